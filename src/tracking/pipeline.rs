//! Frame hand-off between the async receiver and the localization worker
//!
//! ```text
//! InboundVideo --recv_frames--> [bounded queue] --> worker thread
//!                                 drop oldest        Localizer::locate
//!                                 when full          -> CoordinateSlot
//! ```
//!
//! The queue holds at most `capacity` frames. A full queue evicts its oldest
//! frame so the worker always converges on the most recent picture. Shutdown
//! enqueues a sentinel behind any pending frames and joins the thread; it is
//! safe to call more than once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::coords::{CoordinatePair, CoordinateSlot};
use crate::error::{AppError, Result};
use crate::transport::InboundVideo;
use crate::utils::LogThrottler;
use crate::vision::{FrameBuffer, Localizer};

/// How often a blocked sentinel send rechecks that the worker is alive
const SENTINEL_RETRY: Duration = Duration::from_millis(50);

/// Hook invoked on the worker thread after each localization
///
/// Implementations run on the worker, never on the receive path.
pub trait FrameObserver: Send + 'static {
    fn on_frame(&mut self, frame: &FrameBuffer, position: CoordinatePair);
}

enum WorkItem {
    Frame(FrameBuffer),
    Shutdown,
}

/// Pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames offered to the queue
    pub submitted: u64,
    /// Frames evicted before the worker saw them
    pub dropped: u64,
    /// Frames localized
    pub processed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
}

/// Bounded queue plus one dedicated localization thread
pub struct FramePipeline {
    tx: Sender<WorkItem>,
    /// Receiver handle used to evict the oldest entry on overflow
    evict_rx: Receiver<WorkItem>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Serialises submit against shutdown so the sentinel is never evicted
    submit_lock: Mutex<()>,
    closed: AtomicBool,
    counters: Arc<Counters>,
    slot: Arc<CoordinateSlot>,
    capacity: usize,
}

impl FramePipeline {
    /// Start the worker thread
    pub fn start(localizer: Localizer, slot: Arc<CoordinateSlot>, capacity: usize) -> Result<Self> {
        Self::start_with_observer(localizer, slot, capacity, None)
    }

    pub fn start_with_observer(
        localizer: Localizer,
        slot: Arc<CoordinateSlot>,
        capacity: usize,
        observer: Option<Box<dyn FrameObserver>>,
    ) -> Result<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded::<WorkItem>(capacity);
        let counters = Arc::new(Counters::default());

        let worker_rx = rx.clone();
        let worker_slot = slot.clone();
        let worker_counters = counters.clone();
        let handle = std::thread::Builder::new()
            .name("bounce-localizer".to_string())
            .spawn(move || {
                run_worker(localizer, worker_rx, worker_slot, worker_counters, observer)
            })
            .map_err(|e| AppError::Worker(format!("Failed to spawn localizer thread: {}", e)))?;

        info!("Localization worker started (queue capacity {})", capacity);

        Ok(Self {
            tx,
            evict_rx: rx,
            worker: Mutex::new(Some(handle)),
            submit_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            counters,
            slot,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot(&self) -> &Arc<CoordinateSlot> {
        &self.slot
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames currently waiting for the worker
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
        }
    }

    /// Queue a frame without blocking
    ///
    /// Returns `false` once the pipeline has been shut down.
    pub fn submit(&self, frame: FrameBuffer) -> bool {
        let _guard = self.submit_lock.lock();
        if self.is_closed() {
            return false;
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.enqueue(WorkItem::Frame(frame))
    }

    /// Enqueue, evicting the oldest entry while the queue is full
    fn enqueue(&self, mut item: WorkItem) -> bool {
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    match self.evict_rx.try_recv() {
                        Ok(WorkItem::Frame(old)) => {
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                            trace!("Dropped queued frame pts={}", old.pts);
                        }
                        Ok(WorkItem::Shutdown) => {
                            // Only shutdown enqueues the sentinel, under the same lock
                            warn!("Evicted shutdown sentinel");
                        }
                        // The worker drained it first
                        Err(TryRecvError::Empty) => {}
                        Err(TryRecvError::Disconnected) => return false,
                    }
                }
            }
        }
    }

    /// Wait for room behind the queued frames, giving up if the worker died
    fn send_sentinel(&self) {
        let mut item = WorkItem::Shutdown;
        loop {
            match self.tx.send_timeout(item, SENTINEL_RETRY) {
                Ok(()) | Err(SendTimeoutError::Disconnected(_)) => return,
                Err(SendTimeoutError::Timeout(back)) => {
                    let finished = self
                        .worker
                        .lock()
                        .as_ref()
                        .map_or(true, |h| h.is_finished());
                    if finished {
                        return;
                    }
                    item = back;
                }
            }
        }
    }

    /// Stop the worker: enqueue the sentinel and join the thread
    ///
    /// Frames already queued are localized first. Later calls return
    /// immediately.
    pub fn shutdown(&self) -> Result<()> {
        {
            let _guard = self.submit_lock.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.send_sentinel();
        }

        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| AppError::Worker("localization worker panicked".into()))?;

        let stats = self.stats();
        info!(
            "Localization worker stopped: {} submitted, {} processed, {} dropped",
            stats.submitted, stats.processed, stats.dropped
        );
        Ok(())
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Pipeline shutdown on drop failed: {}", e);
        }
    }
}

fn run_worker(
    localizer: Localizer,
    rx: Receiver<WorkItem>,
    slot: Arc<CoordinateSlot>,
    counters: Arc<Counters>,
    mut observer: Option<Box<dyn FrameObserver>>,
) {
    debug!("Localization worker running");
    while let Ok(item) = rx.recv() {
        let frame = match item {
            WorkItem::Frame(frame) => frame,
            WorkItem::Shutdown => break,
        };
        let position = localizer.locate(&frame);
        slot.store(position);
        counters.processed.fetch_add(1, Ordering::Relaxed);
        trace!("Localized pts={} at {}", frame.pts, position);

        if let Some(observer) = observer.as_mut() {
            observer.on_frame(&frame, position);
        }
    }
    debug!("Localization worker exiting");
}

/// Pump frames from an inbound track into the pipeline
///
/// Ends when the track ends, the task is cancelled or the pipeline closes.
/// Decode failures are logged and skipped.
pub async fn recv_frames(
    mut track: Box<dyn InboundVideo>,
    pipeline: Arc<FramePipeline>,
    cancel: CancellationToken,
) -> Result<()> {
    let throttler = LogThrottler::with_secs(5);
    let mut received: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Frame receiver cancelled after {} frames", received);
                return Ok(());
            }
            next = track.recv() => next,
        };

        match next {
            Ok(Some(frame)) => {
                received += 1;
                if !pipeline.submit(frame) {
                    debug!("Pipeline closed, stopping frame receiver");
                    return Ok(());
                }
            }
            Ok(None) => {
                info!("Video track ended after {} frames", received);
                return Ok(());
            }
            Err(e) if !e.is_fatal() => {
                if let Some(suppressed) = throttler.check("frame_decode") {
                    warn!("Skipping undecodable frame: {} ({} suppressed)", e, suppressed);
                }
            }
            Err(e) => return Err(e),
        }
    }
}
