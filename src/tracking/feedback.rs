//! Coordinate feedback over the data channel
//!
//! The consumer side runs a [`CoordinateReporter`] that sends the latest
//! estimate as `"x,y"` once per interval. The producer side feeds each
//! received report to an [`ErrorTracker`], which compares it with the ball
//! position the source last rendered.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coords::{CoordinatePair, CoordinateSlot, ReportParseError};
use crate::transport::{ChannelEvent, ChannelState, DataChannel};
use crate::utils::LogThrottler;

/// Outcome of one reporter tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Sent,
    /// Channel not open; nothing was sent
    Skipped(ChannelState),
    /// Send failed; the next tick tries again
    Failed,
}

/// Sends the latest coordinate estimate at a fixed cadence
pub struct CoordinateReporter {
    channel: Arc<dyn DataChannel>,
    slot: Arc<CoordinateSlot>,
    interval: Duration,
    throttler: LogThrottler,
    sent: u64,
}

impl CoordinateReporter {
    pub fn new(channel: Arc<dyn DataChannel>, slot: Arc<CoordinateSlot>, interval: Duration) -> Self {
        Self {
            channel,
            slot,
            interval,
            throttler: LogThrottler::new(interval * 10),
            sent: 0,
        }
    }

    /// Reports sent so far
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub async fn report_once(&mut self) -> ReportOutcome {
        let state = self.channel.ready_state();
        if state != ChannelState::Open {
            debug!("Data channel state: {}", state);
            return ReportOutcome::Skipped(state);
        }

        let report = self.slot.load().to_string();
        match self.channel.send_text(&report).await {
            Ok(()) => {
                self.sent += 1;
                debug!("Sent coordinates {}", report);
                self.throttler.clear("send_failed");
                ReportOutcome::Sent
            }
            Err(e) => {
                if let Some(suppressed) = self.throttler.check("send_failed") {
                    warn!("Coordinate send failed: {} ({} suppressed)", e, suppressed);
                }
                ReportOutcome::Failed
            }
        }
    }

    /// Tick until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Coordinate reporter started on '{}' every {:?}",
            self.channel.label(),
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.report_once().await;
                }
            }
        }
        info!("Coordinate reporter stopped after {} reports", self.sent);
    }
}

/// Difference between a reported position and the ground truth
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationError {
    pub dx: f64,
    pub dy: f64,
}

impl LocationError {
    pub fn between(report: CoordinatePair, truth: CoordinatePair) -> Self {
        Self {
            dx: report.x - truth.x,
            dy: report.y - truth.y,
        }
    }

    /// Euclidean distance
    pub fn magnitude(&self) -> f64 {
        self.dx.hypot(self.dy)
    }
}

impl fmt::Display for LocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x_error = {}, y_error = {}", self.dx, self.dy)
    }
}

/// Error tracker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub reports: u64,
    pub parse_failures: u64,
}

/// Compares coordinate reports with the source's ground truth
pub struct ErrorTracker {
    ground_truth: Arc<CoordinateSlot>,
    latest: ArcSwapOption<LocationError>,
    reports: AtomicU64,
    parse_failures: AtomicU64,
    throttler: LogThrottler,
}

impl ErrorTracker {
    pub fn new(ground_truth: Arc<CoordinateSlot>) -> Self {
        Self {
            ground_truth,
            latest: ArcSwapOption::empty(),
            reports: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            throttler: LogThrottler::with_secs(5),
        }
    }

    /// Parse one report and record its error against the ground truth
    ///
    /// Malformed reports are counted and returned as errors; they never
    /// affect the stored error.
    pub fn handle_report(&self, text: &str) -> Result<LocationError, ReportParseError> {
        let report: CoordinatePair = match text.parse() {
            Ok(report) => report,
            Err(e) => {
                self.parse_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(suppressed) = self.throttler.check("parse_failed") {
                    warn!("Ignoring report {:?}: {} ({} suppressed)", text, e, suppressed);
                }
                return Err(e);
            }
        };

        let error = LocationError::between(report, self.ground_truth.load());
        self.latest.store(Some(Arc::new(error)));
        self.reports.fetch_add(1, Ordering::Relaxed);
        info!("Received coordinates {}: {}", report, error);
        Ok(error)
    }

    pub fn latest(&self) -> Option<LocationError> {
        self.latest.load_full().map(|e| *e)
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            reports: self.reports.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
        }
    }

    /// Feed channel messages into the tracker until the channel closes
    pub async fn consume(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(ChannelEvent::Message(text)) => {
                    let _ = self.handle_report(&text);
                }
                Some(ChannelEvent::Open) => info!("Coordinate channel open"),
                Some(ChannelEvent::Close) | None => {
                    info!("Coordinate channel closed");
                    break;
                }
            }
        }
    }

    /// Log the latest error once per interval until cancelled
    pub async fn run_reporter(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.latest() {
                    Some(error) => info!("Current location error: {}", error),
                    None => debug!("No coordinate reports yet"),
                },
            }
        }
        let stats = self.stats();
        info!(
            "Error reporter stopped: {} reports, {} malformed",
            stats.reports, stats.parse_failures
        );
    }
}
