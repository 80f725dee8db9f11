//! Consumer side: answer the offer, localize the ball, report coordinates

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{close_signaling, expect_description, Exit, Reaction, SessionCore, SessionRole};
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::tracking::{
    recv_frames, ChannelMonitor, CoordinatePair, CoordinateReporter, CoordinateSlot,
    FramePipeline, PipelineStats,
};
use crate::transport::{
    ChannelEvent, DataChannel, InboundVideo, PeerSession, SdpType, SessionEvent, Signaling,
    SignalingMessage,
};
use crate::vision::Localizer;

/// What the consumer saw by the time the session ended
#[derive(Debug, Clone)]
pub struct ConsumerSummary {
    /// `None` when no video track ever arrived
    pub pipeline: Option<PipelineStats>,
    pub last_estimate: CoordinatePair,
}

pub struct Consumer {
    config: AppConfig,
    peer: Arc<dyn PeerSession>,
    slot: Arc<CoordinateSlot>,
}

impl Consumer {
    pub fn new(config: AppConfig, peer: Arc<dyn PeerSession>) -> Self {
        Self {
            config,
            peer,
            slot: CoordinateSlot::shared(CoordinatePair::default()),
        }
    }

    /// The latest estimate, shared with the localization worker
    pub fn slot(&self) -> Arc<CoordinateSlot> {
        self.slot.clone()
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.tracker.report_interval_ms)
    }

    /// Run the session until the connection closes, the producer says bye
    /// or `shutdown` fires
    pub async fn run(
        self,
        signaling: &mut dyn Signaling,
        shutdown: CancellationToken,
    ) -> Result<ConsumerSummary> {
        let core = SessionCore::new(self.peer.clone(), SessionRole::Initiator);
        let mut pipeline = None;

        let outcome = self.drive(&core, signaling, &shutdown, &mut pipeline).await;
        if let Err(e) = &outcome {
            error!("Consumer session failed: {}", e);
        }

        core.finish("consumer exiting").await;
        let stats = match pipeline {
            Some(pipeline) => Some(stop_pipeline(pipeline).await),
            None => None,
        };
        close_signaling(signaling, !matches!(outcome, Ok(Exit::Remote))).await;
        outcome?;

        let summary = ConsumerSummary {
            pipeline: stats,
            last_estimate: self.slot.load(),
        };
        info!("Consumer finished, last estimate {}", summary.last_estimate);
        Ok(summary)
    }

    async fn drive(
        &self,
        core: &SessionCore,
        signaling: &mut dyn Signaling,
        shutdown: &CancellationToken,
        pipeline: &mut Option<Arc<FramePipeline>>,
    ) -> Result<Exit> {
        let mut events = self
            .peer
            .take_events()
            .ok_or_else(|| AppError::WebRtc("session events already taken".into()))?;

        let channel = self
            .peer
            .create_data_channel(&self.config.webrtc.channel_label)
            .await?;
        let channel_events = channel
            .take_events()
            .ok_or_else(|| AppError::WebRtc("channel events already taken".into()))?;

        let monitor = ChannelMonitor::new(channel.clone(), self.interval());
        core.tasks().spawn("channel-monitor", move |cancel| monitor.run(cancel));
        let (feedback_channel, slot, interval) = (channel.clone(), self.slot.clone(), self.interval());
        core.tasks().spawn("coordinate-feedback", move |cancel| {
            feedback_loop(feedback_channel, channel_events, slot, interval, cancel)
        });

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested before negotiation finished");
                return Ok(Exit::Local);
            }
            negotiated = self.negotiate(core, signaling) => negotiated?,
        }

        let mut signaling_open = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(Exit::Local);
                }
                msg = signaling.receive(), if signaling_open => match msg {
                    Ok(Some(SignalingMessage::Bye)) => {
                        info!("Producer ended the session");
                        return Ok(Exit::Remote);
                    }
                    Ok(Some(other)) => debug!("Ignoring {} after negotiation", other.kind()),
                    Ok(None) => {
                        debug!("Signaling channel closed by producer");
                        signaling_open = false;
                    }
                    Err(e) if !e.is_fatal() => warn!("Ignoring control message: {}", e),
                    Err(e) => {
                        warn!("Signaling receive failed: {}", e);
                        signaling_open = false;
                    }
                },
                event = events.recv() => match event {
                    None => return Ok(Exit::Closed),
                    Some(SessionEvent::StateChanged(state)) => match core.on_state(state) {
                        Reaction::StartFeedback => {
                            debug!("Connected; reports start once the data channel opens")
                        }
                        Reaction::TearDown => {
                            core.teardown(&format!("connection {}", state)).await;
                            return Ok(Exit::Closed);
                        }
                        Reaction::Finished => return Ok(Exit::Closed),
                        Reaction::None => {}
                    },
                    Some(SessionEvent::Track(track)) => self.attach_track(core, track, pipeline)?,
                    Some(SessionEvent::DataChannel(dc)) => {
                        debug!("Ignoring remote data channel '{}'", dc.label())
                    }
                },
            }
        }
    }

    /// Wait for the offer and send back the answer
    async fn negotiate(&self, core: &SessionCore, signaling: &mut dyn Signaling) -> Result<()> {
        signaling.connect().await?;
        core.begin_negotiation()?;

        let offer = expect_description(signaling, SdpType::Offer).await?;
        self.peer.set_remote_description(offer).await?;
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer).await?;
        let local = self
            .peer
            .local_description()
            .await
            .ok_or_else(|| AppError::Negotiation("no local description after answer".into()))?;
        signaling.send(&local.into()).await?;
        info!("Answer sent");
        Ok(())
    }

    /// Start the localization pipeline for the first video track
    fn attach_track(
        &self,
        core: &SessionCore,
        track: Box<dyn InboundVideo>,
        pipeline: &mut Option<Arc<FramePipeline>>,
    ) -> Result<()> {
        if pipeline.is_some() {
            warn!("Ignoring additional video track");
            return Ok(());
        }
        info!("Video track received, starting localizer");

        let localizer = Localizer::from_config(&self.config.tracker, &self.config.video);
        let started = Arc::new(FramePipeline::start(
            localizer,
            self.slot.clone(),
            self.config.tracker.queue_capacity,
        )?);
        let receiver_pipeline = started.clone();
        core.tasks().spawn("frame-receiver", move |cancel| async move {
            if let Err(e) = recv_frames(track, receiver_pipeline, cancel).await {
                error!("Frame receiver stopped: {}", e);
            }
        });
        *pipeline = Some(started);
        Ok(())
    }
}

/// Run the coordinate reporter while the data channel is open
async fn feedback_loop(
    channel: Arc<dyn DataChannel>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    slot: Arc<CoordinateSlot>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut reporter: Option<(CancellationToken, JoinHandle<()>)> = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            // Open can be raised more than once for the same channel
            Some(ChannelEvent::Open) if reporter.is_none() => {
                info!("Data channel '{}' open", channel.label());
                let token = cancel.child_token();
                let task = CoordinateReporter::new(channel.clone(), slot.clone(), interval);
                reporter = Some((token.clone(), tokio::spawn(task.run(token))));
            }
            Some(ChannelEvent::Open) => {}
            Some(ChannelEvent::Close) => {
                info!("Data channel '{}' closed", channel.label());
                stop_reporter(&mut reporter).await;
            }
            Some(ChannelEvent::Message(text)) => {
                debug!("Unexpected message on '{}': {}", channel.label(), text)
            }
            None => break,
        }
    }
    stop_reporter(&mut reporter).await;
}

async fn stop_reporter(reporter: &mut Option<(CancellationToken, JoinHandle<()>)>) {
    if let Some((token, handle)) = reporter.take() {
        token.cancel();
        if let Err(e) = handle.await {
            warn!("Coordinate reporter task failed: {}", e);
        }
    }
}

/// Drain and join the localization worker off the async runtime
async fn stop_pipeline(pipeline: Arc<FramePipeline>) -> PipelineStats {
    let joined = tokio::task::spawn_blocking(move || {
        let result = pipeline.shutdown();
        (result, pipeline.stats())
    })
    .await;

    match joined {
        Ok((Ok(()), stats)) => stats,
        Ok((Err(e), stats)) => {
            warn!("Localization worker shutdown failed: {}", e);
            stats
        }
        Err(e) => {
            warn!("Localization worker join task failed: {}", e);
            PipelineStats::default()
        }
    }
}
