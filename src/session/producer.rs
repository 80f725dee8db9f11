//! Producer side: offer the synthetic video and score returned coordinates

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{close_signaling, expect_description, Exit, Reaction, SessionCore, SessionRole};
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::tracking::feedback::TrackerStats;
use crate::tracking::{CoordinatePair, CoordinateSlot, ErrorTracker, LocationError};
use crate::transport::{
    DataChannel, OutboundVideo, PeerSession, SdpType, SessionEvent, Signaling, SignalingMessage,
};
use crate::utils::LogThrottler;
use crate::vision::BallSource;

/// What the producer saw by the time the session ended
#[derive(Debug, Clone)]
pub struct ProducerSummary {
    pub frames_sent: u64,
    pub reports: TrackerStats,
    pub latest_error: Option<LocationError>,
}

pub struct Producer {
    config: AppConfig,
    peer: Arc<dyn PeerSession>,
    ground_truth: Arc<CoordinateSlot>,
    tracker: Arc<ErrorTracker>,
    frames_sent: Arc<AtomicU64>,
}

impl Producer {
    pub fn new(config: AppConfig, peer: Arc<dyn PeerSession>) -> Self {
        let ground_truth = CoordinateSlot::shared(CoordinatePair::default());
        Self {
            config,
            peer,
            tracker: Arc::new(ErrorTracker::new(ground_truth.clone())),
            ground_truth,
            frames_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn tracker(&self) -> Arc<ErrorTracker> {
        self.tracker.clone()
    }

    /// Position of the ball in the most recent frame
    pub fn ground_truth(&self) -> CoordinatePair {
        self.ground_truth.load()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Run the session until the exit token arrives, the rendezvous channel
    /// closes or `shutdown` fires
    ///
    /// Losing the peer connection tears the session down but keeps waiting
    /// for the exit token.
    pub async fn run(
        self,
        signaling: &mut dyn Signaling,
        shutdown: CancellationToken,
    ) -> Result<ProducerSummary> {
        let core = SessionCore::new(self.peer.clone(), SessionRole::Responder);

        let outcome = self.drive(&core, signaling, &shutdown).await;
        if let Err(e) = &outcome {
            error!("Producer session failed: {}", e);
        }

        core.finish("producer exiting").await;
        close_signaling(signaling, !matches!(outcome, Ok(Exit::Remote))).await;
        outcome?;

        let summary = ProducerSummary {
            frames_sent: self.frames_sent(),
            reports: self.tracker.stats(),
            latest_error: self.tracker.latest(),
        };
        info!(
            "Producer finished: {} frames sent, {} reports received",
            summary.frames_sent, summary.reports.reports
        );
        Ok(summary)
    }

    async fn drive(
        &self,
        core: &SessionCore,
        signaling: &mut dyn Signaling,
        shutdown: &CancellationToken,
    ) -> Result<Exit> {
        let mut events = self
            .peer
            .take_events()
            .ok_or_else(|| AppError::WebRtc("session events already taken".into()))?;

        let video = self.peer.add_video_track().await?;
        let mut source = Some(BallSource::new(&self.config.video, self.ground_truth.clone()));
        self.peer
            .expect_data_channel(&self.config.webrtc.channel_label)
            .await?;

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested before negotiation finished");
                return Ok(Exit::Local);
            }
            negotiated = self.negotiate(core, signaling) => negotiated?,
        }

        // Keeps attached channels alive for the rest of the session
        let mut attached: Vec<Arc<dyn DataChannel>> = Vec::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(Exit::Local);
                }
                msg = signaling.receive() => match msg {
                    Ok(Some(SignalingMessage::Bye)) => {
                        info!("Exit requested by consumer");
                        return Ok(Exit::Remote);
                    }
                    Ok(Some(other)) => debug!("Ignoring {} after negotiation", other.kind()),
                    Ok(None) => {
                        info!("Signaling channel closed by consumer");
                        return Ok(Exit::Remote);
                    }
                    Err(e) if !e.is_fatal() => warn!("Ignoring control message: {}", e),
                    Err(e) => return Err(e),
                },
                event = events.recv() => match event {
                    None => return Ok(Exit::Closed),
                    Some(SessionEvent::StateChanged(state)) => match core.on_state(state) {
                        Reaction::StartFeedback => self.start_feedback(core, &mut source, &video),
                        Reaction::TearDown => {
                            core.teardown(&format!("connection {}", state)).await;
                        }
                        Reaction::Finished | Reaction::None => {}
                    },
                    Some(SessionEvent::DataChannel(dc)) => {
                        if self.attach_channel(core, &dc) {
                            attached.push(dc);
                        }
                    }
                    Some(SessionEvent::Track(_)) => debug!("Ignoring remote video track"),
                },
            }
        }
    }

    /// Accept the consumer, send the offer and apply its answer
    async fn negotiate(&self, core: &SessionCore, signaling: &mut dyn Signaling) -> Result<()> {
        signaling.connect().await?;
        core.begin_negotiation()?;

        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer).await?;
        let local = self
            .peer
            .local_description()
            .await
            .ok_or_else(|| AppError::Negotiation("no local description after offer".into()))?;
        signaling.send(&local.into()).await?;
        info!("Offer sent, waiting for answer");

        let answer = expect_description(signaling, SdpType::Answer).await?;
        self.peer.set_remote_description(answer).await?;
        info!("Answer applied");
        Ok(())
    }

    /// Start the video source and the periodic error log
    fn start_feedback(
        &self,
        core: &SessionCore,
        source: &mut Option<BallSource>,
        video: &Arc<dyn OutboundVideo>,
    ) {
        let Some(source) = source.take() else {
            return;
        };
        let (video, frames) = (video.clone(), self.frames_sent.clone());
        core.tasks()
            .spawn("video-source", move |cancel| pump_video(source, video, frames, cancel));

        let tracker = self.tracker.clone();
        let interval = Duration::from_millis(self.config.tracker.report_interval_ms);
        core.tasks()
            .spawn("error-reporter", move |cancel| tracker.run_reporter(interval, cancel));
    }

    /// Feed the coordinate channel into the error tracker
    fn attach_channel(&self, core: &SessionCore, channel: &Arc<dyn DataChannel>) -> bool {
        if channel.label() != self.config.webrtc.channel_label {
            warn!("Ignoring unexpected data channel '{}'", channel.label());
            return false;
        }
        let Some(events) = channel.take_events() else {
            warn!("Data channel '{}' events already taken", channel.label());
            return false;
        };
        info!("Data channel '{}' attached", channel.label());
        let tracker = self.tracker.clone();
        core.tasks()
            .spawn("coordinate-receiver", move |cancel| tracker.consume(events, cancel));
        true
    }
}

/// Write one frame per clock tick until cancelled
async fn pump_video(
    mut source: BallSource,
    video: Arc<dyn OutboundVideo>,
    frames: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let throttler = LogThrottler::with_secs(5);
    info!("Video source started");
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next_frame() => frame,
        };
        match video.write_frame(&frame).await {
            Ok(()) => {
                frames.fetch_add(1, Ordering::Relaxed);
                throttler.clear("write_frame");
            }
            Err(e) => {
                if let Some(suppressed) = throttler.check("write_frame") {
                    warn!("Frame write failed: {} ({} suppressed)", e, suppressed);
                }
            }
        }
    }
    info!(
        "Video source stopped after {} frames",
        frames.load(Ordering::Relaxed)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Consumer;
    use crate::testing::{MemoryPeer, MemorySignaling};
    use crate::transport::{ConnectionState, TcpSignaling};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.video.width = 160;
        config.video.height = 120;
        config.video.ball_size = 10;
        config.video.ball_radius = 10;
        config.video.fps = 60;
        config.tracker.report_interval_ms = 20;
        config
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_exit_token_ends_producer() {
        let (peer, _remote) = MemoryPeer::pair();
        let (mut ours, mut theirs) = MemorySignaling::pair();
        let producer = Producer::new(config(), peer.clone());

        let run = tokio::spawn(async move {
            let result = producer.run(&mut ours, CancellationToken::new()).await;
            (result, ours)
        });

        let offer = theirs.receive().await.unwrap();
        assert!(matches!(offer, Some(SignalingMessage::Offer { .. })));
        theirs
            .send(&SignalingMessage::Answer { sdp: "memory:peer".into() })
            .await
            .unwrap();
        theirs.send(&SignalingMessage::Bye).await.unwrap();

        let (result, _ours) = run.await.unwrap();
        let summary = result.unwrap();
        assert_eq!(summary.reports.reports, 0);
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_exit() {
        let (peer, _remote) = MemoryPeer::pair();
        let (mut ours, mut theirs) = MemorySignaling::pair();
        let producer = Producer::new(config(), peer.clone());

        let run = tokio::spawn(async move {
            let result = producer.run(&mut ours, CancellationToken::new()).await;
            (result, ours)
        });

        theirs.receive().await.unwrap();
        theirs
            .send(&SignalingMessage::Answer { sdp: "memory:peer".into() })
            .await
            .unwrap();

        peer.inject_state(ConnectionState::Connected);
        peer.inject_state(ConnectionState::Disconnected);
        wait_until(|| peer.close_count() == 1).await;
        assert!(!run.is_finished());

        theirs.send(&SignalingMessage::Bye).await.unwrap();
        let (result, _ours) = run.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(peer.close_count(), 1);
    }

    fn listening_config() -> AppConfig {
        let mut config = config();
        config.signaling.port = 0;
        config
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_consumer() {
        let (peer, _remote) = MemoryPeer::pair();
        let config = listening_config();
        let mut signaling = TcpSignaling::listen(&config.signaling);
        signaling.bind().await.unwrap();

        let stop = CancellationToken::new();
        let producer = Producer::new(config, peer.clone());
        let token = stop.clone();
        let run = tokio::spawn(async move { producer.run(&mut signaling, token).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!run.is_finished());
        stop.cancel();

        let result = tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .expect("producer ignored shutdown while accepting")
            .unwrap();
        assert_eq!(result.unwrap().frames_sent, 0);
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_control_line_is_skipped() {
        let (peer, _remote) = MemoryPeer::pair();
        let config = listening_config();
        let mut signaling = TcpSignaling::listen(&config.signaling);
        let addr = signaling.bind().await.unwrap();

        let producer = Producer::new(config, peer.clone());
        let run = tokio::spawn(async move {
            producer.run(&mut signaling, CancellationToken::new()).await
        });

        let (read, mut write) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut lines = BufReader::new(read).lines();
        let offer = lines.next_line().await.unwrap().unwrap();
        assert!(offer.contains(r#""type":"offer""#));

        write
            .write_all(b"{\"type\":\"answer\",\"sdp\":\"memory:peer\"}\nhello\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!run.is_finished());

        write.write_all(b"exit\n").await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .expect("producer did not stop on exit")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_answer_is_fatal() {
        let (peer, _remote) = MemoryPeer::pair();
        let (mut ours, mut theirs) = MemorySignaling::pair();
        let producer = Producer::new(config(), peer);

        let run = tokio::spawn(async move {
            let result = producer.run(&mut ours, CancellationToken::new()).await;
            (result, ours)
        });
        theirs.receive().await.unwrap();
        theirs
            .send(&SignalingMessage::Answer { sdp: "garbage".into() })
            .await
            .unwrap();

        let (result, _ours) = run.await.unwrap();
        assert!(matches!(result, Err(AppError::Negotiation(_))));
    }

    #[tokio::test]
    async fn test_end_to_end_session() {
        let (producer_peer, consumer_peer) = MemoryPeer::pair();
        let (mut producer_sig, mut consumer_sig) = MemorySignaling::pair();

        let producer = Producer::new(config(), producer_peer.clone());
        let tracker = producer.tracker();
        let consumer = Consumer::new(config(), consumer_peer.clone());
        let estimate = consumer.slot();
        let consumer_shutdown = CancellationToken::new();

        let producer_run = tokio::spawn(async move {
            let result = producer.run(&mut producer_sig, CancellationToken::new()).await;
            (result, producer_sig)
        });
        let shutdown = consumer_shutdown.clone();
        let consumer_run = tokio::spawn(async move {
            let result = consumer.run(&mut consumer_sig, shutdown).await;
            (result, consumer_sig)
        });

        wait_until(|| tracker.stats().reports >= 3 && estimate.updates() > 0).await;
        consumer_shutdown.cancel();

        let (consumer_result, _) = consumer_run.await.unwrap();
        let (producer_result, _) = producer_run.await.unwrap();

        let consumer_summary = consumer_result.unwrap();
        let pipeline = consumer_summary.pipeline.unwrap();
        assert!(pipeline.processed > 0);
        assert!(pipeline.processed + pipeline.dropped <= pipeline.submitted);

        let producer_summary = producer_result.unwrap();
        assert!(producer_summary.frames_sent > 0);
        assert!(producer_summary.reports.reports >= 3);
        assert_eq!(producer_summary.reports.parse_failures, 0);
        assert!(producer_summary.latest_error.is_some());

        assert_eq!(producer_peer.close_count(), 1);
        assert_eq!(consumer_peer.close_count(), 1);
    }
}
