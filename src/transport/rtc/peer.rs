//! WebRTC peer connection

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::channel::RtcDataChannel;
use super::track::{raster_capability, RasterReceiver, RasterSender, RASTER_PAYLOAD_TYPE};
use crate::config::WebRtcConfig;
use crate::error::{AppError, Result};
use crate::transport::{
    ConnectionState, DataChannel, OutboundVideo, PeerSession, SdpType, SessionDescription,
    SessionEvent,
};

fn map_state(s: RTCPeerConnectionState) -> Option<ConnectionState> {
    match s {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| AppError::Negotiation(format!("Invalid SDP: {}", e)))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(AppError::Negotiation(format!(
            "Unsupported description type: {}",
            other
        ))),
    }
}

/// [`PeerSession`] backed by a webrtc-rs peer connection
///
/// Data channels are pre-negotiated: both peers create them in the same
/// order and the stream id is the creation index. This keeps the SCTP
/// section in the offer even though the answering side owns the channel.
pub struct RtcPeer {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    next_channel_id: AtomicU16,
    gather_timeout: Duration,
    rtcp_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RtcPeer {
    pub async fn new(config: &WebRtcConfig) -> Result<Self> {
        let session_id = uuid::Uuid::new_v4().to_string();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: raster_capability(),
                    payload_type: RASTER_PAYLOAD_TYPE,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| AppError::WebRtc(format!("Failed to register raster codec: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create peer connection: {}", e)))?;
        let pc = Arc::new(pc);

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let peer = Self {
            session_id,
            pc,
            state_rx,
            events_tx: events_tx.clone(),
            events_rx: Mutex::new(Some(events_rx)),
            next_channel_id: AtomicU16::new(0),
            gather_timeout: Duration::from_millis(config.gather_timeout_ms),
            rtcp_tasks: Mutex::new(Vec::new()),
        };
        peer.setup_event_handlers(state_tx, events_tx);

        info!("Created peer connection {}", peer.session_id);
        Ok(peer)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn negotiated_channel(&self, label: &str) -> Result<Arc<RTCDataChannel>> {
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(id),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create data channel: {}", e)))?;
        debug!("Data channel '{}' negotiated with id {}", label, id);
        Ok(dc)
    }

    fn setup_event_handlers(
        &self,
        state_tx: watch::Sender<ConnectionState>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) {
        let state_tx = Arc::new(state_tx);
        let session_id = self.session_id.clone();
        let tx = events_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state_tx = state_tx.clone();
                let session_id = session_id.clone();
                let tx = tx.clone();
                Box::pin(async move {
                    let Some(new_state) = map_state(s) else {
                        return;
                    };
                    info!("Peer {} connection state: {}", session_id, new_state);
                    let _ = state_tx.send(new_state);
                    let _ = tx.send(SessionEvent::StateChanged(new_state));
                })
            }));

        let tx = events_tx.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let tx = tx.clone();
                Box::pin(async move {
                    info!("Remote data channel: {}", dc.label());
                    let channel: Arc<dyn DataChannel> = Arc::new(RtcDataChannel::new(dc));
                    let _ = tx.send(SessionEvent::DataChannel(channel));
                })
            }));

        let tx = events_tx;
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Video {
                        debug!("Ignoring non-video track {}", track.id());
                        return;
                    }
                    info!("Remote video track {}", track.id());
                    let _ = tx.send(SessionEvent::Track(Box::new(RasterReceiver::new(track))));
                })
            },
        ));
    }
}

#[async_trait]
impl PeerSession for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create answer: {}", e)))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc(desc)?;
        let mut gather_complete = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(desc).await.map_err(|e| {
            AppError::Negotiation(format!("Failed to set local description: {}", e))
        })?;

        // Candidates are not trickled, so the description must carry them
        if tokio::time::timeout(self.gather_timeout, gather_complete.recv())
            .await
            .is_err()
        {
            warn!(
                "ICE gathering incomplete after {:?}, sending partial candidates",
                self.gather_timeout
            );
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc(desc)?;
        self.pc.set_remote_description(desc).await.map_err(|e| {
            AppError::Negotiation(format!("Failed to set remote description: {}", e))
        })
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc(desc).ok()
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let dc = self.negotiated_channel(label).await?;
        info!("Data channel '{}' created", label);
        Ok(Arc::new(RtcDataChannel::new(dc)))
    }

    async fn expect_data_channel(&self, label: &str) -> Result<()> {
        let dc = self.negotiated_channel(label).await?;
        let channel: Arc<dyn DataChannel> = Arc::new(RtcDataChannel::new(dc));
        let _ = self.events_tx.send(SessionEvent::DataChannel(channel));
        Ok(())
    }

    async fn add_video_track(&self) -> Result<Arc<dyn OutboundVideo>> {
        let sender = RasterSender::new("video", "bounce-track");
        let rtp_sender = self
            .pc
            .add_track(sender.rtp_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to add video track: {}", e)))?;

        // RTCP must be read for interceptors to run
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });
        self.rtcp_tasks.lock().push(handle);

        info!("Video track added to peer connection");
        Ok(Arc::new(sender))
    }

    fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        for handle in self.rtcp_tasks.lock().drain(..) {
            handle.abort();
        }
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            Some(ConnectionState::Connected)
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[test]
    fn test_invalid_sdp_is_negotiation_error() {
        let err = to_rtc(SessionDescription::offer("not sdp")).unwrap_err();
        assert!(matches!(err, AppError::Negotiation(_)));
    }

    #[tokio::test]
    async fn test_offer_carries_raster_codec() {
        let peer = RtcPeer::new(&WebRtcConfig::default()).await.unwrap();
        peer.add_video_track().await.unwrap();
        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.contains("x-raster-rle/90000"));
        peer.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_loopback_session() {
        use std::time::Duration;

        use tokio_util::sync::CancellationToken;

        use crate::config::AppConfig;
        use crate::session::{Consumer, Producer};
        use crate::testing::MemorySignaling;

        let mut config = AppConfig::default();
        config.video.width = 160;
        config.video.height = 120;
        config.video.ball_size = 10;
        config.video.ball_radius = 10;
        config.video.fps = 30;
        config.tracker.report_interval_ms = 50;

        let producer_peer = Arc::new(RtcPeer::new(&config.webrtc).await.unwrap());
        let consumer_peer = Arc::new(RtcPeer::new(&config.webrtc).await.unwrap());
        let (mut producer_sig, mut consumer_sig) = MemorySignaling::pair();

        let producer = Producer::new(config.clone(), producer_peer);
        let tracker = producer.tracker();
        let consumer = Consumer::new(config, consumer_peer);
        let estimate = consumer.slot();
        let stop = CancellationToken::new();

        let producer_run = tokio::spawn(async move {
            producer.run(&mut producer_sig, CancellationToken::new()).await
        });
        let token = stop.clone();
        let consumer_run =
            tokio::spawn(async move { consumer.run(&mut consumer_sig, token).await });

        // Reports only flow once the pre-negotiated channel opened on both ends
        let mut reached = false;
        for _ in 0..200 {
            if tracker.stats().reports >= 3 && estimate.updates() > 0 {
                reached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        stop.cancel();

        let consumer_summary = consumer_run.await.unwrap().unwrap();
        let producer_summary = tokio::time::timeout(Duration::from_secs(10), producer_run)
            .await
            .expect("producer kept running after bye")
            .unwrap()
            .unwrap();
        assert!(reached, "no coordinate reports over the loopback session");

        let pipeline = consumer_summary.pipeline.unwrap();
        assert!(pipeline.processed > 0);
        assert!(producer_summary.frames_sent > 0);
        assert!(producer_summary.reports.reports >= 3);
        assert_eq!(producer_summary.reports.parse_failures, 0);
        assert!(producer_summary.latest_error.is_some());
    }
}
