//! In-memory transport for tests
//!
//! [`MemoryPeer::pair`] connects two sessions once both have applied a
//! local and a remote description. Video goes through the raster codec so
//! the receive path sees the same bytes a real track would carry.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::transport::{
    ChannelEvent, ChannelState, ConnectionState, DataChannel, InboundVideo, OutboundVideo,
    PeerSession, SdpType, SessionDescription, SessionEvent, Signaling, SignalingMessage,
};
use crate::vision::{codec, FrameBuffer};

const SDP_PREFIX: &str = "memory:";

pub struct MemoryChannel {
    label: String,
    state: Mutex<ChannelState>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    peer: Mutex<Weak<MemoryChannel>>,
    sent: Mutex<Vec<String>>,
    fail_sends: AtomicBool,
}

impl MemoryChannel {
    pub fn new(label: &str) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            peer: Mutex::new(Weak::new()),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Two linked ends; messages sent on one arrive on the other
    pub fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let a = Self::new(label);
        let b = Self::new(label);
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        (a, b)
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    pub fn open_pair(a: &Arc<Self>, b: &Arc<Self>) {
        for end in [a, b] {
            end.set_state(ChannelState::Open);
            end.deliver(ChannelEvent::Open);
        }
    }

    pub fn close_pair(a: &Arc<Self>, b: &Arc<Self>) {
        for end in [a, b] {
            end.shut();
        }
    }

    /// Texts sent from this end
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn deliver(&self, event: ChannelEvent) {
        let _ = self.events_tx.send(event);
    }

    fn shut(&self) {
        let mut state = self.state.lock();
        if *state != ChannelState::Closed {
            *state = ChannelState::Closed;
            drop(state);
            self.deliver(ChannelEvent::Close);
        }
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let state = self.ready_state();
        if state != ChannelState::Open {
            return Err(AppError::Transport(format!("channel {}", state)));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(AppError::Transport("injected send failure".into()));
        }
        self.sent.lock().push(text.to_string());
        if let Some(peer) = self.peer.lock().upgrade() {
            peer.deliver(ChannelEvent::Message(text.to_string()));
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        self.shut();
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.shut();
        }
        Ok(())
    }
}

/// Sending half of an in-memory video track
pub struct MemoryVideoSender {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl MemoryVideoSender {
    /// End the track; the receiver sees `None`
    pub fn finish(&self) {
        self.tx.lock().take();
    }
}

#[async_trait]
impl OutboundVideo for MemoryVideoSender {
    async fn write_frame(&self, frame: &FrameBuffer) -> Result<()> {
        // Writes after the track ended are dropped, like an unbound RTP track
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(codec::encode(frame));
        }
        Ok(())
    }
}

pub struct MemoryVideoReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl InboundVideo for MemoryVideoReceiver {
    async fn recv(&mut self) -> Result<Option<FrameBuffer>> {
        match self.rx.recv().await {
            Some(payload) => codec::decode(&payload).map(Some),
            None => Ok(None),
        }
    }
}

pub fn memory_video() -> (Arc<MemoryVideoSender>, MemoryVideoReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(MemoryVideoSender {
            tx: Mutex::new(Some(tx)),
        }),
        MemoryVideoReceiver { rx },
    )
}

#[derive(Default)]
struct Negotiation {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    connected: bool,
}

pub struct MemoryPeer {
    id: String,
    state: Mutex<ConnectionState>,
    negotiation: Mutex<Negotiation>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    remote: Mutex<Weak<MemoryPeer>>,
    pending_channels: Mutex<Vec<(Arc<MemoryChannel>, Arc<MemoryChannel>)>>,
    channels: Mutex<Vec<(Arc<MemoryChannel>, Arc<MemoryChannel>)>>,
    pending_tracks: Mutex<Vec<MemoryVideoReceiver>>,
    senders: Mutex<Vec<Arc<MemoryVideoSender>>>,
    close_calls: AtomicUsize,
}

impl MemoryPeer {
    fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            state: Mutex::new(ConnectionState::New),
            negotiation: Mutex::new(Negotiation::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            remote: Mutex::new(Weak::new()),
            pending_channels: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            pending_tracks: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
        })
    }

    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Self::new();
        let b = Self::new();
        *a.remote.lock() = Arc::downgrade(&b);
        *b.remote.lock() = Arc::downgrade(&a);
        (a, b)
    }

    /// Number of `close` calls that actually closed the session
    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Report a connection state as if the transport had changed
    pub fn inject_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        let _ = self.events_tx.send(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn negotiated(&self) -> bool {
        let n = self.negotiation.lock();
        n.local.is_some() && n.remote.is_some()
    }

    fn try_connect(&self) {
        let Some(remote) = self.remote.lock().upgrade() else {
            return;
        };
        if !self.negotiated() || !remote.negotiated() {
            return;
        }
        {
            let mut n = self.negotiation.lock();
            if n.connected {
                return;
            }
            n.connected = true;
        }
        remote.negotiation.lock().connected = true;

        for peer in [self, remote.as_ref()] {
            peer.inject_state(ConnectionState::Connecting);
            peer.inject_state(ConnectionState::Connected);
        }
        for (from, to) in [(self, remote.as_ref()), (remote.as_ref(), self)] {
            let tracks: Vec<_> = from.pending_tracks.lock().drain(..).collect();
            for track in tracks {
                to.emit(SessionEvent::Track(Box::new(track)));
            }
            let channels: Vec<_> = from.pending_channels.lock().drain(..).collect();
            for (local, remote_end) in channels {
                to.emit(SessionEvent::DataChannel(remote_end.clone()));
                MemoryChannel::open_pair(&local, &remote_end);
                from.channels.lock().push((local, remote_end));
            }
        }
    }

    fn hang_up(&self) {
        let connected = matches!(
            *self.state.lock(),
            ConnectionState::Connecting | ConnectionState::Connected
        );
        if connected {
            self.inject_state(ConnectionState::Disconnected);
        }
    }
}

#[async_trait]
impl PeerSession for MemoryPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("{}{}", SDP_PREFIX, self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let has_offer = matches!(
            self.negotiation.lock().remote.as_ref().map(|d| d.kind),
            Some(SdpType::Offer)
        );
        if !has_offer {
            return Err(AppError::Negotiation("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("{}{}", SDP_PREFIX, self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.negotiation.lock().local = Some(desc);
        self.try_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if !desc.sdp.starts_with(SDP_PREFIX) {
            return Err(AppError::Negotiation(format!(
                "unparseable description: {:?}",
                desc.sdp
            )));
        }
        self.negotiation.lock().remote = Some(desc);
        self.try_connect();
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.negotiation.lock().local.clone()
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let (local, remote_end) = MemoryChannel::pair(label);
        self.pending_channels
            .lock()
            .push((local.clone(), remote_end));
        Ok(local as Arc<dyn DataChannel>)
    }

    async fn expect_data_channel(&self, _label: &str) -> Result<()> {
        Ok(())
    }

    async fn add_video_track(&self) -> Result<Arc<dyn OutboundVideo>> {
        let (sender, receiver) = memory_video();
        self.pending_tracks.lock().push(receiver);
        self.senders.lock().push(sender.clone());
        Ok(sender as Arc<dyn OutboundVideo>)
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.close_calls.fetch_add(1, Ordering::SeqCst);

        for sender in self.senders.lock().iter() {
            sender.finish();
        }
        let channels: Vec<_> = self.channels.lock().drain(..).collect();
        for (local, remote_end) in channels {
            MemoryChannel::close_pair(&local, &remote_end);
        }
        self.inject_state(ConnectionState::Closed);

        let remote = self.remote.lock().upgrade();
        if let Some(remote) = remote {
            remote.hang_up();
        }
        Ok(())
    }
}

/// One end of an in-memory rendezvous channel
pub struct MemorySignaling {
    tx: Option<mpsc::UnboundedSender<SignalingMessage>>,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl MemorySignaling {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn send(&mut self, msg: &SignalingMessage) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| AppError::Signaling("signaling channel closed".into()))?;
        tx.send(msg.clone())
            .map_err(|_| AppError::Signaling("peer went away".into()))
    }

    async fn receive(&mut self) -> Result<Option<SignalingMessage>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}
