//! Data channel wrapper

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::error::{AppError, Result};
use crate::transport::{ChannelEvent, ChannelState, DataChannel};

/// [`DataChannel`] over an `RTCDataChannel`
///
/// Callbacks are registered on construction and feed an event queue, so
/// events raised before the owner subscribes are not lost.
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl RtcDataChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let label = dc.label().to_string();

        let open_tx = tx.clone();
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                info!("Data channel '{}' open", open_label);
                let _ = open_tx.send(ChannelEvent::Open);
            })
        }));

        let close_tx = tx.clone();
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            let tx = close_tx.clone();
            let label = close_label.clone();
            Box::pin(async move {
                info!("Data channel '{}' closed", label);
                let _ = tx.send(ChannelEvent::Close);
            })
        }));

        let msg_tx = tx;
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = msg_tx.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = tx.send(ChannelEvent::Message(text));
                    }
                    Err(_) => {
                        debug!("Ignoring non UTF-8 message of {} bytes", msg.data.len());
                    }
                }
            })
        }));

        Self {
            dc,
            label,
            events_rx: Mutex::new(Some(rx)),
        }
    }
}

pub(crate) fn map_channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        _ => ChannelState::Connecting,
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        map_channel_state(self.dc.ready_state())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        let state = self.ready_state();
        if state != ChannelState::Open {
            return Err(AppError::Transport(format!(
                "channel '{}' is {}",
                self.label, state
            )));
        }
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| AppError::Transport(format!("send on '{}' failed: {}", self.label, e)))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.dc.close().await {
            warn!("Failed to close data channel '{}': {}", self.label, e);
        }
        Ok(())
    }
}
