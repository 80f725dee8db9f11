//! Raster video over RTP
//!
//! Encoded frames are split into payloads of at most [`RTP_MTU`] bytes that
//! share the frame's timestamp; the last packet carries the marker bit.
//! The receiver reassembles packets per timestamp and drops any frame with a
//! sequence gap, since a partial run-length stream cannot be decoded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{AppError, Result};
use crate::transport::{InboundVideo, OutboundVideo};
use crate::utils::LogThrottler;
use crate::warn_throttled;
use crate::vision::clock::VIDEO_CLOCK_RATE;
use crate::vision::{codec, FrameBuffer};

/// Maximum RTP payload size
pub const RTP_MTU: usize = 1200;

/// Dynamic payload type used for the raster codec
pub const RASTER_PAYLOAD_TYPE: u8 = 96;

/// Codec capability advertised in SDP
pub fn raster_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec::MIME_TYPE.to_owned(),
        clock_rate: VIDEO_CLOCK_RATE,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Split an encoded frame into RTP payloads
pub fn packetize(frame: &Bytes, mtu: usize) -> Vec<Bytes> {
    let mut payloads = Vec::with_capacity(frame.len() / mtu + 1);
    let mut offset = 0;
    while offset < frame.len() {
        let end = (offset + mtu).min(frame.len());
        payloads.push(frame.slice(offset..end));
        offset = end;
    }
    payloads
}

/// Outbound video statistics
#[derive(Debug, Clone, Default)]
pub struct SenderStats {
    pub frames_sent: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

/// Sends raster frames on a local RTP track
pub struct RasterSender {
    track: Arc<TrackLocalStaticRTP>,
    sequence_number: Mutex<u16>,
    frames_sent: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl RasterSender {
    pub fn new(track_id: &str, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticRTP::new(
            raster_capability(),
            track_id.to_string(),
            stream_id.to_string(),
        ));
        Self {
            track,
            sequence_number: Mutex::new(rand::random()),
            frames_sent: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.track.clone()
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl OutboundVideo for RasterSender {
    async fn write_frame(&self, frame: &FrameBuffer) -> Result<()> {
        let encoded = codec::encode(frame);
        let payloads = packetize(&encoded, RTP_MTU);
        let count = payloads.len();
        if count == 0 {
            return Ok(());
        }

        // Reserve the sequence range up front so the lock is not held over I/O
        let seq_start = {
            let mut seq = self.sequence_number.lock();
            let start = *seq;
            *seq = seq.wrapping_add(count as u16);
            start
        };

        for (i, payload) in payloads.into_iter().enumerate() {
            let packet = rtp::packet::Packet {
                header: rtp::header::Header {
                    version: 2,
                    marker: i == count - 1,
                    payload_type: RASTER_PAYLOAD_TYPE,
                    sequence_number: seq_start.wrapping_add(i as u16),
                    timestamp: frame.pts,
                    ..Default::default()
                },
                payload,
            };
            self.track
                .write_rtp(&packet)
                .await
                .map_err(|e| AppError::WebRtc(format!("write_rtp failed: {}", e)))?;
        }

        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.packets_sent.fetch_add(count as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(encoded.len() as u64, Ordering::Relaxed);
        trace!("Sent frame pts={} in {} packets", frame.pts, count);
        Ok(())
    }
}

/// Reassembles RTP payloads into encoded frames
#[derive(Debug, Default)]
pub struct FrameAssembler {
    timestamp: Option<u32>,
    expected_seq: Option<u16>,
    buffer: BytesMut,
    broken: bool,
    dropped: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames discarded because of loss or reordering
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Feed one packet; returns the encoded frame when its last packet arrives
    pub fn push(&mut self, seq: u16, timestamp: u32, marker: bool, payload: &[u8]) -> Option<Bytes> {
        let in_sequence = self.expected_seq.map_or(true, |e| e == seq);
        self.expected_seq = Some(seq.wrapping_add(1));

        if self.timestamp != Some(timestamp) {
            if self.timestamp.is_some() {
                // Previous frame never saw its marker
                self.dropped += 1;
            }
            self.timestamp = Some(timestamp);
            self.buffer.clear();
            self.broken = !in_sequence;
        } else if !in_sequence {
            self.broken = true;
        }

        if !self.broken {
            self.buffer.extend_from_slice(payload);
        }

        if !marker {
            return None;
        }

        self.timestamp = None;
        if self.broken {
            self.dropped += 1;
            self.buffer.clear();
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }
}

/// Receives raster frames from a remote RTP track
pub struct RasterReceiver {
    track: Arc<TrackRemote>,
    assembler: FrameAssembler,
    reported_drops: u64,
    throttler: LogThrottler,
}

impl RasterReceiver {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        Self {
            track,
            assembler: FrameAssembler::new(),
            reported_drops: 0,
            throttler: LogThrottler::with_secs(5),
        }
    }

    fn report_drops(&mut self) {
        let dropped = self.assembler.dropped();
        if dropped > self.reported_drops {
            self.reported_drops = dropped;
            warn_throttled!(
                self.throttler,
                "incomplete_frame",
                "Dropped incomplete frames on track {} ({} total)",
                self.track.id(),
                dropped
            );
        }
    }
}

#[async_trait]
impl InboundVideo for RasterReceiver {
    async fn recv(&mut self) -> Result<Option<FrameBuffer>> {
        loop {
            let (packet, _) = match self.track.read_rtp().await {
                Ok(read) => read,
                Err(e) => {
                    debug!("Remote track {} ended: {}", self.track.id(), e);
                    return Ok(None);
                }
            };
            let header = &packet.header;
            if let Some(encoded) = self.assembler.push(
                header.sequence_number,
                header.timestamp,
                header.marker,
                &packet.payload,
            ) {
                self.report_drops();
                return codec::decode(&encoded).map(Some);
            }
            self.report_drops();
        }
    }
}
