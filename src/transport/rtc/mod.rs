//! WebRTC implementation of the transport traits
//!
//! Video uses a private raster codec (`video/x-raster-rle`, payload type 96,
//! 90 kHz) registered on both peers, so no external encoder is involved.

pub mod channel;
pub mod peer;
pub mod track;

pub use channel::RtcDataChannel;
pub use peer::RtcPeer;
pub use track::{FrameAssembler, RasterReceiver, RasterSender, RTP_MTU};
