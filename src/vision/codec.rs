//! Run-length raster codec
//!
//! Frame layout:
//!
//! ```text
//! +-------+---------+----------+-------+--------+-----+----------------+
//! | magic | version | channels | width | height | pts | runs ...       |
//! | 4B    | u8      | u8       | u16BE | u16BE  | u32 | [u16BE n][px]  |
//! +-------+---------+----------+-------+--------+-----+----------------+
//! ```
//!
//! Each run repeats one pixel `n` times (`1..=65535`). Synthetic frames are
//! mostly flat colour, so a 640x480 frame compresses to a few kilobytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::frame::{FrameBuffer, PixelLayout};
use crate::error::{AppError, Result};

pub const MAGIC: &[u8; 4] = b"BTRL";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 14;

/// Largest width or height the header can carry
pub const MAX_EXTENT: u32 = u16::MAX as u32;

/// MIME type advertised for the codec in SDP
pub const MIME_TYPE: &str = "video/x-raster-rle";

/// Encode a frame
///
/// Extents above [`MAX_EXTENT`] are rejected by config validation.
pub fn encode(frame: &FrameBuffer) -> Bytes {
    let ch = frame.channels();
    let mut out = BytesMut::with_capacity(HEADER_LEN + 64);
    out.put_slice(MAGIC);
    out.put_u8(VERSION);
    out.put_u8(ch as u8);
    out.put_u16(frame.width() as u16);
    out.put_u16(frame.height() as u16);
    out.put_u32(frame.pts);

    let mut pixels = frame.data().chunks_exact(ch);
    let Some(mut current) = pixels.next() else {
        return out.freeze();
    };
    let mut run: u16 = 1;
    for px in pixels {
        if px == current && run < u16::MAX {
            run += 1;
        } else {
            out.put_u16(run);
            out.put_slice(current);
            current = px;
            run = 1;
        }
    }
    out.put_u16(run);
    out.put_slice(current);

    out.freeze()
}

/// Decode a frame, validating the header and the exact pixel count
pub fn decode(mut buf: &[u8]) -> Result<FrameBuffer> {
    if buf.len() < HEADER_LEN {
        return Err(AppError::Codec(format!(
            "frame too short: {} bytes",
            buf.len()
        )));
    }
    if &buf[..4] != MAGIC {
        return Err(AppError::Codec("bad frame magic".into()));
    }
    buf.advance(4);

    let version = buf.get_u8();
    if version != VERSION {
        return Err(AppError::Codec(format!("unsupported version {}", version)));
    }
    let channels = buf.get_u8();
    let layout = PixelLayout::from_channels(channels)
        .ok_or_else(|| AppError::Codec(format!("unsupported channel count {}", channels)))?;
    let width = buf.get_u16() as u32;
    let height = buf.get_u16() as u32;
    let pts = buf.get_u32();

    let ch = layout.channels();
    let total = width as usize * height as usize;
    let mut data = Vec::with_capacity(total * ch);
    let mut decoded = 0usize;

    while buf.has_remaining() {
        if buf.remaining() < 2 + ch {
            return Err(AppError::Codec("truncated run".into()));
        }
        let run = buf.get_u16() as usize;
        if run == 0 {
            return Err(AppError::Codec("zero length run".into()));
        }
        decoded += run;
        if decoded > total {
            return Err(AppError::Codec(format!(
                "runs exceed {}x{} extent",
                width, height
            )));
        }
        let px = &buf[..ch];
        for _ in 0..run {
            data.extend_from_slice(px);
        }
        buf.advance(ch);
    }

    if decoded != total {
        return Err(AppError::Codec(format!(
            "expected {} pixels, decoded {}",
            total, decoded
        )));
    }

    FrameBuffer::new(Bytes::from(data), width, height, layout, pts)
}
