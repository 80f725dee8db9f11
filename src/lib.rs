//! bounce-track - peer-to-peer WebRTC ball tracking
//!
//! The producer renders a bouncing ball, streams it over a WebRTC video
//! track and scores the coordinates it receives back. The consumer answers
//! the offer, localizes the ball in each received frame on a dedicated
//! worker and reports its latest estimate over a data channel.

pub mod config;
pub mod error;
pub mod session;
pub mod tracking;
pub mod transport;
pub mod utils;
pub mod vision;

#[cfg(test)]
mod testing;

pub use error::{AppError, Result};
