//! Utility functions and helpers

pub mod throttle;

pub use throttle::LogThrottler;
