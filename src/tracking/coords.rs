//! Coordinate values and the shared latest-estimate slot

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A point in frame pixel space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CoordinatePair {
    pub x: f64,
    pub y: f64,
}

impl CoordinatePair {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for CoordinatePair {
    fn from((x, y): (i32, i32)) -> Self {
        Self::new(x as f64, y as f64)
    }
}

/// Wire form is `"x,y"`
impl fmt::Display for CoordinatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// Malformed coordinate report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportParseError {
    #[error("report has no ',' separator")]
    MissingSeparator,
    #[error("invalid {axis} component '{value}'")]
    InvalidComponent { axis: char, value: String },
}

impl FromStr for CoordinatePair {
    type Err = ReportParseError;

    /// Split on the first comma; each side is an integer or float
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, y) = s.trim().split_once(',').ok_or(ReportParseError::MissingSeparator)?;
        Ok(Self::new(parse_component('x', x)?, parse_component('y', y)?))
    }
}

fn parse_component(axis: char, raw: &str) -> Result<f64, ReportParseError> {
    let value = raw.trim();
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ReportParseError::InvalidComponent {
            axis,
            value: value.to_string(),
        }),
    }
}

/// Most recent coordinate estimate
///
/// Writers replace the whole pair in one atomic swap, so readers never see
/// x from one estimate and y from another.
#[derive(Debug)]
pub struct CoordinateSlot {
    current: ArcSwap<CoordinatePair>,
    updates: AtomicU64,
}

impl CoordinateSlot {
    pub fn new(initial: CoordinatePair) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            updates: AtomicU64::new(0),
        }
    }

    pub fn shared(initial: CoordinatePair) -> Arc<Self> {
        Arc::new(Self::new(initial))
    }

    pub fn load(&self) -> CoordinatePair {
        **self.current.load()
    }

    pub fn store(&self, value: CoordinatePair) {
        self.current.store(Arc::new(value));
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of stores since creation
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

impl Default for CoordinateSlot {
    fn default() -> Self {
        Self::new(CoordinatePair::default())
    }
}
