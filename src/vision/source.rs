//! Synthetic bouncing ball video source

use std::sync::Arc;

use tracing::trace;

use super::clock::FrameClock;
use super::frame::{Canvas, FrameBuffer, PixelLayout};
use crate::config::VideoConfig;
use crate::tracking::coords::{CoordinatePair, CoordinateSlot};

const BACKGROUND: [u8; 3] = [255, 255, 255];
const BALL_COLOR: [u8; 3] = [0, 0, 255];

/// Ball kinematics in integer pixel space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BallState {
    pub position: (i32, i32),
    pub velocity: (i32, i32),
}

impl BallState {
    /// Ball at the centre of a `width` x `height` frame
    pub fn centered(width: u32, height: u32, velocity: (i32, i32)) -> Self {
        Self {
            position: ((width / 2) as i32, (height / 2) as i32),
            velocity,
        }
    }

    /// Advance one tick
    ///
    /// The position is moved first and the velocity on an axis flips when the
    /// new position lies outside `[0, extent - size]`. The position is not
    /// clamped, so the ball may sit one step outside the bound for a tick.
    pub fn advance(&mut self, width: u32, height: u32, size: u32) {
        self.position.0 += self.velocity.0;
        self.position.1 += self.velocity.1;

        let max_x = width as i32 - size as i32;
        let max_y = height as i32 - size as i32;
        if self.position.0 < 0 || self.position.0 > max_x {
            self.velocity.0 = -self.velocity.0;
        }
        if self.position.1 < 0 || self.position.1 > max_y {
            self.velocity.1 = -self.velocity.1;
        }
    }
}

/// Renders one frame per tick and publishes the ball position as ground truth
pub struct BallSource {
    state: BallState,
    width: u32,
    height: u32,
    size: u32,
    radius: u32,
    clock: FrameClock,
    ground_truth: Arc<CoordinateSlot>,
}

impl BallSource {
    pub fn new(config: &VideoConfig, ground_truth: Arc<CoordinateSlot>) -> Self {
        let state = BallState::centered(config.width, config.height, config.velocity);
        ground_truth.store(state.position.into());
        Self {
            state,
            width: config.width,
            height: config.height,
            size: config.ball_size,
            radius: config.ball_radius,
            clock: FrameClock::new(config.fps),
            ground_truth,
        }
    }

    pub fn state(&self) -> BallState {
        self.state
    }

    pub fn ground_truth(&self) -> CoordinatePair {
        self.ground_truth.load()
    }

    /// Advance the ball and render the frame tagged with `pts`
    pub fn tick(&mut self, pts: u32) -> FrameBuffer {
        self.state.advance(self.width, self.height, self.size);
        let (x, y) = self.state.position;
        self.ground_truth.store(self.state.position.into());
        trace!("Ball at ({}, {}) pts={}", x, y, pts);

        let mut canvas = Canvas::new(self.width, self.height, PixelLayout::Bgr24, &BACKGROUND);
        canvas.fill_circle(x, y, self.radius as i32, &BALL_COLOR);
        canvas.into_frame(pts)
    }

    /// Wait for the frame clock and produce the next frame
    pub async fn next_frame(&mut self) -> FrameBuffer {
        let pts = self.clock.tick().await;
        self.tick(pts)
    }
}
