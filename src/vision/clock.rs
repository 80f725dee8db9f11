//! Frame pacing and presentation timestamps

use std::time::Duration;

use tokio::time::Instant;

/// RTP video clock rate
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Paces frame production at a fixed rate and hands out 90 kHz timestamps
///
/// Deadlines are derived from the start instant rather than chained sleeps,
/// so pacing does not drift when a tick runs late. A tick that is more than
/// one period late is not made up for.
#[derive(Debug)]
pub struct FrameClock {
    period: Duration,
    ticks_per_frame: u32,
    frame_index: u64,
    next_deadline: Option<Instant>,
}

impl FrameClock {
    pub fn new(fps: u32) -> Self {
        let fps = fps.max(1);
        Self {
            period: Duration::from_secs(1) / fps,
            ticks_per_frame: VIDEO_CLOCK_RATE / fps,
            frame_index: 0,
            next_deadline: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Number of frames handed out so far
    pub fn frames(&self) -> u64 {
        self.frame_index
    }

    /// Timestamp of the next frame without waiting
    pub fn next_pts(&mut self) -> u32 {
        let pts = (self.frame_index.wrapping_mul(self.ticks_per_frame as u64)) as u32;
        self.frame_index += 1;
        pts
    }

    /// Wait until the next frame is due, then return its timestamp
    pub async fn tick(&mut self) -> u32 {
        let now = Instant::now();
        let deadline = match self.next_deadline {
            None => now,
            Some(deadline) if deadline + self.period < now => now,
            Some(deadline) => deadline,
        };
        tokio::time::sleep_until(deadline).await;
        self.next_deadline = Some(deadline + self.period);
        self.next_pts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pts_advances_by_frame_duration() {
        let mut clock = FrameClock::new(30);
        assert_eq!(clock.next_pts(), 0);
        assert_eq!(clock.next_pts(), 3000);
        assert_eq!(clock.next_pts(), 6000);
        assert_eq!(clock.frames(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_paces_frames() {
        let mut clock = FrameClock::new(10);
        let start = Instant::now();

        assert_eq!(clock.tick().await, 0);
        assert_eq!(clock.tick().await, 9000);
        assert_eq!(clock.tick().await, 18000);

        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }
}
