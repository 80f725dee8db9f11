//! Periodic data channel readiness logging

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::transport::{ChannelState, DataChannel};
use crate::utils::LogThrottler;

const NOT_OPEN_KEY: &str = "channel_not_open";

/// Logs the channel state once per interval
///
/// Changes are logged at info. While the channel stays open the tick is
/// logged at debug; while it stays not-open the debug line is throttled.
pub struct ChannelMonitor {
    channel: Arc<dyn DataChannel>,
    interval: Duration,
    throttler: LogThrottler,
    last: Option<ChannelState>,
}

impl ChannelMonitor {
    pub fn new(channel: Arc<dyn DataChannel>, interval: Duration) -> Self {
        Self {
            channel,
            interval,
            throttler: LogThrottler::new(interval * 10),
            last: None,
        }
    }

    /// Take one reading; returns `true` when the state changed
    pub fn observe(&mut self) -> bool {
        let state = self.channel.ready_state();
        let changed = self.last != Some(state);
        let label = self.channel.label();

        if changed {
            info!("Data channel '{}' state: {}", label, state);
            self.throttler.clear(NOT_OPEN_KEY);
        } else if state == ChannelState::Open {
            debug!("Data channel '{}' state: {}", label, state);
        } else if let Some(suppressed) = self.throttler.check(NOT_OPEN_KEY) {
            debug!(
                "Data channel '{}' still {} ({} repeats suppressed)",
                label, state, suppressed
            );
        }

        self.last = Some(state);
        changed
    }

    pub fn last_state(&self) -> Option<ChannelState> {
        self.last
    }

    /// Tick until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.observe();
                }
            }
        }
        debug!("Channel monitor for '{}' stopped", self.channel.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;

    #[test]
    fn test_observe_reports_changes_only() {
        let channel = MemoryChannel::new("coordinates");
        let mut monitor = ChannelMonitor::new(channel.clone(), Duration::from_secs(1));

        assert!(monitor.observe());
        assert_eq!(monitor.last_state(), Some(ChannelState::Connecting));
        assert!(!monitor.observe());

        channel.set_state(ChannelState::Open);
        assert!(monitor.observe());
        assert!(!monitor.observe());

        channel.set_state(ChannelState::Closed);
        assert!(monitor.observe());
        assert_eq!(monitor.last_state(), Some(ChannelState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let channel = MemoryChannel::new("coordinates");
        let monitor = ChannelMonitor::new(channel, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
