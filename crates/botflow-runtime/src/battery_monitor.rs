//! Background battery watch that raises [`Signal::LowBattery`].

use std::sync::Arc;
use std::time::Duration;

use botflow_link::StatusCache;
use botflow_types::{BotError, Signal};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::heartbeat::MIN_TICK;
use crate::scheduler::SignalSender;

#[derive(Debug, Clone)]
pub struct BatteryMonitorConfig {
    /// Percent below which the routine is aborted.  `0` disables the monitor.
    pub threshold: i64,
    pub interval: Duration,
}

impl Default for BatteryMonitorConfig {
    fn default() -> Self {
        Self {
            threshold: 50,
            interval: Duration::from_secs(30),
        }
    }
}

pub struct BatteryMonitor {
    cache: Arc<StatusCache>,
    signals: SignalSender,
    config: BatteryMonitorConfig,
    /// Cleared after a signal; set again once the level recovers.
    armed: bool,
}

impl BatteryMonitor {
    pub fn new(cache: Arc<StatusCache>, signals: SignalSender, config: BatteryMonitorConfig) -> Self {
        Self {
            cache,
            signals,
            config,
            armed: true,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        if self.config.threshold <= 0 {
            info!("battery monitor disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.config.interval.max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => { self.check(); }
            }
        }
    }

    /// Inspect the cache once.  Returns `true` when a signal was sent.
    pub fn check(&mut self) -> bool {
        let level = match self.cache.get() {
            Ok(status) => status.battery_level,
            Err(BotError::StatusStale { age_ms, .. }) => {
                debug!(age_ms, "battery reading is stale, skipping");
                return false;
            }
            Err(e) => {
                debug!(error = %e, "no battery reading yet");
                return false;
            }
        };

        if level >= self.config.threshold {
            if !self.armed {
                info!(level, "battery recovered");
            }
            self.armed = true;
            return false;
        }
        if !self.armed {
            return false;
        }

        warn!(level, threshold = self.config.threshold, "battery low, aborting routine");
        self.armed = false;
        if let Err(e) = self.signals.send(Signal::LowBattery) {
            warn!(error = %e, "could not deliver low-battery signal");
        }
        true
    }
}
