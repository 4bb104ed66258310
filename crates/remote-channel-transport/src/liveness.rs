//! Liveness monitor: races each probe against a timer.
//!
//! A probe goes out every `interval` and is judged after `timeout`, which is
//! shorter than the interval, so a probe never overlaps the previous one.

use remote_channel_core::{ConnectionError, LivenessConfig};
use tokio::{task::JoinHandle, time::Instant};

use crate::bus::Bus;

/// Run [`monitor`] on its own task.
#[must_use]
pub fn spawn_monitor(bus: Bus, config: LivenessConfig) -> JoinHandle<()> {
    tokio::spawn(monitor(bus, config))
}

/// Probe `bus` until it ends. A probe left unanswered past the timeout
/// fails the bus with [`ConnectionError::LivenessTimeout`].
pub async fn monitor(bus: Bus, config: LivenessConfig) {
    let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if bus.state().is_terminal() {
            break;
        }

        match tokio::time::timeout(config.timeout, bus.ping()).await {
            Ok(Ok(())) => tracing::trace!("Liveness probe answered"),
            Ok(Err(e)) => {
                tracing::debug!("Liveness probe aborted: {e}");
                break;
            }
            Err(_) => {
                tracing::warn!(timeout = ?config.timeout, "Liveness probe unanswered");
                bus.fail(ConnectionError::LivenessTimeout);
                break;
            }
        }
    }
}
