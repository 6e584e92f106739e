//! Echo liveness probing

use super::{ConnInner, Connection};
use crate::config::EchoConfig;
use crate::errors::DispatchError;
use crate::message::Message;
use std::sync::atomic::Ordering;
use std::sync::Weak;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Probe the link bound at `epoch` every period until it is torn down
pub(super) fn spawn(
    conn: Weak<ConnInner>,
    config: EchoConfig,
    mut shutdown: watch::Receiver<bool>,
    epoch: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = config.period();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let Some(inner) = conn.upgrade() else {
                break;
            };
            if !Connection::from_inner(inner).probe(&config, epoch).await {
                break;
            }
        }
        debug!(epoch, "Echo stopped");
    })
}

impl Connection {
    /// Send one echo; false once the link is gone
    async fn probe(&self, config: &EchoConfig, epoch: u64) -> bool {
        let call = Message::echo_call()
            .with_time_to_live(u16::from(config.time_to_live))
            .unwrap_or_else(|_| Message::echo_call());

        match self.dispatch(call).await {
            Ok(_) => {
                self.inner.failed_echo.store(0, Ordering::Relaxed);
                trace!("Echo answered");
                true
            }
            Err(DispatchError::Interrupted { .. }) => false,
            Err(e) => {
                let failed = self.inner.failed_echo.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("appconn_echo_failures_total").increment(1);
                debug!(failed, error = %e, "Echo failed");
                if failed >= config.max_failed {
                    warn!(
                        remote_id = self.inner.remote_id,
                        index = self.inner.index,
                        failed,
                        "Echo failure limit reached"
                    );
                    self.teardown(Some(epoch)).await;
                    return false;
                }
                true
            }
        }
    }
}
