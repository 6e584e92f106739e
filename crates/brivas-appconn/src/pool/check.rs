//! Periodic member health check

use super::{AppClient, ClientInner};
use crate::conn::ConnState;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

pub(super) struct CheckHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CheckHandle {
    /// Stop the timer, cancelling a cycle in progress
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn run(client: Weak<ClientInner>, mut shutdown: watch::Receiver<bool>) {
    let Some(period) = client.upgrade().map(|c| c.config.check_period()) else {
        return;
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let Some(inner) = client.upgrade() else {
            break;
        };
        AppClient { inner }.check().await;
    }
    debug!("Pool check stopped");
}

impl AppClient {
    pub(super) fn schedule_check(&self) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(Arc::downgrade(&self.inner), shutdown_rx));
        let previous = self.inner.check.lock().replace(CheckHandle {
            shutdown: shutdown_tx,
            task,
        });
        if let Some(previous) = previous {
            let _ = previous.shutdown.send(true);
            previous.task.abort();
        }
    }

    /// Restart every offline member, then recompute the pool state
    pub async fn check(&self) {
        for conn in self.members() {
            if conn.state() == ConnState::Online {
                continue;
            }
            metrics::counter!("appconn_reconnect_attempts_total").increment(1);
            match conn.start().await {
                Ok(()) => info!(index = conn.index(), "Connection restarted"),
                Err(e) => debug!(index = conn.index(), error = %e, "Restart failed"),
            }
        }
        self.refresh_state();
    }
}
