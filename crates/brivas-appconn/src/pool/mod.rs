//! Connection pool
//!
//! [`AppClient`] owns the indexed connections to one logical peer, picks an
//! online member round-robin for each dispatch and, when persistent,
//! periodically restarts members that went offline.

mod check;

use crate::config::ClientConfig;
use crate::conn::{ConnState, Connection};
use crate::errors::{ConfigError, DispatchError};
use crate::message::{Message, ECHO_CALL};
use crate::task::TaskRegistry;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[derive(Default)]
struct Members {
    conns: BTreeMap<i16, Connection>,
    cursor: usize,
}

pub(crate) struct ClientInner {
    local_id: i32,
    remote_id: i32,
    config: ClientConfig,
    tasks: Arc<TaskRegistry>,
    members: Mutex<Members>,
    state: RwLock<ConnState>,
    check: Mutex<Option<check::CheckHandle>>,
    /// The echo responder was installed by this pool
    echo_installed: bool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if self.echo_installed {
            self.tasks.remove(ECHO_CALL);
        }
    }
}

/// Pool snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub online: usize,
    pub pending_calls: usize,
    pub state: ConnState,
}

/// Pool of connections to one remote peer
#[derive(Clone)]
pub struct AppClient {
    inner: Arc<ClientInner>,
}

impl AppClient {
    /// Create an idle pool; registrable pools answer echo probes on `tasks`
    pub fn new(
        local_id: i32,
        remote_id: i32,
        tasks: Arc<TaskRegistry>,
        config: ClientConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let echo_installed = config.registrable && tasks.install_echo();
        Ok(Self {
            inner: Arc::new(ClientInner {
                local_id,
                remote_id,
                config,
                tasks,
                members: Mutex::new(Members::default()),
                state: RwLock::new(ConnState::Offline),
                check: Mutex::new(None),
                echo_installed,
            }),
        })
    }

    pub fn local_id(&self) -> i32 {
        self.inner.local_id
    }

    pub fn remote_id(&self) -> i32 {
        self.inner.remote_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.inner.tasks
    }

    /// Aggregate state: online while any member is online
    pub fn state(&self) -> ConnState {
        *self.inner.state.read()
    }

    fn set_state(&self, state: ConnState) {
        let previous = std::mem::replace(&mut *self.inner.state.write(), state);
        if previous != state {
            info!(remote_id = self.inner.remote_id, ?state, "Pool state changed");
        }
    }

    fn refresh_state(&self) {
        let online = self.members().iter().any(Connection::is_connected);
        self.set_state(if online {
            ConnState::Online
        } else {
            ConnState::Offline
        });
    }

    /// Open one connection per configured index
    ///
    /// Members that fail to start stay in the pool offline; persistent pools
    /// retry them every check period.
    #[instrument(skip(self), fields(remote_id = self.inner.remote_id))]
    pub async fn start(&self) {
        for index in self.inner.config.indexes() {
            let conn = Connection::new(
                self.inner.local_id,
                self.inner.remote_id,
                index,
                Arc::clone(&self.inner.tasks),
                &self.inner.config,
            );
            if let Err(e) = conn.start().await {
                warn!(index, error = %e, "Connection failed to start");
            }
            self.add(conn).await;
        }
        self.refresh_state();
        info!(
            size = self.size(),
            state = ?self.state(),
            "Pool started"
        );

        if self.inner.config.persistent {
            self.schedule_check();
        }
    }

    /// Insert `conn` under its index, interrupting any member it replaces
    pub async fn add(&self, conn: Connection) {
        let replaced = {
            let mut members = self.inner.members.lock();
            members.cursor = 0;
            members.conns.insert(conn.index(), conn)
        };
        if let Some(old) = replaced {
            old.interrupt().await;
        }
        self.refresh_state();
    }

    /// Detach and interrupt the member at `index`
    pub async fn remove(&self, index: i16) -> Option<Connection> {
        let removed = {
            let mut members = self.inner.members.lock();
            members.cursor = 0;
            members.conns.remove(&index)
        };
        if let Some(conn) = &removed {
            conn.interrupt().await;
        }
        self.refresh_state();
        removed
    }

    pub fn get(&self, index: i16) -> Option<Connection> {
        self.inner.members.lock().conns.get(&index).cloned()
    }

    /// Members in index order
    pub fn members(&self) -> Vec<Connection> {
        self.inner.members.lock().conns.values().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.inner.members.lock().conns.len()
    }

    /// Next online member, round-robin
    ///
    /// The cursor moves past every member examined, so offline members do
    /// not skew the distribution over online ones.
    pub fn next(&self) -> Option<Connection> {
        let mut members = self.inner.members.lock();
        let len = members.conns.len();
        for _ in 0..len {
            let pos = members.cursor % len;
            members.cursor = (pos + 1) % len;
            if let Some(conn) = members.conns.values().nth(pos) {
                if conn.is_connected() {
                    return Some(conn.clone());
                }
            }
        }
        None
    }

    /// Dispatch on the next online member
    pub async fn dispatch(&self, msg: Message) -> Result<Option<Message>, DispatchError> {
        let Some(conn) = self.next() else {
            metrics::counter!("appconn_no_healthy_connection_total").increment(1);
            return Err(DispatchError::NoHealthyConnection {
                remote_id: self.inner.remote_id,
                code: msg.code(),
            });
        };
        conn.dispatch(msg).await
    }

    /// Go offline, stop the check timer, then interrupt, join and drop every
    /// member
    #[instrument(skip(self), fields(remote_id = self.inner.remote_id))]
    pub async fn interrupt(&self) {
        self.set_state(ConnState::Offline);
        let check = self.inner.check.lock().take();
        if let Some(check) = check {
            check.stop().await;
        }

        for conn in self.members() {
            conn.interrupt().await;
            conn.join().await;
            self.inner.members.lock().conns.remove(&conn.index());
        }
        self.inner.members.lock().cursor = 0;
        // a check cycle cut short may have refreshed the state
        self.set_state(ConnState::Offline);
        info!("Pool interrupted");
    }

    pub fn stats(&self) -> PoolStats {
        let members = self.members();
        PoolStats {
            size: members.len(),
            online: members.iter().filter(|c| c.is_connected()).count(),
            pending_calls: members.iter().map(Connection::pending_calls).sum(),
            state: self.state(),
        }
    }
}

impl std::fmt::Debug for AppClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppClient")
            .field("local_id", &self.inner.local_id)
            .field("remote_id", &self.inner.remote_id)
            .field("size", &self.size())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig {
            address: "127.0.0.1".to_string(),
            port: 1,
            size: 3,
            registrable: false,
            persistent: false,
            connect_timeout_ms: 500,
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_empty_pool_has_no_healthy_connection() {
        let client = AppClient::new(1, 2, Arc::new(TaskRegistry::new()), config()).unwrap();
        assert!(client.next().is_none());

        let err = client.dispatch(Message::call(7, [])).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::NoHealthyConnection { remote_id: 2, code: 7 }
        ));
    }

    #[tokio::test]
    async fn test_offline_members_are_skipped() {
        let client = AppClient::new(1, 2, Arc::new(TaskRegistry::new()), config()).unwrap();
        for index in 0..3 {
            let conn = Connection::new(1, 2, index, Arc::clone(client.tasks()), client.config());
            client.add(conn).await;
        }
        assert_eq!(client.size(), 3);
        assert!(client.next().is_none());
        assert_eq!(client.stats().online, 0);

        assert!(client.remove(1).await.is_some());
        assert_eq!(client.size(), 2);
        assert!(client.get(1).is_none());
    }

    #[tokio::test]
    async fn test_echo_task_lifecycle() {
        let tasks = Arc::new(TaskRegistry::new());
        let registrable = ClientConfig {
            registrable: true,
            ..config()
        };
        let client = AppClient::new(1, 2, Arc::clone(&tasks), registrable).unwrap();
        assert!(tasks.contains(ECHO_CALL));

        drop(client);
        assert!(!tasks.contains(ECHO_CALL));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = ClientConfig {
            address: String::new(),
            ..config()
        };
        assert!(matches!(
            AppClient::new(1, 2, Arc::new(TaskRegistry::new()), bad),
            Err(ConfigError::NullProperty(_))
        ));
    }
}
