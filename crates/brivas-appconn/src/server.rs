//! Inbound peer
//!
//! Accepts connections from remote pools, answers their registration and
//! echo calls and routes everything else to the shared task registry.

use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::message::{ie_code, Message, RegisterResult, REGISTER_CALL};
use crate::task::{Task, TaskRegistry};
use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Accepts registrations addressed to `local_id`
pub struct RegisterTask {
    local_id: i32,
}

impl RegisterTask {
    pub fn new(local_id: i32) -> Self {
        Self { local_id }
    }
}

#[async_trait]
impl Task for RegisterTask {
    async fn execute(&self, conn: &Connection, msg: &Message) -> anyhow::Result<Option<Message>> {
        let peer_id = msg.get_int(ie_code::LOCAL_ID);
        let index = msg.get_short(ie_code::INDEX);
        let result = if msg.get_int(ie_code::REMOTE_ID) == Some(self.local_id) {
            RegisterResult::Accepted
        } else {
            RegisterResult::Failed
        };
        info!(
            peer = ?conn.peer_addr(),
            peer_id,
            index,
            ?result,
            "Registration"
        );
        Ok(Some(Message::register_ret(result)))
    }
}

/// TCP listener for remote pools
#[derive(Clone)]
pub struct AppServer {
    config: ServerConfig,
    listener: Arc<TcpListener>,
    tasks: Arc<TaskRegistry>,
    sessions: Arc<DashMap<u64, Connection>>,
    next_session: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppServer {
    /// Bind the listener and install the register and echo responders
    /// unless `tasks` already provides them
    pub async fn bind(config: ServerConfig, tasks: Arc<TaskRegistry>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        tasks.register_if_absent(REGISTER_CALL, RegisterTask::new(config.local_id));
        tasks.install_echo();
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            listener: Arc::new(listener),
            tasks,
            sessions: Arc::new(DashMap::new()),
            next_session: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Accept until [`AppServer::stop`] is called
    pub async fn run(&self) -> io::Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        info!(address = %self.local_addr()?, local_id = self.config.local_id, "Peer listening");

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((socket, addr)) => self.on_accept(socket, addr).await,
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("Peer stopped");
        Ok(())
    }

    async fn on_accept(&self, socket: TcpStream, addr: SocketAddr) {
        if self.sessions.len() >= self.config.max_connections {
            warn!(%addr, "Max connections reached, rejecting");
            return;
        }

        let conn = Connection::accept(socket, self.config.local_id, Arc::clone(&self.tasks)).await;
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(session_id, conn.clone());
        metrics::counter!("appconn_connections_accepted_total").increment(1);
        debug!(%addr, session_id, "Connection accepted");

        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            conn.join().await;
            sessions.remove(&session_id);
            debug!(%addr, session_id, "Session ended");
        });
    }

    /// Accepted connections still open
    pub fn connections(&self) -> Vec<Connection> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stop accepting and close every accepted connection
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        for conn in self.connections() {
            conn.interrupt().await;
        }
    }
}
