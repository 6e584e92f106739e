//! Connection
//!
//! One TCP link to a peer. The connection owns a receive loop that frames
//! inbound messages, runs the matching task for calls and hands sync rets to
//! the caller waiting on them. Outbound sync calls are correlated by id and
//! bounded by their time to live.

mod echo;
mod pending;
mod reader;

use crate::config::{ClientConfig, EchoConfig};
use crate::errors::DispatchError;
use crate::message::{Message, RegisterResult};
use crate::task::TaskRegistry;
use parking_lot::{Mutex, RwLock};
use pending::PendingCalls;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, instrument, trace, warn};

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnState {
    #[default]
    Offline,
    Online,
}

#[derive(Debug, Clone)]
struct Endpoint {
    address: String,
    port: u16,
    connect_timeout: Duration,
}

/// Signals for the tasks bound to one socket
struct Link {
    epoch: u64,
    shutdown: watch::Sender<bool>,
}

struct Writer {
    epoch: u64,
    half: OwnedWriteHalf,
}

pub(crate) struct ConnInner {
    local_id: i32,
    remote_id: i32,
    index: i16,
    /// `None` for accepted connections
    endpoint: Option<Endpoint>,
    registrable: bool,
    echo: EchoConfig,
    tasks: Arc<TaskRegistry>,
    state: RwLock<ConnState>,
    pending: PendingCalls,
    next_id: AtomicU32,
    epoch: AtomicU64,
    failed_echo: AtomicU32,
    link: Mutex<Option<Link>>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    peer_addr: Mutex<Option<SocketAddr>>,
}

/// Connection handle; clones share the same link
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Outbound connection to the peer described by `config`
    pub fn new(
        local_id: i32,
        remote_id: i32,
        index: i16,
        tasks: Arc<TaskRegistry>,
        config: &ClientConfig,
    ) -> Self {
        let endpoint = Endpoint {
            address: config.address.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout(),
        };
        Self::build(
            local_id,
            remote_id,
            index,
            Some(endpoint),
            config.registrable,
            config.echo,
            tasks,
        )
    }

    /// Wrap an accepted socket; the connection is online immediately
    pub async fn accept(stream: TcpStream, local_id: i32, tasks: Arc<TaskRegistry>) -> Self {
        let conn = Self::build(local_id, 0, 0, None, false, EchoConfig::default(), tasks);
        let epoch = conn.attach(stream).await;
        conn.go_online(epoch);
        conn
    }

    fn build(
        local_id: i32,
        remote_id: i32,
        index: i16,
        endpoint: Option<Endpoint>,
        registrable: bool,
        echo: EchoConfig,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                local_id,
                remote_id,
                index,
                endpoint,
                registrable,
                echo,
                tasks,
                state: RwLock::new(ConnState::Offline),
                pending: PendingCalls::default(),
                next_id: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                failed_echo: AtomicU32::new(0),
                link: Mutex::new(None),
                writer: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
                peer_addr: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ConnInner>) -> Self {
        Self { inner }
    }

    pub fn local_id(&self) -> i32 {
        self.inner.local_id
    }

    pub fn remote_id(&self) -> i32 {
        self.inner.remote_id
    }

    pub fn index(&self) -> i16 {
        self.inner.index
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Online
    }

    pub fn is_registrable(&self) -> bool {
        self.inner.registrable
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.inner.peer_addr.lock()
    }

    /// Sync calls currently awaiting a ret
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.inner.tasks
    }

    /// Open the socket, register when configured and go online
    ///
    /// Any failure leaves the connection offline with its socket released.
    #[instrument(skip(self), fields(remote_id = self.inner.remote_id, index = self.inner.index))]
    pub async fn start(&self) -> Result<(), DispatchError> {
        let Some(endpoint) = self.inner.endpoint.clone() else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "accepted connection cannot be restarted",
            )
            .into());
        };

        self.interrupt().await;

        let connect = TcpStream::connect((endpoint.address.as_str(), endpoint.port));
        let stream = match timeout(endpoint.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(address = %endpoint.address, port = endpoint.port, error = %e, "Connect failed");
                return Err(e.into());
            }
            Err(_) => {
                debug!(address = %endpoint.address, port = endpoint.port, "Connect timed out");
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out").into());
            }
        };

        let epoch = self.attach(stream).await;

        if self.inner.registrable {
            match self.register().await {
                Ok(RegisterResult::Accepted) => {}
                Ok(RegisterResult::Failed) => {
                    warn!("Registration refused");
                    metrics::counter!("appconn_registration_refused_total").increment(1);
                    self.interrupt().await;
                    return Err(DispatchError::RegistrationRefused {
                        remote_id: self.inner.remote_id,
                        index: self.inner.index,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Registration failed");
                    self.interrupt().await;
                    return Err(e);
                }
            }
        }

        let Some(shutdown) = self.go_online(epoch) else {
            return Err(self.interrupted());
        };
        if self.inner.registrable {
            echo::spawn(Arc::downgrade(&self.inner), self.inner.echo, shutdown, epoch);
        }
        info!(peer = ?self.peer_addr(), "Connection online");
        Ok(())
    }

    async fn register(&self) -> Result<RegisterResult, DispatchError> {
        let call = Message::register_call(
            self.inner.local_id,
            self.inner.remote_id,
            self.inner.index,
        );
        let ret = self.dispatch(call).await?;
        Ok(ret
            .as_ref()
            .map(RegisterResult::from_ret)
            .unwrap_or(RegisterResult::Failed))
    }

    /// Bind a fresh socket and spawn its receive loop
    async fn attach(&self, stream: TcpStream) -> u64 {
        let peer_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        *self.inner.writer.lock().await = Some(Writer {
            epoch,
            half: write_half,
        });
        *self.inner.peer_addr.lock() = peer_addr;
        *self.inner.link.lock() = Some(Link {
            epoch,
            shutdown: shutdown_tx,
        });

        let handle = tokio::spawn(reader::run(
            Arc::downgrade(&self.inner),
            read_half,
            shutdown_rx,
            epoch,
        ));
        *self.inner.reader.lock() = Some(handle);
        epoch
    }

    /// Mark online if the socket of `epoch` is still bound
    fn go_online(&self, epoch: u64) -> Option<watch::Receiver<bool>> {
        let link = self.inner.link.lock();
        let current = link.as_ref().filter(|l| l.epoch == epoch)?;
        self.inner.failed_echo.store(0, Ordering::Relaxed);
        *self.inner.state.write() = ConnState::Online;
        Some(current.shutdown.subscribe())
    }

    fn interrupted(&self) -> DispatchError {
        DispatchError::Interrupted {
            remote_id: self.inner.remote_id,
            index: self.inner.index,
        }
    }

    /// Stop the link: signal the receive loop and echo timer, close the
    /// socket, fail outstanding sync calls and go offline. Idempotent.
    pub async fn interrupt(&self) {
        self.teardown(None).await;
    }

    /// Tear down the link bound at `epoch`, or whatever is bound when `None`
    pub(crate) async fn teardown(&self, epoch: Option<u64>) {
        let link = {
            let mut link = self.inner.link.lock();
            match (epoch, link.as_ref()) {
                (Some(expected), Some(current)) if current.epoch != expected => return,
                (Some(_), None) => return,
                _ => {}
            }
            *self.inner.state.write() = ConnState::Offline;
            link.take()
        };
        let Some(link) = link else {
            return;
        };

        // releases writes parked on a peer that stopped reading
        let _ = link.shutdown.send(true);
        let woken = self.inner.pending.drain();

        let writer = {
            let mut writer = self.inner.writer.lock().await;
            match writer.as_ref() {
                Some(w) if w.epoch == link.epoch => writer.take(),
                _ => None,
            }
        };
        if let Some(mut writer) = writer {
            let _ = writer.half.shutdown().await;
        }

        info!(
            remote_id = self.inner.remote_id,
            index = self.inner.index,
            woken,
            "Connection offline"
        );
    }

    /// Wait for the receive loop of the current socket to exit
    pub async fn join(&self) {
        let handle = self.inner.reader.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Send `msg`; sync calls wait for their ret until the time to live expires
    ///
    /// Returns `Ok(None)` for async messages and sync rets once written.
    #[instrument(skip_all, fields(remote_id = self.inner.remote_id, index = self.inner.index, code = msg.code()))]
    pub async fn dispatch(&self, mut msg: Message) -> Result<Option<Message>, DispatchError> {
        if !msg.is_sync_call() {
            self.write(&msg, None).await?;
            return Ok(None);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        msg.set_id(id);
        let time_to_live = msg.time_to_live();
        let deadline = Instant::now() + Duration::from_secs(u64::from(time_to_live));

        let mut call = self.inner.pending.register(id);
        let timed_out = || {
            metrics::counter!("appconn_dispatch_timeouts_total").increment(1);
            warn!(id, time_to_live, "Sync call timed out");
            DispatchError::Timeout {
                remote_id: self.inner.remote_id,
                code: msg.code(),
                time_to_live,
            }
        };

        match self.write(&msg, Some(deadline)).await {
            Ok(()) => trace!(id, msg = %msg.to_json(), "Sync call sent"),
            Err(WriteError::Expired) => return Err(timed_out()),
            Err(WriteError::Failed(e)) => return Err(e),
        }

        match timeout_at(deadline, call.wait()).await {
            Ok(Some(ret)) => Ok(Some(ret)),
            Ok(None) => Err(self.interrupted()),
            Err(_) => Err(timed_out()),
        }
    }

    /// Write one frame, giving up when the link is torn down or `deadline`
    /// passes. A frame cut short leaves the stream unframed, so the link is
    /// torn down as well.
    async fn write(&self, msg: &Message, deadline: Option<Instant>) -> Result<(), WriteError> {
        let frame = msg.encode().map_err(DispatchError::from)?;
        let (epoch, mut shutdown) = {
            let link = self.inner.link.lock();
            let link = link.as_ref().ok_or_else(offline)?;
            (link.epoch, link.shutdown.subscribe())
        };
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expired);

        let mut writer = tokio::select! {
            writer = self.inner.writer.lock() => writer,
            _ = shutdown.wait_for(|stop| *stop) => return Err(self.interrupted().into()),
            _ = &mut expired => return Err(WriteError::Expired),
        };
        let half = match writer.as_mut() {
            Some(w) if w.epoch == epoch => &mut w.half,
            _ => return Err(offline().into()),
        };

        let written = tokio::select! {
            result = half.write_all(&frame) => result.map_err(|e| WriteError::Failed(e.into())),
            _ = shutdown.wait_for(|stop| *stop) => Err(self.interrupted().into()),
            _ = &mut expired => Err(WriteError::Expired),
        };
        drop(writer);

        match written {
            Ok(()) => {
                metrics::counter!("appconn_frames_sent_total").increment(1);
                Ok(())
            }
            Err(e) => {
                self.teardown(Some(epoch)).await;
                Err(e)
            }
        }
    }

    /// Process one inbound message
    async fn handle(&self, msg: Message, received_at: Instant) {
        if msg.is_sync() && msg.is_ret() {
            if !self.inner.pending.complete(msg.id(), msg) {
                debug!("Ret without a pending call");
            }
            return;
        }

        let code = msg.code();
        let Some(task) = self.inner.tasks.get(code) else {
            warn!(code, "No task registered");
            return;
        };

        if !msg.is_sync_call() {
            if let Err(e) = task.execute(self, &msg).await {
                warn!(code, error = %e, "Task failed");
            }
            return;
        }

        let deadline = received_at + Duration::from_secs(u64::from(msg.time_to_live()));
        match task.execute(self, &msg).await {
            Ok(Some(mut ret)) => {
                if Instant::now() >= deadline {
                    warn!(code, id = msg.id(), "Task exceeded time to live, ret dropped");
                    return;
                }
                ret.set_id(msg.id());
                match self.write(&ret, Some(deadline)).await {
                    Ok(()) => {}
                    Err(WriteError::Expired) => {
                        warn!(code, id = msg.id(), "Ret write exceeded time to live")
                    }
                    Err(WriteError::Failed(e)) => warn!(code, error = %e, "Failed to send ret"),
                }
            }
            Ok(None) => warn!(code, "Task produced no ret for sync call"),
            Err(e) => warn!(code, error = %e, "Task failed"),
        }
    }
}

fn offline() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is offline")
}

/// Why a frame did not make it onto the socket
enum WriteError {
    /// The caller's deadline passed first
    Expired,
    Failed(DispatchError),
}

impl From<DispatchError> for WriteError {
    fn from(e: DispatchError) -> Self {
        Self::Failed(e)
    }
}

impl From<io::Error> for WriteError {
    fn from(e: io::Error) -> Self {
        Self::Failed(e.into())
    }
}

impl From<WriteError> for DispatchError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::Failed(e) => e,
            WriteError::Expired => io::Error::new(io::ErrorKind::TimedOut, "write timed out").into(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local_id", &self.inner.local_id)
            .field("remote_id", &self.inner.remote_id)
            .field("index", &self.inner.index)
            .field("state", &self.state())
            .finish()
    }
}
