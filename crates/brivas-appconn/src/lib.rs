//! # Brivas Application Connection Stack
//!
//! Private RPC protocol linking gateway processes over TCP:
//!
//! - **IE** - Typed information elements and their TLV encoding
//! - **Message** - Async/sync call and ret envelopes
//! - **Connection** - Framing, task dispatch and sync call correlation
//! - **Pool** - Round-robin over indexed connections with echo liveness
//!   and reconnection
//!
//! ## Example
//! ```rust,ignore
//! use brivas_appconn::{AppClient, ClientConfig, InformationElement, Message, TaskRegistry};
//!
//! let tasks = Arc::new(TaskRegistry::new());
//! let client = AppClient::new(100, 200, tasks, ClientConfig::from_env()?)?;
//! client.start().await;
//!
//! let ret = client
//!     .dispatch(Message::call(6, [InformationElement::int(0, 42)]))
//!     .await?;
//! ```

pub mod config;
pub mod conn;
pub mod errors;
pub mod ie;
pub mod message;
pub mod pool;
pub mod server;
pub mod task;
pub mod telemetry;

// Re-exports
pub use config::{ClientConfig, EchoConfig, ServerConfig, DEFAULT_PORT};
pub use conn::{ConnState, Connection};
pub use errors::{AppConnError, CodecError, ConfigError, DispatchError, MessageError, Result};
pub use ie::{Code, Composite, IeType, InformationElement, LengthClass};
pub use message::{IoType, Message, MessageType, PROTOCOL_VERSION};
pub use pool::{AppClient, PoolStats};
pub use server::{AppServer, RegisterTask};
pub use task::{EchoTask, Task, TaskRegistry};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
