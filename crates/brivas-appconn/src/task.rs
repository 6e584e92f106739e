//! Task registry
//!
//! Inbound calls are routed by code to a [`Task`]. A registry is shared by
//! every connection of a pool (or of a server) and may be mutated while
//! connections are running.

use crate::conn::Connection;
use crate::message::{Message, ECHO_CALL};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Handler for inbound calls of one code
///
/// A sync call expects `Some(reply)`; the connection stamps the call id on it.
/// The return value of async calls is ignored.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    async fn execute(&self, conn: &Connection, msg: &Message) -> anyhow::Result<Option<Message>>;
}

#[async_trait]
impl<F> Task for F
where
    F: Fn(&Connection, &Message) -> anyhow::Result<Option<Message>> + Send + Sync + 'static,
{
    async fn execute(&self, conn: &Connection, msg: &Message) -> anyhow::Result<Option<Message>> {
        (self)(conn, msg)
    }
}

/// Answers echo probes with an empty sync ret
pub struct EchoTask;

#[async_trait]
impl Task for EchoTask {
    async fn execute(&self, _conn: &Connection, _msg: &Message) -> anyhow::Result<Option<Message>> {
        Ok(Some(Message::echo_ret()))
    }
}

/// Code to task mapping
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<u8, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` for `code`, returning the task it replaces
    pub fn register(&self, code: u8, task: impl Task) -> Option<Arc<dyn Task>> {
        self.register_arc(code, Arc::new(task))
    }

    pub fn register_arc(&self, code: u8, task: Arc<dyn Task>) -> Option<Arc<dyn Task>> {
        self.tasks.insert(code, task)
    }

    /// Register `task` only when `code` is free
    pub fn register_if_absent(&self, code: u8, task: impl Task) -> bool {
        match self.tasks.entry(code) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(task));
                true
            }
        }
    }

    pub fn get(&self, code: u8) -> Option<Arc<dyn Task>> {
        self.tasks.get(&code).map(|t| Arc::clone(t.value()))
    }

    pub fn remove(&self, code: u8) -> Option<Arc<dyn Task>> {
        self.tasks.remove(&code).map(|(_, t)| t)
    }

    pub fn contains(&self, code: u8) -> bool {
        self.tasks.contains_key(&code)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Install the echo responder unless a task already owns the code
    pub fn install_echo(&self) -> bool {
        self.register_if_absent(ECHO_CALL, EchoTask)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codes: Vec<u8> = self.tasks.iter().map(|e| *e.key()).collect();
        codes.sort_unstable();
        f.debug_struct("TaskRegistry").field("codes", &codes).finish()
    }
}
