//! Outstanding sync call table

use crate::message::Message;
use dashmap::DashMap;
use tokio::sync::oneshot;

/// Sync calls awaiting their ret, keyed by message id
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    calls: DashMap<u32, oneshot::Sender<Message>>,
}

impl PendingCalls {
    /// Register `id`; the entry is dropped with the returned guard
    pub fn register(&self, id: u32) -> PendingCall<'_> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(id, tx);
        PendingCall {
            id,
            table: self,
            reply: rx,
        }
    }

    /// Hand `ret` to its waiting caller; false when nobody is waiting
    pub fn complete(&self, id: u32, ret: Message) -> bool {
        match self.calls.remove(&id) {
            Some((_, tx)) => tx.send(ret).is_ok(),
            None => false,
        }
    }

    /// Drop every entry, waking callers with a closed channel
    pub fn drain(&self) -> usize {
        let count = self.calls.len();
        self.calls.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Registration guard for one sync call
pub(crate) struct PendingCall<'a> {
    id: u32,
    table: &'a PendingCalls,
    reply: oneshot::Receiver<Message>,
}

impl PendingCall<'_> {
    /// Wait for the ret; `None` when the table was drained
    pub async fn wait(&mut self) -> Option<Message> {
        (&mut self.reply).await.ok()
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.table.calls.remove(&self.id);
    }
}
