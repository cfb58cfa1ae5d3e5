//! Worker → event loop handoff queue.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tracing::debug;

use mediad_core::{DeviceAction, DeviceRecord};

use super::worker::{lock, SharedState};

/// One item delivered to a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    /// An accepted action; the record is shared with every other queue.
    Device {
        record: Arc<DeviceRecord>,
        action: DeviceAction,
    },
    /// The worker hit a fatal backend error and stopped.
    Exit,
}

/// FIFO of accepted monitor actions for one consumer.
///
/// [`recv`](Self::recv) is the readiness signal: it resolves when an item is
/// available without the consumer polling. Dropping the queue unregisters it
/// and releases anything still queued.
#[derive(Debug)]
pub struct MonitorQueue {
    id: u64,
    receiver: mpsc::UnboundedReceiver<QueueItem>,
    shared: Weak<std::sync::Mutex<SharedState>>,
}

impl MonitorQueue {
    pub(super) fn new(
        id: u64,
        receiver: mpsc::UnboundedReceiver<QueueItem>,
        shared: Weak<std::sync::Mutex<SharedState>>,
    ) -> Self {
        Self {
            id,
            receiver,
            shared,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next item.
    ///
    /// Returns `None` once the monitor itself is gone. Cancel-safe.
    pub async fn recv(&mut self) -> Option<QueueItem> {
        self.receiver.recv().await
    }

    /// Takes the next item if one is ready.
    pub fn pop(&mut self) -> Option<QueueItem> {
        self.receiver.try_recv().ok()
    }

    /// Removes this queue from the fan-out set, releasing queued items.
    pub fn unregister(self) {
        drop(self);
    }
}

impl Drop for MonitorQueue {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared).queues.remove(&self.id);
        }
        self.receiver.close();
        let mut released = 0usize;
        while self.receiver.try_recv().is_ok() {
            released += 1;
        }
        debug!(queue = self.id, released, "Monitor queue unregistered");
    }
}
