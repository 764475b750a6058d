//! The live session with a connected peripheral.

use tokio::task::JoinHandle;

use crate::ble::transport::PeripheralId;
use crate::ble::write_queue::WriteQueue;
use crate::error::Result;

/// Resources owned by one connected peripheral: the notification task, the
/// disconnect watcher and the write queue.
///
/// Dropping the session releases all of them. The notification stream is
/// dropped with its task, which ends the subscription, and unsent writes
/// are discarded.
pub(crate) struct Session {
    peripheral: PeripheralId,
    writes: WriteQueue,
    notifications: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

impl Session {
    pub(crate) fn new(
        peripheral: PeripheralId,
        writes: WriteQueue,
        notifications: JoinHandle<()>,
        watcher: JoinHandle<()>,
    ) -> Self {
        Self {
            peripheral,
            writes,
            notifications,
            watcher,
        }
    }

    pub(crate) fn peripheral(&self) -> &PeripheralId {
        &self.peripheral
    }

    pub(crate) fn write(&self, bytes: Vec<u8>) -> Result<()> {
        self.writes.push(bytes)
    }

    pub(crate) fn pending_writes(&self) -> usize {
        self.writes.pending()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.notifications.abort();
        self.watcher.abort();
    }
}
