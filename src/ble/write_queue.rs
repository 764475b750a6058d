//! Serialized command writes.
//!
//! Entries are written strictly in submission order with at most one write
//! outstanding. A failed write is logged and dropped; the queue moves on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::codec::bytes_to_wire;
use crate::ble::transport::{PeripheralId, Transport};
use crate::error::{Error, Result};

/// Where queued entries are written.
#[derive(Debug, Clone)]
pub struct WriteTarget {
    /// Connected peripheral.
    pub peripheral: PeripheralId,
    /// Data service.
    pub service: Uuid,
    /// Write characteristic.
    pub characteristic: Uuid,
}

/// FIFO of outgoing frames drained by a single worker task.
///
/// Dropping the queue stops the worker and discards unsent entries.
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

impl WriteQueue {
    /// Start a queue writing to `target`.
    pub fn start(transport: Arc<dyn Transport>, target: WriteTarget) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();

        let worker = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                trace!("Writing {} bytes to {}", entry.len(), target.peripheral);

                let result = transport
                    .write_with_response(
                        &target.peripheral,
                        target.service,
                        target.characteristic,
                        bytes_to_wire(&entry),
                    )
                    .await;

                if let Err(e) = result {
                    warn!("Dropping write of {} bytes: {}", entry.len(), e);
                }
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
            debug!("Write queue closed");
        });

        Self { tx, pending, worker }
    }

    /// Enqueue one frame. Never waits for the transport.
    pub fn push(&self, bytes: Vec<u8>) -> Result<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(bytes).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            Error::QueueClosed
        })
    }

    /// Entries queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
