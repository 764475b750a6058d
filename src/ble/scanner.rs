//! BLE scanning functionality.
//!
//! Keeps a scan cache of every peripheral seen (last advertisement wins) and
//! forwards named advertisements to the caller.

use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::ble::transport::{DiscoveredDevice, PeripheralId, Transport};
use crate::error::Result;

type FoundCallback = Arc<dyn Fn(&DiscoveredDevice) + Send + Sync>;

/// BLE scanner for discovering trackers.
pub struct BleScanner {
    /// Transport performing discovery.
    transport: Arc<dyn Transport>,
    /// Whether scanning is currently active.
    is_scanning: Arc<AtomicBool>,
    /// Scan cache keyed by peripheral identifier.
    discovered: Arc<RwLock<HashMap<PeripheralId, DiscoveredDevice>>>,
    /// Channel for discovery events.
    event_tx: broadcast::Sender<DiscoveredDevice>,
    /// Handle to the scanning task.
    scan_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BleScanner {
    /// Create a new BLE scanner.
    pub fn new(transport: Arc<dyn Transport>, capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            transport,
            is_scanning: Arc::new(AtomicBool::new(false)),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            scan_handle: Mutex::new(None),
        }
    }

    /// Start scanning, forwarding named advertisements to `on_found`.
    ///
    /// A no-op if a scan is already running. Restarting clears the cache.
    pub async fn start_scanning<F>(&self, on_found: F) -> Result<()>
    where
        F: Fn(&DiscoveredDevice) + Send + Sync + 'static,
    {
        if self
            .is_scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan");
        self.discovered.write().clear();

        let mut advertisements = match self.transport.start_discovery().await {
            Ok(stream) => stream,
            Err(e) => {
                self.is_scanning.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let on_found: FoundCallback = Arc::new(on_found);
        let is_scanning = self.is_scanning.clone();
        let discovered = self.discovered.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(device) = advertisements.next().await {
                Self::handle_advertisement(device, &discovered, &event_tx, &on_found);
            }

            warn!("Discovery stream ended, scan stopped");
            is_scanning.store(false, Ordering::SeqCst);
        });

        if let Some(previous) = self.scan_handle.lock().replace(handle) {
            previous.abort();
        }

        Ok(())
    }

    /// Stop scanning. Safe to call when no scan is active.
    pub async fn stop_scanning(&self) -> Result<()> {
        let was_scanning = self.is_scanning.swap(false, Ordering::SeqCst);
        let handle = self.scan_handle.lock().take();

        if let Some(handle) = handle {
            handle.abort();
        }

        if !was_scanning {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");
        self.transport.stop_discovery().await
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.is_scanning.load(Ordering::SeqCst)
    }

    /// Look a device up in the scan cache.
    pub fn cached(&self, id: &PeripheralId) -> Option<DiscoveredDevice> {
        self.discovered.read().get(id).cloned()
    }

    /// Get all devices in the scan cache.
    pub fn discovered_devices(&self) -> HashMap<PeripheralId, DiscoveredDevice> {
        self.discovered.read().clone()
    }

    /// Subscribe to named advertisements.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveredDevice> {
        self.event_tx.subscribe()
    }

    fn handle_advertisement(
        device: DiscoveredDevice,
        discovered: &RwLock<HashMap<PeripheralId, DiscoveredDevice>>,
        event_tx: &broadcast::Sender<DiscoveredDevice>,
        on_found: &FoundCallback,
    ) {
        trace!("Advertisement from {} (rssi {:?})", device.id, device.rssi);

        discovered.write().insert(device.id.clone(), device.clone());

        if !device.is_named() {
            return;
        }

        on_found(&device);
        let _ = event_tx.send(device);
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.is_scanning.store(false, Ordering::SeqCst);
        if let Some(handle) = self.scan_handle.get_mut().take() {
            handle.abort();
        }
    }
}
