//! In-memory transport for unit tests.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::ble::codec::{wire_to_bytes, WireValue};
use crate::ble::transport::{AdapterState, DiscoveredDevice, NotificationFrame, PeripheralId, Transport};
use crate::ble::uuids::{DATA_SERVICE_UUID, NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID};
use crate::error::{Error, Result};

fn broadcast_stream<T: Clone + Send + 'static>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

fn channel_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Scriptable fake of a BLE binding.
pub(crate) struct FakeTransport {
    adapter_state: Mutex<AdapterState>,
    state_tx: broadcast::Sender<AdapterState>,
    known: Mutex<HashMap<PeripheralId, DiscoveredDevice>>,
    discovery_tx: Mutex<Option<mpsc::UnboundedSender<DiscoveredDevice>>>,
    connect_failures: Mutex<VecDeque<bool>>,
    fail_all_connects_after: Mutex<Option<usize>>,
    connect_calls: Mutex<Vec<PeripheralId>>,
    connect_delay: Mutex<Duration>,
    cancel_calls: Mutex<Vec<PeripheralId>>,
    services: Mutex<Vec<Uuid>>,
    characteristics: Mutex<Vec<Uuid>>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<NotificationFrame>>>,
    disconnect_tx: broadcast::Sender<PeripheralId>,
    writes: Mutex<Vec<Vec<u8>>>,
    write_delay: Mutex<Duration>,
    failing_writes: Mutex<HashSet<usize>>,
    write_attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::with_state(AdapterState::PoweredOn)
    }

    pub fn with_state(state: AdapterState) -> Self {
        let (state_tx, _) = broadcast::channel(16);
        let (disconnect_tx, _) = broadcast::channel(16);

        Self {
            adapter_state: Mutex::new(state),
            state_tx,
            known: Mutex::new(HashMap::new()),
            discovery_tx: Mutex::new(None),
            connect_failures: Mutex::new(VecDeque::new()),
            fail_all_connects_after: Mutex::new(None),
            connect_calls: Mutex::new(Vec::new()),
            connect_delay: Mutex::new(Duration::ZERO),
            cancel_calls: Mutex::new(Vec::new()),
            services: Mutex::new(vec![DATA_SERVICE_UUID]),
            characteristics: Mutex::new(vec![WRITE_CHARACTERISTIC_UUID, NOTIFY_CHARACTERISTIC_UUID]),
            notify_tx: Mutex::new(None),
            disconnect_tx,
            writes: Mutex::new(Vec::new()),
            write_delay: Mutex::new(Duration::ZERO),
            failing_writes: Mutex::new(HashSet::new()),
            write_attempts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    // --- adapter ---

    pub fn push_adapter_state(&self, state: AdapterState) {
        *self.adapter_state.lock() = state;
        let _ = self.state_tx.send(state);
    }

    pub fn set_adapter_state_silently(&self, state: AdapterState) {
        *self.adapter_state.lock() = state;
    }

    pub fn state_listener_count(&self) -> usize {
        self.state_tx.receiver_count()
    }

    // --- discovery ---

    pub fn register(&self, device: DiscoveredDevice) {
        self.known.lock().insert(device.id.clone(), device);
    }

    pub fn advertise(&self, device: DiscoveredDevice) {
        if let Some(tx) = self.discovery_tx.lock().as_ref() {
            let _ = tx.send(device);
        }
    }

    pub fn end_discovery_stream(&self) {
        self.discovery_tx.lock().take();
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery_tx
            .lock()
            .as_ref()
            .map_or(false, |tx| !tx.is_closed())
    }

    // --- connection ---

    /// Script the outcome of upcoming connects; `true` means fail.
    pub fn script_connects(&self, failures: impl IntoIterator<Item = bool>) {
        self.connect_failures.lock().extend(failures);
    }

    /// Every connect after the first `n` fails.
    pub fn fail_connects_after(&self, n: usize) {
        *self.fail_all_connects_after.lock() = Some(n);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn connect_calls(&self) -> Vec<PeripheralId> {
        self.connect_calls.lock().clone()
    }

    pub fn cancel_calls(&self) -> Vec<PeripheralId> {
        self.cancel_calls.lock().clone()
    }

    pub fn set_characteristics(&self, characteristics: Vec<Uuid>) {
        *self.characteristics.lock() = characteristics;
    }

    pub fn drop_link(&self, id: &PeripheralId) {
        let _ = self.disconnect_tx.send(id.clone());
    }

    // --- notifications ---

    pub fn notify(&self, frame: NotificationFrame) {
        if let Some(tx) = self.notify_tx.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.notify_tx
            .lock()
            .as_ref()
            .map_or(false, |tx| !tx.is_closed())
    }

    // --- writes ---

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Make the n-th write attempt (0-based) fail.
    pub fn fail_write(&self, index: usize) {
        self.failing_writes.lock().insert(index);
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn adapter_state(&self) -> Result<AdapterState> {
        Ok(*self.adapter_state.lock())
    }

    async fn adapter_state_changes(&self) -> Result<BoxStream<'static, AdapterState>> {
        Ok(broadcast_stream(self.state_tx.subscribe()))
    }

    async fn start_discovery(&self) -> Result<BoxStream<'static, DiscoveredDevice>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.discovery_tx.lock() = Some(tx);
        Ok(channel_stream(rx))
    }

    async fn stop_discovery(&self) -> Result<()> {
        self.discovery_tx.lock().take();
        Ok(())
    }

    async fn find_peripheral(&self, id: &PeripheralId) -> Result<Option<DiscoveredDevice>> {
        Ok(self.known.lock().get(id).cloned())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        let attempt = {
            let mut calls = self.connect_calls.lock();
            calls.push(id.clone());
            calls.len()
        };

        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.connect_failures.lock().pop_front().unwrap_or(false);
        let past_limit = self
            .fail_all_connects_after
            .lock()
            .map_or(false, |n| attempt > n);

        if scripted || past_limit {
            return Err(Error::transport("connect", "peripheral did not respond"));
        }
        Ok(())
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<()> {
        self.cancel_calls.lock().push(id.clone());
        Ok(())
    }

    async fn discover_services(&self, _id: &PeripheralId) -> Result<Vec<Uuid>> {
        Ok(self.services.lock().clone())
    }

    async fn discover_characteristics(&self, _id: &PeripheralId, _service: Uuid) -> Result<Vec<Uuid>> {
        Ok(self.characteristics.lock().clone())
    }

    async fn monitor(
        &self,
        _id: &PeripheralId,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<BoxStream<'static, NotificationFrame>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notify_tx.lock() = Some(tx);
        Ok(channel_stream(rx))
    }

    async fn write_with_response(
        &self,
        _id: &PeripheralId,
        _service: Uuid,
        _characteristic: Uuid,
        value: WireValue,
    ) -> Result<()> {
        let index = self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_writes.lock().contains(&index) {
            return Err(Error::transport("write", "GATT write rejected"));
        }
        self.writes.lock().push(wire_to_bytes(&value));
        Ok(())
    }

    async fn disconnections(&self, id: &PeripheralId) -> Result<BoxStream<'static, ()>> {
        let id = id.clone();
        Ok(broadcast_stream(self.disconnect_tx.subscribe())
            .filter_map(move |dropped| {
                let matches = dropped == id;
                async move { matches.then_some(()) }
            })
            .boxed())
    }
}
