//! Device manager for a single BLE wearable.
//!
//! The manager owns the one connection session of the process. It gates
//! scanning and connecting on permissions and adapter readiness, drives the
//! connection state machine (including bounded automatic reconnection),
//! serializes writes and publishes inbound data on the [`EventBus`].
//!
//! Construct it once and share a reference with every consumer.

use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::connection::{ConnectionEvent, ConnectionState, LinkEvent, ReconnectTracker, Recovery};
use crate::ble::notifications::NotificationPipeline;
use crate::ble::permissions::{HostPermissions, PermissionProvider};
use crate::ble::platform::BtleplugTransport;
use crate::ble::readiness::ReadinessGate;
use crate::ble::scanner::BleScanner;
use crate::ble::session::Session;
use crate::ble::transport::{AdapterState, DiscoveredDevice, PeripheralId, Transport};
use crate::ble::write_queue::{WriteQueue, WriteTarget};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::events::{BleEvent, CallbackHandle, EventBus, EventKind, ListenerId};
use crate::protocol::{ProtocolCodec, RawFrameCodec};

/// Connection bookkeeping, always updated under one lock.
struct Link {
    state: ConnectionState,
    target: Option<PeripheralId>,
    session: Option<Session>,
    tracker: ReconnectTracker,
    /// Bumped by every user connect and manual disconnect. Watchers and
    /// reconnect tasks of an older generation are stale.
    generation: u64,
}

struct Inner {
    transport: Arc<dyn Transport>,
    codec: Arc<dyn ProtocolCodec>,
    config: ManagerConfig,
    events: EventBus,
    gate: ReadinessGate,
    scanner: BleScanner,
    link: Mutex<Link>,
    /// Held for the duration of a connect attempt.
    connecting: Arc<tokio::sync::Mutex<()>>,
    state_tx: broadcast::Sender<ConnectionEvent>,
}

fn superseded() -> Error {
    Error::ConnectionFailed {
        reason: "connection attempt superseded".into(),
    }
}

impl Inner {
    fn transition(&self, link: &mut Link, event: LinkEvent) -> bool {
        let Some(next) = link.state.next(event) else {
            debug!("Ignoring {:?} in state {}", event, link.state);
            return false;
        };

        debug!("Connection state {} -> {}", link.state, next);
        link.state = next;
        let _ = self.state_tx.send(ConnectionEvent {
            identifier: link.target.clone(),
            state: next,
        });
        true
    }

    fn advance(&self, generation: u64, event: LinkEvent) -> Result<()> {
        let mut link = self.link.lock();
        if link.generation == generation && self.transition(&mut link, event) {
            Ok(())
        } else {
            Err(superseded())
        }
    }

    fn is_connected_to(&self, id: &PeripheralId) -> bool {
        let link = self.link.lock();
        link.state.is_connected() && link.session.as_ref().map(Session::peripheral) == Some(id)
    }

    fn begin_connect(&self, id: &PeripheralId) -> Result<OwnedMutexGuard<()>> {
        let in_progress = || Error::ConnectionInProgress {
            identifier: id.to_string(),
        };

        let guard = self
            .connecting
            .clone()
            .try_lock_owned()
            .map_err(|_| in_progress())?;

        if self.link.lock().state == ConnectionState::Reconnecting {
            return Err(in_progress());
        }
        Ok(guard)
    }

    /// A lookup that found nothing leaves a torn down manager idle.
    fn settle_after_failed_lookup(&self) {
        let mut link = self.link.lock();
        if link.session.is_none() && link.state == ConnectionState::TornDown {
            self.transition(&mut link, LinkEvent::TargetNotFound);
        }
    }

    /// Start a user-initiated connect. The caller holds the connect guard.
    async fn connect_locked(self: &Arc<Self>, id: PeripheralId) -> Result<()> {
        let previous = self
            .link
            .lock()
            .session
            .as_ref()
            .map(|s| s.peripheral().clone());

        if let Some(previous) = previous {
            info!("Releasing {} before connecting to {}", previous, id);
            if let Some(old) = self.tear_down() {
                if let Err(e) = self.transport.cancel_connection(&old).await {
                    warn!("Failed to cancel connection to {}: {}", old, e);
                }
            }
        }

        let generation = {
            let mut link = self.link.lock();
            link.generation += 1;
            link.tracker.begin();
            link.target = Some(id.clone());
            self.transition(&mut link, LinkEvent::ConnectRequested);
            link.generation
        };

        self.establish(&id, generation).await
    }

    /// Run one connection attempt; failures go through link-loss recovery.
    async fn establish(self: &Arc<Self>, id: &PeripheralId, generation: u64) -> Result<()> {
        match self.open_session(id, generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Connection to {} failed: {}", id, e);
                if let Err(cancel) = self.transport.cancel_connection(id).await {
                    debug!("Failed to cancel connection to {}: {}", id, cancel);
                }
                self.on_link_lost(id, generation);
                Err(e)
            }
        }
    }

    async fn open_session(self: &Arc<Self>, id: &PeripheralId, generation: u64) -> Result<()> {
        info!("Connecting to {}", id);
        self.transport.connect(id).await?;
        self.advance(generation, LinkEvent::LinkEstablished)?;

        let service = self.config.service_uuid;
        let notify = self.config.notify_characteristic_uuid;
        let write = self.config.write_characteristic_uuid;

        let services = self.transport.discover_services(id).await?;
        if !services.contains(&service) {
            return Err(Error::ServiceNotFound {
                uuid: service.to_string(),
            });
        }

        let characteristics = self.transport.discover_characteristics(id, service).await?;
        for uuid in [notify, write] {
            if !characteristics.contains(&uuid) {
                return Err(Error::CharacteristicNotFound {
                    uuid: uuid.to_string(),
                });
            }
        }

        // Watch for disconnects before subscribing so no drop goes unseen.
        let disconnections = self.transport.disconnections(id).await?;
        let frames = self.transport.monitor(id, service, notify).await?;
        debug!("Subscribed to notifications from {}", id);

        let pipeline = NotificationPipeline::new(self.codec.clone(), self.events.clone());
        let writes = WriteQueue::start(
            self.transport.clone(),
            WriteTarget {
                peripheral: id.clone(),
                service,
                characteristic: write,
            },
        );
        let session = Session::new(
            id.clone(),
            writes,
            tokio::spawn(pipeline.run(frames)),
            tokio::spawn(watch_disconnects(
                Arc::downgrade(self),
                id.clone(),
                generation,
                disconnections,
            )),
        );

        {
            let mut link = self.link.lock();
            if link.generation != generation || link.state != ConnectionState::Discovering {
                return Err(superseded());
            }
            link.session = Some(session);
            link.tracker.on_connected();
            self.transition(&mut link, LinkEvent::SubscriptionReady);
        }

        info!("Connected to {}", id);
        self.events.publish(BleEvent::ConnectionState(true));
        Ok(())
    }

    /// Recovery path for a failed attempt or a dropped link.
    fn on_link_lost(self: &Arc<Self>, id: &PeripheralId, generation: u64) {
        let (session, recovery) = {
            let mut link = self.link.lock();
            if link.generation != generation
                || link.state.next(LinkEvent::LinkLost { retry: false }).is_none()
            {
                debug!("Ignoring stale link loss for {}", id);
                return;
            }

            let recovery = link.tracker.on_link_lost();
            let retry = matches!(recovery, Recovery::Reconnect { .. });
            self.transition(&mut link, LinkEvent::LinkLost { retry });
            if !retry {
                link.target = None;
            }
            (link.session.take(), recovery)
        };

        // Releases the subscription and discards queued writes.
        drop(session);
        self.events.publish(BleEvent::ConnectionState(false));

        match recovery {
            Recovery::Reconnect { attempt, delay } => {
                info!(
                    "Reconnecting to {} in {:?} (attempt {}/{})",
                    id, delay, attempt, self.config.reconnect_attempts
                );
                self.schedule_reconnect(id.clone(), generation, delay);
            }
            Recovery::Cleanup => info!("Giving up on {}, session released", id),
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, id: PeripheralId, generation: u64, delay: Duration) {
        let inner = Arc::downgrade(self);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };
            let _guard = inner.connecting.clone().lock_owned().await;

            {
                let mut link = inner.link.lock();
                if link.generation != generation || link.state != ConnectionState::Reconnecting {
                    debug!("Reconnect to {} cancelled", id);
                    return;
                }
                inner.transition(&mut link, LinkEvent::ConnectRequested);
            }

            if let Err(e) = inner.establish(&id, generation).await {
                debug!("Reconnect to {} failed: {}", id, e);
            }
        });
    }

    /// Manual teardown of the current session. Returns the peripheral the
    /// session was targeting, if any.
    fn tear_down(&self) -> Option<PeripheralId> {
        let (session, target, was_connected) = {
            let mut link = self.link.lock();
            link.tracker.mark_manual();
            link.generation += 1;

            let was_connected = link.state.is_connected();
            if link.state != ConnectionState::TornDown {
                self.transition(&mut link, LinkEvent::DisconnectRequested);
            }
            (link.session.take(), link.target.take(), was_connected)
        };

        drop(session);
        if was_connected {
            self.events.publish(BleEvent::ConnectionState(false));
        }
        target
    }
}

async fn watch_disconnects(
    inner: Weak<Inner>,
    id: PeripheralId,
    generation: u64,
    mut disconnections: BoxStream<'static, ()>,
) {
    if disconnections.next().await.is_none() {
        debug!("Disconnect stream for {} ended", id);
        return;
    }

    warn!("Lost connection to {}", id);
    if let Some(inner) = inner.upgrade() {
        inner.on_link_lost(&id, generation);
    }
}

/// Central manager for discovering, connecting to and talking with a wearable.
pub struct DeviceManager {
    inner: Arc<Inner>,
    /// Whether initialization completed once.
    initialized: AtomicBool,
    /// Task forwarding adapter state changes to the event bus.
    adapter_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceManager {
    /// Create a DeviceManager on the host's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let transport = BtleplugTransport::new().await?;

        Ok(Self::with_transport(
            Arc::new(transport),
            Arc::new(HostPermissions),
            Arc::new(RawFrameCodec),
            ManagerConfig::default(),
        ))
    }

    /// Create a DeviceManager from its collaborators.
    pub fn with_transport(
        transport: Arc<dyn Transport>,
        permissions: Arc<dyn PermissionProvider>,
        codec: Arc<dyn ProtocolCodec>,
        config: ManagerConfig,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let gate = ReadinessGate::new(
            transport.clone(),
            permissions,
            config.readiness_poll_interval,
            config.readiness_poll_attempts,
        );

        let link = Link {
            state: ConnectionState::Disconnected,
            target: None,
            session: None,
            tracker: ReconnectTracker::new(config.reconnect_attempts, config.reconnect_delay),
            generation: 0,
        };

        let inner = Inner {
            scanner: BleScanner::new(transport.clone(), config.event_capacity),
            events: EventBus::new(config.event_capacity),
            transport,
            codec,
            gate,
            link: Mutex::new(link),
            connecting: Arc::new(tokio::sync::Mutex::new(())),
            state_tx,
            config,
        };

        Self {
            inner: Arc::new(inner),
            initialized: AtomicBool::new(false),
            adapter_task: Mutex::new(None),
        }
    }

    /// Request permissions and wait for the adapter to become ready.
    ///
    /// Once initialization has succeeded, later calls only check whether
    /// the adapter is powered on. Refused permissions are published as a
    /// [`BleEvent::PermissionsDenied`] event.
    pub async fn initialize(&self) -> bool {
        let gate = &self.inner.gate;

        if self.initialized.load(Ordering::SeqCst) {
            return gate.is_powered_on().await;
        }

        info!("Initializing Bluetooth");

        let denied = gate.request_permissions().await;
        if !denied.is_empty() {
            self.inner.events.publish(BleEvent::PermissionsDenied(denied));
            return false;
        }

        if !gate.poll_until_ready().await {
            return false;
        }

        self.start_adapter_forwarding().await;
        self.initialized.store(true, Ordering::SeqCst);

        gate.is_powered_on().await
    }

    async fn start_adapter_forwarding(&self) {
        let mut changes = match self.inner.transport.adapter_state_changes().await {
            Ok(changes) => changes,
            Err(e) => {
                warn!("Adapter state changes unavailable: {}", e);
                return;
            }
        };

        let events = self.inner.events.clone();
        let handle = tokio::spawn(async move {
            while let Some(state) = changes.next().await {
                info!("Adapter state: {}", state);
                events.publish(BleEvent::AdapterState(state));
            }
        });

        if let Some(previous) = self.adapter_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Query the adapter state and publish it.
    ///
    /// Call when the application returns to the foreground.
    pub async fn refresh_adapter_state(&self) -> AdapterState {
        let state = self.inner.gate.adapter_state().await;
        self.inner.events.publish(BleEvent::AdapterState(state));
        state
    }

    /// Start scanning, passing every named advertisement to `on_found`.
    ///
    /// A no-op if already scanning.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter does not power on in time or a
    /// required permission is missing.
    pub async fn start_scan<F>(&self, on_found: F) -> Result<()>
    where
        F: Fn(&DiscoveredDevice) + Send + Sync + 'static,
    {
        if self.inner.scanner.is_scanning() {
            debug!("Already scanning");
            return Ok(());
        }

        let gate = &self.inner.gate;
        if !gate.wait_powered_on(self.inner.config.powered_on_wait).await {
            let state = gate.adapter_state().await;
            warn!("Bluetooth not ready, cannot scan ({})", state);
            return Err(Error::AdapterNotReady { state });
        }

        let missing = gate.missing_permissions().await;
        if !missing.is_empty() {
            return Err(Error::PermissionDenied {
                permissions: missing,
            });
        }

        self.inner.scanner.start_scanning(on_found).await
    }

    /// Stop scanning. Safe to call when not scanning.
    pub async fn stop_scan(&self) -> Result<()> {
        self.inner.scanner.stop_scanning().await
    }

    /// Check if scanning is active.
    pub fn is_scanning(&self) -> bool {
        self.inner.scanner.is_scanning()
    }

    /// Subscribe to named advertisements.
    pub fn subscribe_discoveries(&self) -> broadcast::Receiver<DiscoveredDevice> {
        self.inner.scanner.subscribe()
    }

    /// Every device in the scan cache.
    pub fn discovered_devices(&self) -> HashMap<PeripheralId, DiscoveredDevice> {
        self.inner.scanner.discovered_devices()
    }

    /// Connect to a peripheral by identifier.
    ///
    /// The scan cache is searched first, then the transport. Connecting to
    /// the peripheral that is already connected is a no-op; connecting to
    /// another one releases the current session first.
    ///
    /// # Errors
    ///
    /// * [`Error::ConnectionInProgress`] if another attempt or a reconnect
    ///   is running
    /// * [`Error::AdapterNotReady`] if the adapter does not power on in time
    /// * [`Error::DeviceNotFound`] if the identifier cannot be resolved
    /// * any error of the connection attempt itself, after which automatic
    ///   reconnection may still be running
    pub async fn connect_by_id(&self, identifier: &str) -> Result<()> {
        let id = PeripheralId::from(identifier);
        let _guard = self.inner.begin_connect(&id)?;

        if self.inner.is_connected_to(&id) {
            debug!("Already connected to {}", id);
            return Ok(());
        }

        let gate = &self.inner.gate;
        if !gate.wait_powered_on(self.inner.config.powered_on_wait).await {
            let state = gate.adapter_state().await;
            warn!("Bluetooth not ready, cannot connect to {} ({})", id, state);
            return Err(Error::AdapterNotReady { state });
        }

        let device = match self.resolve(&id).await {
            Ok(device) => device,
            Err(e) => {
                self.inner.settle_after_failed_lookup();
                return Err(e);
            }
        };
        self.inner.connect_locked(device.id).await
    }

    /// Connect to a discovered peripheral.
    pub async fn connect(&self, device: &DiscoveredDevice) -> Result<()> {
        let _guard = self.inner.begin_connect(&device.id)?;

        if self.inner.is_connected_to(&device.id) {
            debug!("Already connected to {}", device.id);
            return Ok(());
        }

        self.inner.connect_locked(device.id.clone()).await
    }

    async fn resolve(&self, id: &PeripheralId) -> Result<DiscoveredDevice> {
        if let Some(device) = self.inner.scanner.cached(id) {
            return Ok(device);
        }

        debug!("{} not in scan cache, asking the transport", id);
        match self.inner.transport.find_peripheral(id).await {
            Ok(Some(device)) => Ok(device),
            Ok(None) => Err(Error::DeviceNotFound {
                identifier: id.to_string(),
            }),
            Err(e) => {
                warn!("Lookup of {} failed: {}", id, e);
                Err(Error::DeviceNotFound {
                    identifier: id.to_string(),
                })
            }
        }
    }

    /// Disconnect from the current peripheral. Never followed by automatic
    /// reconnection.
    pub async fn disconnect(&self) -> Result<()> {
        match self.inner.tear_down() {
            Some(id) => {
                info!("Disconnecting from {}", id);
                self.inner.transport.cancel_connection(&id).await
            }
            None => Ok(()),
        }
    }

    /// Queue bytes for the write characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without queueing if no session is
    /// connected.
    pub fn write(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        let link = self.inner.link.lock();
        match (&link.session, link.state) {
            (Some(session), ConnectionState::Connected) => session.write(bytes.into()),
            _ => {
                warn!("Write rejected, device not connected");
                Err(Error::NotConnected)
            }
        }
    }

    /// Encode a command and queue every resulting frame in order.
    ///
    /// Returns the number of frames queued.
    pub fn send_command(&self, command: &str, args: &[u8]) -> Result<usize> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let frames = self.inner.codec.encode(command, args)?;
        let count = frames.len();
        for frame in frames {
            self.write(frame)?;
        }

        debug!("Queued command {} as {} frame(s)", command, count);
        Ok(count)
    }

    /// Check if a session is connected.
    pub fn is_connected(&self) -> bool {
        let link = self.inner.link.lock();
        link.state.is_connected() && link.session.is_some()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    /// The peripheral of the live session.
    pub fn connected_peripheral(&self) -> Option<PeripheralId> {
        self.inner
            .link
            .lock()
            .session
            .as_ref()
            .map(|s| s.peripheral().clone())
    }

    /// Writes queued or in flight on the live session.
    pub fn pending_writes(&self) -> usize {
        self.inner
            .link
            .lock()
            .session
            .as_ref()
            .map_or(0, Session::pending_writes)
    }

    /// Subscribe to connection state transitions.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.state_tx.subscribe()
    }

    /// The event bus carrying connection, data and adapter events.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Register a listener on the event bus.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> CallbackHandle
    where
        F: Fn(&BleEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    /// Remove a listener from the event bus.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.inner.events.off(kind, id)
    }

    /// Get the configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Clean shutdown of the connection, scanning and adapter monitoring.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        if let Err(e) = self.stop_scan().await {
            warn!("Error stopping scan: {}", e);
        }

        let result = self.disconnect().await;

        if let Some(task) = self.adapter_task.lock().take() {
            task.abort();
        }

        result
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Some(task) = self.adapter_task.get_mut().take() {
            task.abort();
        }

        let session = {
            let mut link = self.inner.link.lock();
            link.tracker.mark_manual();
            link.generation += 1;
            link.session.take()
        };
        drop(session);
    }
}
