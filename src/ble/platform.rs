//! btleplug implementation of the transport boundary.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::codec::{wire_to_bytes, WireValue};
use crate::ble::transport::{AdapterState, DiscoveredDevice, NotificationFrame, PeripheralId, Transport};
use crate::error::{Error, Result};

impl From<CentralState> for AdapterState {
    fn from(state: CentralState) -> Self {
        match state {
            CentralState::PoweredOn => AdapterState::PoweredOn,
            CentralState::PoweredOff => AdapterState::PoweredOff,
            _ => AdapterState::Unknown,
        }
    }
}

/// Transport backed by the first Bluetooth adapter of the host.
pub struct BtleplugTransport {
    adapter: Adapter,
    /// Peripherals seen so far, keyed by identifier string.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
}

impl BtleplugTransport {
    /// Open the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.read().get(id.as_str()).cloned() {
            return Ok(peripheral);
        }

        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: id.to_string(),
            })?;

        self.peripherals
            .write()
            .insert(id.to_string(), peripheral.clone());
        Ok(peripheral)
    }

    async fn characteristic(
        &self,
        id: &PeripheralId,
        service: Uuid,
        uuid: Uuid,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(id).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == service)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })?;
        Ok((peripheral, characteristic))
    }
}

/// Describe a peripheral from its advertised properties.
async fn describe(peripheral: &Peripheral) -> Option<DiscoveredDevice> {
    let properties = match peripheral.properties().await {
        Ok(Some(p)) => p,
        Ok(None) => return None,
        Err(e) => {
            trace!("Failed to read properties: {}", e);
            return None;
        }
    };

    let mut device = DiscoveredDevice::new(peripheral.id().to_string());
    if let Some(name) = properties.local_name {
        device = device.with_local_name(name);
    }
    if let Some(rssi) = properties.rssi {
        device = device.with_rssi(rssi);
    }
    Some(device)
}

/// Unsubscribes from a characteristic when the notification stream is dropped.
struct SubscriptionGuard {
    peripheral: Peripheral,
    characteristic: Characteristic,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let peripheral = self.peripheral.clone();
        let characteristic = self.characteristic.clone();
        runtime.spawn(async move {
            if let Err(e) = peripheral.unsubscribe(&characteristic).await {
                debug!("Failed to unsubscribe from {}: {}", characteristic.uuid, e);
            }
        });
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn adapter_state(&self) -> Result<AdapterState> {
        Ok(self.adapter.adapter_state().await?.into())
    }

    async fn adapter_state_changes(&self) -> Result<BoxStream<'static, AdapterState>> {
        let events = self.adapter.events().await?;
        Ok(events
            .filter_map(|event| async move {
                match event {
                    CentralEvent::StateUpdate(state) => Some(AdapterState::from(state)),
                    _ => None,
                }
            })
            .boxed())
    }

    async fn start_discovery(&self) -> Result<BoxStream<'static, DiscoveredDevice>> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let adapter = self.adapter.clone();
        let cache = self.peripherals.clone();

        Ok(events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                let cache = cache.clone();
                async move {
                    let id = match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                        _ => return None,
                    };

                    let peripheral = match adapter.peripheral(&id).await {
                        Ok(p) => p,
                        Err(e) => {
                            trace!("Failed to get peripheral: {}", e);
                            return None;
                        }
                    };

                    let device = describe(&peripheral).await?;
                    cache.write().insert(id.to_string(), peripheral);
                    Some(device)
                }
            })
            .boxed())
    }

    async fn stop_discovery(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn find_peripheral(&self, id: &PeripheralId) -> Result<Option<DiscoveredDevice>> {
        match self.peripheral(id).await {
            Ok(peripheral) => Ok(Some(
                describe(&peripheral)
                    .await
                    .unwrap_or_else(|| DiscoveredDevice::new(id.clone())),
            )),
            Err(Error::DeviceNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn connect(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await.map_err(|e| Error::ConnectionFailed {
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn discover_services(&self, id: &PeripheralId) -> Result<Vec<Uuid>> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;
        let services: Vec<Uuid> = peripheral.services().iter().map(|s| s.uuid).collect();
        debug!("Discovered {} services on {}", services.len(), id);
        Ok(services)
    }

    async fn discover_characteristics(&self, id: &PeripheralId, service: Uuid) -> Result<Vec<Uuid>> {
        let peripheral = self.peripheral(id).await?;
        let characteristics: Vec<Uuid> = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| s.characteristics.into_iter().map(|c| c.uuid).collect())
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: service.to_string(),
            })?;
        Ok(characteristics)
    }

    async fn monitor(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, NotificationFrame>> {
        let (peripheral, target) = self.characteristic(id, service, characteristic).await?;

        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&target).await?;
        debug!("Subscribed to notifications from {}", characteristic);

        let guard = SubscriptionGuard {
            peripheral,
            characteristic: target,
        };

        let frames = notifications.filter_map(move |notification| async move {
            if notification.uuid != characteristic {
                return None;
            }
            Some(if notification.value.is_empty() {
                NotificationFrame::Empty
            } else {
                NotificationFrame::Value(WireValue::from(notification.value))
            })
        });

        // The guard lives as long as the stream.
        Ok(stream::unfold((frames.boxed(), guard), |(mut frames, guard)| async move {
            frames.next().await.map(|frame| (frame, (frames, guard)))
        })
        .boxed())
    }

    async fn write_with_response(
        &self,
        id: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
        value: WireValue,
    ) -> Result<()> {
        let (peripheral, target) = self.characteristic(id, service, characteristic).await?;
        let data = wire_to_bytes(&value);

        peripheral
            .write(&target, &data, WriteType::WithResponse)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Wrote {} bytes to characteristic {}", data.len(), characteristic);
        Ok(())
    }

    async fn disconnections(&self, id: &PeripheralId) -> Result<BoxStream<'static, ()>> {
        let events = self.adapter.events().await?;
        let id = id.clone();

        Ok(events
            .filter_map(move |event| {
                let dropped = match event {
                    CentralEvent::DeviceDisconnected(peripheral) => {
                        peripheral.to_string() == id.as_str()
                    }
                    _ => false,
                };
                if dropped {
                    warn!("Peripheral {} disconnected", id);
                }
                async move { dropped.then_some(()) }
            })
            .boxed())
    }
}
