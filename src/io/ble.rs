//! Bluetooth LE central backed by bluest
//!
//! Uses the platform's default adapter. Devices seen while scanning are cached
//! by their platform id so later operations can address them again; the
//! characteristic found during discovery is cached per device.
//!
//! Link loss is observed through a per-device connection event stream that is
//! watched from connect until the device disconnects.

use crate::domain::types::{PeripheralId, PeripheralIdentity};
use crate::io::radio::{GattTarget, Radio, RadioError, RadioEvent};
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Linked {
    device: Device,
    /// Set once discovery found the target characteristic
    characteristic: Option<Characteristic>,
    watcher: Option<JoinHandle<()>>,
}

pub struct BleRadio {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Linked>>>,
    events_tx: broadcast::Sender<RadioEvent>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

fn device_key(device: &Device) -> String {
    format!("{:?}", device.id())
}

impl BleRadio {
    /// Open the default adapter and wait until it is powered
    pub async fn new() -> Result<Self, RadioError> {
        let adapter = Adapter::default().await.ok_or(RadioError::AdapterUnavailable)?;
        adapter.wait_available().await.map_err(|e| RadioError::Other(e.to_string()))?;
        info!("ble_adapter_opened");

        let (events_tx, _) = broadcast::channel(64);
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
            scanner: Mutex::new(None),
        })
    }

    fn device(&self, id: &PeripheralId) -> Result<Device, RadioError> {
        self.devices
            .lock()
            .get(&id.0)
            .map(|linked| linked.device.clone())
            .ok_or_else(|| RadioError::UnknownPeripheral(id.clone()))
    }

    fn characteristic(&self, id: &PeripheralId) -> Result<Characteristic, RadioError> {
        self.devices
            .lock()
            .get(&id.0)
            .and_then(|linked| linked.characteristic.clone())
            .ok_or_else(|| RadioError::NotConnected(id.clone()))
    }

    /// Forward the device's disconnect to subscribers, once
    fn watch_link(&self, id: &PeripheralId, device: Device) {
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let events_tx = self.events_tx.clone();
        let id = id.clone();

        let watcher = tokio::spawn({
            let id = id.clone();
            async move {
                let mut events = match adapter.device_connection_events(&device).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(device = %id, error = %e, "ble_link_watch_failed");
                        return;
                    }
                };
                while let Some(event) = events.next().await {
                    if matches!(event, ConnectionEvent::Disconnected) {
                        debug!(device = %id, "ble_device_disconnected");
                        if let Some(linked) = devices.lock().get_mut(&id.0) {
                            linked.characteristic = None;
                            linked.watcher = None;
                        }
                        let _ = events_tx.send(RadioEvent::Disconnected(id));
                        return;
                    }
                }
            }
        });

        if let Some(linked) = self.devices.lock().get_mut(&id.0) {
            if let Some(previous) = linked.watcher.replace(watcher) {
                previous.abort();
            }
        }
    }
}

impl Drop for BleRadio {
    fn drop(&mut self) {
        if let Some(scanner) = self.scanner.lock().take() {
            scanner.abort();
        }
        for linked in self.devices.lock().values_mut() {
            if let Some(watcher) = linked.watcher.take() {
                watcher.abort();
            }
        }
    }
}

async fn find_characteristic(
    device: &Device,
    target: GattTarget,
) -> Result<Characteristic, RadioError> {
    let services = device
        .discover_services_with_uuid(target.service)
        .await
        .map_err(|e| RadioError::Other(e.to_string()))?;
    let service = services.into_iter().next().ok_or(RadioError::ServiceNotFound(target.service))?;
    let characteristics = service
        .discover_characteristics_with_uuid(target.characteristic)
        .await
        .map_err(|e| RadioError::Other(e.to_string()))?;
    characteristics
        .into_iter()
        .next()
        .ok_or(RadioError::CharacteristicNotFound(target.characteristic))
}

#[async_trait]
impl Radio for BleRadio {
    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events_tx.subscribe()
    }

    async fn start_scan(&self) -> Result<(), RadioError> {
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let events_tx = self.events_tx.clone();

        let scanner = tokio::spawn(async move {
            let mut scan = match adapter.scan(&[]).await {
                Ok(scan) => scan,
                Err(e) => {
                    warn!(error = %e, "ble_scan_failed");
                    return;
                }
            };
            // The platform scan stops when the stream is dropped
            while let Some(found) = scan.next().await {
                // Unnamed advertisers can never match the name filter
                let Some(name) = found.adv_data.local_name else {
                    continue;
                };
                let key = device_key(&found.device);
                devices.lock().entry(key.clone()).or_insert_with(|| Linked {
                    device: found.device.clone(),
                    characteristic: None,
                    watcher: None,
                });
                let _ = events_tx.send(RadioEvent::Discovered(PeripheralIdentity {
                    name,
                    id: PeripheralId(key),
                }));
            }
        });

        if let Some(previous) = self.scanner.lock().replace(scanner) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        if let Some(scanner) = self.scanner.lock().take() {
            scanner.abort();
        }
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), RadioError> {
        let device = self.device(id)?;
        self.adapter
            .connect_device(&device)
            .await
            .map_err(|e| RadioError::Connect(id.clone(), e.to_string()))?;
        self.watch_link(id, device);
        Ok(())
    }

    async fn discover(&self, id: &PeripheralId, target: GattTarget) -> Result<(), RadioError> {
        let device = self.device(id)?;
        let characteristic = find_characteristic(&device, target).await?;
        if let Some(linked) = self.devices.lock().get_mut(&id.0) {
            linked.characteristic = Some(characteristic);
        }
        Ok(())
    }

    async fn write(
        &self,
        id: &PeripheralId,
        _target: GattTarget,
        payload: &[u8],
    ) -> Result<(), RadioError> {
        // bluest writes with response
        self.characteristic(id)?.write(payload).await.map_err(|e| RadioError::Write(e.to_string()))
    }

    async fn read(&self, id: &PeripheralId, _target: GattTarget) -> Result<Vec<u8>, RadioError> {
        self.characteristic(id)?.read().await.map_err(|e| RadioError::Read(e.to_string()))
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), RadioError> {
        let device = self.device(id)?;
        self.adapter.disconnect_device(&device).await.map_err(|e| RadioError::Other(e.to_string()))
    }
}
