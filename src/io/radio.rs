//! Radio abstraction for the BLE central role
//!
//! The session never talks to a platform stack directly. Backends implement
//! [`Radio`]: long operations are async and bounded by the caller, while
//! asynchronous platform callbacks (advertisements, link loss) are delivered
//! as [`RadioEvent`]s on a broadcast subscription.

use crate::domain::types::{PeripheralId, PeripheralIdentity};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// GATT service advertised by the display peripheral
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Characteristic the instruction payload is written to and read back from
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Advertised name of the display peripheral
pub const DEVICE_NAME: &str = "ESP32_BLE";

/// Service + characteristic pair addressed by writes and reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattTarget {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl Default for GattTarget {
    fn default() -> Self {
        Self { service: SERVICE_UUID, characteristic: CHARACTERISTIC_UUID }
    }
}

/// Asynchronous notifications from the platform radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// A device was seen while scanning
    Discovered(PeripheralIdentity),
    /// Link to a device went down (peer-initiated or after an explicit disconnect)
    Disconnected(PeripheralId),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("no radio adapter available")]
    AdapterUnavailable,
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("connect to {0} failed: {1}")]
    Connect(PeripheralId, String),
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("peripheral {0} not connected")]
    NotConnected(PeripheralId),
    #[error("unknown peripheral {0}")]
    UnknownPeripheral(PeripheralId),
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("radio error: {0}")]
    Other(String),
}

/// Platform BLE central
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Subscribe to radio events. The subscription stays valid until dropped.
    fn subscribe(&self) -> broadcast::Receiver<RadioEvent>;

    /// Begin an open-ended scan; discoveries arrive as [`RadioEvent::Discovered`]
    async fn start_scan(&self) -> Result<(), RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    async fn connect(&self, id: &PeripheralId) -> Result<(), RadioError>;

    /// Enumerate services/characteristics and check that `target` exists
    async fn discover(&self, id: &PeripheralId, target: GattTarget) -> Result<(), RadioError>;

    /// Write with response (acknowledged by the peripheral)
    async fn write(
        &self,
        id: &PeripheralId,
        target: GattTarget,
        payload: &[u8],
    ) -> Result<(), RadioError>;

    async fn read(&self, id: &PeripheralId, target: GattTarget) -> Result<Vec<u8>, RadioError>;

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), RadioError>;
}
