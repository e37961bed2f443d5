//! Simulated display peripheral
//!
//! Stands in for the platform radio when no BLE hardware is available and in tests.
//!
//! Behavior:
//! 1. `start_scan` advertises an unrelated device, then the configured display
//!    after `advertise_delay`, repeating every `advertise_delay` while scanning
//! 2. `connect` / `discover` succeed after `op_latency` unless a failure was injected
//! 3. `write` stores the payload as the characteristic value; `read` returns it
//! 4. `drop_link` simulates the peer going away (emits `Disconnected`)

use crate::domain::types::{PeripheralId, PeripheralIdentity};
use crate::io::radio::{GattTarget, Radio, RadioError, RadioEvent, DEVICE_NAME};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const SIM_DEVICE_ADDR: &str = "24:6F:28:AA:BB:01";
const DECOY_DEVICE_ADDR: &str = "5C:F3:70:00:00:42";
const DECOY_DEVICE_NAME: &str = "Forerunner 255";

#[derive(Debug, Clone)]
pub struct SimRadioConfig {
    /// Name the simulated display advertises
    pub device_name: String,
    pub gatt: GattTarget,
    /// Delay between scan start and the display's advertisement
    pub advertise_delay: Duration,
    /// Latency of connect, discover, write and read
    pub op_latency: Duration,
}

impl Default for SimRadioConfig {
    fn default() -> Self {
        Self {
            device_name: DEVICE_NAME.to_string(),
            gatt: GattTarget::default(),
            advertise_delay: Duration::from_millis(300),
            op_latency: Duration::from_millis(20),
        }
    }
}

#[derive(Default)]
struct SimState {
    scanning: bool,
    connected: bool,
    value: Vec<u8>,
    written: Vec<Vec<u8>>,
}

pub struct SimRadio {
    config: SimRadioConfig,
    events_tx: broadcast::Sender<RadioEvent>,
    state: Arc<Mutex<SimState>>,
    advertiser: Mutex<Option<JoinHandle<()>>>,
    scans_started: AtomicU64,
    connect_attempts: AtomicU64,
    write_attempts: AtomicU64,
    reads: AtomicU64,
    fail_connects: AtomicU32,
    fail_writes: AtomicU32,
}

impl SimRadio {
    pub fn new(config: SimRadioConfig) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            config,
            events_tx,
            state: Arc::new(Mutex::new(SimState::default())),
            advertiser: Mutex::new(None),
            scans_started: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            write_attempts: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            fail_connects: AtomicU32::new(0),
            fail_writes: AtomicU32::new(0),
        }
    }

    pub fn identity(&self) -> PeripheralIdentity {
        PeripheralIdentity {
            name: self.config.device_name.clone(),
            id: PeripheralId(SIM_DEVICE_ADDR.to_string()),
        }
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::Relaxed);
    }

    /// Make the next `n` writes fail
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::Relaxed);
    }

    /// Simulate the peer dropping the link
    pub fn drop_link(&self) {
        let was_connected = std::mem::take(&mut self.state.lock().connected);
        if was_connected {
            info!(device = %SIM_DEVICE_ADDR, "sim_peer_disconnected");
            let _ = self.events_tx.send(RadioEvent::Disconnected(self.identity().id));
        }
    }

    pub fn scans_started(&self) -> u64 {
        self.scans_started.load(Ordering::Relaxed)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::Relaxed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Payloads acknowledged so far, in write order
    pub fn written_payloads(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_target(&self, target: GattTarget) -> Result<(), RadioError> {
        if target.service != self.config.gatt.service {
            return Err(RadioError::ServiceNotFound(target.service));
        }
        if target.characteristic != self.config.gatt.characteristic {
            return Err(RadioError::CharacteristicNotFound(target.characteristic));
        }
        Ok(())
    }

    fn check_connected(&self, id: &PeripheralId) -> Result<(), RadioError> {
        if id.0 != SIM_DEVICE_ADDR {
            return Err(RadioError::UnknownPeripheral(id.clone()));
        }
        if !self.state.lock().connected {
            return Err(RadioError::NotConnected(id.clone()));
        }
        Ok(())
    }
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new(SimRadioConfig::default())
    }
}

#[async_trait]
impl Radio for SimRadio {
    fn subscribe(&self) -> broadcast::Receiver<RadioEvent> {
        self.events_tx.subscribe()
    }

    async fn start_scan(&self) -> Result<(), RadioError> {
        self.scans_started.fetch_add(1, Ordering::Relaxed);
        self.state.lock().scanning = true;

        let events_tx = self.events_tx.clone();
        let state = self.state.clone();
        let advertised = self.identity();
        let delay = self.config.advertise_delay;

        let task = tokio::spawn(async move {
            let decoy = PeripheralIdentity {
                name: DECOY_DEVICE_NAME.to_string(),
                id: PeripheralId(DECOY_DEVICE_ADDR.to_string()),
            };
            let _ = events_tx.send(RadioEvent::Discovered(decoy));

            loop {
                tokio::time::sleep(delay).await;
                if !state.lock().scanning {
                    break;
                }
                debug!(device = %advertised.id, name = %advertised.name, "sim_advertisement");
                let _ = events_tx.send(RadioEvent::Discovered(advertised.clone()));
            }
        });

        if let Some(previous) = self.advertiser.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.state.lock().scanning = false;
        if let Some(task) = self.advertiser.lock().take() {
            task.abort();
        }
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), RadioError> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.config.op_latency).await;

        if id.0 != SIM_DEVICE_ADDR {
            return Err(RadioError::UnknownPeripheral(id.clone()));
        }
        if Self::take_failure(&self.fail_connects) {
            return Err(RadioError::Connect(id.clone(), "simulated connect failure".to_string()));
        }
        self.state.lock().connected = true;
        Ok(())
    }

    async fn discover(&self, id: &PeripheralId, target: GattTarget) -> Result<(), RadioError> {
        tokio::time::sleep(self.config.op_latency).await;
        self.check_connected(id)?;
        self.check_target(target)
    }

    async fn write(
        &self,
        id: &PeripheralId,
        target: GattTarget,
        payload: &[u8],
    ) -> Result<(), RadioError> {
        self.write_attempts.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.config.op_latency).await;
        self.check_connected(id)?;
        self.check_target(target)?;

        if Self::take_failure(&self.fail_writes) {
            return Err(RadioError::Write("simulated write failure".to_string()));
        }

        let mut state = self.state.lock();
        state.value = payload.to_vec();
        state.written.push(payload.to_vec());
        Ok(())
    }

    async fn read(&self, id: &PeripheralId, target: GattTarget) -> Result<Vec<u8>, RadioError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.config.op_latency).await;
        self.check_connected(id)?;
        self.check_target(target)?;
        Ok(self.state.lock().value.clone())
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), RadioError> {
        if id.0 != SIM_DEVICE_ADDR {
            return Err(RadioError::UnknownPeripheral(id.clone()));
        }
        let was_connected = std::mem::take(&mut self.state.lock().connected);
        if was_connected {
            let _ = self.events_tx.send(RadioEvent::Disconnected(id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_scan_advertises_decoy_then_display() {
        let radio = SimRadio::default();
        let mut events = radio.subscribe();
        radio.start_scan().await.unwrap();

        let first = events.recv().await.unwrap();
        assert!(matches!(first, RadioEvent::Discovered(ref p) if p.name == DECOY_DEVICE_NAME));
        let second = events.recv().await.unwrap();
        assert_eq!(second, RadioEvent::Discovered(radio.identity()));

        radio.stop_scan().await.unwrap();
        assert!(!radio.is_scanning());
        assert_eq!(radio.scans_started(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_then_read_back() {
        let radio = SimRadio::default();
        let id = radio.identity().id;
        let target = GattTarget::default();

        assert_eq!(radio.write(&id, target, b"x").await, Err(RadioError::NotConnected(id.clone())));

        radio.connect(&id).await.unwrap();
        radio.discover(&id, target).await.unwrap();
        radio.write(&id, target, b"aGk=").await.unwrap();
        assert_eq!(radio.read(&id, target).await.unwrap(), b"aGk=".to_vec());
        assert_eq!(radio.written_payloads(), vec![b"aGk=".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discover_rejects_wrong_characteristic() {
        let radio = SimRadio::default();
        let id = radio.identity().id;
        radio.connect(&id).await.unwrap();

        let wrong = GattTarget { characteristic: uuid::Uuid::nil(), ..GattTarget::default() };
        assert_eq!(
            radio.discover(&id, wrong).await,
            Err(RadioError::CharacteristicNotFound(uuid::Uuid::nil()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_failures_are_consumed() {
        let radio = SimRadio::default();
        let id = radio.identity().id;
        radio.fail_next_connects(1);

        assert!(radio.connect(&id).await.is_err());
        assert!(radio.connect(&id).await.is_ok());
        assert_eq!(radio.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_link_emits_disconnect() {
        let radio = SimRadio::default();
        let id = radio.identity().id;
        let mut events = radio.subscribe();
        radio.connect(&id).await.unwrap();

        radio.drop_link();
        assert_eq!(events.recv().await.unwrap(), RadioEvent::Disconnected(id));
        assert!(!radio.is_connected());
    }
}
