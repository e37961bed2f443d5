//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `radio` - BLE central abstraction (scan, connect, GATT write/read)
//! - `sim_radio` - In-process peripheral simulator implementing `Radio`
//! - `ble` - bluest-backed `Radio` (feature `ble`)
//! - `session` - PeripheralSession actor driving the connection lifecycle
//! - `route_provider` - HTTP directions client
//! - `position_listener` - TCP listener for JSON position lines
//! - `gps_serial` - NMEA GPS receiver on a serial port
//! - `prometheus` - Prometheus metrics HTTP endpoint

#[cfg(feature = "ble")]
pub mod ble;
pub mod gps_serial;
pub mod position_listener;
pub mod prometheus;
pub mod radio;
pub mod route_provider;
pub mod session;
pub mod sim_radio;

// Re-export commonly used types
#[cfg(feature = "ble")]
pub use ble::BleRadio;
pub use gps_serial::GpsReader;
pub use position_listener::start_position_listener;
pub use radio::{GattTarget, Radio, RadioError, RadioEvent};
pub use route_provider::{RouteError, RouteProvider, RouteSource};
pub use session::{
    create_session, PeripheralSession, SessionConfig, SessionError, SessionEvent, SessionHandle,
    SessionState, SessionStatus,
};
pub use sim_radio::{SimRadio, SimRadioConfig};
