//! Domain models - coordinates, route steps and instruction messages
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - Coordinate, Maneuver, RouteStep, PeripheralIdentity, PositionEvent
//! - `polyline` - Encoded polyline decoder/encoder
//! - `route` - RouteStepTable, the atomically replaced step list
//! - `message` - OutboundMessage and its base64 transport encoding

pub mod message;
pub mod polyline;
pub mod route;
pub mod types;

pub use message::OutboundMessage;
pub use route::{RouteSnapshot, RouteStepTable};
pub use types::{
    Coordinate, Maneuver, PeripheralId, PeripheralIdentity, PlannedStep, PositionEvent,
    ProximityEvent, Route, RouteStep,
};
