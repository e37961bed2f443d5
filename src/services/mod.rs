//! Services - route matching and notification logic
//!
//! This module contains the core services:
//! - `proximity` - Haversine distance and due-step matching
//! - `dispatcher` - Periodic tick turning due steps into peripheral messages
//! - `route_refresher` - Fetches routes and loads them into the step table

pub mod dispatcher;
pub mod proximity;
pub mod route_refresher;

// Re-export commonly used types
pub use dispatcher::{DispatcherConfig, NotificationDispatcher, TickOutcome};
pub use proximity::{find_due_step, haversine_m};
pub use route_refresher::RouteRefresher;
