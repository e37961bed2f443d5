//! Route refresher - keeps the step table populated from the route provider
//!
//! Waits for the first position fix, fetches a route from there to the
//! configured destination and loads it. A failed fetch leaves the current table
//! untouched. Repeats every refresh interval when one is configured.

use crate::domain::route::RouteStepTable;
use crate::domain::types::Coordinate;
use crate::infra::metrics::Metrics;
use crate::io::route_provider::{RouteError, RouteSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub struct RouteRefresher {
    source: Arc<dyn RouteSource>,
    table: RouteStepTable,
    destination: Option<String>,
    /// None = fetch once
    refresh_interval: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl RouteRefresher {
    pub fn new(
        source: Arc<dyn RouteSource>,
        table: RouteStepTable,
        destination: Option<String>,
        refresh_interval_secs: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        let refresh_interval = match refresh_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self { source, table, destination, refresh_interval, metrics }
    }

    /// Fetch once from `origin` and load the result. Returns the new generation.
    pub async fn refresh_once(&self, origin: Coordinate) -> Result<u64, RouteError> {
        let Some(destination) = self.destination.as_deref() else {
            return Err(RouteError::NoRoutes);
        };

        match self.source.fetch(origin, destination).await {
            Ok(route) => {
                let steps = route.steps.len();
                let generation = self.table.load(route.steps);
                self.metrics.record_route_loaded(steps);
                info!(
                    generation = %generation,
                    steps = %steps,
                    overview_points = %route.overview.len(),
                    destination = %destination,
                    "route_loaded"
                );
                Ok(generation)
            }
            Err(e) => {
                self.metrics.record_route_failure();
                if e.is_unavailable() {
                    warn!(error = %e, destination = %destination, "route_unavailable");
                } else {
                    error!(error = %e, destination = %destination, "route_geometry_malformed");
                }
                Err(e)
            }
        }
    }

    pub async fn run(
        self,
        mut position_rx: watch::Receiver<Option<Coordinate>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if self.destination.is_none() {
            info!("route_refresher_idle_no_destination");
            let _ = shutdown.wait_for(|stop| *stop).await;
            return;
        }

        info!(
            refresh_secs = %self.refresh_interval.map_or(0, |d| d.as_secs()),
            "route_refresher_started"
        );

        loop {
            let origin = tokio::select! {
                result = position_rx.wait_for(Option::is_some) => match result {
                    Ok(position) => *position,
                    Err(_) => return,
                },
                _ = shutdown.wait_for(|stop| *stop) => return,
            };
            let Some(origin) = origin else {
                continue;
            };

            let _ = self.refresh_once(origin).await;

            let Some(refresh_interval) = self.refresh_interval else {
                let _ = shutdown.wait_for(|stop| *stop).await;
                return;
            };
            tokio::select! {
                _ = tokio::time::sleep(refresh_interval) => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("route_refresher_shutdown");
                    return;
                }
            }
        }
    }
}
