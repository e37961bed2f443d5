//! Directions client for the remote routing service
//!
//! Request: `POST {base_url}?origin=<lat>,<lon>&destination=<dest>&api_key=<key>`
//! with an empty body. Only the first route of the response is used; its legs
//! are flattened into one ordered step list.

use crate::domain::polyline::{self, PolylineError};
use crate::domain::types::{Coordinate, Maneuver, PlannedStep, Route};
use crate::infra::config::Config;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route request failed: {0}")]
    Transport(String),
    #[error("route provider returned HTTP {0}")]
    Status(u16),
    #[error("malformed route response: {0}")]
    MalformedBody(String),
    #[error("route provider returned no routes")]
    NoRoutes,
    #[error("malformed route geometry: {0}")]
    MalformedGeometry(#[from] PolylineError),
}

impl RouteError {
    /// Provider-side failure, as opposed to a response we could not decode
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, RouteError::MalformedGeometry(_))
    }
}

/// Anything that can produce a route from an origin to a destination
#[async_trait]
pub trait RouteSource: Send + Sync + 'static {
    async fn fetch(&self, origin: Coordinate, destination: &str) -> Result<Route, RouteError>;
}

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    #[serde(default)]
    routes: Vec<RouteDto>,
}

#[derive(Debug, Deserialize)]
struct RouteDto {
    overview_polyline: String,
    #[serde(default)]
    legs: Vec<LegDto>,
}

#[derive(Debug, Deserialize)]
struct LegDto {
    #[serde(default)]
    steps: Vec<StepDto>,
}

#[derive(Debug, Deserialize)]
struct StepDto {
    start_location: LocationDto,
    end_location: LocationDto,
    #[serde(default)]
    maneuver: Option<String>,
    #[serde(default)]
    readable_distance: Option<ReadableDistance>,
    /// Meters, when the provider sends it alongside the readable form
    #[serde(default)]
    distance: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LocationDto {
    lat: f64,
    #[serde(alias = "lon")]
    lng: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReadableDistance {
    Detailed {
        text: String,
        #[serde(default)]
        value: Option<f64>,
    },
    Text(String),
}

impl LocationDto {
    fn to_coordinate(&self) -> Result<Coordinate, RouteError> {
        Coordinate::new(self.lat, self.lng).map_err(|e| RouteError::MalformedBody(e.to_string()))
    }
}

impl StepDto {
    fn into_planned(self) -> Result<PlannedStep, RouteError> {
        let (distance_text, readable_meters) = match self.readable_distance {
            Some(ReadableDistance::Detailed { text, value }) => (text, value),
            Some(ReadableDistance::Text(text)) => (text, None),
            None => (String::new(), None),
        };
        let distance_meters = readable_meters.or(self.distance).unwrap_or(0.0);
        let distance_text = if distance_text.is_empty() && distance_meters > 0.0 {
            format!("{} m", distance_meters.round())
        } else {
            distance_text
        };

        Ok(PlannedStep {
            start: self.start_location.to_coordinate()?,
            end: self.end_location.to_coordinate()?,
            maneuver: Maneuver::from_provider(self.maneuver.as_deref()),
            distance_text,
            distance_meters,
        })
    }
}

/// Decode a directions response body into a route
pub fn parse_directions(body: &str) -> Result<Route, RouteError> {
    let response: DirectionsResponse =
        serde_json::from_str(body).map_err(|e| RouteError::MalformedBody(e.to_string()))?;
    let route = response.routes.into_iter().next().ok_or(RouteError::NoRoutes)?;

    let overview = polyline::decode(&route.overview_polyline)?;
    let steps = route
        .legs
        .into_iter()
        .flat_map(|leg| leg.steps)
        .map(StepDto::into_planned)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Route { overview, steps })
}

/// HTTP client for the directions endpoint
pub struct RouteProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl RouteProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RouteError> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RouteError::Transport(e.to_string()))?;
        Ok(Self { client, base_url: base_url.into(), api_key })
    }

    pub fn from_config(config: &Config) -> Result<Self, RouteError> {
        Self::new(
            config.route_base_url(),
            config.route_api_key().map(str::to_string),
            Duration::from_millis(config.route_timeout_ms()),
        )
    }
}

#[async_trait]
impl RouteSource for RouteProvider {
    async fn fetch(&self, origin: Coordinate, destination: &str) -> Result<Route, RouteError> {
        let origin = origin.to_query();
        let mut query = vec![("origin", origin.as_str()), ("destination", destination)];
        if let Some(key) = self.api_key.as_deref() {
            query.push(("api_key", key));
        }

        debug!(origin = %origin, destination = %destination, "route_request");
        let response = self
            .client
            .post(&self.base_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| RouteError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RouteError::Status(status.as_u16()));
        }

        let body = response.text().await.map_err(|e| RouteError::Transport(e.to_string()))?;
        parse_directions(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
        "status": "SUCCESS",
        "routes": [{
            "overview_polyline": "_p~iF~ps|U_ulLnnqC",
            "legs": [
                {"steps": [
                    {
                        "start_location": {"lat": 38.5, "lng": -120.2},
                        "end_location": {"lat": 39.0, "lng": -120.5},
                        "maneuver": "turn-left",
                        "readable_distance": {"text": "200 m", "value": 200}
                    },
                    {
                        "start_location": {"lat": 39.0, "lng": -120.5},
                        "end_location": {"lat": 40.0, "lng": -120.8}
                    }
                ]},
                {"steps": [
                    {
                        "start_location": {"lat": 40.0, "lon": -120.8},
                        "end_location": {"lat": 40.7, "lon": -120.95},
                        "maneuver": "roundabout-right",
                        "readable_distance": "1.2 km",
                        "distance": 1200
                    }
                ]}
            ]
        }, {
            "overview_polyline": "??",
            "legs": []
        }]
    }"#;

    #[test]
    fn test_parse_directions_flattens_legs() {
        let route = parse_directions(BODY).unwrap();
        assert_eq!(route.overview.len(), 2);
        assert_eq!(route.steps.len(), 3);

        assert_eq!(route.steps[0].maneuver, Some(Maneuver::TurnLeft));
        assert_eq!(route.steps[0].distance_text, "200 m");
        assert_eq!(route.steps[0].distance_meters, 200.0);

        // Absent maneuver stays absent until the table is loaded
        assert_eq!(route.steps[1].maneuver, None);

        assert_eq!(route.steps[2].start, Coordinate::new(40.0, -120.8).unwrap());
        assert_eq!(route.steps[2].maneuver, Some(Maneuver::Other("roundabout-right".to_string())));
        assert_eq!(route.steps[2].distance_text, "1.2 km");
        assert_eq!(route.steps[2].distance_meters, 1200.0);
    }

    #[test]
    fn test_parse_directions_no_routes() {
        let err = parse_directions(r#"{"routes": []}"#).unwrap_err();
        assert!(matches!(err, RouteError::NoRoutes));
        assert!(err.is_unavailable());

        let err = parse_directions(r#"{"status": "ZERO_RESULTS"}"#).unwrap_err();
        assert!(matches!(err, RouteError::NoRoutes));
    }

    #[test]
    fn test_parse_directions_malformed_body() {
        assert!(matches!(parse_directions("<html>"), Err(RouteError::MalformedBody(_))));
        assert!(matches!(
            parse_directions(r#"{"routes": [{"legs": []}]}"#),
            Err(RouteError::MalformedBody(_))
        ));
    }

    #[test]
    fn test_parse_directions_bad_geometry() {
        let err = parse_directions(r#"{"routes": [{"overview_polyline": "_p~i", "legs": []}]}"#)
            .unwrap_err();
        assert!(matches!(err, RouteError::MalformedGeometry(PolylineError::Truncated { .. })));
        assert!(!err.is_unavailable());
    }

    #[test]
    fn test_parse_directions_rejects_out_of_range_location() {
        let body = r#"{"routes": [{"overview_polyline": "", "legs": [{"steps": [{
            "start_location": {"lat": 91.0, "lng": 0.0},
            "end_location": {"lat": 0.0, "lng": 0.0}
        }]}]}]}"#;
        assert!(matches!(parse_directions(body), Err(RouteError::MalformedBody(_))));
    }
}
