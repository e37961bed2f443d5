//! Shared types for the navigation beacon

use thiserror::Error;

/// WGS84 position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum CoordinateError {
    #[error("latitude {0} outside [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} outside [-180, 180]")]
    Longitude(f64),
}

impl Coordinate {
    /// Build a coordinate, rejecting values outside the WGS84 ranges (and NaN)
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, CoordinateError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(CoordinateError::Latitude(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(CoordinateError::Longitude(longitude));
        }
        Ok(Self { latitude, longitude })
    }

    /// Check the invariant on a value built from public fields
    pub fn validate(self) -> Result<Self, CoordinateError> {
        Self::new(self.latitude, self.longitude)
    }

    /// `lat,lon` form used in provider query strings
    pub fn to_query(&self) -> String {
        format!("{},{}", self.latitude, self.longitude)
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6},{:.6}", self.latitude, self.longitude)
    }
}

/// Routing instruction category as reported by the route provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Maneuver {
    Straight,
    TurnLeft,
    TurnRight,
    TurnSlightLeft,
    TurnSlightRight,
    TurnSharpLeft,
    TurnSharpRight,
    UturnLeft,
    UturnRight,
    /// Provider token we have no dedicated variant for; forwarded verbatim
    Other(String),
}

impl std::str::FromStr for Maneuver {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "straight" => Maneuver::Straight,
            "turn-left" => Maneuver::TurnLeft,
            "turn-right" => Maneuver::TurnRight,
            "turn-slight-left" => Maneuver::TurnSlightLeft,
            "turn-slight-right" => Maneuver::TurnSlightRight,
            "turn-sharp-left" => Maneuver::TurnSharpLeft,
            "turn-sharp-right" => Maneuver::TurnSharpRight,
            "uturn-left" => Maneuver::UturnLeft,
            "uturn-right" => Maneuver::UturnRight,
            other => Maneuver::Other(other.to_string()),
        })
    }
}

impl Maneuver {
    /// Token written to the peripheral
    pub fn as_str(&self) -> &str {
        match self {
            Maneuver::Straight => "straight",
            Maneuver::TurnLeft => "turn-left",
            Maneuver::TurnRight => "turn-right",
            Maneuver::TurnSlightLeft => "turn-slight-left",
            Maneuver::TurnSlightRight => "turn-slight-right",
            Maneuver::TurnSharpLeft => "turn-sharp-left",
            Maneuver::TurnSharpRight => "turn-sharp-right",
            Maneuver::UturnLeft => "uturn-left",
            Maneuver::UturnRight => "uturn-right",
            Maneuver::Other(s) => s,
        }
    }

    /// Parse an optional provider field. Absent or blank means no maneuver.
    pub fn from_provider(token: Option<&str>) -> Option<Self> {
        let token = token.map(str::trim).filter(|t| !t.is_empty())?;
        token.parse().ok()
    }
}

impl std::fmt::Display for Maneuver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step as delivered by the route provider, before it is loaded into a table
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub start: Coordinate,
    pub end: Coordinate,
    pub maneuver: Option<Maneuver>,
    pub distance_text: String,
    pub distance_meters: f64,
}

/// One loaded navigation step. Immutable once its table is published.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteStep {
    /// Position in route order, 0-based
    pub index: usize,
    pub start: Coordinate,
    pub end: Coordinate,
    pub maneuver: Maneuver,
    pub distance_text: String,
    pub distance_meters: f64,
}

impl RouteStep {
    pub fn from_planned(index: usize, planned: PlannedStep) -> Self {
        Self {
            index,
            start: planned.start,
            end: planned.end,
            maneuver: planned.maneuver.unwrap_or(Maneuver::Straight),
            distance_text: planned.distance_text,
            distance_meters: planned.distance_meters,
        }
    }
}

/// Decoded route: overview geometry plus its steps in route order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Route {
    pub overview: Vec<Coordinate>,
    pub steps: Vec<PlannedStep>,
}

/// A step that became due during one dispatch cycle
#[derive(Debug, Clone, PartialEq)]
pub struct ProximityEvent {
    pub step: RouteStep,
    pub distance_m: f64,
}

/// Platform address or handle of a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PeripheralId(pub String);

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralIdentity {
    pub name: String,
    pub id: PeripheralId,
}

/// Position update delivered by a position source
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Fix(Coordinate),
    /// Source lost its fix or could not be opened
    Lost(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_range() {
        assert!(Coordinate::new(38.5, -120.2).is_ok());
        assert!(Coordinate::new(90.0, 180.0).is_ok());
        assert_eq!(Coordinate::new(90.1, 0.0), Err(CoordinateError::Latitude(90.1)));
        assert_eq!(Coordinate::new(0.0, -180.5), Err(CoordinateError::Longitude(-180.5)));
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_maneuver_from_str() {
        assert_eq!("turn-left".parse::<Maneuver>().unwrap(), Maneuver::TurnLeft);
        assert_eq!("turn-slight-right".parse::<Maneuver>().unwrap(), Maneuver::TurnSlightRight);
        assert_eq!(
            "roundabout-right".parse::<Maneuver>().unwrap(),
            Maneuver::Other("roundabout-right".to_string())
        );
        assert_eq!(Maneuver::Other("ramp-left".to_string()).as_str(), "ramp-left");
    }

    #[test]
    fn test_maneuver_from_provider_blank() {
        assert_eq!(Maneuver::from_provider(None), None);
        assert_eq!(Maneuver::from_provider(Some("  ")), None);
        assert_eq!(Maneuver::from_provider(Some("straight")), Some(Maneuver::Straight));
    }

    #[test]
    fn test_step_defaults_to_straight() {
        let c = Coordinate::new(12.0, 77.0).unwrap();
        let planned = PlannedStep {
            start: c,
            end: c,
            maneuver: None,
            distance_text: "200 m".to_string(),
            distance_meters: 200.0,
        };
        let step = RouteStep::from_planned(3, planned);
        assert_eq!(step.index, 3);
        assert_eq!(step.maneuver, Maneuver::Straight);
    }
}
