//! Proximity matching - decides which route step is due for announcement
//!
//! Steps are checked in route order against the great-circle distance from the
//! current position to each step's start. The first step strictly inside the
//! threshold wins; later steps are not examined. No memory of earlier matches is
//! kept, so a step keeps firing while the vehicle stays inside its radius.

use crate::domain::route::RouteSnapshot;
use crate::domain::types::{Coordinate, ProximityEvent};

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Default proximity threshold in meters
pub const DEFAULT_THRESHOLD_M: f64 = 50.0;

/// Great-circle distance in meters (haversine)
pub fn haversine_m(a: Coordinate, b: Coordinate) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// First step (in route order) whose start is strictly closer than `threshold_m`
pub fn find_due_step(
    position: Coordinate,
    snapshot: &RouteSnapshot,
    threshold_m: f64,
) -> Option<ProximityEvent> {
    snapshot.steps.iter().find_map(|step| {
        let distance_m = haversine_m(position, step.start);
        (distance_m < threshold_m).then(|| ProximityEvent { step: step.clone(), distance_m })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::route::RouteStepTable;
    use crate::domain::types::{Maneuver, PlannedStep};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn coord(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).unwrap()
    }

    fn step_at(start: Coordinate, maneuver: Option<Maneuver>, text: &str) -> PlannedStep {
        PlannedStep { start, end: start, maneuver, distance_text: text.to_string(), distance_meters: 0.0 }
    }

    /// Point `meters` north of `origin`
    fn north_of(origin: Coordinate, meters: f64) -> Coordinate {
        let d_lat = (meters / EARTH_RADIUS_M).to_degrees();
        coord(origin.latitude + d_lat, origin.longitude)
    }

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude along a meridian
        let d = haversine_m(coord(0.0, 0.0), coord(1.0, 0.0));
        assert!((d - 111_194.93).abs() < 0.5, "got {d}");

        let d = haversine_m(coord(12.9716, 77.5946), coord(12.9716, 77.5946));
        assert_eq!(d, 0.0);
    }

    #[test]
    fn test_haversine_symmetric() {
        let a = coord(38.5, -120.2);
        let b = coord(40.7, -120.95);
        assert!((haversine_m(a, b) - haversine_m(b, a)).abs() < 1e-6);
    }

    #[test]
    fn test_position_at_step_start_is_due() {
        let table = RouteStepTable::new();
        let start = coord(12.9352, 77.6245);
        table.load(vec![
            step_at(coord(12.90, 77.60), None, "1 km"),
            step_at(start, Some(Maneuver::TurnLeft), "200 m"),
        ]);

        let event = find_due_step(start, &table.current_steps(), DEFAULT_THRESHOLD_M).unwrap();
        assert_eq!(event.step.index, 1);
        assert_eq!(event.step.maneuver, Maneuver::TurnLeft);
        assert!(event.distance_m < 1e-6);
    }

    #[test]
    fn test_far_position_matches_nothing() {
        let table = RouteStepTable::new();
        let a = coord(12.9352, 77.6245);
        let b = coord(12.9400, 77.6300);
        table.load(vec![step_at(a, None, "x"), step_at(b, None, "y")]);

        let far = coord(13.5, 78.5);
        assert!(haversine_m(far, a) > 1000.0 && haversine_m(far, b) > 1000.0);
        assert!(find_due_step(far, &table.current_steps(), DEFAULT_THRESHOLD_M).is_none());

        // 1000 m north of the only step
        let table = RouteStepTable::new();
        table.load(vec![step_at(a, None, "x")]);
        let km_away = north_of(a, 1000.0);
        assert!(find_due_step(km_away, &table.current_steps(), DEFAULT_THRESHOLD_M).is_none());
    }

    #[test]
    fn test_earlier_step_wins_overlap() {
        let table = RouteStepTable::new();
        let base = coord(12.9352, 77.6245);
        // Step 1 is closer to the vehicle, but step 0 comes first in route order
        table.load(vec![
            step_at(north_of(base, 40.0), Some(Maneuver::TurnRight), "300 m"),
            step_at(north_of(base, 5.0), Some(Maneuver::TurnLeft), "100 m"),
        ]);

        let event = find_due_step(base, &table.current_steps(), DEFAULT_THRESHOLD_M).unwrap();
        assert_eq!(event.step.index, 0);
        assert!((event.distance_m - 40.0).abs() < 0.01);
    }

    #[test]
    fn test_threshold_is_strict() {
        let table = RouteStepTable::new();
        let base = coord(0.0, 0.0);
        let start = north_of(base, 50.0);
        table.load(vec![step_at(start, None, "x")]);
        let exact = haversine_m(base, start);

        assert!(find_due_step(base, &table.current_steps(), exact).is_none());
        assert!(find_due_step(base, &table.current_steps(), exact + 1e-6).is_some());
    }

    #[test]
    fn test_missing_maneuver_reported_as_straight() {
        let table = RouteStepTable::new();
        let start = coord(12.0, 77.0);
        table.load(vec![step_at(start, None, "20 m")]);
        let event = find_due_step(start, &table.current_steps(), DEFAULT_THRESHOLD_M).unwrap();
        assert_eq!(event.step.maneuver, Maneuver::Straight);
    }

    #[test]
    fn test_empty_table_matches_nothing() {
        let table = RouteStepTable::new();
        assert!(find_due_step(coord(0.0, 0.0), &table.current_steps(), DEFAULT_THRESHOLD_M).is_none());
    }

    #[test]
    fn test_concurrent_reload_never_mixes_routes() {
        // Route A: every step tagged "a"; route B: every step tagged "b".
        // The vehicle sits on step 2 of both, so a mixed list would surface as a
        // match whose table holds both tags.
        let vehicle = coord(12.0, 77.0);
        let route = |tag: &str| -> Vec<PlannedStep> {
            (0..8)
                .map(|i| {
                    let start = if i == 2 { vehicle } else { north_of(vehicle, 5_000.0 + i as f64) };
                    step_at(start, None, tag)
                })
                .collect()
        };

        let table = RouteStepTable::new();
        table.load(route("a"));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let table = table.clone();
            let stop = stop.clone();
            let (a, b) = (route("a"), route("b"));
            thread::spawn(move || {
                let mut flip = false;
                while !stop.load(Ordering::Relaxed) {
                    table.load(if flip { a.clone() } else { b.clone() });
                    flip = !flip;
                }
            })
        };

        for _ in 0..5_000 {
            let snapshot = table.current_steps();
            let event = find_due_step(vehicle, &snapshot, DEFAULT_THRESHOLD_M).unwrap();
            assert_eq!(event.step.index, 2);
            let tag = &snapshot.steps[0].distance_text;
            assert!(snapshot.steps.iter().all(|s| &s.distance_text == tag));
            assert_eq!(&event.step.distance_text, tag);
        }

        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
