//! Route replay - drives the position listener along a route
//!
//! Walks an encoded polyline (or the geometry of a saved directions response)
//! at a fixed speed and writes one JSON position line per interval to the
//! nav-beacon position listener.
//!
//! Usage:
//!   cargo run --bin route-replay -- --polyline '_p~iF~ps|U_ulLnnqC_mqNvxq`@'
//!   cargo run --bin route-replay -- --route-file route.json --speed-kmh 60
//!   cargo run --bin route-replay -- --polyline ... --lose-fix-at-end

use anyhow::{bail, Context};
use clap::Parser;
use nav_beacon::domain::polyline;
use nav_beacon::domain::types::Coordinate;
use nav_beacon::io::route_provider::parse_directions;
use nav_beacon::services::proximity::haversine_m;
use serde_json::json;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "route-replay")]
#[command(about = "Replay a route as position fixes into nav-beacon")]
struct Args {
    /// Encoded polyline to follow
    #[arg(long, conflicts_with = "route_file")]
    polyline: Option<String>,

    /// Saved directions response (JSON); follows its overview geometry
    #[arg(long)]
    route_file: Option<String>,

    /// Position listener address
    #[arg(long, default_value = "127.0.0.1:5600")]
    addr: String,

    /// Vehicle speed
    #[arg(long, default_value = "40")]
    speed_kmh: f64,

    /// Milliseconds between fixes
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Restart from the first point after reaching the end
    #[arg(long)]
    repeat: bool,

    /// Send a lost-fix line after the last point
    #[arg(long)]
    lose_fix_at_end: bool,
}

/// Route geometry from either source
fn load_path(args: &Args) -> anyhow::Result<Vec<Coordinate>> {
    if let Some(encoded) = &args.polyline {
        return polyline::decode(encoded).context("invalid polyline");
    }
    let Some(path) = &args.route_file else {
        bail!("one of --polyline or --route-file is required");
    };

    let body = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
    let route = parse_directions(&body).with_context(|| format!("failed to parse {}", path))?;
    if !route.overview.is_empty() {
        return Ok(route.overview);
    }

    // No overview line: chain the step endpoints instead
    let mut points = Vec::with_capacity(route.steps.len() + 1);
    for step in &route.steps {
        points.push(step.start);
    }
    if let Some(last) = route.steps.last() {
        points.push(last.end);
    }
    Ok(points)
}

/// Positions spaced `stride_m` apart along the path, ending on its last point
fn interpolate(path: &[Coordinate], stride_m: f64) -> Vec<Coordinate> {
    let Some(&first) = path.first() else {
        return Vec::new();
    };
    let mut fixes = vec![first];
    // Distance already covered past the last emitted fix
    let mut carried = 0.0;

    for pair in path.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let segment = haversine_m(a, b);
        if segment <= f64::EPSILON {
            continue;
        }

        let mut along = stride_m - carried;
        while along < segment {
            let t = along / segment;
            let lat = a.latitude + (b.latitude - a.latitude) * t;
            let lon = a.longitude + (b.longitude - a.longitude) * t;
            if let Ok(point) = Coordinate::new(lat, lon) {
                fixes.push(point);
            }
            along += stride_m;
        }
        carried = segment - (along - stride_m);
    }

    if let Some(&last) = path.last() {
        if fixes.last() != Some(&last) {
            fixes.push(last);
        }
    }
    fixes
}

async fn send_line(stream: &mut TcpStream, value: serde_json::Value) -> anyhow::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    stream.write_all(line.as_bytes()).await.context("position listener write failed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    if !(args.speed_kmh.is_finite() && args.speed_kmh > 0.0) {
        bail!("--speed-kmh must be positive");
    }

    let path = load_path(&args)?;
    if path.is_empty() {
        bail!("route has no points");
    }

    let interval = Duration::from_millis(args.interval_ms.max(1));
    let stride_m = args.speed_kmh / 3.6 * interval.as_secs_f64();
    let fixes = interpolate(&path, stride_m);

    info!(
        points = %path.len(),
        fixes = %fixes.len(),
        stride_m = %format!("{:.1}", stride_m),
        addr = %args.addr,
        "replay_starting"
    );

    let mut stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("failed to connect to {}", args.addr))?;
    let mut ticker = tokio::time::interval(interval);

    loop {
        for (i, fix) in fixes.iter().enumerate() {
            ticker.tick().await;
            send_line(&mut stream, json!({ "latitude": fix.latitude, "longitude": fix.longitude }))
                .await?;
            info!(n = %i, position = %fix, "fix_sent");
        }
        if !args.repeat {
            break;
        }
        warn!("replay_restarting");
    }

    if args.lose_fix_at_end {
        send_line(&mut stream, json!({ "lost": "replay finished" })).await?;
    }
    stream.shutdown().await.ok();
    info!("replay_complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).unwrap()
    }

    #[test]
    fn test_interpolate_spacing() {
        // ~1112 m along the equator
        let path = [coord(0.0, 0.0), coord(0.0, 0.01)];
        let fixes = interpolate(&path, 100.0);

        assert_eq!(fixes.first(), Some(&path[0]));
        assert_eq!(fixes.last(), Some(&path[1]));
        assert_eq!(fixes.len(), 13);
        for pair in fixes[..fixes.len() - 1].windows(2) {
            let d = haversine_m(pair[0], pair[1]);
            assert!((d - 100.0).abs() < 0.5, "spacing {d}");
        }
    }

    #[test]
    fn test_interpolate_carries_across_vertices() {
        // Two 60 m legs with a 100 m stride: the second fix lands 40 m into leg two
        let a = coord(0.0, 0.0);
        let b = coord(0.0, 60.0 / 111_194.93);
        let c = coord(0.0, 120.0 / 111_194.93);
        let fixes = interpolate(&[a, b, c], 100.0);

        assert_eq!(fixes.len(), 3);
        assert!((haversine_m(a, fixes[1]) - 100.0).abs() < 0.5);
        assert_eq!(fixes[2], c);
    }

    #[test]
    fn test_interpolate_degenerate_paths() {
        assert!(interpolate(&[], 10.0).is_empty());
        let p = coord(12.0, 77.0);
        assert_eq!(interpolate(&[p], 10.0), vec![p]);
        assert_eq!(interpolate(&[p, p], 10.0), vec![p]);
    }
}
