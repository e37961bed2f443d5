//! Encoded polyline codec (precision 5)
//!
//! Format:
//! - Each value is the signed delta from the previous point, in 1e-5 degree units
//! - Zig-zag: left shift by one, invert if negative
//! - Split into 5-bit groups, low group first; 0x20 marks "more groups follow"
//! - Each group is offset by 63 into printable ASCII
//! - Values alternate latitude, longitude

use crate::domain::types::Coordinate;
use thiserror::Error;

const CHAR_OFFSET: u8 = 63;
const CONTINUATION_BIT: i64 = 0x20;
const VALUE_MASK: i64 = 0x1f;
const PRECISION: f64 = 1e-5;
const INV_PRECISION: f64 = 1e5;

/// Highest shift that still fits a 32-bit zig-zag value
const MAX_SHIFT: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolylineError {
    #[error("polyline truncated inside value starting at byte {offset}")]
    Truncated { offset: usize },
    #[error("invalid polyline byte 0x{byte:02X} at offset {offset}")]
    InvalidByte { offset: usize, byte: u8 },
    #[error("polyline value at byte {offset} has too many groups")]
    Overlong { offset: usize },
    #[error("decoded point {index} is outside WGS84 range")]
    OutOfRange { index: usize },
}

/// Decode an encoded polyline into coordinates.
///
/// Fails if the string ends in the middle of a value (including a latitude with
/// no longitude), contains a byte outside the encoding alphabet, or produces a
/// point outside the valid coordinate range. An empty string decodes to no points.
pub fn decode(encoded: &str) -> Result<Vec<Coordinate>, PolylineError> {
    let bytes = encoded.as_bytes();
    let mut pos = 0usize;
    let mut lat: i64 = 0;
    let mut lon: i64 = 0;
    let mut points = Vec::with_capacity(bytes.len() / 4);

    while pos < bytes.len() {
        lat += next_value(bytes, &mut pos)?;
        lon += next_value(bytes, &mut pos)?;

        let point = Coordinate::new(lat as f64 * PRECISION, lon as f64 * PRECISION)
            .map_err(|_| PolylineError::OutOfRange { index: points.len() })?;
        points.push(point);
    }

    Ok(points)
}

/// Read one zig-zag value starting at `pos`, advancing past it
fn next_value(bytes: &[u8], pos: &mut usize) -> Result<i64, PolylineError> {
    let offset = *pos;
    let mut result: i64 = 0;
    let mut shift: u32 = 0;

    loop {
        let Some(&byte) = bytes.get(*pos) else {
            return Err(PolylineError::Truncated { offset });
        };
        if !(CHAR_OFFSET..=126).contains(&byte) {
            return Err(PolylineError::InvalidByte { offset: *pos, byte });
        }
        if shift > MAX_SHIFT {
            return Err(PolylineError::Overlong { offset });
        }
        *pos += 1;

        let group = (byte - CHAR_OFFSET) as i64;
        result |= (group & VALUE_MASK) << shift;
        shift += 5;

        if group & CONTINUATION_BIT == 0 {
            break;
        }
    }

    Ok(if result & 1 != 0 { !(result >> 1) } else { result >> 1 })
}

/// Encode coordinates as a polyline. Inverse of [`decode`] to 1e-5 degrees.
pub fn encode(points: &[Coordinate]) -> String {
    let mut out = String::with_capacity(points.len() * 8);
    let mut prev_lat: i64 = 0;
    let mut prev_lon: i64 = 0;

    for point in points {
        let lat = (point.latitude * INV_PRECISION).round() as i64;
        let lon = (point.longitude * INV_PRECISION).round() as i64;
        push_value(&mut out, lat - prev_lat);
        push_value(&mut out, lon - prev_lon);
        prev_lat = lat;
        prev_lon = lon;
    }

    out
}

fn push_value(out: &mut String, delta: i64) {
    let mut value = if delta < 0 { !(delta << 1) } else { delta << 1 };
    while value >= CONTINUATION_BIT {
        out.push((((value & VALUE_MASK) | CONTINUATION_BIT) as u8 + CHAR_OFFSET) as char);
        value >>= 5;
    }
    out.push((value as u8 + CHAR_OFFSET) as char);
}
