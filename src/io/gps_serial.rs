//! NMEA 0183 GPS receiver on a serial port
//!
//! Protocol:
//! - Sentences: `$<talker><type>,<fields...>*<hh>\r\n`
//! - Checksum: XOR of every byte between `$` and `*`, two hex digits
//! - Positions from RMC (status `A` = valid) and GGA (fix quality > 0)
//! - Latitude `ddmm.mmmm`, longitude `dddmm.mmmm`, hemisphere in the next field

use crate::domain::types::{Coordinate, PositionEvent};
use crate::infra::config::Config;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

/// Delay before reopening the port after an open or read failure
const REOPEN_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NmeaError {
    #[error("sentence does not start with '$'")]
    MissingStart,
    #[error("sentence has no checksum")]
    MissingChecksum,
    #[error("checksum mismatch: sentence says {expected:02X}, computed {actual:02X}")]
    Checksum { expected: u8, actual: u8 },
    #[error("invalid {0} field")]
    Field(&'static str),
}

fn checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Convert `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere to signed decimal degrees
fn parse_angle(value: &str, hemisphere: &str, name: &'static str) -> Result<f64, NmeaError> {
    let raw: f64 = value.parse().map_err(|_| NmeaError::Field(name))?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    if !(0.0..60.0).contains(&minutes) {
        return Err(NmeaError::Field(name));
    }
    let angle = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Ok(angle),
        "S" | "W" => Ok(-angle),
        _ => Err(NmeaError::Field(name)),
    }
}

fn parse_position(fields: &[&str], at: usize) -> Result<Coordinate, NmeaError> {
    let field = |i: usize| fields.get(i).copied().unwrap_or_default();
    let lat = parse_angle(field(at), field(at + 1), "latitude")?;
    let lon = parse_angle(field(at + 2), field(at + 3), "longitude")?;
    Coordinate::new(lat, lon).map_err(|_| NmeaError::Field("position"))
}

/// Parse one sentence. `Ok(None)` for valid sentences that carry no position.
pub fn parse_sentence(line: &str) -> Result<Option<PositionEvent>, NmeaError> {
    let line = line.trim();
    let body = line.strip_prefix('$').ok_or(NmeaError::MissingStart)?;
    let (body, sum) = body.rsplit_once('*').ok_or(NmeaError::MissingChecksum)?;
    let expected = u8::from_str_radix(sum.trim(), 16).map_err(|_| NmeaError::MissingChecksum)?;
    let actual = checksum(body);
    if expected != actual {
        return Err(NmeaError::Checksum { expected, actual });
    }

    let fields: Vec<&str> = body.split(',').collect();
    let kind = fields[0].get(2..).unwrap_or_default();

    match kind {
        "RMC" => match fields.get(2).copied() {
            Some("A") => parse_position(&fields, 3).map(|c| Some(PositionEvent::Fix(c))),
            Some("V") => Ok(Some(PositionEvent::Lost("receiver reports no fix".to_string()))),
            _ => Err(NmeaError::Field("status")),
        },
        "GGA" => {
            let quality: u8 = fields
                .get(6)
                .and_then(|q| q.parse().ok())
                .ok_or(NmeaError::Field("fix quality"))?;
            if quality == 0 {
                return Ok(Some(PositionEvent::Lost("receiver reports no fix".to_string())));
            }
            parse_position(&fields, 2).map(|c| Some(PositionEvent::Fix(c)))
        }
        _ => Ok(None),
    }
}

pub struct GpsReader {
    device: String,
    baud: u32,
    /// Whether the last event sent was a fix; `Lost` is only sent on transitions
    has_fix: bool,
}

impl GpsReader {
    pub fn new(config: &Config) -> Self {
        Self {
            device: config.serial_device().to_string(),
            baud: config.serial_baud(),
            has_fix: true,
        }
    }

    fn forward(&mut self, event: PositionEvent, tx: &mpsc::Sender<PositionEvent>) {
        match &event {
            PositionEvent::Fix(_) => self.has_fix = true,
            PositionEvent::Lost(reason) => {
                if !self.has_fix {
                    return;
                }
                warn!(device = %self.device, reason = %reason, "gps_fix_lost");
                self.has_fix = false;
            }
        }
        if let Err(e) = tx.try_send(event) {
            debug!(error = %e, "gps_position_dropped");
        }
    }

    /// Read sentences until shutdown, reopening the port on failure
    pub async fn run(mut self, tx: mpsc::Sender<PositionEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(device = %self.device, baud = %self.baud, "gps_reader_started");

        loop {
            let port = match tokio_serial::new(&self.device, self.baud).open_native_async() {
                Ok(port) => {
                    info!(device = %self.device, "gps_port_opened");
                    Some(port)
                }
                Err(e) => {
                    error!(device = %self.device, error = %e, "gps_port_open_failed");
                    self.forward(PositionEvent::Lost(format!("serial port unavailable: {}", e)), &tx);
                    None
                }
            };

            if let Some(port) = port {
                let mut lines = BufReader::new(port).lines();
                loop {
                    tokio::select! {
                        result = shutdown.changed() => {
                            if result.is_err() || *shutdown.borrow() {
                                info!("gps_reader_shutdown");
                                return;
                            }
                        }
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => match parse_sentence(&line) {
                                Ok(Some(event)) => self.forward(event, &tx),
                                Ok(None) => {}
                                Err(e) => debug!(line = %line.trim(), error = %e, "nmea_sentence_rejected"),
                            },
                            Ok(None) => {
                                warn!(device = %self.device, "gps_port_closed");
                                break;
                            }
                            Err(e) => {
                                warn!(device = %self.device, error = %e, "gps_read_error");
                                self.forward(PositionEvent::Lost(format!("serial read failed: {}", e)), &tx);
                                break;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("gps_reader_shutdown");
                        return;
                    }
                }
                _ = tokio::time::sleep(REOPEN_DELAY) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentence(body: &str) -> String {
        format!("${}*{:02X}", body, checksum(body))
    }

    fn assert_fix(event: Option<PositionEvent>, lat: f64, lon: f64) {
        match event {
            Some(PositionEvent::Fix(c)) => {
                assert!((c.latitude - lat).abs() < 1e-6, "latitude {}", c.latitude);
                assert!((c.longitude - lon).abs() < 1e-6, "longitude {}", c.longitude);
            }
            other => panic!("expected fix, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rmc() {
        let event = parse_sentence(
            "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n",
        )
        .unwrap();
        assert_fix(event, 48.0 + 7.038 / 60.0, 11.0 + 31.0 / 60.0);
    }

    #[test]
    fn test_parse_gga() {
        let event =
            parse_sentence("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47")
                .unwrap();
        assert_fix(event, 48.1173, 11.0 + 31.0 / 60.0);
    }

    #[test]
    fn test_southern_western_hemispheres() {
        let line = sentence("GNRMC,010203,A,3351.000,S,15112.600,W,0.0,0.0,010124,,");
        assert_fix(parse_sentence(&line).unwrap(), -(33.0 + 51.0 / 60.0), -(151.0 + 12.6 / 60.0));
    }

    #[test]
    fn test_no_fix_reports_lost() {
        let rmc = sentence("GPRMC,123519,V,,,,,,,230394,,");
        assert!(matches!(parse_sentence(&rmc), Ok(Some(PositionEvent::Lost(_)))));

        let gga = sentence("GPGGA,123519,,,,,0,00,,,M,,M,,");
        assert!(matches!(parse_sentence(&gga), Ok(Some(PositionEvent::Lost(_)))));
    }

    #[test]
    fn test_checksum_mismatch() {
        let result =
            parse_sentence("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*48");
        assert_eq!(result, Err(NmeaError::Checksum { expected: 0x48, actual: 0x47 }));
    }

    #[test]
    fn test_malformed_sentences() {
        assert_eq!(parse_sentence("GPGGA,1*00"), Err(NmeaError::MissingStart));
        assert_eq!(parse_sentence("$GPGGA,123519"), Err(NmeaError::MissingChecksum));
        let bad_lat = sentence("GPRMC,123519,A,48xx.038,N,01131.000,E,,,230394,,");
        assert_eq!(parse_sentence(&bad_lat), Err(NmeaError::Field("latitude")));
    }

    #[test]
    fn test_other_sentences_ignored() {
        let gsv = sentence("GPGSV,3,1,11,03,03,111,00,04,15,270,00,06,01,010,00,13,06,292,00");
        assert_eq!(parse_sentence(&gsv), Ok(None));
    }

    #[tokio::test]
    async fn test_lost_only_sent_on_transition() {
        let mut reader = GpsReader::new(&Config::default());
        let (tx, mut rx) = mpsc::channel(8);
        let fix = Coordinate::new(1.0, 2.0).unwrap();

        reader.forward(PositionEvent::Lost("a".to_string()), &tx);
        reader.forward(PositionEvent::Lost("b".to_string()), &tx);
        reader.forward(PositionEvent::Fix(fix), &tx);

        assert_eq!(rx.recv().await.unwrap(), PositionEvent::Lost("a".to_string()));
        assert_eq!(rx.recv().await.unwrap(), PositionEvent::Fix(fix));
    }
}
