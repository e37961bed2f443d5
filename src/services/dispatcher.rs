//! Notification dispatcher - turns position + route into instructions
//!
//! Owns the latest known position and runs the proximity check on a fixed
//! cadence. A due step is formatted as `"<maneuver>: <distance>"` and handed
//! to the peripheral session without waiting on the radio.

use crate::domain::message::OutboundMessage;
use crate::domain::route::RouteStepTable;
use crate::domain::types::{Coordinate, PositionEvent};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::session::{SessionError, SessionEvent, SessionHandle};
use crate::services::proximity::find_due_step;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Result of one dispatch cycle
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No fix received yet, or the source reported it lost
    NoPosition,
    /// Last fix is older than the configured maximum age
    StalePosition,
    NoStepDue,
    /// Same step of the same route already fired (repeat guard enabled)
    Suppressed { step_index: usize },
    Queued { step_index: usize, distance_m: f64 },
    SendRejected(SessionError),
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub interval: Duration,
    pub threshold_m: f64,
    /// Suppress re-sending the step that fired last
    pub dedupe_repeats: bool,
    /// None disables the staleness check
    pub max_fix_age: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            threshold_m: 50.0,
            dedupe_repeats: false,
            max_fix_age: Some(Duration::from_secs(30)),
        }
    }
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.dispatch_interval_secs()),
            threshold_m: config.threshold_m(),
            dedupe_repeats: config.dedupe_repeats(),
            max_fix_age: match config.max_fix_age_secs() {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

pub struct NotificationDispatcher {
    table: RouteStepTable,
    session: SessionHandle,
    config: DispatcherConfig,
    metrics: Arc<Metrics>,
    latest: Option<(Coordinate, Instant)>,
    /// Last known position, published for the route refresher
    position_tx: watch::Sender<Option<Coordinate>>,
    /// (route generation, step index) of the last queued step
    last_fired: Option<(u64, usize)>,
}

impl NotificationDispatcher {
    pub fn new(
        table: RouteStepTable,
        session: SessionHandle,
        config: DispatcherConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (position_tx, _) = watch::channel(None);
        Self { table, session, config, metrics, latest: None, position_tx, last_fired: None }
    }

    /// Subscribe to the last known position
    pub fn watch_position(&self) -> watch::Receiver<Option<Coordinate>> {
        self.position_tx.subscribe()
    }

    pub fn on_position(&mut self, event: PositionEvent) {
        match event {
            PositionEvent::Fix(position) => {
                self.latest = Some((position, Instant::now()));
                self.metrics.record_position();
                self.position_tx.send_replace(Some(position));
                debug!(position = %position, "position_updated");
            }
            PositionEvent::Lost(reason) => {
                if self.latest.take().is_some() {
                    warn!(reason = %reason, "position_unavailable");
                }
            }
        }
    }

    /// Run one proximity check
    pub fn tick(&mut self) -> TickOutcome {
        self.metrics.record_tick();

        let Some((position, received_at)) = self.latest else {
            self.metrics.record_tick_no_position();
            debug!("tick_skipped_no_position");
            return TickOutcome::NoPosition;
        };

        if let Some(max_age) = self.config.max_fix_age {
            let age = received_at.elapsed();
            if age > max_age {
                self.metrics.record_tick_no_position();
                debug!(age_ms = %age.as_millis(), "tick_skipped_stale_position");
                return TickOutcome::StalePosition;
            }
        }

        let snapshot = self.table.current_steps();
        let Some(due) = find_due_step(position, &snapshot, self.config.threshold_m) else {
            return TickOutcome::NoStepDue;
        };
        self.metrics.record_step_matched();

        let step_index = due.step.index;
        let key = (snapshot.generation, step_index);
        if self.config.dedupe_repeats && self.last_fired == Some(key) {
            self.metrics.record_step_suppressed();
            debug!(step = %step_index, "step_repeat_suppressed");
            return TickOutcome::Suppressed { step_index };
        }

        let message = OutboundMessage::from_step(&due.step);
        info!(
            step = %step_index,
            generation = %snapshot.generation,
            distance_m = %format!("{:.1}", due.distance_m),
            text = %message.text(),
            "step_due"
        );

        match self.session.send(message) {
            Ok(()) => {
                self.last_fired = Some(key);
                self.metrics.record_message_queued();
                TickOutcome::Queued { step_index, distance_m: due.distance_m }
            }
            Err(e) => {
                self.metrics.record_message_rejected();
                warn!(step = %step_index, error = %e, "instruction_rejected");
                TickOutcome::SendRejected(e)
            }
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Dropped { text, reason } => {
                self.metrics.record_message_rejected();
                info!(text = %text, reason = %reason, "instruction_dropped");
                // Let the step fire again on the next tick
                self.last_fired = None;
            }
            SessionEvent::WriteFailed { .. } => self.last_fired = None,
            SessionEvent::Delivered { text, latency_ms, .. } => {
                debug!(text = %text, latency_ms = %latency_ms, "instruction_delivered");
            }
            _ => {}
        }
    }

    /// Run until shutdown, consuming positions and ticking on the cadence
    pub async fn run(
        mut self,
        mut position_rx: mpsc::Receiver<PositionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut session_events = self.session.subscribe();
        let mut events_open = true;

        info!(
            interval_secs = %self.config.interval.as_secs(),
            threshold_m = %self.config.threshold_m,
            dedupe_repeats = %self.config.dedupe_repeats,
            "dispatcher_started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.tick();
                    tracing::trace!(outcome = ?outcome, "dispatch_tick");
                }
                Some(event) = position_rx.recv() => self.on_position(event),
                event = session_events.recv(), if events_open => match event {
                    Ok(event) => self.on_session_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = %skipped, "session_events_lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("dispatcher_shutdown");
                        return;
                    }
                }
            }
        }
    }
}
