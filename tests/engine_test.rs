//! End-to-end tests: position feed -> dispatcher -> session -> simulated display

use async_trait::async_trait;
use nav_beacon::domain::message::decode_payload;
use nav_beacon::domain::types::{Coordinate, Maneuver, PlannedStep, PositionEvent, Route};
use nav_beacon::domain::RouteStepTable;
use nav_beacon::infra::Metrics;
use nav_beacon::io::position_listener::serve_positions;
use nav_beacon::io::route_provider::{RouteError, RouteSource};
use nav_beacon::io::{
    create_session, SessionConfig, SessionEvent, SessionHandle, SessionState, SimRadio,
};
use nav_beacon::services::{DispatcherConfig, NotificationDispatcher, RouteRefresher};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};

fn coord(lat: f64, lon: f64) -> Coordinate {
    Coordinate::new(lat, lon).unwrap()
}

fn step(lat: f64, lon: f64, maneuver: Maneuver, text: &str) -> PlannedStep {
    PlannedStep {
        start: coord(lat, lon),
        end: coord(lat, lon),
        maneuver: Some(maneuver),
        distance_text: text.to_string(),
        distance_meters: 0.0,
    }
}

/// Route source returning a fixed route
struct FixedSource {
    route: Mutex<Route>,
}

#[async_trait]
impl RouteSource for FixedSource {
    async fn fetch(&self, _origin: Coordinate, _destination: &str) -> Result<Route, RouteError> {
        Ok(self.route.lock().clone())
    }
}

async fn next_delivery(events: &mut broadcast::Receiver<SessionEvent>) -> String {
    loop {
        match tokio::time::timeout(Duration::from_secs(30), events.recv()).await {
            Ok(Ok(SessionEvent::Delivered { text, .. })) => return text,
            Ok(Ok(_)) => continue,
            other => panic!("no delivery: {other:?}"),
        }
    }
}

struct Engine {
    radio: Arc<SimRadio>,
    table: RouteStepTable,
    session: SessionHandle,
    metrics: Arc<Metrics>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Engine {
    /// Session + dispatcher running on `position_rx`; the route refresher is
    /// only started when a source is given
    fn start(
        position_rx: mpsc::Receiver<PositionEvent>,
        source: Option<Arc<dyn RouteSource>>,
        dispatch: DispatcherConfig,
    ) -> Self {
        let radio = Arc::new(SimRadio::default());
        let metrics = Arc::new(Metrics::new());
        let table = RouteStepTable::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (session, peripheral) =
            create_session(radio.clone(), SessionConfig::default(), metrics.clone());
        let mut tasks = vec![tokio::spawn(peripheral.run(shutdown_rx.clone()))];

        let dispatcher =
            NotificationDispatcher::new(table.clone(), session.clone(), dispatch, metrics.clone());
        if let Some(source) = source {
            let refresher = RouteRefresher::new(
                source,
                table.clone(),
                Some("Indiranagar, Bengaluru".to_string()),
                0,
                metrics.clone(),
            );
            tasks.push(tokio::spawn(refresher.run(dispatcher.watch_position(), shutdown_rx.clone())));
        }
        tasks.push(tokio::spawn(dispatcher.run(position_rx, shutdown_rx)));

        Self { radio, table, session, metrics, shutdown_tx, tasks }
    }

    async fn stop(self) {
        self.shutdown_tx.send(true).unwrap();
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_tcp_feed_to_display() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (position_tx, position_rx) = mpsc::channel(64);

    let source = Arc::new(FixedSource {
        route: Mutex::new(Route {
            overview: vec![coord(12.9716, 77.5946), coord(12.9784, 77.6408)],
            steps: vec![
                step(12.9716, 77.5946, Maneuver::Straight, "2.1 km"),
                step(12.9784, 77.6408, Maneuver::TurnRight, "120 m"),
            ],
        }),
    });
    let dispatch = DispatcherConfig { interval: Duration::from_millis(100), ..DispatcherConfig::default() };
    let engine = Engine::start(position_rx, Some(source as Arc<dyn RouteSource>), dispatch);
    let mut events = engine.session.subscribe();

    let (listener_shutdown_tx, listener_shutdown_rx) = watch::channel(false);
    let listener_task = tokio::spawn(serve_positions(listener, position_tx, listener_shutdown_rx));

    let mut feed = TcpStream::connect(addr).await.unwrap();
    feed.write_all(b"{\"latitude\": 12.97842, \"longitude\": 77.64083}\n").await.unwrap();

    assert_eq!(next_delivery(&mut events).await, "turn-right: 120 m");

    let written = engine.radio.written_payloads();
    assert!(!written.is_empty());
    assert_eq!(decode_payload(&written[0]).as_deref(), Some("turn-right: 120 m"));
    assert_eq!(engine.table.generation(), 1);
    assert_eq!(engine.session.state(), SessionState::Connected);
    assert!(engine.metrics.messages_delivered() >= 1);

    listener_shutdown_tx.send(true).unwrap();
    listener_task.await.unwrap();
    let radio = engine.radio.clone();
    engine.stop().await;
    assert!(!radio.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_peer_disconnect() {
    let (position_tx, position_rx) = mpsc::channel(64);
    let engine = Engine::start(position_rx, None, DispatcherConfig::default());
    engine.table.load(vec![step(12.9352, 77.6245, Maneuver::TurnLeft, "200 m")]);
    let mut events = engine.session.subscribe();

    position_tx.send(PositionEvent::Fix(coord(12.9352, 77.6245))).await.unwrap();
    assert_eq!(next_delivery(&mut events).await, "turn-left: 200 m");
    assert_eq!(engine.radio.scans_started(), 1);

    engine.radio.drop_link();
    loop {
        match events.recv().await.unwrap() {
            SessionEvent::Disconnected { by_peer } => {
                assert!(by_peer);
                break;
            }
            _ => continue,
        }
    }
    assert_eq!(engine.session.state(), SessionState::Idle);

    // Keep the fix fresh; the next due tick starts a new discovery
    position_tx.send(PositionEvent::Fix(coord(12.9352, 77.6245))).await.unwrap();
    assert_eq!(next_delivery(&mut events).await, "turn-left: 200 m");
    assert_eq!(engine.radio.scans_started(), 2);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_route_reload_changes_instruction() {
    let (position_tx, position_rx) = mpsc::channel(64);
    let engine = Engine::start(position_rx, None, DispatcherConfig::default());
    let here = coord(12.9352, 77.6245);
    engine.table.load(vec![step(12.9352, 77.6245, Maneuver::TurnLeft, "200 m")]);
    let mut events = engine.session.subscribe();

    position_tx.send(PositionEvent::Fix(here)).await.unwrap();
    assert_eq!(next_delivery(&mut events).await, "turn-left: 200 m");

    engine.table.load(vec![step(12.9352, 77.6245, Maneuver::UturnRight, "50 m")]);
    position_tx.send(PositionEvent::Fix(here)).await.unwrap();
    assert_eq!(next_delivery(&mut events).await, "uturn-right: 50 m");

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_fix_stops_instructions() {
    let (position_tx, position_rx) = mpsc::channel(64);
    let engine = Engine::start(position_rx, None, DispatcherConfig::default());
    engine.table.load(vec![step(12.9352, 77.6245, Maneuver::TurnLeft, "200 m")]);
    let mut events = engine.session.subscribe();

    position_tx.send(PositionEvent::Fix(coord(12.9352, 77.6245))).await.unwrap();
    next_delivery(&mut events).await;

    position_tx.send(PositionEvent::Lost("location permission revoked".to_string())).await.unwrap();
    // Let the dispatcher observe the loss before counting
    tokio::time::sleep(Duration::from_millis(10)).await;
    let delivered = engine.metrics.messages_delivered();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(engine.metrics.messages_delivered(), delivered);

    engine.stop().await;
}
