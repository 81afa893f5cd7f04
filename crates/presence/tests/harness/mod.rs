//! Multi-client session harness
//!
//! Wires several [`PresenceCoordinator`]s to one shared event log through
//! loopback model transports, with scripted media transports and recording
//! renderers. Time is tokio's paused clock; model time is derived from it.
//!
//! Basic usage pattern:
//!
//! 1. Create a `SessionHarness` (inside `#[tokio::test(start_paused = true)]`)
//! 2. Add clients with `harness.join("a")`
//! 3. Drive transport events with `harness.transport_event(..)`
//! 4. Let time pass with `harness.advance(..)`, which also pumps the model

#![allow(dead_code)]

pub mod fakes;

use async_trait::async_trait;
use parking_lot::Mutex;
use remotemedia_presence::model::{EventLog, ModelEvent, ModelSettings, Replica};
use remotemedia_presence::{
    Collaborators, ConnectionState, Error, ModelTransport, PeerIdentity, PresenceConfig,
    PresenceCoordinator, Result, Silence, TransportEvent, ViewId,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub use fakes::{failed, track, RecordingRenderer, ScriptedTransport, TransportCall};

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,remotemedia_presence=debug")
        .with_test_writer()
        .try_init();
}

/// Per-client model transport feeding the shared log
///
/// Payloads go through the wire encoding and are decoded back, as a real
/// framework would.
#[derive(Default)]
pub struct LoopbackModel {
    pending: Mutex<Vec<ModelEvent>>,
    offline: AtomicBool,
}

impl LoopbackModel {
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn drain(&self) -> Vec<ModelEvent> {
        std::mem::take(&mut *self.pending.lock())
    }
}

#[async_trait]
impl ModelTransport for LoopbackModel {
    async fn publish(&self, _scope: &str, event_name: &str, payload: Value) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::ModelOffline("loopback unplugged".to_string()));
        }
        let event = ModelEvent::decode(event_name, payload)?;
        self.pending.lock().push(event);
        Ok(())
    }
}

pub struct TestClient {
    pub id: ViewId,
    pub coordinator: PresenceCoordinator,
    pub transport: Arc<ScriptedTransport>,
    pub render: Arc<RecordingRenderer>,
    pub model: Arc<LoopbackModel>,
    replica: Replica,
    /// Receives model notifications
    attached: bool,
}

pub struct SessionHarness {
    config: PresenceConfig,
    settings: ModelSettings,
    log: EventLog,
    clients: Vec<TestClient>,
    start: Instant,
}

pub fn identity(name: &str) -> PeerIdentity {
    PeerIdentity {
        nickname: name.to_string(),
        initials: name.to_uppercase(),
        color: "#336699".to_string(),
        agent: "harness".to_string(),
    }
}

pub fn id(name: &str) -> ViewId {
    ViewId::new(name)
}

impl SessionHarness {
    pub fn new() -> Self {
        Self::with_config(PresenceConfig::default())
    }

    pub fn with_config(config: PresenceConfig) -> Self {
        Self {
            settings: ModelSettings::from(&config),
            config,
            log: EventLog::new(),
            clients: Vec::new(),
            start: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn client(&self, name: &str) -> &TestClient {
        self.clients
            .iter()
            .find(|c| c.id.as_str() == name)
            .unwrap_or_else(|| panic!("no client {}", name))
    }

    pub fn coordinator(&self, name: &str) -> &PresenceCoordinator {
        &self.client(name).coordinator
    }

    fn client_mut(&mut self, name: &str) -> &mut TestClient {
        self.clients
            .iter_mut()
            .find(|c| c.id.as_str() == name)
            .unwrap_or_else(|| panic!("no client {}", name))
    }

    /// Any replica's model; all of them agree
    pub fn model(&self) -> &remotemedia_presence::SessionModel {
        self.clients
            .iter()
            .find(|c| c.attached)
            .map(|c| c.replica.model())
            .expect("no attached client")
    }

    /// A new view joins the session and announces its identity
    pub async fn join(&mut self, name: &str) {
        let id = id(name);
        let transport = Arc::new(ScriptedTransport::default());
        let render = Arc::new(RecordingRenderer::default());
        let model = Arc::new(LoopbackModel::default());

        let coordinator = PresenceCoordinator::new(
            self.config.clone(),
            id.clone(),
            Collaborators {
                transport: transport.clone(),
                model: model.clone(),
                render: render.clone(),
                levels: Arc::new(Silence),
            },
        )
        .expect("valid config");

        self.clients.push(TestClient {
            id: id.clone(),
            coordinator,
            transport,
            render,
            model,
            replica: Replica::new(self.settings.clone()),
            attached: false,
        });

        let now = self.now_ms();
        self.log.append(now, ModelEvent::ViewJoin { view_id: id });
        self.pump().await;
        self.attach(name).await;
        self.coordinator(name)
            .announce_identity(identity(name), false)
            .await
            .expect("announce identity");
        self.pump().await;
    }

    /// Catch the client's replica up and hand the coordinator a fresh snapshot
    pub async fn attach(&mut self, name: &str) {
        let now = self.now_ms();
        let log = &self.log;
        let client = self
            .clients
            .iter_mut()
            .find(|c| c.id.as_str() == name)
            .unwrap_or_else(|| panic!("no client {}", name));

        client.model.set_offline(false);
        // history is covered by the snapshot
        client.replica.advance_to(now);
        client.replica.catch_up(log);
        client.attached = true;

        let snapshot = client.replica.model().snapshot();
        client
            .coordinator
            .attach_model(snapshot)
            .await
            .expect("attach model");
        self.pump().await;
    }

    /// The client loses its model connection but stays in the session
    pub fn unplug(&mut self, name: &str) {
        let client = self.client_mut(name);
        client.model.set_offline(true);
        client.coordinator.detach_model();
        client.attached = false;
    }

    /// The framework drops the view from the session
    pub async fn exit(&mut self, name: &str) {
        self.unplug(name);
        let now = self.now_ms();
        self.log
            .append(now, ModelEvent::ViewExit { view_id: id(name) });
        self.pump().await;
    }

    /// The framework re-admits a view that exited
    pub async fn rejoin(&mut self, name: &str) {
        let now = self.now_ms();
        self.log
            .append(now, ModelEvent::ViewJoin { view_id: id(name) });
        self.pump().await;
        self.attach(name).await;
    }

    /// Deliver published events to the log and notifications to coordinators
    /// until nothing moves
    pub async fn pump(&mut self) {
        loop {
            settle().await;
            let now = self.now_ms();
            let mut moved = false;

            for client in self.clients.iter().filter(|c| c.attached) {
                for event in client.model.drain() {
                    self.log.append(now, event);
                    moved = true;
                }
            }

            for client in self.clients.iter_mut().filter(|c| c.attached) {
                let mut notifications = client.replica.advance_to(now);
                notifications.extend(client.replica.catch_up(&self.log));
                for notification in notifications {
                    moved = true;
                    client.coordinator.handle_notification(notification).await;
                }
            }

            if !moved {
                break;
            }
        }
    }

    pub async fn transport_event(&mut self, name: &str, event: TransportEvent) {
        self.coordinator(name).handle_transport_event(event).await;
        self.pump().await;
    }

    pub async fn connect(&mut self, name: &str) {
        self.transport_event(
            name,
            TransportEvent::ConnectionStateChange {
                current: ConnectionState::Connected,
                previous: ConnectionState::Connecting,
                reason: None,
            },
        )
        .await;
    }

    pub async fn disconnect(&mut self, name: &str) {
        self.transport_event(
            name,
            TransportEvent::ConnectionStateChange {
                current: ConnectionState::Disconnected,
                previous: ConnectionState::Connected,
                reason: Some("LEAVE".to_string()),
            },
        )
        .await;
    }

    /// Move the paused clock, letting timers and spawned tasks run
    pub async fn advance(&mut self, by: Duration) {
        let step = Duration::from_millis(100);
        let mut left = by;
        while !left.is_zero() {
            let tick = left.min(step);
            tokio::time::advance(tick).await;
            left -= tick;
            self.pump().await;
        }
    }

    pub async fn shutdown(&self) {
        for client in &self.clients {
            let _ = client.coordinator.shutdown().await;
        }
    }
}

/// Let spawned tasks run to their next await on the current-thread runtime
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
