//! Event bus for inter-component communication
//!
//! Uses tokio::sync::broadcast for pub/sub between the dispatcher, the idle
//! monitor, the reconnect supervisor and collaborators. Listener traits are
//! bridged onto the bus by relay tasks, so a listener always runs on its own
//! task and never on the one doing socket I/O.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::protocol::{CurrentStatus, ServerVersion, Track};

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// `disconnect()` was called. Never triggers a reconnect.
    Requested,
    /// An established connection failed.
    ConnectionLost(String),
    /// A connect attempt did not succeed.
    ConnectFailed(String),
}

impl DisconnectReason {
    pub fn is_requested(&self) -> bool {
        matches!(self, DisconnectReason::Requested)
    }
}

/// Events published on the bus
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    /// A connect attempt started. `explicit` is false for reconnects.
    Connecting { explicit: bool },
    Connected { version: ServerVersion },
    Disconnected { reason: DisconnectReason },
    /// The dispatcher sent `idle` and the connection is parked.
    IdleEntered,
    /// The server woke an idle connection.
    ServerChanged { subsystems: Vec<String> },
    /// `authoritative` is false for interpolated refreshes.
    StatusChanged {
        status: CurrentStatus,
        authoritative: bool,
    },
    TrackChanged { track: Track },
    ShuttingDown,
}

/// Event bus handle for publishing and subscribing
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: ClientEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    /// 256 events of backlog per subscriber
    fn default() -> Self {
        Self::new(256)
    }
}

/// Shared event bus wrapped in Arc for thread-safe sharing
pub type SharedBus = Arc<EventBus>;

pub fn create_bus() -> SharedBus {
    Arc::new(EventBus::default())
}

/// Receives playback updates.
pub trait StatusListener: Send + Sync + 'static {
    /// `authoritative` is false when the status was interpolated locally.
    fn on_new_status(&self, status: &CurrentStatus, authoritative: bool);
    fn on_new_track(&self, track: &Track);
}

/// Receives connection lifecycle changes.
pub trait ConnectionListener: Send + Sync + 'static {
    fn on_connected(&self, version: ServerVersion);
    fn on_disconnected(&self, reason: &DisconnectReason);
}

/// Forward bus events to `deliver` until shutdown or the bus closes.
///
/// `replay` runs after subscribing, so nothing published in between is lost;
/// its events are delivered before anything from the bus.
fn spawn_relay<R, F>(
    bus: &SharedBus,
    replay: R,
    shutdown: CancellationToken,
    deliver: F,
) -> JoinHandle<()>
where
    R: FnOnce() -> Vec<ClientEvent>,
    F: Fn(ClientEvent) + Send + 'static,
{
    let mut rx = bus.subscribe();
    let replay = replay();
    tokio::spawn(async move {
        for event in replay {
            deliver(event);
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => deliver(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Listener relay lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

/// `current` supplies the status and track the listener should start from.
pub fn spawn_status_relay(
    bus: &SharedBus,
    listener: Arc<dyn StatusListener>,
    current: impl FnOnce() -> Vec<ClientEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    spawn_relay(bus, current, shutdown, move |event| match event {
        ClientEvent::StatusChanged {
            status,
            authoritative,
        } => listener.on_new_status(&status, authoritative),
        ClientEvent::TrackChanged { track } => listener.on_new_track(&track),
        _ => {}
    })
}

pub fn spawn_connection_relay(
    bus: &SharedBus,
    listener: Arc<dyn ConnectionListener>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    spawn_relay(bus, Vec::new, shutdown, move |event| match event {
        ClientEvent::Connected { version } => listener.on_connected(version),
        ClientEvent::Disconnected { reason } => listener.on_disconnected(&reason),
        _ => {}
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_pubsub() {
        let bus = create_bus();
        let mut rx = bus.subscribe();

        bus.publish(ClientEvent::Connected {
            version: ServerVersion::parse("0.23.5"),
        });

        let event = rx.recv().await.unwrap();
        match event {
            ClientEvent::Connected { version } => assert_eq!(version.minor, 23),
            _ => panic!("Wrong event type"),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = create_bus();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(ClientEvent::IdleEntered);

        assert_eq!(rx1.recv().await.unwrap(), ClientEvent::IdleEntered);
        assert_eq!(rx2.recv().await.unwrap(), ClientEvent::IdleEntered);
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<String>,
        seen: Mutex<u32>,
    }

    impl StatusListener for Recorder {
        fn on_new_status(&self, status: &CurrentStatus, authoritative: bool) {
            *self.seen.lock().unwrap() += 1;
            let _ = self
                .tx
                .send(format!("status {} {}", status.volume, authoritative));
        }

        fn on_new_track(&self, track: &Track) {
            let _ = self.tx.send(format!("track {}", track.path));
        }
    }

    #[tokio::test]
    async fn test_status_relay_delivers_in_order() {
        let bus = create_bus();
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Recorder {
            tx,
            seen: Mutex::new(0),
        });
        let relay = spawn_status_relay(&bus, listener.clone(), Vec::new, shutdown.clone());

        let status = CurrentStatus {
            volume: 40,
            ..Default::default()
        };
        bus.publish(ClientEvent::StatusChanged {
            status,
            authoritative: true,
        });
        bus.publish(ClientEvent::IdleEntered);
        bus.publish(ClientEvent::TrackChanged {
            track: Track::new("a.flac"),
        });

        assert_eq!(rx.recv().await.unwrap(), "status 40 true");
        assert_eq!(rx.recv().await.unwrap(), "track a.flac");
        assert_eq!(*listener.seen.lock().unwrap(), 1);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .expect("relay stops on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_relay_replays_current_state_first() {
        let bus = create_bus();
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Recorder {
            tx,
            seen: Mutex::new(0),
        });
        let current = || {
            vec![
                ClientEvent::StatusChanged {
                    status: CurrentStatus {
                        volume: 20,
                        ..Default::default()
                    },
                    authoritative: true,
                },
                ClientEvent::TrackChanged {
                    track: Track::new("now.flac"),
                },
            ]
        };
        let _relay = spawn_status_relay(&bus, listener, current, shutdown.clone());

        bus.publish(ClientEvent::TrackChanged {
            track: Track::new("next.flac"),
        });

        assert_eq!(rx.recv().await.unwrap(), "status 20 true");
        assert_eq!(rx.recv().await.unwrap(), "track now.flac");
        assert_eq!(rx.recv().await.unwrap(), "track next.flac");
        shutdown.cancel();
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(ClientEvent::Disconnected {
            reason: DisconnectReason::ConnectionLost("reset".into()),
        })
        .unwrap();
        assert_eq!(json["type"], "Disconnected");
        assert_eq!(json["payload"]["reason"]["kind"], "connection_lost");
    }
}
