//! IdleMonitor: keeps listeners up to date while the connection idles.
//!
//! Once the dispatcher parks the connection in `idle`, two timers run: an
//! interpolation tick that advances the elapsed time locally, and a one-shot
//! resync that refreshes status from the server. A server wakeup triggers the
//! resync early. Resyncs go through the dispatcher like any other command, so
//! the `noidle` / `idle` dance stays in one place.

use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{ClientEvent, SharedBus};
use crate::dispatcher::Dispatcher;
use crate::protocol::{commands, parser};
use crate::protocol::{CurrentStatus, MpdResult, PlaybackState, Response, Track};

/// Shortest timer period; `interval_at` rejects zero.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub resync_interval: Duration,
    pub interpolate_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            interpolate_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    /// Not connected
    #[default]
    Inactive,
    Idling,
    Resyncing,
    Interpolating,
}

/// Read side of the monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    state: watch::Receiver<MonitorState>,
    last_status: watch::Receiver<Option<CurrentStatus>>,
    last_track: watch::Receiver<Option<Track>>,
}

impl MonitorHandle {
    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// Latest status fetched from the server (never an interpolated one).
    pub fn last_status(&self) -> Option<CurrentStatus> {
        self.last_status.borrow().clone()
    }

    pub fn last_track(&self) -> Option<Track> {
        self.last_track.borrow().clone()
    }

    /// Events that bring a late listener up to date with what the others
    /// have already seen.
    pub fn replay(&self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        if let Some(status) = self.last_status() {
            events.push(ClientEvent::StatusChanged {
                status,
                authoritative: true,
            });
        }
        if let Some(track) = self.last_track() {
            events.push(ClientEvent::TrackChanged { track });
        }
        events
    }
}

pub struct IdleMonitor {
    config: MonitorConfig,
    dispatcher: Dispatcher,
    bus: SharedBus,
    events: broadcast::Receiver<ClientEvent>,
    state: watch::Sender<MonitorState>,
    last_status: watch::Sender<Option<CurrentStatus>>,
    last_track: watch::Sender<Option<Track>>,
    last_resync: Instant,
    interpolation: Option<Interval>,
    resync_timer: Option<Pin<Box<Sleep>>>,
    shutdown: CancellationToken,
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn resync_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

impl IdleMonitor {
    pub fn spawn(
        config: MonitorConfig,
        dispatcher: Dispatcher,
        bus: SharedBus,
        shutdown: CancellationToken,
    ) -> (MonitorHandle, JoinHandle<()>) {
        let (state_tx, state_rx) = watch::channel(MonitorState::Inactive);
        let (status_tx, status_rx) = watch::channel(None);
        let (track_tx, track_rx) = watch::channel(None);
        let monitor = Self {
            config,
            dispatcher,
            events: bus.subscribe(),
            bus,
            state: state_tx,
            last_status: status_tx,
            last_track: track_tx,
            last_resync: Instant::now(),
            interpolation: None,
            resync_timer: None,
            shutdown,
        };
        let handle = MonitorHandle {
            state: state_rx,
            last_status: status_rx,
            last_track: track_rx,
        };
        (handle, tokio::spawn(monitor.run()))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = next_tick(&mut self.interpolation) => self.interpolate(),
                _ = resync_due(&mut self.resync_timer) => self.resync().await,
                event = self.events.recv() => match event {
                    Ok(event) => self.on_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Idle monitor lagged, skipped {} events", n);
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Idle monitor stopped");
    }

    async fn on_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected { .. } => {
                // Clear whatever the listeners still show from a previous server.
                self.last_status.send_replace(None);
                self.last_track.send_replace(None);
                self.bus.publish(ClientEvent::StatusChanged {
                    status: CurrentStatus::default(),
                    authoritative: true,
                });
                self.bus.publish(ClientEvent::TrackChanged {
                    track: Track::default(),
                });
                self.resync().await;
            }
            ClientEvent::IdleEntered => self.start_timers(),
            ClientEvent::ServerChanged { subsystems } => {
                debug!("Resync after server change {:?}", subsystems);
                self.resync().await;
            }
            ClientEvent::Disconnected { .. } => {
                self.cancel_timers();
                self.set_state(MonitorState::Inactive);
            }
            _ => {}
        }
    }

    fn set_state(&self, state: MonitorState) {
        self.state.send_replace(state);
    }

    fn start_timers(&mut self) {
        let period = self.config.interpolate_interval.max(MIN_PERIOD);
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interpolation = Some(interval);
        let resync = self.config.resync_interval.max(MIN_PERIOD);
        self.resync_timer = Some(Box::pin(sleep(resync)));
        self.set_state(MonitorState::Idling);
    }

    fn cancel_timers(&mut self) {
        self.interpolation = None;
        self.resync_timer = None;
    }

    /// Advance the elapsed time locally. Only a playing track moves.
    fn interpolate(&mut self) {
        let Some(status) = self.last_status.borrow().clone() else {
            return;
        };
        if status.playback_state != PlaybackState::Playing {
            return;
        }
        self.set_state(MonitorState::Interpolating);
        let advanced = status.interpolated(self.last_resync.elapsed().as_secs());
        self.bus.publish(ClientEvent::StatusChanged {
            status: advanced,
            authoritative: false,
        });
        self.set_state(MonitorState::Idling);
    }

    async fn fetch_status(&self) -> MpdResult<Option<CurrentStatus>> {
        match self
            .dispatcher
            .request(commands::STATUS, parser::status_parser)
            .await?
        {
            Response::Status(status) => Ok(Some(status)),
            other => {
                warn!("Unexpected status response {:?}", other);
                Ok(None)
            }
        }
    }

    async fn fetch_track(&self) -> MpdResult<Track> {
        match self
            .dispatcher
            .request(commands::CURRENT_SONG, parser::current_song_parser)
            .await?
        {
            Response::Track(track) => Ok(track.unwrap_or_default()),
            other => {
                warn!("Unexpected currentsong response {:?}", other);
                Ok(Track::default())
            }
        }
    }

    /// Refresh status, and the current track when it may have changed.
    async fn resync(&mut self) {
        self.cancel_timers();
        self.set_state(MonitorState::Resyncing);

        let status = match self.fetch_status().await {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(e) => {
                debug!("Status refresh failed: {}", e);
                return;
            }
        };

        let track_changed = self.last_status.borrow().as_ref().map_or(true, |previous| {
            previous.current_song_index != status.current_song_index
                || previous.playlist_version != status.playlist_version
        });

        self.last_resync = Instant::now();
        self.last_status.send_replace(Some(status.clone()));
        self.bus.publish(ClientEvent::StatusChanged {
            status,
            authoritative: true,
        });

        if track_changed {
            match self.fetch_track().await {
                Ok(track) => {
                    self.last_track.send_replace(Some(track.clone()));
                    self.bus.publish(ClientEvent::TrackChanged { track });
                }
                Err(e) => debug!("Track refresh failed: {}", e),
            }
        }

        // Without idle support nothing will restart the timers for us.
        if !self.dispatcher.capabilities().has_idle {
            self.start_timers();
        }
    }
}
