//! ReconnectSupervisor: reconnects after unexpected disconnects.
//!
//! The supervisor only watches the bus. A `Disconnected` event that was not
//! requested schedules one reconnect timer; the attempt itself is queued on the
//! dispatcher, which publishes the outcome back on the bus.

use std::pin::Pin;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{ClientEvent, DisconnectReason, SharedBus};
use crate::dispatcher::Dispatcher;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// Delay for the first `short_tries` consecutive failures
    pub short_delay: Duration,
    /// Delay from then on
    pub long_delay: Duration,
    pub short_tries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            short_delay: Duration::from_secs(10),
            long_delay: Duration::from_secs(60),
            short_tries: 5,
        }
    }
}

/// Backoff bookkeeping, free of any timers.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    failures: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Delay before retrying after the `failure`-th consecutive failure (1-based).
    pub fn delay_for(&self, failure: u32) -> Duration {
        if failure <= self.config.short_tries {
            self.config.short_delay
        } else {
            self.config.long_delay
        }
    }

    /// Count one more failure and return the delay before the next attempt.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay_for(self.failures)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Nothing to do: never connected, or the user disconnected.
    #[default]
    Inactive,
    Connected,
    /// A reconnect timer is pending.
    DisconnectedWaiting,
    /// A reconnect attempt has been queued.
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub failures: u32,
    /// An explicit disconnect is holding reconnects back
    pub suppressed: bool,
    /// Delay of the pending timer, if one is scheduled
    #[serde(skip)]
    pub next_delay: Option<Duration>,
}

pub struct ReconnectSupervisor {
    policy: ReconnectPolicy,
    enabled: bool,
    state: SupervisorState,
    dispatcher: Dispatcher,
    events: broadcast::Receiver<ClientEvent>,
    status: watch::Sender<SupervisorStatus>,
    /// At most one pending reconnect; scheduling again replaces it.
    timer: Option<Pin<Box<Sleep>>>,
    /// Set by an explicit disconnect, cleared by the next explicit connect.
    suppressed: bool,
    shutdown: CancellationToken,
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

impl ReconnectSupervisor {
    /// Subscribe to the bus and start supervising.
    pub fn spawn(
        config: ReconnectConfig,
        dispatcher: Dispatcher,
        bus: &SharedBus,
        shutdown: CancellationToken,
    ) -> (watch::Receiver<SupervisorStatus>, JoinHandle<()>) {
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());
        let supervisor = Self {
            enabled: config.enabled,
            policy: ReconnectPolicy::new(config),
            state: SupervisorState::Inactive,
            dispatcher,
            events: bus.subscribe(),
            status: status_tx,
            timer: None,
            suppressed: false,
            shutdown,
        };
        (status_rx, tokio::spawn(supervisor.run()))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = reconnect_due(&mut self.timer) => {
                    self.timer = None;
                    self.publish(SupervisorState::Reconnecting, None);
                    info!("Reconnect attempt after {} failure(s)", self.policy.failures());
                    if self.dispatcher.reconnect().await.is_err() {
                        break;
                    }
                }
                event = self.events.recv() => match event {
                    Ok(event) => self.on_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Reconnect supervisor lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Reconnect supervisor stopped");
    }

    fn on_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connecting { explicit: true } => {
                self.suppressed = false;
                self.timer = None;
                self.publish(self.state, None);
            }
            ClientEvent::Connected { .. } => {
                self.policy.reset();
                self.timer = None;
                self.publish(SupervisorState::Connected, None);
            }
            ClientEvent::Disconnected { reason } => self.on_disconnected(&reason),
            ClientEvent::ShuttingDown => {
                self.suppressed = true;
                self.timer = None;
            }
            _ => {}
        }
    }

    fn on_disconnected(&mut self, reason: &DisconnectReason) {
        if reason.is_requested() {
            self.suppressed = true;
            self.timer = None;
            self.publish(SupervisorState::Inactive, None);
            return;
        }
        if self.suppressed || !self.enabled {
            debug!("Not reconnecting after {:?}", reason);
            self.publish(SupervisorState::Inactive, None);
            return;
        }
        self.schedule();
    }

    fn schedule(&mut self) {
        let delay = self.policy.record_failure();
        info!(
            "Reconnecting in {:?} (failure {})",
            delay,
            self.policy.failures()
        );
        self.timer = Some(Box::pin(sleep(delay)));
        self.publish(SupervisorState::DisconnectedWaiting, Some(delay));
    }

    fn publish(&mut self, state: SupervisorState, next_delay: Option<Duration>) {
        self.state = state;
        self.status.send_replace(SupervisorStatus {
            state,
            failures: self.policy.failures(),
            suppressed: self.suppressed,
            next_delay,
        });
    }
}
