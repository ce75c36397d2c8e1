//! CommandDispatcher: one worker task owns the transport.
//!
//! Everything that touches the connection (commands, connect, disconnect and
//! idle transitions) is a [`Task`] on one bounded queue, so exactly one command
//! is ever in flight and commands run in submission order.
//!
//! While idling, the read half of the socket is lent to a spawned idle reader.
//! A queued command first sends `noidle`, waits for the reader to hand the
//! socket back, and only then writes the command. Results go to a separate
//! delivery task that runs callbacks in order, off the worker.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{ClientEvent, DisconnectReason, SharedBus};
use crate::protocol::commands;
use crate::protocol::parser::{self, Parser};
use crate::protocol::transport::{read_idle_response, LineReader};
use crate::protocol::{
    ConnectionState, MpdError, MpdResult, Response, ServerCapabilities, ServerVersion, Transport,
    TransportTimeouts, DEFAULT_PORT,
};

/// Receives the outcome of one submitted command, exactly once.
pub type Callback = Box<dyn FnOnce(MpdResult<Response>) + Send + 'static>;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub timeouts: TransportTimeouts,
    /// How long the idle reader may take to hand the socket back after `noidle`
    pub noidle_timeout: Duration,
    /// Quiet period after the last command before entering idle
    pub idle_delay: Duration,
    /// Subsystems passed to `idle` (all when empty)
    pub idle_subsystems: Vec<String>,
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeouts: TransportTimeouts::default(),
            noidle_timeout: Duration::from_secs(5),
            idle_delay: Duration::from_millis(500),
            idle_subsystems: Vec::new(),
            queue_capacity: 256,
        }
    }
}

/// Where to connect.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl ConnectTarget {
    pub fn new(host: impl Into<String>, port: u16, password: Option<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password: password.filter(|p| !p.is_empty()),
        }
    }
}

impl Default for ConnectTarget {
    fn default() -> Self {
        Self::new("", DEFAULT_PORT, None)
    }
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Counters for `idle` / `noidle` traffic.
///
/// Every `idle` ends either with our `noidle` or with a server wakeup, so
/// `idle_sent == noidle_sent + server_wakeups + idling` at all times. All four
/// fields change under one lock, so a snapshot is always consistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IdleStats {
    pub idle_sent: u64,
    pub noidle_sent: u64,
    pub server_wakeups: u64,
    pub idling: bool,
}

impl IdleStats {
    pub fn is_balanced(&self) -> bool {
        self.idle_sent == self.noidle_sent + self.server_wakeups + u64::from(self.idling)
    }
}

pub struct PendingCommand {
    pub command: String,
    pub parser: Parser,
    callback: Callback,
    seq: u64,
}

enum Task {
    Command(PendingCommand),
    Connect {
        target: ConnectTarget,
        explicit: bool,
        reply: Option<oneshot::Sender<MpdResult<ServerVersion>>>,
    },
    /// Connect again to the last target, if any. Outcome goes to the bus.
    Reconnect,
    Disconnect {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Cloneable handle to the dispatcher worker.
#[derive(Clone)]
pub struct Dispatcher {
    tasks: mpsc::Sender<Task>,
    state: watch::Receiver<ConnectionState>,
    capabilities: watch::Receiver<ServerCapabilities>,
    counters: Arc<Mutex<IdleStats>>,
    next_seq: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Start the worker and its callback delivery task.
    pub fn spawn(
        config: DispatcherConfig,
        bus: SharedBus,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let capacity = config.queue_capacity.max(1);
        let (task_tx, task_rx) = mpsc::channel(capacity);
        let (delivery_tx, delivery_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (caps_tx, caps_rx) = watch::channel(ServerCapabilities::default());
        let counters = Arc::new(Mutex::new(IdleStats::default()));

        tokio::spawn(deliver_callbacks(delivery_rx));

        let worker = Worker {
            transport: Transport::new(config.timeouts),
            config,
            tasks: task_rx,
            deliveries: delivery_tx,
            bus,
            state: state_tx,
            capabilities: caps_tx,
            counters: counters.clone(),
            idle_reply: None,
            idle_reader: None,
            idle_timer: None,
            idle_refused: false,
            last_target: None,
            reconnect_suppressed: false,
            shutdown,
        };
        let handle = tokio::spawn(worker.run());

        let dispatcher = Self {
            tasks: task_tx,
            state: state_rx,
            capabilities: caps_rx,
            counters,
            next_seq: Arc::new(AtomicU64::new(0)),
        };
        (dispatcher, handle)
    }

    /// Queue a command. Returns once it is queued; `callback` later receives
    /// the parsed response or the error.
    pub async fn submit<F>(&self, command: impl Into<String>, parser: Parser, callback: F)
    where
        F: FnOnce(MpdResult<Response>) + Send + 'static,
    {
        let pending = PendingCommand {
            command: command.into(),
            parser,
            callback: Box::new(callback),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        if let Err(mpsc::error::SendError(Task::Command(pending))) =
            self.tasks.send(Task::Command(pending)).await
        {
            (pending.callback)(Err(MpdError::Shutdown));
        }
    }

    /// Queue a command and wait for its result.
    pub async fn request(&self, command: impl Into<String>, parser: Parser) -> MpdResult<Response> {
        let (tx, rx) = oneshot::channel();
        self.submit(command, parser, move |result| {
            if tx.send(result).is_err() {
                debug!("Requester went away before the response arrived");
            }
        })
        .await;
        rx.await.unwrap_or(Err(MpdError::Shutdown))
    }

    /// Connect (closing any open connection first) and wait for the outcome.
    pub async fn connect(&self, target: ConnectTarget, explicit: bool) -> MpdResult<ServerVersion> {
        let (tx, rx) = oneshot::channel();
        let task = Task::Connect {
            target,
            explicit,
            reply: Some(tx),
        };
        if self.tasks.send(task).await.is_err() {
            return Err(MpdError::Shutdown);
        }
        rx.await.unwrap_or(Err(MpdError::Shutdown))
    }

    /// Queue a reconnect to the last target without waiting; the outcome is
    /// published on the bus as `Connected` or `Disconnected`.
    pub async fn reconnect(&self) -> MpdResult<()> {
        self.tasks
            .send(Task::Reconnect)
            .await
            .map_err(|_| MpdError::Shutdown)
    }

    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tasks.send(Task::Disconnect { reply: Some(tx) }).await.is_err() {
            return;
        }
        if rx.await.is_err() {
            debug!("Dispatcher stopped before confirming disconnect");
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        self.capabilities.borrow().clone()
    }

    pub fn idle_stats(&self) -> IdleStats {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Delivery {
    callback: Callback,
    result: MpdResult<Response>,
}

/// Run callbacks in the order the worker finished their commands. Ends when
/// the worker drops its sender, after draining what is queued.
async fn deliver_callbacks(mut rx: mpsc::Receiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        (delivery.callback)(delivery.result);
    }
}

type IdleOutcome = (LineReader, MpdResult<Vec<String>>);

enum Wake {
    Shutdown,
    Task(Option<Task>),
    Idle(Result<IdleOutcome, oneshot::error::RecvError>),
    IdleDue,
}

async fn idle_outcome(
    reply: &mut Option<oneshot::Receiver<IdleOutcome>>,
) -> Result<IdleOutcome, oneshot::error::RecvError> {
    match reply {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

async fn idle_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

enum IdleEnd {
    Noidle,
    Server,
}

struct Worker {
    config: DispatcherConfig,
    transport: Transport,
    tasks: mpsc::Receiver<Task>,
    deliveries: mpsc::Sender<Delivery>,
    bus: SharedBus,
    state: watch::Sender<ConnectionState>,
    capabilities: watch::Sender<ServerCapabilities>,
    counters: Arc<Mutex<IdleStats>>,
    /// Set while idling: the idle reader answers here with the socket.
    idle_reply: Option<oneshot::Receiver<IdleOutcome>>,
    idle_reader: Option<JoinHandle<()>>,
    idle_timer: Option<Pin<Box<Sleep>>>,
    /// The server ACKed `idle`; don't retry until the next connect.
    idle_refused: bool,
    last_target: Option<ConnectTarget>,
    /// Set by an explicit disconnect, cleared by the next explicit connect.
    /// Reconnects queued in between are dropped.
    reconnect_suppressed: bool,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                task = self.tasks.recv() => Wake::Task(task),
                outcome = idle_outcome(&mut self.idle_reply) => Wake::Idle(outcome),
                _ = idle_due(&mut self.idle_timer) => Wake::IdleDue,
            };

            match wake {
                Wake::Shutdown | Wake::Task(None) => break,
                Wake::Task(Some(task)) => self.handle(task).await,
                Wake::Idle(outcome) => self.on_idle_outcome(outcome),
                Wake::IdleDue => self.enter_idle().await,
            }
        }

        self.finish().await;
    }

    async fn handle(&mut self, task: Task) {
        match task {
            Task::Command(pending) => {
                debug!(
                    "Executing #{} {}",
                    pending.seq,
                    commands::redact(&pending.command)
                );
                let result = self.execute(&pending.command, pending.parser).await;
                self.deliver(pending.callback, result).await;
                self.arm_idle_timer();
            }
            Task::Connect {
                target,
                explicit,
                reply,
            } => {
                let result = self.connect(&target, explicit).await;
                if let Some(reply) = reply {
                    if reply.send(result).is_err() {
                        debug!("Connect caller went away");
                    }
                }
            }
            Task::Reconnect if self.reconnect_suppressed => {
                debug!("Disconnected on request, dropping reconnect");
            }
            Task::Reconnect if self.transport.is_open() => {
                debug!("Already connected, dropping stale reconnect");
            }
            Task::Reconnect => match self.last_target.clone() {
                Some(target) => {
                    if let Err(e) = self.connect(&target, false).await {
                        debug!("Reconnect failed: {}", e);
                    }
                }
                None => warn!("Reconnect requested before any connect"),
            },
            Task::Disconnect { reply } => {
                self.reconnect_suppressed = true;
                self.disconnect().await;
                if let Some(reply) = reply {
                    if reply.send(()).is_err() {
                        debug!("Disconnect caller went away");
                    }
                }
            }
        }
    }

    async fn execute(&mut self, command: &str, parser: Parser) -> MpdResult<Response> {
        if !self.transport.is_open() {
            return Err(MpdError::NotConnected);
        }
        self.idle_timer = None;

        if let Err(e) = self.leave_idle().await {
            self.connection_lost(&e);
            return Err(e);
        }

        match self.transport.command(command).await {
            Ok(lines) => parser(&lines).map_err(|e| {
                warn!(
                    "Failed to parse response to {}: {}",
                    commands::redact(command),
                    e
                );
                e
            }),
            Err(MpdError::Server(e)) => {
                debug!("{} failed: {}", commands::redact(command), e);
                if self.transport.capabilities_mut().observe_error(&e.message) {
                    warn!("Server looks like Mopidy, disabling list grouping and filtering");
                    self.capabilities
                        .send_replace(self.transport.capabilities().clone());
                }
                Err(MpdError::Server(e))
            }
            Err(e) => {
                self.connection_lost(&e);
                Err(e)
            }
        }
    }

    async fn deliver(&self, callback: Callback, result: MpdResult<Response>) {
        if let Err(mpsc::error::SendError(delivery)) =
            self.deliveries.send(Delivery { callback, result }).await
        {
            (delivery.callback)(delivery.result);
        }
    }

    // =========================================================================
    // Idle handling
    // =========================================================================

    fn can_idle(&self) -> bool {
        self.transport.is_open()
            && self.transport.capabilities().has_idle
            && !self.idle_refused
            && self.idle_reply.is_none()
    }

    fn arm_idle_timer(&mut self) {
        if self.can_idle() {
            self.idle_timer = Some(Box::pin(sleep(self.config.idle_delay)));
        }
    }

    fn record(&self, update: impl FnOnce(&mut IdleStats)) {
        let mut stats = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut stats);
    }

    fn idle_ended(&self, how: IdleEnd) {
        self.record(|s| {
            match how {
                IdleEnd::Noidle => s.noidle_sent += 1,
                IdleEnd::Server => s.server_wakeups += 1,
            }
            s.idling = false;
        });
    }

    async fn enter_idle(&mut self) {
        self.idle_timer = None;
        if !self.can_idle() {
            return;
        }

        let command = commands::idle(&self.config.idle_subsystems);
        if let Err(e) = self.transport.send_line(&command).await {
            self.connection_lost(&e);
            return;
        }
        self.record(|s| {
            s.idle_sent += 1;
            s.idling = true;
        });

        let Some(reader) = self.transport.take_reader() else {
            self.idle_ended(IdleEnd::Server);
            self.connection_lost(&MpdError::NotConnected);
            return;
        };
        let (tx, rx) = oneshot::channel();
        self.idle_reader = Some(tokio::spawn(async move {
            let outcome = read_idle_response(reader).await;
            if tx.send(outcome).is_err() {
                debug!("Idle response arrived after the dispatcher gave up on it");
            }
        }));
        self.idle_reply = Some(rx);

        self.set_state(ConnectionState::Idling);
        self.bus.publish(ClientEvent::IdleEntered);
    }

    /// The server answered `idle` on its own.
    fn on_idle_outcome(&mut self, outcome: Result<IdleOutcome, oneshot::error::RecvError>) {
        self.idle_reply = None;
        self.idle_reader = None;
        self.idle_ended(IdleEnd::Server);

        match outcome {
            Ok((reader, Ok(lines))) => {
                self.transport.restore_reader(reader);
                self.set_state(ConnectionState::Connected);
                let subsystems = parser::parse_changed(&lines);
                debug!("Server changed: {:?}", subsystems);
                self.bus.publish(ClientEvent::ServerChanged { subsystems });
                self.arm_idle_timer();
            }
            Ok((reader, Err(MpdError::Server(e)))) => {
                self.transport.restore_reader(reader);
                self.set_state(ConnectionState::Connected);
                warn!("Server refused idle, staying in polling mode: {}", e);
                self.idle_refused = true;
            }
            Ok((_, Err(e))) => self.connection_lost(&e),
            Err(_) => self.connection_lost(&MpdError::Connection("idle reader stopped".into())),
        }
    }

    /// Cancel an outstanding idle with `noidle` and take the socket back.
    async fn leave_idle(&mut self) -> MpdResult<()> {
        let Some(reply) = self.idle_reply.take() else {
            return Ok(());
        };

        if let Err(e) = self.transport.send_line(commands::NOIDLE).await {
            self.idle_ended(IdleEnd::Server);
            self.abort_idle_reader();
            return Err(e);
        }
        self.idle_ended(IdleEnd::Noidle);

        let outcome = timeout(self.config.noidle_timeout, reply).await;
        match outcome {
            Ok(Ok((reader, result))) => {
                self.idle_reader = None;
                self.transport.restore_reader(reader);
                self.set_state(ConnectionState::Connected);
                match result {
                    Ok(lines) => {
                        let subsystems = parser::parse_changed(&lines);
                        if !subsystems.is_empty() {
                            self.bus.publish(ClientEvent::ServerChanged { subsystems });
                        }
                        Ok(())
                    }
                    Err(MpdError::Server(e)) => {
                        warn!("idle ended with an error: {}", e);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Ok(Err(_)) => {
                self.idle_reader = None;
                Err(MpdError::Connection("idle reader stopped".into()))
            }
            Err(_) => {
                self.abort_idle_reader();
                Err(MpdError::Timeout("noidle"))
            }
        }
    }

    fn abort_idle_reader(&mut self) {
        if let Some(reader) = self.idle_reader.take() {
            reader.abort();
        }
    }

    /// Drop an outstanding idle without talking to the server.
    fn abandon_idle(&mut self) {
        if self.idle_reply.take().is_some() {
            self.idle_ended(IdleEnd::Server);
        }
        self.abort_idle_reader();
    }

    // =========================================================================
    // Connection lifecycle
    // =========================================================================

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
    }

    fn connection_lost(&mut self, e: &MpdError) {
        error!("MPD connection lost: {}", e);
        self.abandon_idle();
        self.transport.close();
        self.idle_timer = None;
        self.set_state(ConnectionState::Disconnected);
        self.bus.publish(ClientEvent::Disconnected {
            reason: DisconnectReason::ConnectionLost(e.to_string()),
        });
    }

    async fn connect(&mut self, target: &ConnectTarget, explicit: bool) -> MpdResult<ServerVersion> {
        if target.host.is_empty() {
            warn!("Ignoring connect without a host");
            return Err(MpdError::NotConnected);
        }
        if explicit {
            self.reconnect_suppressed = false;
        }
        if self.transport.is_open() {
            self.disconnect().await;
        }
        self.idle_refused = false;
        self.last_target = Some(target.clone());
        self.set_state(ConnectionState::Connecting);
        self.bus.publish(ClientEvent::Connecting { explicit });
        info!("Connecting to {}", target);

        match self
            .transport
            .connect(&target.host, target.password.as_deref(), target.port)
            .await
        {
            Ok(()) => {
                let version = self.transport.version();
                self.capabilities
                    .send_replace(self.transport.capabilities().clone());
                self.set_state(ConnectionState::Connected);
                self.bus.publish(ClientEvent::Connected { version });
                self.arm_idle_timer();
                Ok(version)
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", target, e);
                self.set_state(ConnectionState::Disconnected);
                self.bus.publish(ClientEvent::Disconnected {
                    reason: DisconnectReason::ConnectFailed(e.to_string()),
                });
                Err(e)
            }
        }
    }

    /// Explicit disconnect: always reported as `Requested`, even when already
    /// disconnected, so a pending reconnect gets suppressed.
    async fn disconnect(&mut self) {
        self.idle_timer = None;
        if self.transport.is_open() {
            if let Err(e) = self.leave_idle().await {
                debug!("noidle before close failed: {}", e);
            }
            self.abandon_idle();
            self.transport.send_close().await;
            info!("Disconnected from MPD");
        }
        self.set_state(ConnectionState::Disconnected);
        self.bus.publish(ClientEvent::Disconnected {
            reason: DisconnectReason::Requested,
        });
    }

    async fn finish(&mut self) {
        if self.transport.is_open() {
            self.disconnect().await;
        }
        self.abandon_idle();

        self.tasks.close();
        while let Ok(task) = self.tasks.try_recv() {
            match task {
                Task::Command(pending) => {
                    self.deliver(pending.callback, Err(MpdError::Shutdown)).await
                }
                Task::Connect {
                    reply: Some(reply), ..
                } => {
                    if reply.send(Err(MpdError::Shutdown)).is_err() {
                        debug!("Connect caller went away");
                    }
                }
                Task::Disconnect { reply: Some(reply) } => {
                    if reply.send(()).is_err() {
                        debug!("Disconnect caller went away");
                    }
                }
                _ => {}
            }
        }
        info!("Dispatcher stopped");
    }
}
