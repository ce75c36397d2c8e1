//! `MpdClient`: the facade collaborators hold.
//!
//! It owns the dispatcher worker, the idle monitor and the reconnect
//! supervisor, all tied to one cancellation token. There is no global state;
//! create one client per server connection and pass it where it is needed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{
    create_bus, spawn_connection_relay, spawn_status_relay, ClientEvent, ConnectionListener,
    SharedBus, StatusListener,
};
use crate::dispatcher::{ConnectTarget, Dispatcher, DispatcherConfig, IdleStats};
use crate::monitor::{IdleMonitor, MonitorConfig, MonitorHandle, MonitorState};
use crate::protocol::parser::{self, Parser};
use crate::protocol::{
    commands, Album, Artist, ConnectionState, CurrentStatus, FileEntry, MpdError, MpdResult,
    Output, Response, ServerCapabilities, ServerVersion, Statistics, Track,
};
use crate::reconnect::{ReconnectConfig, ReconnectSupervisor, SupervisorStatus};

/// How long `shutdown` waits for each background task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub dispatcher: DispatcherConfig,
    pub monitor: MonitorConfig,
    pub reconnect: ReconnectConfig,
}

fn unexpected(command: &str, response: Response) -> MpdError {
    MpdError::Parse(format!("unexpected response to {}: {:?}", command, response))
}

pub struct MpdClient {
    bus: SharedBus,
    dispatcher: Dispatcher,
    monitor: MonitorHandle,
    reconnect: watch::Receiver<SupervisorStatus>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MpdClient {
    /// Start the background tasks. Must be called inside a tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        let bus = create_bus();
        let shutdown = CancellationToken::new();

        let (dispatcher, worker) =
            Dispatcher::spawn(config.dispatcher, bus.clone(), shutdown.clone());
        let (monitor, monitor_task) = IdleMonitor::spawn(
            config.monitor,
            dispatcher.clone(),
            bus.clone(),
            shutdown.clone(),
        );
        let (reconnect, supervisor_task) = ReconnectSupervisor::spawn(
            config.reconnect,
            dispatcher.clone(),
            &bus,
            shutdown.clone(),
        );

        Self {
            bus,
            dispatcher,
            monitor,
            reconnect,
            shutdown,
            tasks: vec![worker, monitor_task, supervisor_task],
        }
    }

    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub async fn connect(
        &self,
        host: &str,
        password: Option<&str>,
        port: u16,
    ) -> MpdResult<ServerVersion> {
        self.connect_to(ConnectTarget::new(host, port, password.map(str::to_string)))
            .await
    }

    pub async fn connect_to(&self, target: ConnectTarget) -> MpdResult<ServerVersion> {
        self.dispatcher.connect(target, true).await
    }

    /// Close the connection and hold off automatic reconnects until the next
    /// `connect`.
    pub async fn disconnect(&self) {
        self.dispatcher.disconnect().await;
    }

    /// Disconnect, stop every background task and wait for them.
    pub async fn shutdown(mut self) {
        info!("Shutting down MPD client");
        self.bus.publish(ClientEvent::ShuttingDown);
        self.dispatcher.disconnect().await;
        self.shutdown.cancel();

        for handle in std::mem::take(&mut self.tasks) {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Background task failed: {}", e),
                Err(_) => warn!("Background task did not stop in time"),
            }
        }
        debug!("MPD client stopped");
    }

    // =========================================================================
    // Listeners and observation
    // =========================================================================

    /// Deliver status and track updates to `listener` on its own task. A
    /// listener registered while connected first gets the current status and
    /// track.
    pub fn register_status_listener(&self, listener: Arc<dyn StatusListener>) {
        let monitor = self.monitor.clone();
        spawn_status_relay(
            &self.bus,
            listener,
            move || monitor.replay(),
            self.shutdown.child_token(),
        );
    }

    pub fn register_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        spawn_connection_relay(&self.bus, listener, self.shutdown.child_token());
    }

    pub fn state(&self) -> ConnectionState {
        self.dispatcher.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.dispatcher.watch_state()
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        self.dispatcher.capabilities()
    }

    pub fn idle_stats(&self) -> IdleStats {
        self.dispatcher.idle_stats()
    }

    /// Latest status fetched from the server.
    pub fn last_status(&self) -> Option<CurrentStatus> {
        self.monitor.last_status()
    }

    pub fn last_track(&self) -> Option<Track> {
        self.monitor.last_track()
    }

    pub fn monitor_state(&self) -> MonitorState {
        self.monitor.state()
    }

    pub fn reconnect_status(&self) -> SupervisorStatus {
        *self.reconnect.borrow()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Queue `command`; `callback` gets the parsed response or an error.
    pub async fn submit<F>(&self, command: impl Into<String>, parser: Parser, callback: F)
    where
        F: FnOnce(MpdResult<Response>) + Send + 'static,
    {
        self.dispatcher.submit(command, parser, callback).await
    }

    pub async fn request(&self, command: impl Into<String>, parser: Parser) -> MpdResult<Response> {
        self.dispatcher.request(command, parser).await
    }

    async fn simple(&self, command: String) -> MpdResult<()> {
        self.request(command, parser::ok_parser).await.map(|_| ())
    }

    async fn entries(&self, command: &str) -> MpdResult<Vec<FileEntry>> {
        match self.request(command, parser::entries_parser).await? {
            Response::Entries(entries) => Ok(entries),
            other => Err(unexpected(command, other)),
        }
    }

    async fn tracks(&self, command: &str) -> MpdResult<Vec<Track>> {
        let entries = self.entries(command).await?;
        Ok(entries.into_iter().filter_map(FileEntry::into_track).collect())
    }

    pub async fn status(&self) -> MpdResult<CurrentStatus> {
        match self.request(commands::STATUS, parser::status_parser).await? {
            Response::Status(status) => Ok(status),
            other => Err(unexpected(commands::STATUS, other)),
        }
    }

    pub async fn current_song(&self) -> MpdResult<Option<Track>> {
        match self
            .request(commands::CURRENT_SONG, parser::current_song_parser)
            .await?
        {
            Response::Track(track) => Ok(track),
            other => Err(unexpected(commands::CURRENT_SONG, other)),
        }
    }

    pub async fn statistics(&self) -> MpdResult<Statistics> {
        match self.request(commands::STATS, parser::statistics_parser).await? {
            Response::Statistics(stats) => Ok(stats),
            other => Err(unexpected(commands::STATS, other)),
        }
    }

    pub async fn outputs(&self) -> MpdResult<Vec<Output>> {
        match self.request(commands::OUTPUTS, parser::outputs_parser).await? {
            Response::Outputs(outputs) => Ok(outputs),
            other => Err(unexpected(commands::OUTPUTS, other)),
        }
    }

    async fn list_albums(&self, artist: Option<&str>) -> MpdResult<Vec<Album>> {
        let caps = self.capabilities();
        let group = caps.has_list_group && caps.has_musicbrainz_tags;
        let command = commands::list_albums(artist, group, caps.has_list_filtering);

        let response = match self.request(command.clone(), parser::albums_parser).await {
            // Mopidy rejects the extended syntax; the first failure flips the
            // capabilities, so retry once in the plain form.
            Err(MpdError::Server(e)) if self.capabilities().mopidy_detected => {
                let caps = self.capabilities();
                let plain = commands::list_albums(artist, false, caps.has_list_filtering);
                if plain == command {
                    return Err(MpdError::Server(e));
                }
                debug!("Retrying album list as {} after {}", plain, e);
                self.request(plain, parser::albums_parser).await?
            }
            other => other?,
        };

        match response {
            Response::Albums(mut albums) => {
                albums.sort();
                Ok(albums)
            }
            other => Err(unexpected("list album", other)),
        }
    }

    /// Every album in the database, sorted by name.
    pub async fn albums(&self) -> MpdResult<Vec<Album>> {
        self.list_albums(None).await
    }

    /// Albums by one artist, sorted by name.
    pub async fn artist_albums(&self, artist: &str) -> MpdResult<Vec<Album>> {
        let mut albums = self.list_albums(Some(artist)).await?;
        for album in &mut albums {
            if album.artist_name.is_empty() {
                album.artist_name = artist.to_string();
            }
        }
        Ok(albums)
    }

    /// Artists (or album artists) sorted by name, one entry per name.
    pub async fn artists(&self, album_artists: bool) -> MpdResult<Vec<Artist>> {
        let caps = self.capabilities();
        let group = caps.has_list_group && caps.has_musicbrainz_tags;
        let album_artists = album_artists && caps.has_tag_albumartist;
        let command = commands::list_artists(album_artists, group);

        let response = match self.request(command, parser::artists_parser).await {
            Err(MpdError::Server(e)) if group && self.capabilities().mopidy_detected => {
                debug!("Retrying artist list without grouping after {}", e);
                self.request(commands::list_artists(album_artists, false), parser::artists_parser)
                    .await?
            }
            other => other?,
        };

        match response {
            Response::Artists(artists) => Ok(parser::dedupe_artists(artists)),
            other => Err(unexpected("list artist", other)),
        }
    }

    /// Tracks of one album. When the album carries an artist or MBID, tracks
    /// from same-named albums by others are dropped.
    pub async fn album_tracks(&self, album: &Album) -> MpdResult<Vec<Track>> {
        let command = commands::find_album(&album.name);
        let entries = self.entries(&command).await?;
        let filtered = parser::filter_tracks(entries, &album.artist_name, &album.mbid);
        Ok(filtered.into_iter().filter_map(FileEntry::into_track).collect())
    }

    pub async fn all_tracks(&self) -> MpdResult<Vec<Track>> {
        self.tracks(commands::LIST_ALL_INFO).await
    }

    /// The play queue.
    pub async fn current_playlist(&self) -> MpdResult<Vec<Track>> {
        self.tracks(&commands::playlist_info(None)).await
    }

    /// Queue entries `start..end`. Falls back to the whole queue on servers
    /// without ranged `playlistinfo`.
    pub async fn current_playlist_window(&self, start: u32, end: u32) -> MpdResult<Vec<Track>> {
        if !self.capabilities().has_ranged_current_playlist {
            let all = self.current_playlist().await?;
            return Ok(all
                .into_iter()
                .skip(start as usize)
                .take(end.saturating_sub(start) as usize)
                .collect());
        }
        self.tracks(&commands::playlist_info(Some((start, end)))).await
    }

    pub async fn pause(&self, paused: bool) -> MpdResult<()> {
        self.simple(commands::pause(paused)).await
    }

    pub async fn play(&self, index: Option<u32>) -> MpdResult<()> {
        self.simple(commands::play(index)).await
    }

    pub async fn stop(&self) -> MpdResult<()> {
        self.simple(commands::STOP.to_string()).await
    }

    pub async fn next(&self) -> MpdResult<()> {
        self.simple(commands::NEXT.to_string()).await
    }

    pub async fn previous(&self) -> MpdResult<()> {
        self.simple(commands::PREVIOUS.to_string()).await
    }

    pub async fn set_volume(&self, volume: i32) -> MpdResult<()> {
        self.simple(commands::set_volume(volume)).await
    }

    pub async fn seek(&self, seconds: u32) -> MpdResult<()> {
        self.simple(commands::seek_current(seconds)).await
    }

    pub async fn set_random(&self, on: bool) -> MpdResult<()> {
        self.simple(commands::random(on)).await
    }

    pub async fn set_repeat(&self, on: bool) -> MpdResult<()> {
        self.simple(commands::repeat(on)).await
    }

    pub async fn set_single(&self, on: bool) -> MpdResult<()> {
        self.simple(commands::single(on)).await
    }

    pub async fn set_consume(&self, on: bool) -> MpdResult<()> {
        self.simple(commands::consume(on)).await
    }

    pub async fn enable_output(&self, id: u32) -> MpdResult<()> {
        self.simple(commands::enable_output(id)).await
    }

    pub async fn disable_output(&self, id: u32) -> MpdResult<()> {
        self.simple(commands::disable_output(id)).await
    }

    pub async fn toggle_output(&self, id: u32) -> MpdResult<()> {
        self.simple(commands::toggle_output(id)).await
    }

    /// Start a database update; the job id shows up in `status`.
    pub async fn update_database(&self, path: Option<&str>) -> MpdResult<()> {
        self.simple(commands::update(path)).await
    }
}

impl Drop for MpdClient {
    fn drop(&mut self) {
        // Without an explicit shutdown the tasks would otherwise outlive us.
        self.shutdown.cancel();
    }
}
