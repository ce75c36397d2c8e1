#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock MPD for testing
//!
//! Speaks enough of the line protocol for the client: greeting, password,
//! capability probing, `idle`/`noidle`, status and a handful of playback
//! commands. Every line received is logged so tests can check ordering.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

/// Mock MPD state
#[derive(Debug, Clone)]
pub struct MockMpdState {
    pub version: String,
    pub password: Option<String>,
    pub supports_idle: bool,
    /// Answer `list ... group` and filtered `list` the way Mopidy does
    pub mopidy: bool,
    /// Advertise the MUSICBRAINZ_* tag types
    pub musicbrainz_tags: bool,
    /// Never answer `noidle`, like a server that hung mid-idle
    pub ignore_noidle: bool,
    pub state: String, // play, pause, stop
    pub volume: i32,
    pub playlist_version: u32,
    pub queue: Vec<(String, String, String)>, // (file, artist, title)
    pub song: Option<usize>,
    pub elapsed: f64,
    pub albums: Vec<(String, String)>, // (album, mbid)
}

impl Default for MockMpdState {
    fn default() -> Self {
        Self {
            version: "0.23.5".to_string(),
            password: None,
            supports_idle: true,
            mopidy: false,
            musicbrainz_tags: true,
            ignore_noidle: false,
            state: "stop".to_string(),
            volume: 50,
            playlist_version: 1,
            queue: vec![
                (
                    "music/abba/waterloo.flac".to_string(),
                    "ABBA".to_string(),
                    "Waterloo".to_string(),
                ),
                (
                    "music/abba/sos.flac".to_string(),
                    "ABBA".to_string(),
                    "SOS".to_string(),
                ),
            ],
            song: None,
            elapsed: 0.0,
            albums: vec![
                ("waterloo".to_string(), "mbid-w".to_string()),
                ("Arrival".to_string(), "mbid-a".to_string()),
                ("Voulez-Vous".to_string(), String::new()),
            ],
        }
    }
}

/// Mock MPD server
pub struct MockMpdServer {
    addr: SocketAddr,
    state: Arc<RwLock<MockMpdState>>,
    log: Arc<RwLock<Vec<String>>>,
    changes: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl MockMpdServer {
    /// Start a mock MPD on a random port
    pub async fn start() -> Self {
        Self::start_with(MockMpdState::default(), 0).await
    }

    /// Start with the given state, on `port` (0 for any)
    pub async fn start_with(initial: MockMpdState, port: u16) -> Self {
        let state = Arc::new(RwLock::new(initial));
        let log = Arc::new(RwLock::new(Vec::new()));
        let (changes, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(4);
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let ctx = Connection {
            state: state.clone(),
            log: log.clone(),
            changes: changes.clone(),
            kick: kick.clone(),
        };
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            ctx.serve(stream).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            addr,
            state,
            log,
            changes,
            kick,
            handle,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every line received so far, across connections
    pub async fn received(&self) -> Vec<String> {
        self.log.read().await.clone()
    }

    /// Change the volume as if another client did, waking idlers
    pub async fn set_volume(&self, volume: i32) {
        self.state.write().await.volume = volume;
        let _ = self.changes.send("mixer".to_string());
    }

    /// Start playing `index` as if another client did
    pub async fn play(&self, index: usize) {
        {
            let mut state = self.state.write().await;
            state.state = "play".to_string();
            state.song = Some(index);
            state.elapsed = 0.0;
        }
        let _ = self.changes.send("player".to_string());
    }

    /// Drop every open connection but keep listening
    pub fn drop_connections(&self) {
        let _ = self.kick.send(());
    }

    /// Stop the mock server and close its connections
    pub async fn stop(self) {
        let _ = self.kick.send(());
        self.handle.abort();
        let _ = self.handle.await;
    }
}

#[derive(Clone)]
struct Connection {
    state: Arc<RwLock<MockMpdState>>,
    log: Arc<RwLock<Vec<String>>>,
    changes: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
}

enum Next {
    Line(String),
    Closed,
}

async fn read_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Next {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => Next::Closed,
        Ok(_) => Next::Line(line.trim_end().to_string()),
    }
}

impl Connection {
    async fn serve(self, stream: TcpStream) {
        let mut kick = self.kick.subscribe();
        let mut changes = self.changes.subscribe();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let greeting = format!("OK MPD {}\n", self.state.read().await.version);
        if writer.write_all(greeting.as_bytes()).await.is_err() {
            return;
        }
        let mut authenticated = self.state.read().await.password.is_none();

        loop {
            let line = tokio::select! {
                _ = kick.recv() => return,
                next = read_line(&mut reader) => match next {
                    Next::Line(line) => line,
                    Next::Closed => return,
                },
            };
            self.log.write().await.push(line.clone());

            if line == "close" {
                return;
            }
            if line == "noidle" {
                // Outside idle MPD ignores it.
                continue;
            }

            if line.starts_with("idle") {
                if !self.state.read().await.supports_idle {
                    if !reply(&mut writer, "ACK [5@0] {idle} unknown command \"idle\"\n").await {
                        return;
                    }
                    continue;
                }
                let mut pending = Vec::new();
                while let Ok(subsystem) = changes.try_recv() {
                    pending.push(subsystem);
                }
                if pending.is_empty() {
                    let ignore_noidle = self.state.read().await.ignore_noidle;
                    loop {
                        tokio::select! {
                            _ = kick.recv() => return,
                            subsystem = changes.recv() => {
                                if let Ok(subsystem) = subsystem {
                                    pending.push(subsystem);
                                }
                                break;
                            }
                            next = read_line(&mut reader) => match next {
                                Next::Line(line) => {
                                    self.log.write().await.push(line.clone());
                                    if line != "noidle" {
                                        // Anything but noidle during idle is a protocol error.
                                        return;
                                    }
                                    if !ignore_noidle {
                                        break;
                                    }
                                }
                                Next::Closed => return,
                            },
                        }
                    }
                }
                pending.dedup();
                let mut response: String =
                    pending.iter().map(|s| format!("changed: {}\n", s)).collect();
                response.push_str("OK\n");
                if !reply(&mut writer, &response).await {
                    return;
                }
                continue;
            }

            let response = if !authenticated && !line.starts_with("password") {
                let name = line.split_whitespace().next().unwrap_or("");
                format!("ACK [4@0] {{{}}} you don't have permission for \"{}\"\n", name, name)
            } else if let Some(pw) = line.strip_prefix("password ") {
                let expected = self.state.read().await.password.clone();
                if expected.as_deref() == Some(pw.trim_matches('"')) {
                    authenticated = true;
                    "OK\n".to_string()
                } else {
                    "ACK [3@0] {password} incorrect password\n".to_string()
                }
            } else {
                self.process_command(&line).await
            };
            if !reply(&mut writer, &response).await {
                return;
            }
        }
    }

    async fn notify(&self, subsystem: &str) {
        let _ = self.changes.send(subsystem.to_string());
    }

    /// Process one non-idle command and return the full response
    async fn process_command(&self, line: &str) -> String {
        let mut parts = line.splitn(2, ' ');
        let name = parts.next().unwrap_or("");
        let args = parts.next().unwrap_or("").trim();

        match name {
            "commands" => {
                let state = self.state.read().await;
                let mut names = vec![
                    "close",
                    "commands",
                    "currentsong",
                    "list",
                    "pause",
                    "play",
                    "playlistinfo",
                    "setvol",
                    "stats",
                    "status",
                    "stop",
                    "tagtypes",
                ];
                if state.supports_idle {
                    names.push("idle");
                    names.push("noidle");
                }
                let mut out: String = names.iter().map(|c| format!("command: {}\n", c)).collect();
                out.push_str("OK\n");
                out
            }
            "tagtypes" => {
                let mut out = String::from(
                    "tagtype: Artist\ntagtype: AlbumArtist\ntagtype: Album\ntagtype: Title\n",
                );
                if self.state.read().await.musicbrainz_tags {
                    out.push_str("tagtype: MUSICBRAINZ_ALBUMID\ntagtype: MUSICBRAINZ_ARTISTID\n");
                }
                out.push_str("OK\n");
                out
            }
            "status" => {
                let state = self.state.read().await;
                let mut out = format!(
                    "volume: {}\nrepeat: 0\nrandom: 0\nsingle: 0\nconsume: 0\n\
                     playlist: {}\nplaylistlength: {}\nstate: {}\n",
                    state.volume,
                    state.playlist_version,
                    state.queue.len(),
                    state.state
                );
                if let Some(song) = state.song {
                    out.push_str(&format!(
                        "song: {}\nsongid: {}\ntime: {}:200\nelapsed: {:.3}\nduration: 200.000\n\
                         audio: 44100:16:2\nbitrate: 900\n",
                        song,
                        song + 1,
                        state.elapsed as u32,
                        state.elapsed
                    ));
                }
                out.push_str("OK\n");
                out
            }
            "currentsong" => {
                let state = self.state.read().await;
                match state.song.and_then(|i| state.queue.get(i).map(|t| (i, t))) {
                    Some((i, (file, artist, title))) => format!(
                        "file: {}\nArtist: {}\nTitle: {}\nTime: 200\nPos: {}\nId: {}\nOK\n",
                        file,
                        artist,
                        title,
                        i,
                        i + 1
                    ),
                    None => "OK\n".to_string(),
                }
            }
            "playlistinfo" => {
                let state = self.state.read().await;
                let mut out = String::new();
                for (i, (file, artist, title)) in state.queue.iter().enumerate() {
                    out.push_str(&format!(
                        "file: {}\nArtist: {}\nTitle: {}\nPos: {}\nId: {}\n",
                        file,
                        artist,
                        title,
                        i,
                        i + 1
                    ));
                }
                out.push_str("OK\n");
                out
            }
            "play" => {
                let index = if args.is_empty() {
                    Some(0)
                } else {
                    args.parse::<usize>().ok()
                };
                let mut state = self.state.write().await;
                match index {
                    Some(i) if i < state.queue.len() => {
                        state.state = "play".to_string();
                        state.song = Some(i);
                        state.elapsed = 0.0;
                        drop(state);
                        self.notify("player").await;
                        "OK\n".to_string()
                    }
                    _ => "ACK [5@0] {play} Bad song index\n".to_string(),
                }
            }
            "pause" => {
                let mut state = self.state.write().await;
                if state.song.is_some() {
                    state.state = if args == "0" { "play" } else { "pause" }.to_string();
                }
                drop(state);
                self.notify("player").await;
                "OK\n".to_string()
            }
            "stop" => {
                self.state.write().await.state = "stop".to_string();
                self.notify("player").await;
                "OK\n".to_string()
            }
            "setvol" => match args.parse::<i32>() {
                Ok(v) => {
                    self.state.write().await.volume = v;
                    self.notify("mixer").await;
                    "OK\n".to_string()
                }
                Err(_) => "ACK [2@0] {setvol} Integer expected\n".to_string(),
            },
            "stats" => "artists: 1\nalbums: 3\nsongs: 2\nuptime: 100\nplaytime: 10\n\
                        db_playtime: 400\ndb_update: 1700000000\nOK\n"
                .to_string(),
            "list" => {
                let state = self.state.read().await;
                let extended = args.contains("group") || args.starts_with("album artist ");
                if extended && state.mopidy {
                    return "ACK [2@0] {list} not able to parse args\n".to_string();
                }
                if args.starts_with("album") {
                    let grouped = args.contains("group");
                    let mut out = String::new();
                    for (album, mbid) in &state.albums {
                        out.push_str(&format!("Album: {}\n", album));
                        if grouped && !mbid.is_empty() {
                            out.push_str(&format!("MUSICBRAINZ_ALBUMID: {}\n", mbid));
                        }
                    }
                    out.push_str("OK\n");
                    out
                } else {
                    "Artist: ABBA\nOK\n".to_string()
                }
            }
            _ => format!("ACK [5@0] {{{}}} unknown command \"{}\"\n", name, name),
        }
    }
}

async fn reply(writer: &mut OwnedWriteHalf, response: &str) -> bool {
    writer.write_all(response.as_bytes()).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn mock_mpd_greets() {
        let server = MockMpdServer::start().await;

        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        let mut greeting = vec![0u8; 64];
        let n = stream.read(&mut greeting).await.unwrap();
        assert_eq!(&greeting[..n], b"OK MPD 0.23.5\n");

        server.stop().await;
    }
}
