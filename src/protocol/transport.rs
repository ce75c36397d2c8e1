//! TransportConnection: the TCP socket and its line framing.
//!
//! This is the only module that touches the socket. Any I/O failure closes the
//! transport before it is reported, so a caller never sees a half-open
//! connection. The read half can be lent out while the connection is parked in
//! `idle` (see [`read_idle_response`]).

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::capabilities::ServerCapabilities;
use super::commands;
use super::error::{MpdError, MpdResult, ServerError};
use super::types::ServerVersion;

const GREETING_PREFIX: &str = "OK MPD ";

/// Buffered read half of the socket.
pub type LineReader = BufReader<OwnedReadHalf>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTimeouts {
    pub connect: Duration,
    pub response: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            response: Duration::from_secs(5),
        }
    }
}

/// Terminal line of a response, if `line` is one.
enum Terminator {
    Ok,
    Ack(ServerError),
}

fn terminator(line: &str) -> Option<Terminator> {
    if line.starts_with("OK") {
        Some(Terminator::Ok)
    } else if line.starts_with("ACK") {
        Some(Terminator::Ack(ServerError::parse(line)))
    } else {
        None
    }
}

/// Read one line without its `\n` / `\r\n`. EOF is a connection error.
async fn next_line(reader: &mut LineReader) -> MpdResult<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(MpdError::Connection("connection closed by server".into()));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    debug!("<< {}", line);
    Ok(line)
}

async fn collect_response(reader: &mut LineReader) -> MpdResult<Vec<String>> {
    let mut body = Vec::new();
    loop {
        let line = next_line(reader).await?;
        match terminator(&line) {
            Some(Terminator::Ok) => return Ok(body),
            Some(Terminator::Ack(e)) => return Err(MpdError::Server(e)),
            None => body.push(line),
        }
    }
}

/// Wait for the answer to an `idle` on a lent-out reader.
///
/// Runs without a timeout: it completes when the server reports a change or
/// when `noidle` forces the response. The reader is handed back together with
/// the result so the owner can reattach it.
pub async fn read_idle_response(mut reader: LineReader) -> (LineReader, MpdResult<Vec<String>>) {
    let result = collect_response(&mut reader).await;
    (reader, result)
}

pub struct Transport {
    reader: Option<LineReader>,
    writer: Option<OwnedWriteHalf>,
    timeouts: TransportTimeouts,
    capabilities: ServerCapabilities,
    peer: String,
}

impl Transport {
    pub fn new(timeouts: TransportTimeouts) -> Self {
        Self {
            reader: None,
            writer: None,
            timeouts,
            capabilities: ServerCapabilities::default(),
            peer: String::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn version(&self) -> ServerVersion {
        self.capabilities.version
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    pub fn capabilities_mut(&mut self) -> &mut ServerCapabilities {
        &mut self.capabilities
    }

    /// Open the socket, read the greeting, authenticate and probe capabilities.
    ///
    /// An already open connection is closed first. A rejected password closes
    /// the socket and yields [`MpdError::Auth`].
    pub async fn connect(&mut self, host: &str, password: Option<&str>, port: u16) -> MpdResult<()> {
        self.close();
        if host.is_empty() {
            return Err(MpdError::NotConnected);
        }

        let addr = format!("{}:{}", host, port);
        let stream = timeout(self.timeouts.connect, TcpStream::connect(&addr))
            .await
            .map_err(|_| MpdError::Timeout("connect"))?
            .map_err(|e| MpdError::Connection(format!("connect to {} failed: {}", addr, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        self.reader = Some(BufReader::new(read_half));
        self.writer = Some(write_half);
        self.peer = addr;

        let greeting = self.read_line().await?;
        let Some(version) = greeting.strip_prefix(GREETING_PREFIX) else {
            self.close();
            return Err(MpdError::Connection(format!("unexpected greeting {:?}", greeting)));
        };
        let version = ServerVersion::parse(version);

        if let Some(pw) = password.filter(|p| !p.is_empty()) {
            match self.command(&commands::password(pw)).await {
                Ok(_) => {}
                Err(MpdError::Server(e)) => {
                    warn!("MPD at {} rejected the password: {}", self.peer, e.message);
                    self.close();
                    return Err(MpdError::Auth(e));
                }
                Err(e) => return Err(e),
            }
        }

        let command_list = self.listing(commands::COMMANDS, "command").await?;
        let tag_types = self.listing(commands::TAG_TYPES, "tagtype").await?;
        self.capabilities = ServerCapabilities::new(version, command_list, tag_types);

        info!("Connected to MPD {} at {}", version, self.peer);
        Ok(())
    }

    /// One-column listing used for capability probing. An ACK (for example a
    /// permission error) yields an empty list.
    async fn listing(&mut self, command: &str, key: &str) -> MpdResult<Vec<String>> {
        match self.command(command).await {
            Ok(lines) => Ok(super::parser::parse_values(&lines, key)),
            Err(MpdError::Server(e)) => {
                warn!("{} refused: {}", command, e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Write one command line.
    pub async fn send_line(&mut self, text: &str) -> MpdResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(MpdError::NotConnected);
        };
        debug!(">> {}", commands::redact(text));

        let mut buf = Vec::with_capacity(text.len() + 1);
        buf.extend_from_slice(text.as_bytes());
        buf.push(b'\n');

        let written = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            self.close();
            return Err(e.into());
        }
        Ok(())
    }

    /// Read one line within the response timeout.
    pub async fn read_line(&mut self) -> MpdResult<String> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(MpdError::NotConnected);
        };
        let result = match timeout(self.timeouts.response, next_line(reader)).await {
            Ok(r) => r,
            Err(_) => Err(MpdError::Timeout("response")),
        };
        if result.is_err() {
            self.close();
        }
        result
    }

    /// Read a full response up to `OK` or `ACK`. An ACK becomes
    /// [`MpdError::Server`] and leaves the connection open.
    pub async fn read_response(&mut self) -> MpdResult<Vec<String>> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(MpdError::NotConnected);
        };
        let result = match timeout(self.timeouts.response, collect_response(reader)).await {
            Ok(r) => r,
            Err(_) => Err(MpdError::Timeout("response")),
        };
        if let Err(e) = &result {
            if e.is_connection_loss() {
                self.close();
            }
        }
        result
    }

    /// Send a command and read its response.
    pub async fn command(&mut self, text: &str) -> MpdResult<Vec<String>> {
        self.send_line(text).await?;
        self.read_response().await
    }

    /// Lend the read half to an idle reader.
    pub fn take_reader(&mut self) -> Option<LineReader> {
        self.reader.take()
    }

    pub fn restore_reader(&mut self, reader: LineReader) {
        if self.writer.is_some() {
            self.reader = Some(reader);
        }
    }

    /// Say goodbye to the server, then close. Failures are ignored.
    pub async fn send_close(&mut self) {
        if self.reader.is_some() && self.send_line(commands::CLOSE).await.is_err() {
            debug!("close command not delivered");
        }
        self.close();
    }

    /// Drop both halves of the socket. Safe to call repeatedly.
    pub fn close(&mut self) {
        let was_open = self.writer.take().is_some();
        self.reader = None;
        if was_open {
            debug!("Closed connection to {}", self.peer);
        }
    }
}
