//! Error taxonomy for the MPD client.
//!
//! Every failure that crosses a component boundary is one of these variants.
//! I/O failures never escape as raw `std::io::Error`; the transport maps them
//! to [`MpdError::Connection`] and closes itself first.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error code used when the `[code@index]` part of an ACK is not numeric.
pub const UNKNOWN_ERROR_CODE: i32 = -4711;

/// Structured form of an `ACK [<code>@<index>] {<command>} <message>` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub code: i32,
    pub command_index: i32,
    pub command: String,
    pub message: String,
}

impl ServerError {
    /// Parse an ACK line. Malformed pieces degrade to sentinel values instead
    /// of failing, so a garbled ACK still reaches the caller as a server error.
    pub fn parse(line: &str) -> Self {
        let code = between(line, '[', '@')
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(UNKNOWN_ERROR_CODE);
        let command_index = between(line, '@', ']')
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(-1);
        let command = between(line, '{', '}').unwrap_or_default().to_string();
        let message = match line.rfind('}') {
            Some(pos) => line[pos + 1..].trim_start().to_string(),
            None => line.trim_start_matches("ACK").trim().to_string(),
        };

        Self {
            code,
            command_index,
            command,
            message,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}@{}] {{{}}} {}",
            self.code, self.command_index, self.command, self.message
        )
    }
}

fn between(line: &str, open: char, close: char) -> Option<&str> {
    let start = line.find(open)? + open.len_utf8();
    let end = line.rfind(close)?;
    (start <= end).then(|| &line[start..end])
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MpdError {
    /// Socket or I/O failure; the transport has been closed.
    #[error("connection error: {0}")]
    Connection(String),
    /// The server answered with an ACK. The connection stays usable.
    #[error("server error: {0}")]
    Server(ServerError),
    /// The response did not match the expected grammar.
    #[error("parse error: {0}")]
    Parse(String),
    /// Password rejected during connect.
    #[error("authentication failed: {0}")]
    Auth(ServerError),
    #[error("not connected")]
    NotConnected,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// The client was shut down before the request completed.
    #[error("client shut down")]
    Shutdown,
}

impl MpdError {
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, MpdError::Connection(_) | MpdError::Timeout(_))
    }

    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            MpdError::Server(e) | MpdError::Auth(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MpdError {
    fn from(e: std::io::Error) -> Self {
        MpdError::Connection(e.to_string())
    }
}

pub type MpdResult<T> = Result<T, MpdError>;
