//! mpd-link: an async client for the Music Player Daemon.
//!
//! This library provides:
//! - A line-oriented transport with the connect/password/probe handshake
//! - Parsers for status, songs, albums, artists, outputs and statistics
//! - A single-worker command dispatcher that parks the connection in `idle`
//! - An idle monitor that keeps listeners current between server events
//! - A reconnect supervisor with short/long backoff

pub mod bus;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod monitor;
pub mod protocol;
pub mod reconnect;

pub use bus::{ClientEvent, ConnectionListener, DisconnectReason, StatusListener};
pub use client::{ClientConfig, MpdClient};
pub use dispatcher::{ConnectTarget, Dispatcher, DispatcherConfig, IdleStats};
pub use protocol::{MpdError, MpdResult};
