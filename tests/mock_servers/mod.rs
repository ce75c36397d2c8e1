//! Mock servers for client integration testing
//!
//! A scripted MPD that lets the full client stack run without a real daemon.

pub mod mpd;

pub use mpd::{MockMpdServer, MockMpdState};
