//! mpd-link monitor
//!
//! Connects to the configured MPD server and reports playback changes until
//! interrupted. With `--json` every client event is printed as one JSON line.

use mpd_link::bus::{ClientEvent, ConnectionListener, DisconnectReason, StatusListener};
use mpd_link::protocol::{CurrentStatus, ServerVersion, Track};
use mpd_link::{config, MpdClient};

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Logs what a listener would show on screen.
struct ConsoleReporter;

impl StatusListener for ConsoleReporter {
    fn on_new_status(&self, status: &CurrentStatus, authoritative: bool) {
        if authoritative {
            tracing::info!(
                "{:?} {}/{}s vol {} ({} queued)",
                status.playback_state,
                status.elapsed_time,
                status.track_length,
                status.volume,
                status.playlist_length
            );
        } else {
            tracing::debug!("{}/{}s", status.elapsed_time, status.track_length);
        }
    }

    fn on_new_track(&self, track: &Track) {
        if track.path.is_empty() {
            return;
        }
        tracing::info!("Now playing: {} - {}", track.artist, track.visible_title());
    }
}

impl ConnectionListener for ConsoleReporter {
    fn on_connected(&self, version: ServerVersion) {
        tracing::info!("Connected to MPD {}", version);
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        tracing::warn!("Disconnected: {:?}", reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mpd_link=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(
        "Starting mpd-link v{} ({})",
        env!("MPDL_VERSION"),
        env!("MPDL_GIT_SHA")
    );

    let json = std::env::args().skip(1).any(|arg| arg == "--json");

    let config = config::load_config()?;
    let target = config.target();
    tracing::info!("Configuration loaded, server: {}", target);

    let client = MpdClient::new(config.client_config());
    let events = client.bus().subscribe();

    if !json {
        let reporter = Arc::new(ConsoleReporter);
        client.register_status_listener(reporter.clone());
        client.register_connection_listener(reporter);
    }

    // A failed first attempt is left to the reconnect supervisor.
    if let Err(e) = client.connect_to(target).await {
        tracing::warn!("Initial connect failed: {}", e);
    }

    tokio::select! {
        result = print_events(events), if json => result?,
        _ = shutdown_signal() => {}
    }

    tracing::info!("Disconnecting...");
    client.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Print each bus event as a JSON line until the bus closes.
async fn print_events(mut events: broadcast::Receiver<ClientEvent>) -> Result<()> {
    loop {
        match events.recv().await {
            Ok(event) => println!("{}", serde_json::to_string(&event)?),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Output lagged, skipped {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
