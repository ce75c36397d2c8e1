//! Configuration management

use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::client::ClientConfig;
use crate::dispatcher::{ConnectTarget, DispatcherConfig};
use crate::monitor::MonitorConfig;
use crate::protocol::{TransportTimeouts, DEFAULT_PORT};
use crate::reconnect::ReconnectConfig;

const DEFAULT_HOST: &str = "localhost";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mpd: MpdConfig,

    #[serde(default)]
    pub profiles: Vec<ServerProfile>,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub reconnect: ReconnectSettings,

    /// Subsystems to wait for in `idle`; empty means all
    #[serde(default)]
    pub idle_subsystems: Vec<String>,
}

/// Direct connection settings. When `host` is unset the active profile is used.
#[derive(Debug, Deserialize)]
pub struct MpdConfig {
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    pub password: Option<String>,
}

impl Default for MpdConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            password: None,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// A saved server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerProfile {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub password: Option<String>,
    #[serde(default)]
    pub autoconnect: bool,
}

impl ServerProfile {
    pub fn target(&self) -> ConnectTarget {
        ConnectTarget::new(self.host.clone(), self.port, self.password.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub response_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub noidle_timeout_ms: u64,
    pub idle_delay_ms: u64,
    pub resync_interval_ms: u64,
    pub interpolate_interval_ms: u64,
}

impl TimingConfig {
    /// The monitor timers need a non-zero period.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("timing.resync_interval_ms", self.resync_interval_ms),
            ("timing.interpolate_interval_ms", self.interpolate_interval_ms),
        ] {
            if value == 0 {
                bail!("{} must be greater than 0", key);
            }
        }
        Ok(())
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            noidle_timeout_ms: 5_000,
            idle_delay_ms: 500,
            resync_interval_ms: 30_000,
            interpolate_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub enabled: bool,
    pub short_delay_ms: u64,
    pub long_delay_ms: u64,
    pub short_tries: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            short_delay_ms: 10_000,
            long_delay_ms: 60_000,
            short_tries: 5,
        }
    }
}

impl Config {
    /// Profile marked `autoconnect`, else the first one.
    pub fn active_profile(&self) -> Option<&ServerProfile> {
        self.profiles
            .iter()
            .find(|p| p.autoconnect)
            .or_else(|| self.profiles.first())
    }

    /// Where to connect: explicit `mpd.host`, else the active profile, else
    /// localhost.
    pub fn target(&self) -> ConnectTarget {
        if let Some(host) = self.mpd.host.as_ref().filter(|h| !h.is_empty()) {
            return ConnectTarget::new(host.clone(), self.mpd.port, self.mpd.password.clone());
        }
        match self.active_profile() {
            Some(profile) => profile.target(),
            None => ConnectTarget::new(DEFAULT_HOST, self.mpd.port, self.mpd.password.clone()),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let t = &self.timing;
        ClientConfig {
            dispatcher: DispatcherConfig {
                timeouts: TransportTimeouts {
                    connect: Duration::from_millis(t.connect_timeout_ms),
                    response: Duration::from_millis(t.response_timeout_ms),
                },
                noidle_timeout: Duration::from_millis(t.noidle_timeout_ms),
                idle_delay: Duration::from_millis(t.idle_delay_ms),
                idle_subsystems: self.idle_subsystems.clone(),
                ..DispatcherConfig::default()
            },
            monitor: MonitorConfig {
                resync_interval: Duration::from_millis(t.resync_interval_ms),
                interpolate_interval: Duration::from_millis(t.interpolate_interval_ms),
            },
            reconnect: ReconnectConfig {
                enabled: self.reconnect.enabled,
                short_delay: Duration::from_millis(self.reconnect.short_delay_ms),
                long_delay: Duration::from_millis(self.reconnect.long_delay_ms),
                short_tries: self.reconnect.short_tries,
            },
        }
    }
}

/// Get config directory (MPDL_CONFIG_DIR, XDG_CONFIG_HOME or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MPDL_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/mpd-link");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("mpd-link");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config/mpd-link");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("mpd-link");
        }
    }

    PathBuf::from(".")
}

/// Split the conventional `MPD_HOST` form `password@host`.
pub fn split_mpd_host(value: &str) -> (Option<&str>, &str) {
    match value.rsplit_once('@') {
        Some((password, host)) if !host.is_empty() => (Some(password), host),
        _ => (None, value),
    }
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("mpd.port", DEFAULT_PORT as i64)?
        // Load from config file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // Override with environment variables (MPDL_MPD__HOST, MPDL_TIMING__IDLE_DELAY_MS, ...)
        .add_source(
            ::config::Environment::with_prefix("MPDL")
                .separator("__")
                .try_parsing(true),
        );

    // The variables every MPD client understands
    if let Ok(value) = std::env::var("MPD_HOST") {
        let (password, host) = split_mpd_host(&value);
        builder = builder.set_override("mpd.host", host)?;
        if let Some(password) = password {
            builder = builder.set_override("mpd.password", password)?;
        }
    }
    if let Ok(port) = std::env::var("MPD_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("mpd.port", port_num as i64)?;
        }
    }
    if let Ok(password) = std::env::var("MPD_PASSWORD") {
        builder = builder.set_override("mpd.password", password)?;
    }

    let config: Config = builder.build()?.try_deserialize()?;
    config.timing.validate()?;
    Ok(config)
}
