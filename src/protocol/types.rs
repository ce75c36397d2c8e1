//! Value records produced by the response parsers.
//!
//! Nothing outside `protocol::parser` constructs these from wire data; the rest
//! of the crate only passes them around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Default MPD TCP port
pub const DEFAULT_PORT: u16 = 6600;

/// Connection lifecycle as seen by collaborators.
///
/// `Idling` implies connected: the socket is open but parked in `idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Idling,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Idling)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Idling => "idling",
        };
        f.write_str(s)
    }
}

/// Protocol version announced in the greeting (`OK MPD 0.23.5`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    /// Parse `major.minor.patch`. Missing or non-numeric segments become 0.
    pub fn parse(text: &str) -> Self {
        let mut parts = text.trim().split('.').map(|p| p.trim().parse().unwrap_or(0));
        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            patch: parts.next().unwrap_or(0),
        }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Playing,
    Pausing,
    #[default]
    Stopped,
}

impl PlaybackState {
    /// Map the `state:` field of a status block.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "play" => Some(PlaybackState::Playing),
            "pause" => Some(PlaybackState::Pausing),
            "stop" => Some(PlaybackState::Stopped),
            _ => None,
        }
    }
}

/// Snapshot of the `status` command.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CurrentStatus {
    /// 0..=100; out-of-range server values are stored as 0
    pub volume: u8,
    pub repeat: bool,
    pub random: bool,
    pub single: bool,
    pub consume: bool,
    pub playlist_version: u32,
    pub playlist_length: u32,
    pub current_song_index: Option<u32>,
    pub next_song_index: Option<u32>,
    pub samplerate: u32,
    /// Kept as text: MPD reports `f` for floating point samples
    pub bit_depth: String,
    pub channel_count: u32,
    pub bitrate: u32,
    /// Seconds
    pub elapsed_time: u32,
    /// Seconds
    pub track_length: u32,
    /// 0 when no database update is running
    pub update_db_job: u32,
    pub playback_state: PlaybackState,
}

impl CurrentStatus {
    /// Copy of this status with the elapsed time advanced by `seconds`.
    pub fn interpolated(&self, seconds: u64) -> Self {
        let advanced = u64::from(self.elapsed_time).saturating_add(seconds);
        Self {
            elapsed_time: u32::try_from(advanced).unwrap_or(u32::MAX),
            ..self.clone()
        }
    }
}

/// A song in the database or the queue.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Track {
    pub path: String,
    pub title: String,
    /// Stream name (`Name:`), shown when a radio stream has no title
    pub name: String,
    pub artist: String,
    pub album: String,
    pub album_artist: String,
    pub date: String,
    pub artist_mbid: String,
    pub track_mbid: String,
    pub album_mbid: String,
    pub album_artist_mbid: String,
    /// Seconds
    pub length: u32,
    pub track_number: u32,
    /// 0 when the tag had no "of N" part
    pub album_track_count: u32,
    pub disc_number: u32,
    pub album_disc_count: u32,
    pub song_position: Option<u32>,
    pub song_id: Option<u32>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl Track {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Last path component.
    pub fn filename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Title, else stream name, else file name.
    pub fn visible_title(&self) -> &str {
        if !self.title.is_empty() {
            &self.title
        } else if !self.name.is_empty() {
            &self.name
        } else {
            self.filename()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Directory {
    pub path: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A stored playlist as listed by `lsinfo`/`listplaylists`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Playlist {
    pub path: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One entry of a file listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileEntry {
    Track(Track),
    Directory(Directory),
    Playlist(Playlist),
}

impl FileEntry {
    pub fn path(&self) -> &str {
        match self {
            FileEntry::Track(t) => &t.path,
            FileEntry::Directory(d) => &d.path,
            FileEntry::Playlist(p) => &p.path,
        }
    }

    pub fn as_track(&self) -> Option<&Track> {
        match self {
            FileEntry::Track(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_track(self) -> Option<Track> {
        match self {
            FileEntry::Track(t) => Some(t),
            _ => None,
        }
    }

    pub(crate) fn set_last_modified(&mut self, when: DateTime<Utc>) {
        let slot = match self {
            FileEntry::Track(t) => &mut t.last_modified,
            FileEntry::Directory(d) => &mut d.last_modified,
            FileEntry::Playlist(p) => &mut p.last_modified,
        };
        *slot = Some(when);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Album {
    pub name: String,
    pub mbid: String,
    pub artist_name: String,
    pub date: String,
}

impl Album {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl PartialOrd for Album {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Album {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .to_lowercase()
            .cmp(&other.name.to_lowercase())
            .then_with(|| self.mbid.cmp(&other.mbid))
            .then_with(|| self.artist_name.cmp(&other.artist_name))
            .then_with(|| self.date.cmp(&other.date))
            .then_with(|| self.name.cmp(&other.name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Artist {
    pub name: String,
    pub mbids: Vec<String>,
}

impl Artist {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mbids: Vec::new(),
        }
    }
}

impl PartialOrd for Artist {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Artist {
    /// Case-insensitive by name; entries with fewer MBIDs sort first so that
    /// the best-tagged duplicate ends up last.
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .to_lowercase()
            .cmp(&other.name.to_lowercase())
            .then_with(|| self.mbids.len().cmp(&other.mbids.len()))
            .then_with(|| self.mbids.cmp(&other.mbids))
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// `stats` output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub uptime: u64,
    pub playtime: u64,
    pub artists: u32,
    pub albums: u32,
    pub songs: u32,
    pub db_playtime: u64,
    /// Unix timestamp of the last database update
    pub db_update: i64,
}

/// An audio output from `outputs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub id: u32,
    pub name: String,
    pub enabled: bool,
}

/// Parsed result handed to a command callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum Response {
    /// Plain `OK` with no payload of interest
    Ok,
    Albums(Vec<Album>),
    Artists(Vec<Artist>),
    Entries(Vec<FileEntry>),
    Track(Option<Track>),
    Status(CurrentStatus),
    Statistics(Statistics),
    Outputs(Vec<Output>),
    /// Single-column listings such as `commands` or `tagtypes`
    Values(Vec<String>),
    /// Unparsed body lines
    Raw(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        assert_eq!(
            ServerVersion::parse("0.23.5"),
            ServerVersion { major: 0, minor: 23, patch: 5 }
        );
    }

    #[test]
    fn test_version_missing_segments_default_to_zero() {
        assert_eq!(
            ServerVersion::parse("0.21"),
            ServerVersion { major: 0, minor: 21, patch: 0 }
        );
        assert_eq!(
            ServerVersion::parse("1.x.beta"),
            ServerVersion { major: 1, minor: 0, patch: 0 }
        );
        assert_eq!(ServerVersion::parse(""), ServerVersion::default());
    }

    #[test]
    fn test_visible_title_fallbacks() {
        let mut track = Track::new("music/artist/song.flac");
        assert_eq!(track.visible_title(), "song.flac");
        track.name = "Radio One".into();
        assert_eq!(track.visible_title(), "Radio One");
        track.title = "Song".into();
        assert_eq!(track.visible_title(), "Song");
    }

    #[test]
    fn test_interpolated_advances_elapsed_only() {
        let status = CurrentStatus {
            elapsed_time: 10,
            track_length: 200,
            playback_state: PlaybackState::Playing,
            ..Default::default()
        };
        let next = status.interpolated(3);
        assert_eq!(next.elapsed_time, 13);
        assert_eq!(next.track_length, 200);
        assert_eq!(status.elapsed_time, 10);
    }

    #[test]
    fn test_artist_ordering_puts_most_mbids_last() {
        let mut artists = vec![
            Artist { name: "beta".into(), mbids: vec!["a".into(), "b".into()] },
            Artist::new("Alpha"),
            Artist { name: "Beta".into(), mbids: vec![] },
        ];
        artists.sort();
        assert_eq!(artists[0].name, "Alpha");
        assert!(artists[1].mbids.is_empty());
        assert_eq!(artists[2].mbids.len(), 2);
    }

    #[test]
    fn test_connection_state_is_connected() {
        assert!(ConnectionState::Idling.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
    }
}
