//! Response parsers: line streams to records.
//!
//! Every function takes the body of one response (the lines before the
//! terminating `OK`) and is stateless. Parsing is lenient: unknown keys are
//! skipped and malformed numbers leave the field at its default, so a slightly
//! odd server still yields a partial record instead of an error.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::error::MpdResult;
use super::types::{
    Album, Artist, CurrentStatus, Directory, FileEntry, Output, PlaybackState, Playlist, Response,
    Statistics, Track,
};

/// A parser turns a response body into a tagged [`Response`].
pub type Parser = fn(&[String]) -> MpdResult<Response>;

/// Split `key: value`. The space after the colon is optional so that an empty
/// value (`Album: ` with the trailing blank stripped by a proxy) still parses.
pub fn split_pair(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    Some((key, value.strip_prefix(' ').unwrap_or(value)))
}

/// Split `n/total` tags (`Track: 3/12`, `Disc: 1`). Missing or invalid parts
/// become 0.
pub fn split_count(value: &str) -> (u32, u32) {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let mut parts = compact.split('/');
    let number = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let count = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (number, count)
}

fn parse_seconds(value: &str) -> Option<u32> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v.round() as u32)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            debug!("Unparseable Last-Modified {:?}: {}", value, e);
            None
        }
    }
}

fn set_number(target: &mut u32, key: &str, value: &str) {
    match value.parse() {
        Ok(v) => *target = v,
        Err(_) => warn!("Ignoring non-numeric {}: {:?}", key, value),
    }
}

// =============================================================================
// Albums / artists
// =============================================================================

/// Album stream. A record starts at each `Album:` line and is flushed when the
/// next one arrives or the stream ends, so empty album names are kept.
pub fn parse_albums(lines: &[String]) -> Vec<Album> {
    let mut albums = Vec::new();
    let mut current: Option<Album> = None;

    for line in lines {
        let Some((key, value)) = split_pair(line) else {
            continue;
        };
        match key {
            "Album" => {
                if let Some(done) = current.replace(Album::new(value)) {
                    albums.push(done);
                }
            }
            "MUSICBRAINZ_ALBUMID" => {
                if let Some(album) = current.as_mut() {
                    album.mbid = value.to_string();
                }
            }
            "AlbumArtist" => {
                if let Some(album) = current.as_mut() {
                    album.artist_name = value.to_string();
                }
            }
            "Date" => {
                if let Some(album) = current.as_mut() {
                    album.date = value.to_string();
                }
            }
            _ => {}
        }
    }

    albums.extend(current);
    albums
}

/// Artist stream from `list artist`/`list albumartist`, optionally grouped by
/// `MUSICBRAINZ_ARTISTID`.
pub fn parse_artists(lines: &[String]) -> Vec<Artist> {
    let mut artists = Vec::new();
    let mut current: Option<Artist> = None;

    for line in lines {
        let Some((key, value)) = split_pair(line) else {
            continue;
        };
        match key {
            "Artist" | "AlbumArtist" | "ArtistSort" | "AlbumArtistSort" => {
                if let Some(done) = current.replace(Artist::new(value)) {
                    artists.push(done);
                }
            }
            "MUSICBRAINZ_ARTISTID" => {
                if let Some(artist) = current.as_mut() {
                    artist.mbids.push(value.to_string());
                }
            }
            _ => {}
        }
    }

    artists.extend(current);
    artists
}

/// Sort artists and drop same-name duplicates, keeping the entry with the most
/// MBIDs. Used when artists were listed grouped by MBID.
pub fn dedupe_artists(mut artists: Vec<Artist>) -> Vec<Artist> {
    artists.sort();
    let mut cleared: Vec<Artist> = Vec::with_capacity(artists.len());
    for artist in artists {
        if let Some(last) = cleared.last_mut() {
            if last.name == artist.name {
                *last = artist;
                continue;
            }
        }
        cleared.push(artist);
    }
    cleared
}

// =============================================================================
// Files and tracks
// =============================================================================

fn apply_track_field(track: &mut Track, key: &str, value: &str) {
    match key {
        "Title" => track.title = value.to_string(),
        "Name" => track.name = value.to_string(),
        "Artist" => track.artist = value.to_string(),
        "AlbumArtist" => track.album_artist = value.to_string(),
        "Album" => track.album = value.to_string(),
        "Date" => track.date = value.to_string(),
        "MUSICBRAINZ_ALBUMID" => track.album_mbid = value.to_string(),
        "MUSICBRAINZ_ARTISTID" => track.artist_mbid = value.to_string(),
        "MUSICBRAINZ_ALBUMARTISTID" => track.album_artist_mbid = value.to_string(),
        "MUSICBRAINZ_TRACKID" => track.track_mbid = value.to_string(),
        "Time" => set_number(&mut track.length, key, value),
        "duration" => {
            if let Some(secs) = parse_seconds(value) {
                track.length = secs;
            }
        }
        "Id" => track.song_id = value.parse().ok(),
        "Pos" => track.song_position = value.parse().ok(),
        "Track" => {
            let (number, count) = split_count(value);
            track.track_number = number;
            track.album_track_count = count;
        }
        "Disc" => {
            let (number, count) = split_count(value);
            track.disc_number = number;
            track.album_disc_count = count;
        }
        _ => {}
    }
}

/// File listing (`listallinfo`, `playlistinfo`, `lsinfo`, `find`, ...).
///
/// `file:`, `directory:` and `playlist:` lines each start a new entry; tag
/// lines populate the current track and are ignored before the first entry.
pub fn parse_file_entries(lines: &[String]) -> Vec<FileEntry> {
    let mut entries = Vec::new();
    let mut current: Option<FileEntry> = None;

    for line in lines {
        let Some((key, value)) = split_pair(line) else {
            continue;
        };
        let started = match key {
            "file" => Some(FileEntry::Track(Track::new(value))),
            "directory" => Some(FileEntry::Directory(Directory {
                path: value.to_string(),
                last_modified: None,
            })),
            "playlist" => Some(FileEntry::Playlist(Playlist {
                path: value.to_string(),
                last_modified: None,
            })),
            _ => None,
        };

        if let Some(entry) = started {
            if let Some(done) = current.replace(entry) {
                entries.push(done);
            }
            continue;
        }

        match (key, current.as_mut()) {
            ("Last-Modified", Some(entry)) => {
                if let Some(when) = parse_timestamp(value) {
                    entry.set_last_modified(when);
                }
            }
            (_, Some(FileEntry::Track(track))) => apply_track_field(track, key, value),
            _ => {}
        }
    }

    entries.extend(current);
    entries
}

/// Keep tracks whose artist or album artist equals `artist` (if non-empty)
/// and whose album MBID equals `album_mbid` (if non-empty). Directories and
/// playlists always pass.
pub fn filter_tracks(entries: Vec<FileEntry>, artist: &str, album_mbid: &str) -> Vec<FileEntry> {
    entries
        .into_iter()
        .filter(|entry| match entry {
            FileEntry::Track(t) => {
                (artist.is_empty() || t.artist == artist || t.album_artist == artist)
                    && (album_mbid.is_empty() || t.album_mbid == album_mbid)
            }
            _ => true,
        })
        .collect()
}

/// `currentsong`: the single track, if one is loaded.
pub fn parse_current_song(lines: &[String]) -> Option<Track> {
    let mut entries = parse_file_entries(lines);
    if entries.len() != 1 {
        return None;
    }
    entries.pop().and_then(FileEntry::into_track)
}

// =============================================================================
// Status
// =============================================================================

/// `status` block.
pub fn parse_status(lines: &[String]) -> CurrentStatus {
    let mut status = CurrentStatus::default();

    for line in lines {
        let Some((key, value)) = split_pair(line) else {
            continue;
        };
        match key {
            "volume" => {
                status.volume = value
                    .parse::<i64>()
                    .ok()
                    .and_then(|v| u8::try_from(v).ok())
                    .filter(|v| *v <= 100)
                    .unwrap_or(0);
            }
            "repeat" => status.repeat = value == "1",
            "random" => status.random = value == "1",
            "single" => status.single = value == "1",
            "consume" => status.consume = value == "1",
            "playlist" => set_number(&mut status.playlist_version, key, value),
            "playlistlength" => set_number(&mut status.playlist_length, key, value),
            "song" => status.current_song_index = value.parse().ok(),
            "nextsong" => status.next_song_index = value.parse().ok(),
            "state" => match PlaybackState::from_wire(value) {
                Some(state) => status.playback_state = state,
                None => warn!("Unknown playback state {:?}", value),
            },
            "time" => {
                if let Some((elapsed, total)) = value.split_once(':') {
                    if let (Ok(elapsed), Ok(total)) = (elapsed.parse(), total.parse()) {
                        status.elapsed_time = elapsed;
                        status.track_length = total;
                    }
                }
            }
            "elapsed" => {
                if let Some(secs) = parse_seconds(value) {
                    status.elapsed_time = secs;
                }
            }
            "duration" => {
                if let Some(secs) = parse_seconds(value) {
                    status.track_length = secs;
                }
            }
            "bitrate" => set_number(&mut status.bitrate, key, value),
            "audio" => {
                let parts: Vec<&str> = value.split(':').collect();
                if let [rate, bits, channels] = parts.as_slice() {
                    set_number(&mut status.samplerate, "samplerate", rate);
                    status.bit_depth = bits.to_string();
                    set_number(&mut status.channel_count, "channels", channels);
                } else {
                    warn!("Malformed audio format {:?}", value);
                }
            }
            "updating_db" => set_number(&mut status.update_db_job, key, value),
            _ => {}
        }
    }

    status
}

// =============================================================================
// Misc listings
// =============================================================================

pub fn parse_statistics(lines: &[String]) -> Statistics {
    let mut stats = Statistics::default();
    for line in lines {
        let Some((key, value)) = split_pair(line) else {
            continue;
        };
        match key {
            "uptime" => stats.uptime = value.parse().unwrap_or(0),
            "playtime" => stats.playtime = value.parse().unwrap_or(0),
            "artists" => stats.artists = value.parse().unwrap_or(0),
            "albums" => stats.albums = value.parse().unwrap_or(0),
            "songs" => stats.songs = value.parse().unwrap_or(0),
            "db_playtime" => stats.db_playtime = value.parse().unwrap_or(0),
            "db_update" => stats.db_update = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    stats
}

pub fn parse_outputs(lines: &[String]) -> Vec<Output> {
    let mut outputs = Vec::new();
    let mut current: Option<Output> = None;

    for line in lines {
        let Some((key, value)) = split_pair(line) else {
            continue;
        };
        match key {
            "outputid" => {
                let id = value.parse().unwrap_or(0);
                if let Some(done) = current.replace(Output {
                    id,
                    name: String::new(),
                    enabled: false,
                }) {
                    outputs.push(done);
                }
            }
            "outputname" => {
                if let Some(output) = current.as_mut() {
                    output.name = value.to_string();
                }
            }
            "outputenabled" => {
                if let Some(output) = current.as_mut() {
                    output.enabled = value == "1";
                }
            }
            _ => {}
        }
    }

    outputs.extend(current);
    outputs
}

/// Values of every line with the given key (`command`, `tagtype`, `changed`).
pub fn parse_values(lines: &[String], wanted: &str) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| split_pair(line))
        .filter(|(key, _)| *key == wanted)
        .map(|(_, value)| value.to_string())
        .collect()
}

/// Subsystems named by `changed:` lines of an idle response.
pub fn parse_changed(lines: &[String]) -> Vec<String> {
    parse_values(lines, "changed")
}

// =============================================================================
// Parser functions for `submit`
// =============================================================================

pub fn ok_parser(_lines: &[String]) -> MpdResult<Response> {
    Ok(Response::Ok)
}

pub fn raw_parser(lines: &[String]) -> MpdResult<Response> {
    Ok(Response::Raw(lines.to_vec()))
}

pub fn albums_parser(lines: &[String]) -> MpdResult<Response> {
    Ok(Response::Albums(parse_albums(lines)))
}

pub fn artists_parser(lines: &[String]) -> MpdResult<Response> {
    Ok(Response::Artists(parse_artists(lines)))
}

pub fn entries_parser(lines: &[String]) -> MpdResult<Response> {
    Ok(Response::Entries(parse_file_entries(lines)))
}

pub fn current_song_parser(lines: &[String]) -> MpdResult<Response> {
    Ok(Response::Track(parse_current_song(lines)))
}

pub fn status_parser(lines: &[String]) -> MpdResult<Response> {
    Ok(Response::Status(parse_status(lines)))
}

pub fn statistics_parser(lines: &[String]) -> MpdResult<Response> {
    Ok(Response::Statistics(parse_statistics(lines)))
}

pub fn outputs_parser(lines: &[String]) -> MpdResult<Response> {
    Ok(Response::Outputs(parse_outputs(lines)))
}

pub fn commands_parser(lines: &[String]) -> MpdResult<Response> {
    Ok(Response::Values(parse_values(lines, "command")))
}

pub fn tagtypes_parser(lines: &[String]) -> MpdResult<Response> {
    Ok(Response::Values(parse_values(lines, "tagtype")))
}
