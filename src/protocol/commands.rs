//! Command-text builders.
//!
//! Arguments are always double-quoted so that names with spaces survive; an
//! embedded `"` or `\` is backslash-escaped.

pub const CLOSE: &str = "close";
pub const COMMANDS: &str = "commands";
pub const CURRENT_SONG: &str = "currentsong";
pub const IDLE: &str = "idle";
pub const LIST_ALL_INFO: &str = "listallinfo";
pub const NEXT: &str = "next";
pub const NOIDLE: &str = "noidle";
pub const OUTPUTS: &str = "outputs";
pub const PLAYLIST_INFO: &str = "playlistinfo";
pub const PREVIOUS: &str = "previous";
pub const STATS: &str = "stats";
pub const STATUS: &str = "status";
pub const STOP: &str = "stop";
pub const TAG_TYPES: &str = "tagtypes";

/// Quote one argument for the wire.
pub fn quote(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

pub fn password(pw: &str) -> String {
    format!("password {}", quote(pw))
}

/// Hide the password argument from log output.
pub fn redact(command: &str) -> &str {
    if command.starts_with("password ") {
        "password ***"
    } else {
        command
    }
}

/// `idle` for the given subsystems (all when empty).
pub fn idle(subsystems: &[String]) -> String {
    if subsystems.is_empty() {
        IDLE.to_string()
    } else {
        format!("{} {}", IDLE, subsystems.join(" "))
    }
}

pub fn pause(paused: bool) -> String {
    format!("pause {}", flag(paused))
}

pub fn play(index: Option<u32>) -> String {
    match index {
        Some(i) => format!("play {}", i),
        None => "play".to_string(),
    }
}

/// `setvol`, clamped to the valid range.
pub fn set_volume(volume: i32) -> String {
    format!("setvol {}", volume.clamp(0, 100))
}

pub fn seek_current(seconds: u32) -> String {
    format!("seekcur {}", seconds)
}

pub fn random(on: bool) -> String {
    format!("random {}", flag(on))
}

pub fn repeat(on: bool) -> String {
    format!("repeat {}", flag(on))
}

pub fn single(on: bool) -> String {
    format!("single {}", flag(on))
}

pub fn consume(on: bool) -> String {
    format!("consume {}", flag(on))
}

pub fn enable_output(id: u32) -> String {
    format!("enableoutput {}", id)
}

pub fn disable_output(id: u32) -> String {
    format!("disableoutput {}", id)
}

pub fn toggle_output(id: u32) -> String {
    format!("toggleoutput {}", id)
}

pub fn update(path: Option<&str>) -> String {
    match path {
        Some(p) => format!("update {}", quote(p)),
        None => "update".to_string(),
    }
}

/// `playlistinfo start:end`, or the whole queue without a window.
pub fn playlist_info(window: Option<(u32, u32)>) -> String {
    match window {
        Some((start, end)) => format!("{} {}:{}", PLAYLIST_INFO, start, end),
        None => PLAYLIST_INFO.to_string(),
    }
}

/// `list album`, optionally restricted to one artist.
///
/// `group` asks for album MBIDs alongside the names; servers older than 0.19
/// and Mopidy reject it. Without `filtering` the artist is passed the pre-0.19
/// way, as a bare argument.
pub fn list_albums(artist: Option<&str>, group: bool, filtering: bool) -> String {
    let mut cmd = String::from("list album");
    if let Some(artist) = artist {
        if filtering {
            cmd.push_str(" artist ");
        } else {
            cmd.push(' ');
        }
        cmd.push_str(&quote(artist));
    }
    if group {
        cmd.push_str(" group MUSICBRAINZ_ALBUMID");
    }
    cmd
}

/// `list artist` (or `albumartist`), optionally grouped by artist MBID.
pub fn list_artists(album_artists: bool, group: bool) -> String {
    let tag = if album_artists { "albumartist" } else { "artist" };
    if group {
        format!("list {} group MUSICBRAINZ_ARTISTID", tag)
    } else {
        format!("list {}", tag)
    }
}

pub fn find_album(album: &str) -> String {
    format!("find album {}", quote(album))
}
