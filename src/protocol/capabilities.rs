//! What the connected server can do, derived from its version and from the
//! `commands` and `tagtypes` listings.

use serde::Serialize;

use super::types::ServerVersion;

/// ACK text Mopidy answers with when it cannot handle `group`/filter clauses.
pub const MOPIDY_PARSE_ERROR: &str = "not able to parse args";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerCapabilities {
    pub version: ServerVersion,
    pub has_idle: bool,
    pub has_ranged_current_playlist: bool,
    pub has_search_add: bool,
    pub has_list_group: bool,
    pub has_list_filtering: bool,
    pub has_musicbrainz_tags: bool,
    pub has_tag_albumartist: bool,
    pub has_current_playlist_remove_range: bool,
    pub mopidy_detected: bool,
    pub commands: Vec<String>,
    pub tag_types: Vec<String>,
}

impl ServerCapabilities {
    pub fn new(version: ServerVersion, commands: Vec<String>, tag_types: Vec<String>) -> Self {
        let modern = version.major > 0;
        let has_command = |name: &str| commands.iter().any(|c| c == name);

        Self {
            version,
            has_idle: has_command("idle"),
            has_ranged_current_playlist: modern || version.minor > 14,
            has_search_add: has_command("searchadd"),
            has_list_group: modern || version.minor >= 19,
            has_list_filtering: modern || version.minor >= 19,
            has_musicbrainz_tags: tag_types.iter().any(|t| t.contains("MUSICBRAINZ")),
            has_tag_albumartist: tag_types.iter().any(|t| t.eq_ignore_ascii_case("albumartist")),
            has_current_playlist_remove_range: modern || version.minor >= 16,
            mopidy_detected: false,
            commands,
            tag_types,
        }
    }

    /// Inspect an ACK message; Mopidy's arg-parsing complaint disables the
    /// `list` extensions it does not understand. Returns true on first detection.
    pub fn observe_error(&mut self, message: &str) -> bool {
        if self.mopidy_detected || !message.contains(MOPIDY_PARSE_ERROR) {
            return false;
        }
        self.mopidy_detected = true;
        self.has_list_group = false;
        self.has_list_filtering = false;
        true
    }
}
