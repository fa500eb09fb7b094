//! HLS output layout.
//!
//! Derives the on-disk locations for a session's playlist and segments.
//! Every join is safety-checked: session ids must match a strict charset
//! and segment references from playlists must not escape the session
//! directory.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::session::StreamProfile;

/// Playlist file name written by the transcoder.
pub const PLAYLIST_NAME: &str = "index.m3u8";
/// Init segment name for fMP4 output.
pub const INIT_SEGMENT_NAME: &str = "init.mp4";
/// Directory under the HLS root holding per-session output.
pub const SESSIONS_DIR: &str = "sessions";
/// Prefix of generated segment files (`seg_00001.ts` / `.m4s`).
pub const SEGMENT_PREFIX: &str = "seg_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("invalid session id")]
    InvalidSessionId,
    #[error("unsafe segment reference: {0}")]
    UnsafeSegmentName(String),
}

fn session_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[A-Za-z0-9_-]{1,64}$").expect("static regex"))
}

/// Whether `id` is safe to use in a filesystem path.
#[must_use]
pub fn valid_session_id(id: &str) -> bool {
    session_id_re().is_match(id)
}

/// Whether a playlist segment reference may be resolved inside a session
/// directory. Rejects absolute paths, parent traversal and separators.
#[must_use]
pub fn safe_segment_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.contains("..")
        && !name.contains('\\')
        && !name.contains('/')
}

/// Path derivation for HLS session output.
#[derive(Debug, Clone)]
pub struct HlsLayout {
    root: PathBuf,
}

impl HlsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The `sessions/` directory holding all per-session output.
    #[must_use]
    pub fn sessions_root(&self) -> PathBuf {
        self.root.join(SESSIONS_DIR)
    }

    /// Output directory owned by one session.
    pub fn session_dir(&self, session_id: &str) -> Result<PathBuf, LayoutError> {
        if !valid_session_id(session_id) {
            return Err(LayoutError::InvalidSessionId);
        }
        Ok(self.sessions_root().join(session_id))
    }

    /// The session's `index.m3u8`.
    pub fn playlist_path(&self, session_id: &str) -> Result<PathBuf, LayoutError> {
        Ok(self.session_dir(session_id)?.join(PLAYLIST_NAME))
    }

    /// The session's fMP4 init segment.
    pub fn init_segment_path(&self, session_id: &str) -> Result<PathBuf, LayoutError> {
        Ok(self.session_dir(session_id)?.join(INIT_SEGMENT_NAME))
    }

    /// `printf`-style segment pattern handed to the transcoder.
    pub fn segment_pattern(
        &self,
        session_id: &str,
        profile: &StreamProfile,
    ) -> Result<PathBuf, LayoutError> {
        let name = format!("{SEGMENT_PREFIX}%05d.{}", profile.segment_extension());
        Ok(self.session_dir(session_id)?.join(name))
    }

    /// Resolves a playlist segment reference inside the session directory,
    /// refusing anything that could escape it.
    pub fn resolve_segment(&self, session_id: &str, name: &str) -> Result<PathBuf, LayoutError> {
        if !safe_segment_name(name) {
            return Err(LayoutError::UnsafeSegmentName(name.to_string()));
        }
        Ok(self.session_dir(session_id)?.join(name))
    }
}

/// Whether a directory entry name looks like a segment file.
#[must_use]
pub fn is_segment_file(name: &str) -> bool {
    name.starts_with(SEGMENT_PREFIX) && (name.ends_with(".ts") || name.ends_with(".m4s"))
}

/// Scans a session directory for any produced segment file.
#[must_use]
pub fn any_segment_on_disk(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if let Some(name) = name.to_str() {
            if is_segment_file(name) {
                if let Ok(meta) = entry.metadata() {
                    if meta.len() > 0 {
                        return true;
                    }
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_safe_session_ids() {
        assert!(valid_session_id("abc"));
        assert!(valid_session_id("a1-B2_c3"));
        assert!(valid_session_id(&"x".repeat(64)));
    }

    #[test]
    fn rejects_unsafe_session_ids() {
        assert!(!valid_session_id(""));
        assert!(!valid_session_id("../etc"));
        assert!(!valid_session_id("a/b"));
        assert!(!valid_session_id("a b"));
        assert!(!valid_session_id(&"x".repeat(65)));
    }

    #[test]
    fn session_dir_rejects_bad_id() {
        let layout = HlsLayout::new("/srv/hls");
        assert_eq!(
            layout.session_dir("../oops"),
            Err(LayoutError::InvalidSessionId)
        );
    }

    #[test]
    fn derives_expected_paths() {
        let layout = HlsLayout::new("/srv/hls");
        assert_eq!(
            layout.playlist_path("s1").unwrap(),
            PathBuf::from("/srv/hls/sessions/s1/index.m3u8")
        );
        let pattern = layout
            .segment_pattern("s1", &StreamProfile::hd())
            .unwrap();
        assert_eq!(pattern, PathBuf::from("/srv/hls/sessions/s1/seg_%05d.ts"));
    }

    #[test]
    fn resolve_segment_refuses_traversal() {
        let layout = HlsLayout::new("/srv/hls");
        assert!(layout.resolve_segment("s1", "seg_00001.ts").is_ok());
        assert!(layout.resolve_segment("s1", "../../etc/passwd").is_err());
        assert!(layout.resolve_segment("s1", "/abs.ts").is_err());
        assert!(layout.resolve_segment("s1", "a/b.ts").is_err());
        assert!(layout.resolve_segment("s1", "").is_err());
    }

    #[test]
    fn segment_file_names() {
        assert!(is_segment_file("seg_00001.ts"));
        assert!(is_segment_file("seg_00042.m4s"));
        assert!(!is_segment_file("index.m3u8"));
        assert!(!is_segment_file("init.mp4"));
    }

    #[test]
    fn any_segment_on_disk_ignores_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!any_segment_on_disk(dir.path()));

        std::fs::write(dir.path().join("seg_00001.ts"), b"").unwrap();
        assert!(!any_segment_on_disk(dir.path()));

        std::fs::write(dir.path().join("seg_00002.ts"), b"data").unwrap();
        assert!(any_segment_on_disk(dir.path()));
    }
}
