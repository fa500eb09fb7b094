//! Upstream-corruption policy and repair profiles.
//!
//! The signature list is deliberately small and encoder-specific; it is a
//! policy table, not a grep of everything ffmpeg can print. Broadening it
//! risks classifying legitimate exits as corruption, so changes here need
//! matching tests.

use crate::reason::ReasonCode;
use crate::session::StreamProfile;

/// Stderr fragments that, with zero produced segments, indicate a corrupt
/// upstream elementary stream rather than a packaging failure.
pub const CORRUPTION_SIGNATURES: [&str; 6] = [
    "decode_slice_header error",
    "no frame!",
    "non-existing PPS",
    "non-existing SPS",
    "mmco: unref short failure",
    "number of reference frames",
];

/// Whether any line carries a corruption signature.
#[must_use]
pub fn contains_corruption_signature(lines: &[String]) -> bool {
    lines
        .iter()
        .any(|line| CORRUPTION_SIGNATURES.iter().any(|sig| line.contains(sig)))
}

/// Classifies a readiness timeout: corruption signatures with no segment on
/// disk mean the upstream is corrupt; everything else is the packager's
/// failure to produce a valid playlist.
#[must_use]
pub fn classify_stall(lines: &[String], any_segment: bool) -> ReasonCode {
    if !any_segment && contains_corruption_signature(lines) {
        ReasonCode::UpstreamCorrupt
    } else {
        ReasonCode::PackagerFailed
    }
}

/// Fallback ladder for one corrupt session.
///
/// A profile that was already passing video through gets the copy/AAC
/// variant directly; a transcoding profile first tries copy/AAC, then a
/// forced full transcode with deinterlacing off. Execution takes at most
/// one rung (a single repair attempt per session).
#[must_use]
pub fn repair_ladder(original: &StreamProfile) -> Vec<StreamProfile> {
    let copy_aac = StreamProfile {
        name: "copy".to_string(),
        transcode_video: false,
        transcode_audio: true,
        audio_bitrate_k: 192,
        deinterlace: false,
        ..original.clone()
    };

    if !original.transcode_video {
        return vec![copy_aac];
    }

    let full = StreamProfile {
        video_codec: "h264".to_string(),
        transcode_video: true,
        transcode_audio: true,
        audio_bitrate_k: 192,
        deinterlace: false,
        crf: 24,
        ..original.clone()
    };
    vec![copy_aac, full]
}

/// The profile used for the single repair attempt.
#[must_use]
pub fn repair_profile(original: &StreamProfile) -> StreamProfile {
    repair_ladder(original)
        .into_iter()
        .next()
        .unwrap_or_else(|| original.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn recognizes_each_signature() {
        for sig in CORRUPTION_SIGNATURES {
            let log = lines(&["[h264 @ 0x55] something", sig]);
            assert!(contains_corruption_signature(&log), "missed {sig}");
        }
    }

    #[test]
    fn clean_logs_are_not_corrupt() {
        let log = lines(&[
            "frame= 120 fps= 25 q=28.0",
            "Opening 'seg_00001.ts' for writing",
        ]);
        assert!(!contains_corruption_signature(&log));
    }

    #[test]
    fn corruption_requires_zero_segments() {
        let log = lines(&["non-existing PPS 0 referenced"]);
        assert_eq!(classify_stall(&log, false), ReasonCode::UpstreamCorrupt);
        // A produced segment means the input decodes; the stall is packaging.
        assert_eq!(classify_stall(&log, true), ReasonCode::PackagerFailed);
    }

    #[test]
    fn stall_without_signatures_is_packager_failure() {
        let log = lines(&["speed=0.99x"]);
        assert_eq!(classify_stall(&log, false), ReasonCode::PackagerFailed);
    }

    #[test]
    fn transcoding_profile_repairs_to_copy_first() {
        let original = StreamProfile::hd();
        assert!(original.transcode_video);
        let repair = repair_profile(&original);
        assert_eq!(repair.name, "copy");
        assert!(!repair.transcode_video);
        assert!(repair.transcode_audio);
        assert_eq!(repair.audio_bitrate_k, 192);
        // Packaging parameters are preserved.
        assert_eq!(repair.container, original.container);
        assert_eq!(repair.segment_duration_secs, original.segment_duration_secs);
    }

    #[test]
    fn ladder_for_transcoding_profile_ends_in_full_transcode() {
        let ladder = repair_ladder(&StreamProfile::hd());
        assert_eq!(ladder.len(), 2);
        let full = &ladder[1];
        assert!(full.transcode_video);
        assert_eq!(full.crf, 24);
        assert!(!full.deinterlace);
        assert_eq!(full.audio_bitrate_k, 192);
    }

    #[test]
    fn copy_profile_has_single_rung() {
        let ladder = repair_ladder(&StreamProfile::copy());
        assert_eq!(ladder.len(), 1);
        assert!(!ladder[0].transcode_video);
        assert_eq!(ladder[0].audio_bitrate_k, 192);
    }
}
