use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Video codec families the server can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFamily {
    H264,
    Hevc,
    Av1,
    Vp9,
}

impl CodecFamily {
    /// Negotiation priority, most efficient codec first.
    pub const PRIORITY: [CodecFamily; 4] = [
        CodecFamily::Av1,
        CodecFamily::Hevc,
        CodecFamily::Vp9,
        CodecFamily::H264,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Av1 => "av1",
            Self::Vp9 => "vp9",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match normalize_video_codec(s).as_str() {
            "h264" => Some(Self::H264),
            "hevc" => Some(Self::Hevc),
            "av1" => Some(Self::Av1),
            "vp9" => Some(Self::Vp9),
            _ => None,
        }
    }
}

impl fmt::Display for CodecFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collapse ffprobe / container codec aliases onto canonical names.
pub fn normalize_video_codec(codec: &str) -> String {
    let lower = codec.trim().to_ascii_lowercase();
    match lower.as_str() {
        "avc" | "avc1" | "h264" | "h.264" => "h264".to_string(),
        "hev1" | "hvc1" | "h265" | "h.265" | "hevc" => "hevc".to_string(),
        "av01" | "av1" => "av1".to_string(),
        "vp09" | "vp9" => "vp9".to_string(),
        _ => lower,
    }
}

pub fn normalize_audio_codec(codec: &str) -> String {
    let lower = codec.trim().to_ascii_lowercase();
    match lower.as_str() {
        "mp4a" | "aac-lc" | "aac_latm" | "aac" => "aac".to_string(),
        "flac" => "flac".to_string(),
        "ac-3" | "ac3" => "ac3".to_string(),
        "ec-3" | "eac3" | "e-ac3" => "eac3".to_string(),
        "mp3" | "mp3float" => "mp3".to_string(),
        _ => lower,
    }
}

/// Container token for a file: extension first, format tag as a fallback.
/// ffprobe reports families like "mov,mp4,m4a,3gp,3g2,mj2" and
/// "matroska,webm", so the extension is the more precise signal.
pub fn container_token(path: &Path, format_name: &str) -> String {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        return ext.to_ascii_lowercase();
    }

    let first = format_name.split(',').next().unwrap_or(format_name);
    match first {
        "mov" => "mp4".to_string(),
        "matroska" => "mkv".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

/// Codec support a browser declares through query parameters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BrowserCodecs {
    #[serde(default)]
    pub h264: bool,
    #[serde(default)]
    pub hevc: bool,
    #[serde(default)]
    pub av1: bool,
    #[serde(default)]
    pub vp9: bool,
    #[serde(default)]
    pub aac: bool,
    #[serde(default)]
    pub opus: bool,
    #[serde(default)]
    pub flac: bool,
    #[serde(default)]
    pub ac3: bool,
}

impl BrowserCodecs {
    /// A conservative baseline every mainstream browser satisfies.
    pub fn baseline() -> Self {
        Self {
            h264: true,
            aac: true,
            ..Default::default()
        }
    }

    pub fn supports_video(&self, family: CodecFamily) -> bool {
        match family {
            CodecFamily::H264 => self.h264,
            CodecFamily::Hevc => self.hevc,
            CodecFamily::Av1 => self.av1,
            CodecFamily::Vp9 => self.vp9,
        }
    }

    pub fn supports_audio(&self, codec: &str) -> bool {
        match normalize_audio_codec(codec).as_str() {
            "aac" => self.aac,
            "opus" => self.opus,
            "flac" => self.flac,
            "ac3" => self.ac3,
            _ => false,
        }
    }
}

/// Containers browsers can progressive-play natively. mkv/avi are never
/// direct-playable even when the codecs inside are.
pub fn browser_native_container(container: &str) -> bool {
    matches!(container, "mp4" | "m4v" | "webm")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_normalize_video_aliases() {
        assert_eq!(normalize_video_codec("avc1"), "h264");
        assert_eq!(normalize_video_codec("AVC"), "h264");
        assert_eq!(normalize_video_codec("hvc1"), "hevc");
        assert_eq!(normalize_video_codec("hev1"), "hevc");
        assert_eq!(normalize_video_codec("h265"), "hevc");
        assert_eq!(normalize_video_codec("av01"), "av1");
        assert_eq!(normalize_video_codec("vp09"), "vp9");
        assert_eq!(normalize_video_codec("mpeg2video"), "mpeg2video");
    }

    #[test]
    fn test_normalize_audio_aliases() {
        assert_eq!(normalize_audio_codec("mp4a"), "aac");
        assert_eq!(normalize_audio_codec("ac-3"), "ac3");
        assert_eq!(normalize_audio_codec("eac3"), "eac3");
        assert_eq!(normalize_audio_codec("opus"), "opus");
    }

    #[test]
    fn test_container_token_prefers_extension() {
        let path = PathBuf::from("/media/show.mkv");
        assert_eq!(container_token(&path, "matroska,webm"), "mkv");
    }

    #[test]
    fn test_container_token_from_format_tag() {
        let path = PathBuf::from("/media/noext");
        assert_eq!(container_token(&path, "mov,mp4,m4a,3gp,3g2,mj2"), "mp4");
        assert_eq!(container_token(&path, "matroska,webm"), "mkv");
    }

    #[test]
    fn test_browser_codec_lookup() {
        let b = BrowserCodecs {
            h264: true,
            aac: true,
            ..Default::default()
        };
        assert!(b.supports_video(CodecFamily::H264));
        assert!(!b.supports_video(CodecFamily::Av1));
        assert!(b.supports_audio("mp4a"));
        assert!(!b.supports_audio("flac"));
        assert!(!b.supports_audio("dts"));
    }

    #[test]
    fn test_native_containers() {
        assert!(browser_native_container("mp4"));
        assert!(browser_native_container("webm"));
        assert!(!browser_native_container("mkv"));
        assert!(!browser_native_container("avi"));
    }
}
