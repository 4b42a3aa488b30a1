use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::ProbeError;
use crate::media::codecs::{container_token, normalize_audio_codec, normalize_video_codec};

/// Media properties extracted from a file. Immutable once built; safe to
/// cache per (path, mtime).
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub path: PathBuf,
    pub container: String,
    pub duration: f64,
    pub size: u64,
    /// Overall bitrate in bits per second, estimated from size/duration when
    /// the container does not report one.
    pub bitrate: u64,
    pub video_codec: String,
    pub pixel_format: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    /// Audio streams in audio-only order, indexed from zero.
    pub audio_tracks: Vec<AudioTrack>,
    pub chapters: Vec<Chapter>,
}

#[derive(Debug, Clone)]
pub struct AudioTrack {
    pub index: usize,
    pub codec: String,
    pub channels: u32,
    pub language: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Chapter {
    pub title: Option<String>,
    pub start: f64,
    pub end: f64,
}

impl MediaInfo {
    /// The default audio track (first in audio-only order).
    pub fn default_audio(&self) -> Option<&AudioTrack> {
        self.audio_tracks.first()
    }

    /// Whether the video stream uses a 10-bit pixel format.
    pub fn is_10bit(&self) -> bool {
        self.pixel_format
            .as_deref()
            .map(|p| p.contains("10le") || p.contains("10be") || p.contains("p010"))
            .unwrap_or(false)
    }

    /// Extract media properties using ffprobe.
    pub async fn probe(ffprobe_path: &Path, path: &Path) -> Result<Self, ProbeError> {
        if !path.exists() {
            return Err(ProbeError::NotFound(path.to_path_buf()));
        }

        let output = Command::new(ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                "-show_chapters",
            ])
            .arg(path)
            .output()
            .await
            .map_err(ProbeError::Probe)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Unreadable(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(path = %path.display(), "ffprobe output parsed");

        let raw: FfprobeOutput = serde_json::from_str(&stdout)
            .map_err(|e| ProbeError::Unreadable(format!("invalid probe JSON: {}", e)))?;

        Self::from_raw(path, raw)
    }

    fn from_raw(path: &Path, raw: FfprobeOutput) -> Result<Self, ProbeError> {
        let video = raw
            .streams
            .iter()
            .find(|s| s.codec_type == "video")
            .ok_or_else(|| ProbeError::Unreadable("no video stream".to_string()))?;

        let duration: f64 = raw
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse().ok())
            .unwrap_or(0.0);

        let size: u64 = raw
            .format
            .size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let bitrate = raw
            .format
            .bit_rate
            .as_deref()
            .and_then(|b| b.parse::<u64>().ok())
            .filter(|b| *b > 0)
            .unwrap_or_else(|| {
                if duration > 0.0 {
                    ((size as f64) * 8.0 / duration) as u64
                } else {
                    0
                }
            });

        let audio_tracks = raw
            .streams
            .iter()
            .filter(|s| s.codec_type == "audio")
            .enumerate()
            .map(|(index, s)| AudioTrack {
                index,
                codec: normalize_audio_codec(s.codec_name.as_deref().unwrap_or("unknown")),
                channels: s.channels.unwrap_or(2),
                language: s.tags.as_ref().and_then(|t| t.language.clone()),
                title: s.tags.as_ref().and_then(|t| t.title.clone()),
            })
            .collect();

        let chapters = raw
            .chapters
            .iter()
            .map(|c| Chapter {
                title: c.tags.as_ref().and_then(|t| t.title.clone()),
                start: c.start_time.as_deref().and_then(|t| t.parse().ok()).unwrap_or(0.0),
                end: c.end_time.as_deref().and_then(|t| t.parse().ok()).unwrap_or(0.0),
            })
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            container: container_token(path, &raw.format.format_name),
            duration,
            size,
            bitrate,
            video_codec: normalize_video_codec(video.codec_name.as_deref().unwrap_or("unknown")),
            pixel_format: video.pix_fmt.clone(),
            width: video.width.unwrap_or(0),
            height: video.height.unwrap_or(0),
            frame_rate: video
                .frame_rate
                .as_deref()
                .and_then(parse_frame_rate)
                .unwrap_or(0.0),
            audio_tracks,
            chapters,
        })
    }
}

/// ffprobe reports frame rates as rationals like "24000/1001".
fn parse_frame_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den > 0.0 {
                Some(num / den)
            } else {
                None
            }
        }
        None => raw.parse().ok(),
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FormatInfo,
    #[serde(default)]
    streams: Vec<StreamInfo>,
    #[serde(default)]
    chapters: Vec<ChapterInfo>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    #[serde(default)]
    format_name: String,
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamInfo {
    codec_name: Option<String>,
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    #[serde(rename = "r_frame_rate")]
    frame_rate: Option<String>,
    channels: Option<u32>,
    tags: Option<StreamTags>,
}

#[derive(Debug, Deserialize)]
struct StreamTags {
    language: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChapterInfo {
    start_time: Option<String>,
    end_time: Option<String>,
    tags: Option<StreamTags>,
}

/// Per-path probe cache keyed by modification time, so edits invalidate
/// stale entries.
pub struct ProbeCache {
    ffprobe_path: PathBuf,
    entries: Mutex<HashMap<PathBuf, (SystemTime, Arc<MediaInfo>)>>,
}

impl ProbeCache {
    pub fn new(ffprobe_path: PathBuf) -> Self {
        Self {
            ffprobe_path,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_probe(&self, path: &Path) -> Result<Arc<MediaInfo>, ProbeError> {
        let mtime = tokio::fs::metadata(path)
            .await
            .map_err(|_| ProbeError::NotFound(path.to_path_buf()))?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);

        if let Some((cached_mtime, info)) = self.entries.lock().get(path) {
            if *cached_mtime == mtime {
                return Ok(info.clone());
            }
        }

        let info = Arc::new(MediaInfo::probe(&self.ffprobe_path, path).await?);
        self.entries
            .lock()
            .insert(path.to_path_buf(), (mtime, info.clone()));
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "format": {
            "format_name": "matroska,webm",
            "duration": "5400.5",
            "size": "4320000000",
            "bit_rate": ""
        },
        "streams": [
            {
                "codec_name": "hevc",
                "codec_type": "video",
                "width": 3840,
                "height": 2160,
                "pix_fmt": "yuv420p10le",
                "r_frame_rate": "24000/1001"
            },
            {
                "codec_name": "flac",
                "codec_type": "audio",
                "channels": 6,
                "tags": { "language": "jpn", "title": "Surround" }
            },
            {
                "codec_name": "aac",
                "codec_type": "audio",
                "channels": 2,
                "tags": { "language": "eng" }
            }
        ],
        "chapters": [
            { "start_time": "0.0", "end_time": "90.0", "tags": { "title": "Opening" } }
        ]
    }"#;

    #[test]
    fn test_from_raw_normalizes_and_orders() {
        let raw: FfprobeOutput = serde_json::from_str(SAMPLE).unwrap();
        let info = MediaInfo::from_raw(Path::new("/media/show.mkv"), raw).unwrap();

        assert_eq!(info.container, "mkv");
        assert_eq!(info.video_codec, "hevc");
        assert!(info.is_10bit());
        assert_eq!(info.width, 3840);
        assert!((info.frame_rate - 23.976).abs() < 0.001);

        // Audio tracks keep audio-only ordering from zero.
        assert_eq!(info.audio_tracks.len(), 2);
        assert_eq!(info.audio_tracks[0].index, 0);
        assert_eq!(info.audio_tracks[0].codec, "flac");
        assert_eq!(info.audio_tracks[1].index, 1);
        assert_eq!(info.audio_tracks[1].codec, "aac");
        assert_eq!(info.default_audio().unwrap().codec, "flac");

        assert_eq!(info.chapters.len(), 1);
        assert_eq!(info.chapters[0].title.as_deref(), Some("Opening"));
    }

    #[test]
    fn test_bitrate_estimated_when_missing() {
        let raw: FfprobeOutput = serde_json::from_str(SAMPLE).unwrap();
        let info = MediaInfo::from_raw(Path::new("/media/show.mkv"), raw).unwrap();

        // size * 8 / duration
        let expected = (4_320_000_000u64 as f64 * 8.0 / 5400.5) as u64;
        assert_eq!(info.bitrate, expected);
    }

    #[test]
    fn test_no_video_stream_is_unreadable() {
        let raw: FfprobeOutput = serde_json::from_str(
            r#"{"format": {"format_name": "mp3"}, "streams": [
                {"codec_type": "audio", "codec_name": "mp3", "channels": 2}
            ]}"#,
        )
        .unwrap();
        let err = MediaInfo::from_raw(Path::new("/media/song.mp3"), raw).unwrap_err();
        assert!(matches!(err, ProbeError::Unreadable(_)));
    }
}
