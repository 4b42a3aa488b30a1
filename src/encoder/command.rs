use std::path::Path;

use serde::Serialize;

use crate::encoder::capabilities::{CodecChoice, HwAccelKind, HwCapabilities};
use crate::encoder::presets::QualityOption;
use crate::media::codecs::CodecFamily;
use crate::media::probe::MediaInfo;

/// HLS segment container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentFormat {
    MpegTs,
    Fmp4,
}

impl SegmentFormat {
    /// h264 plays fine from mpegts everywhere; every other family needs
    /// fragmented MP4 for browser MSE.
    pub fn for_family(family: CodecFamily) -> Self {
        match family {
            CodecFamily::H264 => Self::MpegTs,
            _ => Self::Fmp4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MpegTs => "mpegts",
            Self::Fmp4 => "fmp4",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::MpegTs => "ts",
            Self::Fmp4 => "m4s",
        }
    }
}

/// Execution tier of a transcoding session. Sessions fall down the chain
/// when the transcoder dies within the startup window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Hardware decode + hardware encode.
    Vaapi,
    /// Software decode + hardware encode via hwupload.
    Hybrid,
    /// Software decode + software encode.
    Software,
    /// Stream copy; exempt from the fallback chain.
    Passthrough,
}

impl Tier {
    pub fn next(&self) -> Option<Tier> {
        match self {
            Self::Vaapi => Some(Self::Hybrid),
            Self::Hybrid => Some(Self::Software),
            Self::Software | Self::Passthrough => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vaapi => "vaapi",
            Self::Hybrid => "hybrid",
            Self::Software => "sw",
            Self::Passthrough => "passthrough",
        }
    }
}

/// Everything needed to build one session's transcode command.
#[derive(Debug, Clone)]
pub struct TranscodeParams {
    pub label: String,
    pub height: u32,
    pub crf: u32,
    pub maxrate: u64,
    pub bufsize: u64,
    pub video_codec: CodecFamily,
    pub audio_codec: String,
    pub encoder: String,
    pub hwaccel: HwAccelKind,
    pub device: Option<String>,
    pub segment_format: SegmentFormat,
    pub audio_index: usize,
    pub passthrough: bool,
    pub source_video_codec: Option<String>,
    pub source_audio_codec: Option<String>,
}

impl TranscodeParams {
    /// Resolve a selected quality option against the negotiated encoder and
    /// the probed source.
    pub fn from_quality(
        quality: &QualityOption,
        choice: &CodecChoice,
        media: &MediaInfo,
        audio_index: usize,
    ) -> Self {
        if quality.value == "passthrough" {
            // Segment format is always fmp4 for passthrough; remuxing MKV
            // sources into mpegts has DTS hazards.
            return Self {
                label: quality.label.clone(),
                height: quality.height,
                crf: 0,
                maxrate: 0,
                bufsize: 0,
                video_codec: CodecFamily::parse(&media.video_codec).unwrap_or(CodecFamily::H264),
                audio_codec: quality.audio_codec.clone(),
                encoder: "copy".to_string(),
                hwaccel: HwAccelKind::None,
                device: None,
                segment_format: SegmentFormat::Fmp4,
                audio_index,
                passthrough: true,
                source_video_codec: Some(media.video_codec.clone()),
                source_audio_codec: media.default_audio().map(|a| a.codec.clone()),
            };
        }

        Self {
            label: quality.label.clone(),
            height: quality.height,
            crf: quality.crf,
            maxrate: quality.maxrate,
            bufsize: quality.bufsize,
            video_codec: choice.family,
            audio_codec: "aac".to_string(),
            encoder: choice.encoder.encoder.clone(),
            hwaccel: choice.encoder.hwaccel,
            device: choice.encoder.device.clone(),
            segment_format: SegmentFormat::for_family(choice.family),
            audio_index,
            passthrough: false,
            source_video_codec: Some(media.video_codec.clone()),
            source_audio_codec: media.default_audio().map(|a| a.codec.clone()),
        }
    }

    /// The tier a fresh session starts on.
    pub fn initial_tier(&self, hw_decode: bool) -> Tier {
        if self.passthrough {
            Tier::Passthrough
        } else if self.hwaccel == HwAccelKind::Vaapi {
            if hw_decode {
                Tier::Vaapi
            } else {
                Tier::Hybrid
            }
        } else {
            Tier::Software
        }
    }

    /// The encoder actually used at a tier.
    pub fn encoder_at(&self, tier: Tier) -> String {
        match tier {
            Tier::Vaapi | Tier::Hybrid => self.encoder.clone(),
            Tier::Software => HwCapabilities::software_encoder(self.video_codec).to_string(),
            Tier::Passthrough => "copy".to_string(),
        }
    }
}

/// Build the full ffmpeg argument list for one session at one tier.
pub fn build_session_args(
    params: &TranscodeParams,
    tier: Tier,
    input: &Path,
    start_secs: f64,
    output_dir: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into(), "-loglevel".into(), "warning".into()];

    let device = params.device.as_deref().unwrap_or("/dev/dri/renderD128");

    // Device setup before the input.
    match tier {
        Tier::Vaapi => {
            args.extend([
                "-init_hw_device".into(),
                format!("vaapi=va:{}", device),
                "-filter_hw_device".into(),
                "va".into(),
                "-hwaccel".into(),
                "vaapi".into(),
                "-hwaccel_output_format".into(),
                "vaapi".into(),
                "-hwaccel_device".into(),
                device.into(),
            ]);
        }
        Tier::Hybrid => {
            args.extend([
                "-init_hw_device".into(),
                format!("vaapi=va:{}", device),
                "-filter_hw_device".into(),
                "va".into(),
            ]);
        }
        Tier::Software | Tier::Passthrough => {}
    }

    // Seek before the input for fast keyframe-aligned starts.
    if start_secs > 0.0 {
        args.extend(["-ss".into(), format!("{:.3}", start_secs)]);
    }

    args.extend(["-i".into(), input.to_string_lossy().into_owned()]);

    // First video stream, chosen audio stream (audio-only ordering).
    args.extend([
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        format!("0:a:{}", params.audio_index),
    ]);

    match tier {
        Tier::Vaapi => {
            // GPU scaling; the nv12 coercion downconverts 10-bit sources.
            args.extend([
                "-vf".into(),
                format!("scale_vaapi=w=-2:h={}:format=nv12", params.height),
                "-c:v".into(),
                params.encoder.clone(),
                "-global_quality".into(),
                params.crf.to_string(),
                "-maxrate".into(),
                params.maxrate.to_string(),
                "-bufsize".into(),
                params.bufsize.to_string(),
            ]);
        }
        Tier::Hybrid => {
            // CPU decode, upload frames to the GPU for encoding.
            args.extend([
                "-vf".into(),
                format!("scale=-2:{},format=nv12,hwupload", params.height),
                "-c:v".into(),
                params.encoder.clone(),
                "-global_quality".into(),
                params.crf.to_string(),
                "-maxrate".into(),
                params.maxrate.to_string(),
                "-bufsize".into(),
                params.bufsize.to_string(),
            ]);
        }
        Tier::Software => {
            let encoder = params.encoder_at(Tier::Software);
            args.extend([
                "-vf".into(),
                format!("scale=-2:{}", params.height),
                "-c:v".into(),
                encoder.clone(),
            ]);
            match params.video_codec {
                CodecFamily::H264 => args.extend(["-preset".into(), "veryfast".into()]),
                CodecFamily::Hevc => args.extend(["-preset".into(), "fast".into()]),
                CodecFamily::Av1 => args.extend(["-preset".into(), "8".into()]),
                CodecFamily::Vp9 => {
                    args.extend(["-cpu-used".into(), "4".into(), "-row-mt".into(), "1".into()]);
                    // libvpx CRF mode needs an explicit zero target bitrate.
                    args.extend(["-b:v".into(), "0".into()]);
                }
            }
            args.extend([
                "-crf".into(),
                params.crf.to_string(),
                "-pix_fmt".into(),
                "yuv420p".into(),
            ]);
            if params.video_codec == CodecFamily::Hevc {
                args.extend(["-tag:v".into(), "hvc1".into()]);
            }
        }
        Tier::Passthrough => {
            args.extend(["-c:v".into(), "copy".into()]);
            // Restart presentation timestamps at zero without re-encoding.
            args.extend(["-bsf:v".into(), "setts=pts=PTS-STARTPTS".into()]);
            match params.source_video_codec.as_deref() {
                Some("hevc") => args.extend(["-tag:v".into(), "hvc1".into()]),
                Some("h264") => args.extend(["-tag:v".into(), "avc1".into()]),
                _ => {}
            }
        }
    }

    // Audio.
    if params.audio_codec == "copy" {
        args.extend(["-c:a".into(), "copy".into()]);
    } else {
        args.extend(["-c:a".into(), "aac".into(), "-b:a".into(), "192k".into(), "-ac".into(), "2".into()]);
        if tier == Tier::Passthrough {
            // Resample against the copied video to hold A/V sync.
            args.extend(["-af".into(), "aresample=async=1".into()]);
        }
    }

    if tier == Tier::Passthrough {
        args.extend([
            "-avoid_negative_ts".into(),
            "make_zero".into(),
            "-fflags".into(),
            "+genpts+igndts".into(),
            "-max_interleave_delta".into(),
            "1000000".into(),
        ]);
    }

    // HLS output.
    args.extend([
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        "4".into(),
        "-hls_init_time".into(),
        "1".into(),
        "-hls_playlist_type".into(),
        "event".into(),
        "-hls_flags".into(),
        "independent_segments".into(),
        "-hls_list_size".into(),
        "0".into(),
    ]);

    match params.segment_format {
        SegmentFormat::Fmp4 => {
            args.extend([
                "-hls_segment_type".into(),
                "fmp4".into(),
                "-hls_fmp4_init_filename".into(),
                "init.mp4".into(),
                "-hls_segment_filename".into(),
                output_dir.join("seg_%05d.m4s").to_string_lossy().into_owned(),
            ]);
        }
        SegmentFormat::MpegTs => {
            args.extend([
                "-hls_segment_filename".into(),
                output_dir.join("seg_%05d.ts").to_string_lossy().into_owned(),
            ]);
        }
    }

    args.push(output_dir.join("playlist.m3u8").to_string_lossy().into_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn hw_params() -> TranscodeParams {
        TranscodeParams {
            label: "720p".to_string(),
            height: 720,
            crf: 22,
            maxrate: 4_000_000,
            bufsize: 8_000_000,
            video_codec: CodecFamily::Hevc,
            audio_codec: "aac".to_string(),
            encoder: "hevc_vaapi".to_string(),
            hwaccel: HwAccelKind::Vaapi,
            device: Some("/dev/dri/renderD128".to_string()),
            segment_format: SegmentFormat::Fmp4,
            audio_index: 1,
            passthrough: false,
            source_video_codec: Some("hevc".to_string()),
            source_audio_codec: Some("flac".to_string()),
        }
    }

    fn args_at(tier: Tier, params: &TranscodeParams) -> Vec<String> {
        build_session_args(
            params,
            tier,
            Path::new("/media/show.mkv"),
            0.0,
            &PathBuf::from("/tmp/session"),
        )
    }

    fn has_pair(args: &[String], key: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == key && w[1] == value)
    }

    #[test]
    fn test_vaapi_args() {
        let args = args_at(Tier::Vaapi, &hw_params());
        assert!(has_pair(&args, "-hwaccel", "vaapi"));
        assert!(has_pair(&args, "-hwaccel_output_format", "vaapi"));
        assert!(has_pair(&args, "-vf", "scale_vaapi=w=-2:h=720:format=nv12"));
        assert!(has_pair(&args, "-global_quality", "22"));
        assert!(has_pair(&args, "-maxrate", "4000000"));
        assert!(has_pair(&args, "-bufsize", "8000000"));
        assert!(has_pair(&args, "-map", "0:a:1"));
        assert!(has_pair(&args, "-hls_segment_type", "fmp4"));
        assert!(has_pair(&args, "-hls_fmp4_init_filename", "init.mp4"));
    }

    #[test]
    fn test_hybrid_args_upload_chain() {
        let args = args_at(Tier::Hybrid, &hw_params());
        assert!(!args.contains(&"-hwaccel".to_string()), "hybrid decodes in software");
        assert!(has_pair(&args, "-vf", "scale=-2:720,format=nv12,hwupload"));
        assert!(has_pair(&args, "-global_quality", "22"));
        assert!(args.iter().any(|a| a.starts_with("vaapi=va:")));
    }

    #[test]
    fn test_software_args_per_encoder_presets() {
        let mut params = hw_params();
        let args = args_at(Tier::Software, &params);
        assert!(has_pair(&args, "-c:v", "libx265"));
        assert!(has_pair(&args, "-preset", "fast"));
        assert!(has_pair(&args, "-crf", "22"));
        assert!(has_pair(&args, "-pix_fmt", "yuv420p"));
        assert!(has_pair(&args, "-tag:v", "hvc1"));

        params.video_codec = CodecFamily::H264;
        let args = args_at(Tier::Software, &params);
        assert!(has_pair(&args, "-c:v", "libx264"));
        assert!(has_pair(&args, "-preset", "veryfast"));

        params.video_codec = CodecFamily::Av1;
        let args = args_at(Tier::Software, &params);
        assert!(has_pair(&args, "-c:v", "libsvtav1"));
        assert!(has_pair(&args, "-preset", "8"));

        params.video_codec = CodecFamily::Vp9;
        let args = args_at(Tier::Software, &params);
        assert!(has_pair(&args, "-c:v", "libvpx-vp9"));
        assert!(has_pair(&args, "-cpu-used", "4"));
        assert!(has_pair(&args, "-row-mt", "1"));
        assert!(has_pair(&args, "-b:v", "0"));
    }

    #[test]
    fn test_passthrough_args() {
        let params = TranscodeParams {
            label: "Original (AAC)".to_string(),
            height: 1080,
            crf: 0,
            maxrate: 0,
            bufsize: 0,
            video_codec: CodecFamily::Hevc,
            audio_codec: "aac".to_string(),
            encoder: "copy".to_string(),
            hwaccel: HwAccelKind::None,
            device: None,
            segment_format: SegmentFormat::Fmp4,
            audio_index: 0,
            passthrough: true,
            source_video_codec: Some("hevc".to_string()),
            source_audio_codec: Some("flac".to_string()),
        };
        let args = args_at(Tier::Passthrough, &params);

        assert!(has_pair(&args, "-c:v", "copy"));
        assert!(has_pair(&args, "-bsf:v", "setts=pts=PTS-STARTPTS"));
        assert!(has_pair(&args, "-tag:v", "hvc1"));
        assert!(has_pair(&args, "-c:a", "aac"));
        assert!(has_pair(&args, "-af", "aresample=async=1"));
        assert!(has_pair(&args, "-avoid_negative_ts", "make_zero"));
        assert!(has_pair(&args, "-fflags", "+genpts+igndts"));
        assert!(has_pair(&args, "-hls_segment_type", "fmp4"));
    }

    #[test]
    fn test_seek_before_input() {
        let args = build_session_args(
            &hw_params(),
            Tier::Vaapi,
            Path::new("/media/show.mkv"),
            90.5,
            &PathBuf::from("/tmp/session"),
        );
        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < input);
        assert_eq!(args[ss + 1], "90.500");
    }

    #[test]
    fn test_mpegts_segments_for_h264() {
        let mut params = hw_params();
        params.video_codec = CodecFamily::H264;
        params.segment_format = SegmentFormat::MpegTs;
        let args = args_at(Tier::Software, &params);
        assert!(!args.contains(&"-hls_segment_type".to_string()));
        assert!(args.iter().any(|a| a.ends_with("seg_%05d.ts")));
    }

    #[test]
    fn test_tier_chain() {
        assert_eq!(Tier::Vaapi.next(), Some(Tier::Hybrid));
        assert_eq!(Tier::Hybrid.next(), Some(Tier::Software));
        assert_eq!(Tier::Software.next(), None);
        assert_eq!(Tier::Passthrough.next(), None);
    }

    #[test]
    fn test_initial_tier_selection() {
        let params = hw_params();
        assert_eq!(params.initial_tier(true), Tier::Vaapi);
        assert_eq!(params.initial_tier(false), Tier::Hybrid);

        let mut sw = hw_params();
        sw.hwaccel = HwAccelKind::None;
        sw.encoder = "libx265".to_string();
        assert_eq!(sw.initial_tier(true), Tier::Software);
    }
}
