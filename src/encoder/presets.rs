use serde::Serialize;

use crate::encoder::capabilities::CodecChoice;
use crate::media::codecs::{browser_native_container, BrowserCodecs, CodecFamily};
use crate::media::probe::MediaInfo;

/// One entry of the quality ladder offered to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityOption {
    /// Short id the client sends back ("720p", "original", "passthrough").
    pub value: String,
    pub label: String,
    /// Descriptive bandwidth string, e.g. "6.5 Mbps".
    pub bandwidth: String,
    pub height: u32,
    pub crf: u32,
    /// Rate bounds in bits per second. Zero for original playback.
    pub maxrate: u64,
    pub bufsize: u64,
    pub video_codec: String,
    pub audio_codec: String,
    pub can_original: bool,
    pub can_original_video: bool,
    pub can_original_audio: bool,
    pub source_audio_codec: String,
}

/// Standard resolution tiers with their h264-equivalent maxrate floors.
const TIERS: [(u32, u64); 4] = [
    (720, 4_000_000),
    (1080, 8_000_000),
    (1440, 15_000_000),
    (2160, 25_000_000),
];

/// CRF ladder per codec at the 720/1080/1440/2160 tiers, plus the bitrate
/// ratio each codec needs relative to h264 for comparable quality.
fn codec_profile(family: CodecFamily) -> (&'static [u32; 4], f64) {
    match family {
        CodecFamily::H264 => (&[17, 16, 15, 15], 1.0),
        CodecFamily::Hevc => (&[22, 21, 20, 20], 0.65),
        CodecFamily::Av1 => (&[30, 28, 27, 27], 0.5),
        CodecFamily::Vp9 => (&[25, 23, 22, 22], 0.65),
    }
}

/// Index of the tier a given height belongs to (first tier at or above it).
fn tier_index(height: u32) -> usize {
    TIERS
        .iter()
        .position(|(h, _)| *h >= height)
        .unwrap_or(TIERS.len() - 1)
}

fn tier_label(height: u32) -> String {
    if height == 2160 {
        "4K".to_string()
    } else {
        format!("{}p", height)
    }
}

fn round_half_mbps(bps: f64) -> u64 {
    ((bps / 500_000.0).round() as u64) * 500_000
}

fn format_bandwidth(bps: u64) -> String {
    let mbps = bps as f64 / 1_000_000.0;
    if (mbps - mbps.round()).abs() < 0.05 {
        format!("{:.0} Mbps", mbps)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// Maxrate for a downscale tier: scale the source bitrate by the height
/// ratio (^1.5 approximates the area/complexity falloff), give transcodes
/// 50% headroom, scale by codec efficiency, then clamp. The source-bitrate
/// cap is applied last so a low-rate source is never inflated past itself.
fn tier_maxrate(tier_height: u32, floor: u64, src_height: u32, src_bitrate: u64, ratio: f64, cap: f64) -> u64 {
    let height_ratio = tier_height as f64 / src_height as f64;
    let raw = height_ratio.powf(1.5) * src_bitrate as f64 * 1.5 * ratio;
    let lo = floor as f64 * ratio;

    if src_bitrate == 0 {
        return round_half_mbps(lo);
    }

    let hi = cap * src_bitrate as f64;
    round_half_mbps(raw.max(lo).min(hi))
}

/// Build the ordered quality ladder for a probed file: downscale tiers
/// strictly below the source height, a same-resolution transcode, the
/// original, and a passthrough entry when the browser can decode the codec
/// but not direct-play the file. Pure function of its inputs.
pub fn generate_presets(
    media: &MediaInfo,
    choice: &CodecChoice,
    browser: &BrowserCodecs,
) -> Vec<QualityOption> {
    let (crf_table, ratio) = codec_profile(choice.family);
    let src_height = media.height.max(1);
    let src_bitrate = media.bitrate;

    let source_audio = media
        .default_audio()
        .map(|a| a.codec.clone())
        .unwrap_or_else(|| "none".to_string());

    let source_family = CodecFamily::parse(&media.video_codec);

    // Codec-level decode support, container-independent. 10-bit h264 has no
    // browser MSE path, so it never qualifies.
    let can_original_video = source_family
        .map(|f| browser.supports_video(f))
        .unwrap_or(false)
        && !(media.video_codec == "h264" && media.is_10bit());

    let can_original_audio = media
        .default_audio()
        .map(|a| browser.supports_audio(&a.codec))
        .unwrap_or(true);

    let can_original = can_original_video
        && can_original_audio
        && browser_native_container(&media.container);

    let flags = |option: QualityOption| QualityOption {
        can_original,
        can_original_video,
        can_original_audio,
        source_audio_codec: source_audio.clone(),
        ..option
    };

    let mut options = Vec::new();

    // Downscale tiers strictly below the source.
    for (idx, (tier_height, floor)) in TIERS.iter().enumerate() {
        if *tier_height >= src_height {
            break;
        }
        let maxrate = tier_maxrate(*tier_height, *floor, src_height, src_bitrate, ratio, 0.95);
        options.push(flags(QualityOption {
            value: format!("{}p", tier_height),
            label: tier_label(*tier_height),
            bandwidth: format_bandwidth(maxrate),
            height: *tier_height,
            crf: crf_table[idx],
            maxrate,
            bufsize: maxrate * 2,
            video_codec: choice.family.as_str().to_string(),
            audio_codec: "aac".to_string(),
            ..QualityOption::default()
        }));
    }

    // Same-resolution transcode, capped at the source bitrate itself.
    {
        let idx = tier_index(src_height);
        let floor = TIERS[idx].1;
        let maxrate = tier_maxrate(src_height, floor, src_height, src_bitrate, ratio, 1.0);
        options.push(flags(QualityOption {
            value: format!("{}p", src_height),
            label: tier_label(src_height),
            bandwidth: format_bandwidth(maxrate),
            height: src_height,
            crf: crf_table[idx],
            maxrate,
            bufsize: maxrate * 2,
            video_codec: choice.family.as_str().to_string(),
            audio_codec: "aac".to_string(),
            ..QualityOption::default()
        }));
    }

    // Original playback.
    options.push(flags(QualityOption {
        value: "original".to_string(),
        label: "Original".to_string(),
        bandwidth: format_bandwidth(src_bitrate),
        height: src_height,
        crf: 0,
        maxrate: 0,
        bufsize: 0,
        video_codec: media.video_codec.clone(),
        audio_codec: source_audio.clone(),
        ..QualityOption::default()
    }));

    // Passthrough: video copy into HLS segments, audio to AAC when needed.
    // Only worth offering when the codec itself plays but direct play is
    // blocked by audio or container.
    if can_original_video && !can_original {
        let label = if can_original_audio {
            "Original (Remux)".to_string()
        } else {
            "Original (AAC)".to_string()
        };
        let audio_codec = if can_original_audio { "copy" } else { "aac" };
        options.push(flags(QualityOption {
            value: "passthrough".to_string(),
            label,
            bandwidth: format_bandwidth(src_bitrate),
            height: src_height,
            crf: 0,
            maxrate: 0,
            bufsize: 0,
            video_codec: media.video_codec.clone(),
            audio_codec: audio_codec.to_string(),
            ..QualityOption::default()
        }));
    }

    options
}

impl Default for QualityOption {
    fn default() -> Self {
        Self {
            value: String::new(),
            label: String::new(),
            bandwidth: String::new(),
            height: 0,
            crf: 0,
            maxrate: 0,
            bufsize: 0,
            video_codec: String::new(),
            audio_codec: String::new(),
            can_original: false,
            can_original_video: false,
            can_original_audio: false,
            source_audio_codec: String::new(),
        }
    }
}
