use std::path::Path;
#[cfg(any(target_os = "linux", target_os = "macos"))]
use std::process::Command;
use std::sync::OnceLock;

#[cfg(any(target_os = "linux", target_os = "macos"))]
use tracing::debug;
use tracing::info;

use serde::Serialize;

use crate::media::codecs::{BrowserCodecs, CodecFamily};

/// Process-wide capability probe result, detected once at startup.
static CAPABILITIES: OnceLock<HwCapabilities> = OnceLock::new();

/// DRI render nodes probed for VAAPI, in order.
const RENDER_DEVICES: [&str; 2] = ["/dev/dri/renderD128", "/dev/dri/renderD129"];

/// VAAPI encoders probed at startup, best codec first.
const VAAPI_CANDIDATES: [(CodecFamily, &str); 3] = [
    (CodecFamily::Av1, "av1_vaapi"),
    (CodecFamily::Hevc, "hevc_vaapi"),
    (CodecFamily::H264, "h264_vaapi"),
];

/// Software encoders per codec family.
const SOFTWARE_CANDIDATES: [(CodecFamily, &str); 4] = [
    (CodecFamily::Av1, "libsvtav1"),
    (CodecFamily::Hevc, "libx265"),
    (CodecFamily::Vp9, "libvpx-vp9"),
    (CodecFamily::H264, "libx264"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccelKind {
    Vaapi,
    None,
}

impl HwAccelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vaapi => "vaapi",
            Self::None => "none",
        }
    }
}

/// One working encoder on this host.
#[derive(Debug, Clone, Serialize)]
pub struct EncoderInfo {
    pub family: CodecFamily,
    pub encoder: String,
    pub hwaccel: HwAccelKind,
    pub device: Option<String>,
}

impl EncoderInfo {
    fn software(family: CodecFamily, encoder: &str) -> Self {
        Self {
            family,
            encoder: encoder.to_string(),
            hwaccel: HwAccelKind::None,
            device: None,
        }
    }
}

/// Encoders and decode support detected on this host. Detection never
/// fails: a host with nothing working still gets a software h264 entry.
#[derive(Debug, Clone, Serialize)]
pub struct HwCapabilities {
    pub encoders: Vec<EncoderInfo>,
    pub hwaccel: HwAccelKind,
    pub hw_decode: bool,
    pub device: Option<String>,
}

impl HwCapabilities {
    /// Detect available encoders, memoized process-wide.
    pub fn detect_cached(ffmpeg_path: &Path) -> &'static HwCapabilities {
        CAPABILITIES.get_or_init(|| Self::detect(ffmpeg_path))
    }

    /// Probe VAAPI encoders in codec priority order, then software encoders
    /// for each family the hardware does not cover.
    pub fn detect(ffmpeg_path: &Path) -> Self {
        let mut encoders: Vec<EncoderInfo> = Vec::new();
        let mut device = None;
        let mut hw_decode = false;

        if let Some(render_device) = find_render_device() {
            for (family, encoder) in VAAPI_CANDIDATES {
                if probe_vaapi_encode(ffmpeg_path, encoder, render_device) {
                    info!(encoder, device = render_device, "VAAPI encoder verified");
                    encoders.push(EncoderInfo {
                        family,
                        encoder: encoder.to_string(),
                        hwaccel: HwAccelKind::Vaapi,
                        device: Some(render_device.to_string()),
                    });
                    device = Some(render_device.to_string());
                }
            }
            if !encoders.is_empty() {
                hw_decode = probe_vaapi_decode(ffmpeg_path, render_device);
                if hw_decode {
                    info!(device = render_device, "VAAPI decoding verified");
                }
            }
        }

        for (family, encoder) in SOFTWARE_CANDIDATES {
            let covered = encoders.iter().any(|e| e.family == family);
            if !covered && probe_software_encode(ffmpeg_path, encoder) {
                info!(encoder, "software encoder verified");
                encoders.push(EncoderInfo::software(family, encoder));
            }
        }

        if encoders.is_empty() {
            info!("no encoder probe succeeded, assuming software h264");
            encoders.push(EncoderInfo::software(CodecFamily::H264, "libx264"));
        }

        let hwaccel = if encoders.iter().any(|e| e.hwaccel == HwAccelKind::Vaapi) {
            HwAccelKind::Vaapi
        } else {
            HwAccelKind::None
        };

        Self {
            encoders,
            hwaccel,
            hw_decode,
            device,
        }
    }

    /// Best encoder for a codec family; hardware entries are probed first so
    /// they sort ahead of software ones.
    pub fn encoder_for(&self, family: CodecFamily) -> Option<&EncoderInfo> {
        self.encoders.iter().find(|e| e.family == family)
    }

    /// The software encoder name for a family, independent of what this host
    /// has verified. Used by the fallback chain's final tier.
    pub fn software_encoder(family: CodecFamily) -> &'static str {
        match family {
            CodecFamily::H264 => "libx264",
            CodecFamily::Hevc => "libx265",
            CodecFamily::Av1 => "libsvtav1",
            CodecFamily::Vp9 => "libvpx-vp9",
        }
    }

    /// A capability set with only software h264, for tests and degraded hosts.
    pub fn software_only() -> Self {
        Self {
            encoders: vec![EncoderInfo::software(CodecFamily::H264, "libx264")],
            hwaccel: HwAccelKind::None,
            hw_decode: false,
            device: None,
        }
    }
}

/// The negotiated codec and the encoder that will produce it.
#[derive(Debug, Clone, Serialize)]
pub struct CodecChoice {
    pub family: CodecFamily,
    pub encoder: EncoderInfo,
}

/// Pick the best codec both sides can handle: first of [av1, hevc, vp9,
/// h264] the browser accepts and the host can encode. Falls back to
/// software h264 when there is no intersection.
pub fn negotiate_codec(caps: &HwCapabilities, browser: &BrowserCodecs) -> CodecChoice {
    for family in CodecFamily::PRIORITY {
        if !browser.supports_video(family) {
            continue;
        }
        if let Some(encoder) = caps.encoder_for(family) {
            return CodecChoice {
                family,
                encoder: encoder.clone(),
            };
        }
    }

    CodecChoice {
        family: CodecFamily::H264,
        encoder: EncoderInfo::software(CodecFamily::H264, "libx264"),
    }
}

fn find_render_device() -> Option<&'static str> {
    RENDER_DEVICES
        .iter()
        .find(|d| Path::new(*d).exists())
        .copied()
}

/// Verify a VAAPI encoder end-to-end with a 1-frame transcode of a null
/// source. Catches missing driver support that device-file checks miss.
#[cfg(target_os = "linux")]
fn probe_vaapi_encode(ffmpeg_path: &Path, encoder: &str, device: &str) -> bool {
    let result = Command::new(ffmpeg_path)
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-init_hw_device",
            &format!("vaapi=va:{}", device),
            "-filter_hw_device",
            "va",
            "-f",
            "lavfi",
            "-i",
            "nullsrc=s=64x64:d=0.1",
            "-vf",
            "format=nv12,hwupload",
            "-c:v",
            encoder,
            "-frames:v",
            "1",
            "-f",
            "null",
            "-",
        ])
        .output();

    match result {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(encoder, device, stderr = %stderr, "VAAPI encode probe failed");
            false
        }
        Err(e) => {
            debug!(error = %e, "failed to run VAAPI encode probe");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn probe_vaapi_encode(_ffmpeg_path: &Path, _encoder: &str, _device: &str) -> bool {
    false
}

/// Verify hardware-accelerated decode initializes on the device.
#[cfg(target_os = "linux")]
fn probe_vaapi_decode(ffmpeg_path: &Path, device: &str) -> bool {
    let result = Command::new(ffmpeg_path)
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-hwaccel",
            "vaapi",
            "-hwaccel_device",
            device,
            "-f",
            "lavfi",
            "-i",
            "nullsrc=s=64x64:d=0.1:r=1",
            "-frames:v",
            "1",
            "-f",
            "null",
            "-",
        ])
        .output();

    match result {
        Ok(output) if output.status.success() => true,
        Ok(_) => {
            debug!(device, "VAAPI decode probe failed");
            false
        }
        Err(e) => {
            debug!(error = %e, "failed to run VAAPI decode probe");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn probe_vaapi_decode(_ffmpeg_path: &Path, _device: &str) -> bool {
    false
}

/// Verify a software encoder is compiled into this ffmpeg build.
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn probe_software_encode(ffmpeg_path: &Path, encoder: &str) -> bool {
    let result = Command::new(ffmpeg_path)
        .args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "lavfi",
            "-i",
            "nullsrc=s=64x64:d=0.1",
            "-c:v",
            encoder,
            "-frames:v",
            "1",
            "-f",
            "null",
            "-",
        ])
        .output();

    match result {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(encoder, stderr = %stderr, "software encode probe failed");
            false
        }
        Err(e) => {
            debug!(error = %e, "failed to run software encode probe");
            false
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn probe_software_encode(_ffmpeg_path: &Path, _encoder: &str) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_with(encoders: Vec<EncoderInfo>, hw_decode: bool) -> HwCapabilities {
        let hwaccel = if encoders.iter().any(|e| e.hwaccel == HwAccelKind::Vaapi) {
            HwAccelKind::Vaapi
        } else {
            HwAccelKind::None
        };
        let device = encoders.iter().find_map(|e| e.device.clone());
        HwCapabilities {
            encoders,
            hwaccel,
            hw_decode,
            device,
        }
    }

    fn vaapi(family: CodecFamily, encoder: &str) -> EncoderInfo {
        EncoderInfo {
            family,
            encoder: encoder.to_string(),
            hwaccel: HwAccelKind::Vaapi,
            device: Some("/dev/dri/renderD128".to_string()),
        }
    }

    #[test]
    fn test_negotiation_prefers_av1() {
        let caps = caps_with(
            vec![
                vaapi(CodecFamily::Av1, "av1_vaapi"),
                vaapi(CodecFamily::Hevc, "hevc_vaapi"),
                EncoderInfo::software(CodecFamily::H264, "libx264"),
            ],
            true,
        );
        let browser = BrowserCodecs {
            h264: true,
            hevc: true,
            av1: true,
            aac: true,
            ..Default::default()
        };

        let choice = negotiate_codec(&caps, &browser);
        assert_eq!(choice.family, CodecFamily::Av1);
        assert_eq!(choice.encoder.encoder, "av1_vaapi");
    }

    #[test]
    fn test_negotiation_skips_unsupported_browser_codec() {
        let caps = caps_with(
            vec![
                vaapi(CodecFamily::Av1, "av1_vaapi"),
                EncoderInfo::software(CodecFamily::H264, "libx264"),
            ],
            true,
        );
        let browser = BrowserCodecs {
            h264: true,
            aac: true,
            ..Default::default()
        };

        let choice = negotiate_codec(&caps, &browser);
        assert_eq!(choice.family, CodecFamily::H264);
    }

    #[test]
    fn test_negotiation_falls_back_to_software_h264() {
        let caps = caps_with(vec![vaapi(CodecFamily::Hevc, "hevc_vaapi")], true);
        // Browser accepts nothing the server encodes.
        let browser = BrowserCodecs {
            vp9: true,
            aac: true,
            ..Default::default()
        };

        let choice = negotiate_codec(&caps, &browser);
        assert_eq!(choice.family, CodecFamily::H264);
        assert_eq!(choice.encoder.encoder, "libx264");
        assert_eq!(choice.encoder.hwaccel, HwAccelKind::None);
    }

    #[test]
    fn test_negotiation_result_always_in_intersection_or_h264() {
        // Property check over every browser/capability combination of the
        // four families.
        for mask in 0..16u8 {
            let browser = BrowserCodecs {
                av1: mask & 1 != 0,
                hevc: mask & 2 != 0,
                vp9: mask & 4 != 0,
                h264: mask & 8 != 0,
                aac: true,
                ..Default::default()
            };
            for enc_mask in 0..16u8 {
                let mut encoders = Vec::new();
                if enc_mask & 1 != 0 {
                    encoders.push(vaapi(CodecFamily::Av1, "av1_vaapi"));
                }
                if enc_mask & 2 != 0 {
                    encoders.push(vaapi(CodecFamily::Hevc, "hevc_vaapi"));
                }
                if enc_mask & 4 != 0 {
                    encoders.push(EncoderInfo::software(CodecFamily::Vp9, "libvpx-vp9"));
                }
                if enc_mask & 8 != 0 {
                    encoders.push(EncoderInfo::software(CodecFamily::H264, "libx264"));
                }
                let caps = caps_with(encoders, false);
                let choice = negotiate_codec(&caps, &browser);

                let in_intersection = browser.supports_video(choice.family)
                    && caps.encoder_for(choice.family).is_some();
                if !in_intersection {
                    assert_eq!(choice.family, CodecFamily::H264);
                    assert_eq!(choice.encoder.encoder, "libx264");
                }
            }
        }
    }

    #[test]
    fn test_software_only_has_h264() {
        let caps = HwCapabilities::software_only();
        assert!(caps.encoder_for(CodecFamily::H264).is_some());
        assert_eq!(caps.hwaccel, HwAccelKind::None);
        assert!(!caps.hw_decode);
    }

    #[test]
    fn test_software_encoder_names() {
        assert_eq!(HwCapabilities::software_encoder(CodecFamily::H264), "libx264");
        assert_eq!(HwCapabilities::software_encoder(CodecFamily::Hevc), "libx265");
        assert_eq!(HwCapabilities::software_encoder(CodecFamily::Av1), "libsvtav1");
        assert_eq!(HwCapabilities::software_encoder(CodecFamily::Vp9), "libvpx-vp9");
    }
}
