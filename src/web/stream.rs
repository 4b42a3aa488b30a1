use std::io::SeekFrom;
use std::path::Path;

use axum::{
    body::Body,
    extract::{Path as UrlPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::encoder::capabilities::negotiate_codec;
use crate::encoder::command::TranscodeParams;
use crate::encoder::presets::generate_presets;
use crate::hls::playlist::PlaylistRewriter;
use crate::media::codecs::{BrowserCodecs, CodecFamily};
use crate::web::{resolve_media_path, ApiError, AppState};

/// Browser codec flags as they arrive in query parameters ("1", "true").
#[derive(Debug, Default, Deserialize)]
pub struct BrowserQuery {
    h264: Option<String>,
    hevc: Option<String>,
    av1: Option<String>,
    vp9: Option<String>,
    aac: Option<String>,
    opus: Option<String>,
    flac: Option<String>,
    ac3: Option<String>,
    codec: Option<String>,
}

fn truthy(value: &Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

impl BrowserQuery {
    fn to_codecs(&self) -> BrowserCodecs {
        let declared = BrowserCodecs {
            h264: truthy(&self.h264),
            hevc: truthy(&self.hevc),
            av1: truthy(&self.av1),
            vp9: truthy(&self.vp9),
            aac: truthy(&self.aac),
            opus: truthy(&self.opus),
            flac: truthy(&self.flac),
            ac3: truthy(&self.ac3),
        };
        // A client that declares nothing gets the baseline every mainstream
        // browser satisfies.
        if !(declared.h264 || declared.hevc || declared.av1 || declared.vp9) {
            BrowserCodecs::baseline()
        } else {
            declared
        }
    }
}

/// GET /api/stream/capabilities — what the server can encode, and what it
/// would pick for this browser.
pub async fn capabilities(
    State(state): State<AppState>,
    Query(query): Query<BrowserQuery>,
) -> Json<serde_json::Value> {
    let browser = query.to_codecs();
    let choice = negotiate_codec(&state.caps, &browser);

    Json(serde_json::json!({
        "server_encoders": state.caps.encoders,
        "hwaccel": state.caps.hwaccel.as_str(),
        "device": state.caps.device,
        "selected_codec": choice.family.as_str(),
        "selected_encoder": choice.encoder.encoder,
        "browser_support": browser,
    }))
}

/// GET /api/stream/presets/{path} — the quality ladder for one file.
pub async fn presets(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    Query(query): Query<BrowserQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let media_path = resolve_media_path(&state.config.media_root, &path)?;
    let media = state.probe_cache.get_or_probe(&media_path).await?;

    let browser = query.to_codecs();
    let choice = resolve_choice(&state, &browser, query.codec.as_deref())?;
    let options = generate_presets(&media, &choice, &browser);

    Ok(Json(serde_json::json!({
        "codec": choice.family.as_str(),
        "encoder": choice.encoder.encoder,
        "options": options,
    })))
}

fn resolve_choice(
    state: &AppState,
    browser: &BrowserCodecs,
    codec_override: Option<&str>,
) -> Result<crate::encoder::capabilities::CodecChoice, ApiError> {
    match codec_override {
        None | Some("") | Some("auto") => Ok(negotiate_codec(&state.caps, browser)),
        Some(raw) => {
            let family = CodecFamily::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown codec: {}", raw)))?;
            let encoder = state
                .caps
                .encoder_for(family)
                .ok_or_else(|| ApiError::BadRequest(format!("no encoder for codec: {}", raw)))?;
            Ok(crate::encoder::capabilities::CodecChoice {
                family,
                encoder: encoder.clone(),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HlsQuery {
    quality: Option<String>,
    codec: Option<String>,
    #[serde(default)]
    start: f64,
    #[serde(default)]
    audio_track: usize,
    session_id: Option<String>,
    /// When present, serve this file from the session directory instead of
    /// the playlist.
    file: Option<String>,
    // Browser flags forwarded from the presets request.
    h264: Option<String>,
    hevc: Option<String>,
    av1: Option<String>,
    vp9: Option<String>,
    aac: Option<String>,
    opus: Option<String>,
    flac: Option<String>,
    ac3: Option<String>,
}

impl HlsQuery {
    fn browser(&self) -> BrowserQuery {
        BrowserQuery {
            h264: self.h264.clone(),
            hevc: self.hevc.clone(),
            av1: self.av1.clone(),
            vp9: self.vp9.clone(),
            aac: self.aac.clone(),
            opus: self.opus.clone(),
            flac: self.flac.clone(),
            ac3: self.ac3.clone(),
            codec: self.codec.clone(),
        }
    }
}

/// GET /api/stream/hls/{path} — start or join a session and return its
/// playlist, or serve one session file when `file` is set.
pub async fn hls(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    Query(query): Query<HlsQuery>,
) -> Result<Response, ApiError> {
    // Segment/init fetches reference an existing session.
    if let Some(file) = &query.file {
        let session_id = query
            .session_id
            .as_deref()
            .ok_or_else(|| ApiError::BadRequest("file fetch requires session_id".to_string()))?;
        let file_path = state
            .sessions
            .session_file(session_id, file)
            .map_err(ApiError::from)?;

        // A client actively pulling segments is alive.
        state.sessions.heartbeat(session_id);

        let bytes = tokio::fs::read(&file_path)
            .await
            .map_err(|_| ApiError::NotFound(format!("segment not ready: {}", file)))?;
        let content_type = segment_content_type(file);
        return Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response());
    }

    let media_path = resolve_media_path(&state.config.media_root, &path)?;
    let media = state.probe_cache.get_or_probe(&media_path).await?;

    let quality = query
        .quality
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("quality is required".to_string()))?;

    let browser_query = query.browser();
    let browser = browser_query.to_codecs();
    let choice = resolve_choice(&state, &browser, query.codec.as_deref())?;

    let options = generate_presets(&media, &choice, &browser);
    let option = options
        .iter()
        .find(|o| o.value == quality)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown quality: {}", quality)))?;
    if option.value == "original" {
        return Err(ApiError::BadRequest(
            "original playback uses /api/stream/direct".to_string(),
        ));
    }

    let audio_track = query.audio_track;
    if !media.audio_tracks.is_empty() && audio_track >= media.audio_tracks.len() {
        return Err(ApiError::BadRequest(format!(
            "audio track {} out of range",
            audio_track
        )));
    }

    let session_id = query.session_id.clone().unwrap_or_else(|| {
        derive_session_id(&path, quality, choice.family, audio_track, query.start)
    });

    // A new playback attempt supersedes older sessions of the same
    // (path, quality, codec); their fallback state goes with them.
    state
        .sessions
        .stop_sessions_for_path(&media_path, quality, choice.family, &session_id)
        .await;

    let params = TranscodeParams::from_quality(option, &choice, &media, audio_track);
    let handle = state
        .sessions
        .get_or_create_session(&session_id, &media_path, query.start, quality, params)
        .await
        .map_err(ApiError::from)?;

    let content = tokio::fs::read_to_string(handle.playlist_path())
        .await
        .map_err(|_| ApiError::NotFound("playlist not ready, retry".to_string()))?;

    let base = format!(
        "/api/stream/hls/{}?session_id={}&quality={}&codec={}&audio_track={}",
        encode_path(&path),
        handle.id,
        quality,
        choice.family.as_str(),
        audio_track,
    );
    let rewritten =
        PlaylistRewriter::new().rewrite(&content, |name| format!("{}&file={}", base, name));

    Ok((
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        rewritten,
    )
        .into_response())
}

/// POST /api/stream/heartbeat/{session}
pub async fn heartbeat(
    State(state): State<AppState>,
    UrlPath(session): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.heartbeat(&session) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("unknown session: {}", session)))
    }
}

/// POST /api/stream/pause/{session}
pub async fn pause(
    State(state): State<AppState>,
    UrlPath(session): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.pause(&session)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/stream/resume/{session}
pub async fn resume(
    State(state): State<AppState>,
    UrlPath(session): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.resume(&session)?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/stream/session/{session}
pub async fn stop_session(
    State(state): State<AppState>,
    UrlPath(session): UrlPath<String>,
) -> Result<StatusCode, ApiError> {
    state.sessions.stop_session(&session).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/stream/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "sessions": state.sessions.list_sessions() }))
}

/// GET /api/stream/direct/{path} — range-streamed original bytes for
/// direct-playable files.
pub async fn direct(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let media_path = resolve_media_path(&state.config.media_root, &path)?;

    let metadata = tokio::fs::metadata(&media_path)
        .await
        .map_err(|_| ApiError::NotFound(format!("not found: {}", path)))?;
    let file_size = metadata.len();

    let content_type = mime_guess::from_path(&media_path)
        .first_or_octet_stream()
        .to_string();

    let range = headers
        .get(header::RANGE)
        .and_then(|h| h.to_str().ok())
        .and_then(parse_range_header);

    let mut file = tokio::fs::File::open(&media_path)
        .await
        .map_err(|_| ApiError::NotFound(format!("not found: {}", path)))?;

    match range {
        Some((start, end)) => {
            if start >= file_size {
                return Ok((
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", file_size))],
                )
                    .into_response());
            }
            let end = end.unwrap_or(file_size - 1).min(file_size - 1);
            let length = end - start + 1;

            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            let stream = ReaderStream::new(file.take(length));

            Ok(Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, length.to_string())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, file_size),
                )
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::from_stream(stream))
                .map_err(|e| ApiError::Internal(e.to_string()))?)
        }
        None => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, file_size.to_string())
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from_stream(ReaderStream::new(file)))
            .map_err(|e| ApiError::Internal(e.to_string()))?),
    }
}

/// Parse "bytes=start-end" with an optional open end.
fn parse_range_header(value: &str) -> Option<(u64, Option<u64>)> {
    let range = value.strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

fn segment_content_type(name: &str) -> &'static str {
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("m4s") | Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Deterministic session id for a playback attempt, so reconnects and
/// heartbeat-after-reap land on the same session and its fallback cache.
fn derive_session_id(
    path: &str,
    quality: &str,
    codec: CodecFamily,
    audio_track: usize,
    start: f64,
) -> String {
    let key = format!("{}|{}|{}|{}|{:.3}", path, quality, codec.as_str(), audio_track, start);
    format!("s{:016x}", fnv1a(key.as_bytes()))
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Percent-encode a media path for reuse inside a rewritten playlist URL.
fn encode_path(path: &str) -> String {
    url::form_urlencoded::byte_serialize(path.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
        .replace("%2F", "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_header() {
        assert_eq!(parse_range_header("bytes=0-1023"), Some((0, Some(1023))));
        assert_eq!(parse_range_header("bytes=500-"), Some((500, None)));
        assert_eq!(parse_range_header("chunks=0-1"), None);
        assert_eq!(parse_range_header("bytes=abc-1"), None);
    }

    #[test]
    fn test_session_id_is_deterministic() {
        let a = derive_session_id("shows/ep1.mkv", "720p", CodecFamily::Hevc, 0, 0.0);
        let b = derive_session_id("shows/ep1.mkv", "720p", CodecFamily::Hevc, 0, 0.0);
        assert_eq!(a, b);

        // A seek yields a different id.
        let seeked = derive_session_id("shows/ep1.mkv", "720p", CodecFamily::Hevc, 0, 90.0);
        assert_ne!(a, seeked);

        let other_track = derive_session_id("shows/ep1.mkv", "720p", CodecFamily::Hevc, 1, 0.0);
        assert_ne!(a, other_track);
    }

    #[test]
    fn test_truthy_flags() {
        assert!(truthy(&Some("1".to_string())));
        assert!(truthy(&Some("true".to_string())));
        assert!(truthy(&Some("TRUE".to_string())));
        assert!(!truthy(&Some("0".to_string())));
        assert!(!truthy(&None));
    }

    #[test]
    fn test_encode_path_keeps_slashes() {
        assert_eq!(encode_path("shows/ep 1.mkv"), "shows/ep%201.mkv");
    }

    #[test]
    fn test_segment_content_types() {
        assert_eq!(segment_content_type("seg_00001.m4s"), "video/mp4");
        assert_eq!(segment_content_type("seg_00001.ts"), "video/mp2t");
        assert_eq!(segment_content_type("init.mp4"), "video/mp4");
        assert_eq!(segment_content_type("playlist.m3u8"), "application/vnd.apple.mpegurl");
    }
}
