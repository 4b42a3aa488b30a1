use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HandlerError;
use crate::jobs::queue::ProgressReporter;
use crate::subtitles::cues::{ensure_vtt_header, offset_cues, parse_vtt, render_vtt};

/// Transient failures are retried this many times, sleeping 2/4/8 s.
const RETRY_BACKOFF_SECS: [u64; 3] = [2, 4, 8];

/// Upload ceiling of the cloud engine. Past it the audio is re-encoded to
/// MP3; past it again, split into chunks.
const CLOUD_UPLOAD_CAP: u64 = 25 * 1024 * 1024;
const CHUNK_SECS: f64 = 600.0;

/// Bytes per second of the intermediate WAV (16 kHz mono s16le).
const WAV_BYTES_PER_SEC: f64 = 32_000.0;

#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub media_path: PathBuf,
    /// "auto" or an ISO language code.
    pub language: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TranscribeOutput {
    pub vtt: String,
    pub language: String,
}

/// A speech-to-text engine. Selected by string discriminator; variants are
/// the self-hosted server and the size-capped cloud API.
#[async_trait]
pub trait TranscribeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn transcribe(
        &self,
        cancel: &CancellationToken,
        req: &TranscribeRequest,
        progress: &ProgressReporter,
    ) -> Result<TranscribeOutput, HandlerError>;
}

/// Run an operation with the standard transient-retry policy.
pub(crate) async fn with_retries<T, F, Fut>(
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, HandlerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HandlerError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(HandlerError::Transient(msg)) if attempt < RETRY_BACKOFF_SECS.len() => {
                let delay = Duration::from_secs(RETRY_BACKOFF_SECS[attempt]);
                attempt += 1;
                warn!(attempt, delay_secs = delay.as_secs(), error = %msg, "transient failure, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(HandlerError::Cancelled),
                }
            }
            other => return other,
        }
    }
}

/// Race a request against cancellation; dropping the future aborts the
/// underlying HTTP call.
pub(crate) async fn cancellable<T, Fut>(
    cancel: &CancellationToken,
    fut: Fut,
) -> Result<T, HandlerError>
where
    Fut: Future<Output = Result<T, HandlerError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(HandlerError::Cancelled),
        res = fut => res,
    }
}

/// Extract a mono 16 kHz WAV side-file, the input format both engines want.
async fn extract_wav(ffmpeg_path: &Path, input: &Path, output: &Path) -> Result<(), HandlerError> {
    let result = Command::new(ffmpeg_path)
        .args(["-hide_banner", "-y", "-i"])
        .arg(input)
        .args(["-vn", "-ac", "1", "-ar", "16000", "-c:a", "pcm_s16le"])
        .arg(output)
        .output()
        .await
        .map_err(|e| HandlerError::Fatal(format!("ffmpeg spawn failed: {}", e)))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(HandlerError::Fatal(format!(
            "audio extraction failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Re-encode the WAV to a small mono MP3 for the upload cap.
async fn encode_mp3(ffmpeg_path: &Path, input: &Path, output: &Path) -> Result<(), HandlerError> {
    let result = Command::new(ffmpeg_path)
        .args(["-hide_banner", "-y", "-i"])
        .arg(input)
        .args(["-vn", "-ac", "1", "-ar", "16000", "-b:a", "64k"])
        .arg(output)
        .output()
        .await
        .map_err(|e| HandlerError::Fatal(format!("ffmpeg spawn failed: {}", e)))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(HandlerError::Fatal(format!(
            "mp3 encode failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

/// Cut one chunk out of the WAV by stream copy.
async fn cut_chunk(
    ffmpeg_path: &Path,
    input: &Path,
    output: &Path,
    offset_secs: f64,
) -> Result<(), HandlerError> {
    let result = Command::new(ffmpeg_path)
        .args(["-hide_banner", "-y", "-ss", &format!("{:.3}", offset_secs), "-t"])
        .arg(format!("{:.3}", CHUNK_SECS))
        .arg("-i")
        .arg(input)
        .args(["-c", "copy"])
        .arg(output)
        .output()
        .await
        .map_err(|e| HandlerError::Fatal(format!("ffmpeg spawn failed: {}", e)))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(HandlerError::Fatal(format!(
            "chunk cut failed: {}",
            stderr.trim()
        )));
    }
    Ok(())
}

async fn file_size(path: &Path) -> Result<u64, HandlerError> {
    Ok(tokio::fs::metadata(path)
        .await
        .map_err(|e| HandlerError::Fatal(format!("stat failed: {}", e)))?
        .len())
}

/// Self-hosted transcription server: multipart upload, JSON response with
/// the VTT text and the detected language. When a model id is configured,
/// a `/model/load` call first aligns the server with the job.
pub struct LocalServerBackend {
    base_url: String,
    ffmpeg_path: PathBuf,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct LocalTranscribeResponse {
    vtt: String,
    #[serde(default)]
    language: Option<String>,
}

impl LocalServerBackend {
    pub fn new(base_url: String, ffmpeg_path: PathBuf) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            ffmpeg_path,
            http: reqwest::Client::new(),
        }
    }

    async fn ensure_model(&self, cancel: &CancellationToken, model: &str) -> Result<(), HandlerError> {
        let url = format!("{}/model/load", self.base_url);
        let body = serde_json::json!({ "model": model });

        with_retries(cancel, || {
            let url = url.clone();
            let body = body.clone();
            async move {
                cancellable(cancel, async {
                    let response = self
                        .http
                        .post(&url)
                        .json(&body)
                        .send()
                        .await
                        .map_err(HandlerError::from_request)?;
                    let status = response.status();
                    if !status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(HandlerError::from_response(status, &text));
                    }
                    Ok(())
                })
                .await
            }
        })
        .await
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        wav_path: &Path,
        language: &str,
    ) -> Result<LocalTranscribeResponse, HandlerError> {
        let url = format!("{}/transcribe", self.base_url);
        let bytes = tokio::fs::read(wav_path)
            .await
            .map_err(|e| HandlerError::Fatal(format!("read wav failed: {}", e)))?;

        with_retries(cancel, || {
            let url = url.clone();
            let bytes = bytes.clone();
            let language = language.to_string();
            async move {
                cancellable(cancel, async {
                    let part = reqwest::multipart::Part::bytes(bytes)
                        .file_name("audio.wav")
                        .mime_str("audio/wav")
                        .map_err(|e| HandlerError::Fatal(e.to_string()))?;
                    let form = reqwest::multipart::Form::new()
                        .part("file", part)
                        .text("language", language);

                    let response = self
                        .http
                        .post(&url)
                        .multipart(form)
                        .send()
                        .await
                        .map_err(HandlerError::from_request)?;

                    let status = response.status();
                    if !status.is_success() {
                        let text = response.text().await.unwrap_or_default();
                        return Err(HandlerError::from_response(status, &text));
                    }

                    response
                        .json::<LocalTranscribeResponse>()
                        .await
                        .map_err(|e| HandlerError::Fatal(format!("bad engine response: {}", e)))
                })
                .await
            }
        })
        .await
    }
}

#[async_trait]
impl TranscribeBackend for LocalServerBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn transcribe(
        &self,
        cancel: &CancellationToken,
        req: &TranscribeRequest,
        progress: &ProgressReporter,
    ) -> Result<TranscribeOutput, HandlerError> {
        if let Some(model) = &req.model {
            debug!(model, "aligning transcription server model");
            self.ensure_model(cancel, model).await?;
        }

        let workdir = tempfile_dir(&req.media_path)?;
        let wav_path = workdir.join("audio.wav");
        extract_wav(&self.ffmpeg_path, &req.media_path, &wav_path).await?;
        progress.set(0.2).await;

        let response = self.upload(cancel, &wav_path, &req.language).await;
        let _ = tokio::fs::remove_dir_all(&workdir).await;
        let response = response?;
        progress.set(0.9).await;

        let language = response
            .language
            .unwrap_or_else(|| req.language.clone());
        info!(language = %language, "transcription complete");

        Ok(TranscribeOutput {
            vtt: ensure_vtt_header(&response.vtt),
            language,
        })
    }
}

/// Cloud engine with a 25 MB upload cap: MP3 first, then 10-minute WAV
/// chunks whose cue timestamps are offset back into file time.
pub struct CloudApiBackend {
    endpoint: String,
    api_key: String,
    ffmpeg_path: PathBuf,
    http: reqwest::Client,
}

impl CloudApiBackend {
    pub fn new(endpoint: String, api_key: String, ffmpeg_path: PathBuf) -> Self {
        Self {
            endpoint,
            api_key,
            ffmpeg_path,
            http: reqwest::Client::new(),
        }
    }

    async fn upload_once(
        &self,
        cancel: &CancellationToken,
        audio_path: &Path,
        language: &str,
        model: &str,
    ) -> Result<String, HandlerError> {
        let bytes = tokio::fs::read(audio_path)
            .await
            .map_err(|e| HandlerError::Fatal(format!("read audio failed: {}", e)))?;
        let file_name = audio_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();

        with_retries(cancel, || {
            let bytes = bytes.clone();
            let file_name = file_name.clone();
            let language = language.to_string();
            let model = model.to_string();
            async move {
                cancellable(cancel, async {
                    let part = reqwest::multipart::Part::bytes(bytes)
                        .file_name(file_name)
                        .mime_str("application/octet-stream")
                        .map_err(|e| HandlerError::Fatal(e.to_string()))?;
                    let mut form = reqwest::multipart::Form::new()
                        .part("file", part)
                        .text("model", model)
                        .text("response_format", "vtt");
                    if language != "auto" {
                        form = form.text("language", language);
                    }

                    let response = self
                        .http
                        .post(&self.endpoint)
                        .bearer_auth(&self.api_key)
                        .multipart(form)
                        .send()
                        .await
                        .map_err(HandlerError::from_request)?;

                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    if !status.is_success() {
                        return Err(HandlerError::from_response(status, &text));
                    }
                    Ok(text)
                })
                .await
            }
        })
        .await
    }
}

#[async_trait]
impl TranscribeBackend for CloudApiBackend {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn transcribe(
        &self,
        cancel: &CancellationToken,
        req: &TranscribeRequest,
        progress: &ProgressReporter,
    ) -> Result<TranscribeOutput, HandlerError> {
        let model = req.model.clone().unwrap_or_else(|| "whisper-1".to_string());
        let workdir = tempfile_dir(&req.media_path)?;
        let wav_path = workdir.join("audio.wav");

        let result: Result<String, HandlerError> = async {
            extract_wav(&self.ffmpeg_path, &req.media_path, &wav_path).await?;
            progress.set(0.1).await;

            let wav_size = file_size(&wav_path).await?;
            if wav_size <= CLOUD_UPLOAD_CAP {
                let vtt = self
                    .upload_once(cancel, &wav_path, &req.language, &model)
                    .await?;
                return Ok(ensure_vtt_header(&vtt));
            }

            // Over the cap: try a lossy re-encode first.
            let mp3_path = workdir.join("audio.mp3");
            encode_mp3(&self.ffmpeg_path, &wav_path, &mp3_path).await?;
            if file_size(&mp3_path).await? <= CLOUD_UPLOAD_CAP {
                let vtt = self
                    .upload_once(cancel, &mp3_path, &req.language, &model)
                    .await?;
                return Ok(ensure_vtt_header(&vtt));
            }

            // Still oversize: split into fixed chunks and stitch the cues
            // back with per-chunk offsets.
            let duration_secs = (wav_size.saturating_sub(44)) as f64 / WAV_BYTES_PER_SEC;
            let chunk_count = (duration_secs / CHUNK_SECS).ceil().max(1.0) as usize;
            info!(chunk_count, "audio over upload cap, chunking");

            let mut all_cues = Vec::new();
            for chunk_index in 0..chunk_count {
                let offset = chunk_index as f64 * CHUNK_SECS;
                let chunk_path = workdir.join(format!("chunk_{:03}.wav", chunk_index));
                cut_chunk(&self.ffmpeg_path, &wav_path, &chunk_path, offset).await?;

                let vtt = self
                    .upload_once(cancel, &chunk_path, &req.language, &model)
                    .await?;
                let mut cues = parse_vtt(&ensure_vtt_header(&vtt));
                offset_cues(&mut cues, offset);
                all_cues.extend(cues);

                progress
                    .set(0.1 + 0.85 * (chunk_index + 1) as f64 / chunk_count as f64)
                    .await;
            }

            for (index, cue) in all_cues.iter_mut().enumerate() {
                cue.index = index;
            }
            Ok(render_vtt(&all_cues))
        }
        .await;

        let _ = tokio::fs::remove_dir_all(&workdir).await;
        let vtt = result?;

        Ok(TranscribeOutput {
            vtt,
            language: req.language.clone(),
        })
    }
}

/// Scratch directory next to the system temp dir, unique per job.
fn tempfile_dir(media_path: &Path) -> Result<PathBuf, HandlerError> {
    let stem = media_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("media");
    let dir = std::env::temp_dir().join(format!("homestream-{}-{}", stem, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)
        .map_err(|e| HandlerError::Fatal(format!("scratch dir failed: {}", e)))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retries_stop_after_three_backoffs() {
        tokio::time::pause();
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), HandlerError> = with_retries(&cancel, move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Transient("nope".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(HandlerError::Transient(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4, "initial try plus three retries");
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), HandlerError> = with_retries(&cancel, move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Fatal("out of memory".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(HandlerError::Fatal(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_sleep_is_cancellable() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), HandlerError> = with_retries(&cancel, || async {
            Err(HandlerError::Transient("nope".to_string()))
        })
        .await;

        assert!(matches!(result, Err(HandlerError::Cancelled)));
    }

    #[test]
    fn test_chunk_count_estimate() {
        // An hour of 16 kHz mono s16le is ~115 MB -> 6 chunks of 10 minutes.
        let wav_size: u64 = 3600 * 32_000 + 44;
        let duration = (wav_size - 44) as f64 / WAV_BYTES_PER_SEC;
        let chunks = (duration / CHUNK_SECS).ceil() as usize;
        assert_eq!(chunks, 6);
    }

    #[tokio::test]
    async fn test_local_upload_retries_transient_then_succeeds() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream hiccup"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "vtt": "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nhello\n",
                "language": "en"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let wav = dir.path().join("audio.wav");
        std::fs::write(&wav, b"RIFF....WAVE").expect("write wav");

        let backend = LocalServerBackend::new(server.uri(), PathBuf::from("ffmpeg"));
        let cancel = CancellationToken::new();

        let response = backend.upload(&cancel, &wav, "auto").await.expect("upload");
        assert_eq!(response.language.as_deref(), Some("en"));
        assert!(response.vtt.contains("hello"));
    }

    #[tokio::test]
    async fn test_local_upload_oom_body_is_not_retried() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string("CUDA error: out of memory"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let wav = dir.path().join("audio.wav");
        std::fs::write(&wav, b"RIFF....WAVE").expect("write wav");

        let backend = LocalServerBackend::new(server.uri(), PathBuf::from("ffmpeg"));
        let cancel = CancellationToken::new();

        let err = backend
            .upload(&cancel, &wav, "auto")
            .await
            .expect_err("oom is fatal");
        assert!(matches!(err, HandlerError::Fatal(_)));
    }
}
