use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::error::HandlerError;
use crate::jobs::queue::{JobHandler, ProgressReporter};
use crate::jobs::types::{Job, TranscribeParams, TranscribeResult, TranslateParams, TranslateResult};
use crate::subtitles::cues::{parse_vtt, render_vtt};
use crate::subtitles::transcribe::{
    CloudApiBackend, LocalServerBackend, TranscribeBackend, TranscribeRequest,
};
use crate::subtitles::translate::{client_for, translate_cues};

/// Transcription lane handler: picks the engine by discriminator, runs the
/// backend, writes the produced subtitle next to the media file.
pub struct TranscribeJobHandler {
    config: Arc<Config>,
}

impl TranscribeJobHandler {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Resolve an engine discriminator of the form "name" or "name:model".
    /// The suffix is a model hint used when the job itself names none.
    fn backend_for(
        &self,
        engine: &str,
    ) -> Result<(Box<dyn TranscribeBackend>, Option<String>), HandlerError> {
        let (name, model_hint) = match engine.split_once(':') {
            Some((name, suffix)) => (name, Some(suffix.to_string())),
            None => (engine, None),
        };

        match name {
            "cloud" => {
                let key = self.config.cloud_transcribe_api_key.clone().ok_or_else(|| {
                    HandlerError::Fatal("CLOUD_TRANSCRIBE_API_KEY not configured".to_string())
                })?;
                Ok((
                    Box::new(CloudApiBackend::new(
                        "https://api.openai.com/v1/audio/transcriptions".to_string(),
                        key,
                        self.config.ffmpeg_path.clone(),
                    )),
                    model_hint,
                ))
            }
            _ => {
                let url = self.config.transcribe_server_url.clone().ok_or_else(|| {
                    HandlerError::Fatal("TRANSCRIBE_SERVER_URL not configured".to_string())
                })?;
                Ok((
                    Box::new(LocalServerBackend::new(url, self.config.ffmpeg_path.clone())),
                    model_hint,
                ))
            }
        }
    }
}

#[async_trait]
impl JobHandler for TranscribeJobHandler {
    async fn run(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<serde_json::Value, HandlerError> {
        let params: TranscribeParams = serde_json::from_value(job.params.clone())
            .map_err(|e| HandlerError::Fatal(format!("bad transcribe params: {}", e)))?;

        let media_path = PathBuf::from(&job.file_path);
        if !media_path.exists() {
            return Err(HandlerError::Fatal(format!(
                "media file missing: {}",
                job.file_path
            )));
        }

        let (backend, model_hint) = self.backend_for(&params.engine)?;
        let request = TranscribeRequest {
            media_path: media_path.clone(),
            language: params.language.clone(),
            model: params.model.clone().or(model_hint),
        };

        let output = backend.transcribe(cancel, &request, progress).await?;

        let subtitle_path = subtitle_output_path(&media_path, "whisper", &output.language);
        tokio::fs::write(&subtitle_path, &output.vtt)
            .await
            .map_err(|e| HandlerError::Fatal(format!("subtitle write failed: {}", e)))?;

        info!(
            job_id = %job.id,
            subtitle = %subtitle_path.display(),
            engine = backend.name(),
            "subtitle generated"
        );

        let result = TranscribeResult {
            subtitle_path: subtitle_path.to_string_lossy().into_owned(),
            language: output.language,
        };
        serde_json::to_value(result).map_err(|e| HandlerError::Fatal(e.to_string()))
    }
}

/// Translation lane handler: parses the source subtitle into cues, drives
/// the batch translation, writes the translated WebVTT beside the source.
pub struct TranslateJobHandler {
    config: Arc<Config>,
}

impl TranslateJobHandler {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl JobHandler for TranslateJobHandler {
    async fn run(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<serde_json::Value, HandlerError> {
        let params: TranslateParams = serde_json::from_value(job.params.clone())
            .map_err(|e| HandlerError::Fatal(format!("bad translate params: {}", e)))?;

        let source_path = PathBuf::from(&params.source);
        let content = tokio::fs::read_to_string(&source_path)
            .await
            .map_err(|e| HandlerError::Fatal(format!("cannot read {}: {}", params.source, e)))?;

        let cues = parse_vtt(&content);
        if cues.is_empty() {
            return Err(HandlerError::Fatal(format!(
                "no cues in source subtitle: {}",
                params.source
            )));
        }

        let client = client_for(
            &params.config.engine,
            self.config.gemini_api_key.as_deref(),
            &self.config.gemini_translate_model,
            self.config.openai_api_key.as_deref(),
            &self.config.openai_translate_model,
        )?;

        let translated =
            translate_cues(client.as_ref(), cancel, &cues, &params.config, progress).await?;

        let output_path =
            subtitle_output_path(&source_path, "translated", &params.config.target_language);
        tokio::fs::write(&output_path, render_vtt(&translated))
            .await
            .map_err(|e| HandlerError::Fatal(format!("subtitle write failed: {}", e)))?;

        info!(
            job_id = %job.id,
            subtitle = %output_path.display(),
            engine = client.name(),
            "subtitle translated"
        );

        let result = TranslateResult {
            subtitle_path: output_path.to_string_lossy().into_owned(),
            cue_count: translated.len(),
        };
        serde_json::to_value(result).map_err(|e| HandlerError::Fatal(e.to_string()))
    }
}

/// "/media/ep1.mkv" -> "/media/ep1.whisper_ja.vtt";
/// "/media/ep1.whisper_ja.vtt" -> "/media/ep1.whisper_ja.translated_ko.vtt".
fn subtitle_output_path(base: &Path, kind: &str, language: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("subtitle");
    let name = format!("{}.{}_{}.vtt", stem, kind, language);
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtitle_output_paths() {
        assert_eq!(
            subtitle_output_path(Path::new("/media/ep1.mkv"), "whisper", "ja"),
            PathBuf::from("/media/ep1.whisper_ja.vtt")
        );
        assert_eq!(
            subtitle_output_path(Path::new("/media/ep1.whisper_ja.vtt"), "translated", "ko"),
            PathBuf::from("/media/ep1.whisper_ja.translated_ko.vtt")
        );
    }
}
