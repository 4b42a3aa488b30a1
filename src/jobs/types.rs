use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Work lanes. Transcription is GPU-bound, translation is network-bound;
/// each lane runs one job at a time so they never contend for the same
/// resource while still overlapping each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Transcribe,
    Translate,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::Translate => "translate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transcribe" => Some(Self::Transcribe),
            "translate" => Some(Self::Translate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A persisted background job. The row is the single source of truth for
/// status; channel membership and cancellation handles are in-memory
/// conveniences rebuilt on restart.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub file_path: String,
    pub params: serde_json::Value,
    pub progress: f64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters of a transcription job. `translate` chains a follow-up
/// translation job onto successful completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeParams {
    /// Backend discriminator, e.g. "local" or "cloud".
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Language hint: "auto" or an ISO code.
    #[serde(default = "default_language")]
    pub language: String,
    /// Model id to align the transcription server to, when it supports it.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub translate: Option<TranslateConfig>,
}

impl Default for TranscribeParams {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            language: default_language(),
            model: None,
            translate: None,
        }
    }
}

fn default_engine() -> String {
    "local".to_string()
}

fn default_language() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateConfig {
    /// LLM discriminator, e.g. "gemini" or "openai".
    pub engine: String,
    pub target_language: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default)]
    pub custom_prompt: Option<String>,
}

fn default_preset() -> String {
    "movie".to_string()
}

/// Parameters of a translation job: the source subtitle and the LLM config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateParams {
    pub source: String,
    #[serde(flatten)]
    pub config: TranslateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeResult {
    pub subtitle_path: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslateResult {
    pub subtitle_path: String,
    pub cue_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn test_transcribe_params_defaults() {
        let params: TranscribeParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.engine, "local");
        assert_eq!(params.language, "auto");
        assert!(params.translate.is_none());
    }

    #[test]
    fn test_translate_params_flatten() {
        let params: TranslateParams = serde_json::from_str(
            r#"{"source": "a.vtt", "engine": "gemini", "target_language": "ko", "preset": "anime"}"#,
        )
        .unwrap();
        assert_eq!(params.source, "a.vtt");
        assert_eq!(params.config.engine, "gemini");
        assert_eq!(params.config.preset, "anime");
    }
}
