use std::path::PathBuf;

use crate::error::ConfigError;

/// Server configuration, loaded from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the browsable media tree. All request paths are relative to it.
    pub media_root: PathBuf,
    /// Base directory for per-session transcode output.
    pub transcode_dir: PathBuf,
    /// Path of the sqlite job store.
    pub job_db_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub http_port: u16,
    /// Base URL of the self-hosted transcription server, if any.
    pub transcribe_server_url: Option<String>,
    /// API key for the cloud transcription engine.
    pub cloud_transcribe_api_key: Option<String>,
    /// API keys for translation engines.
    pub gemini_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    /// Model override for the OpenAI-compatible translation engine.
    pub openai_translate_model: String,
    pub gemini_translate_model: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let media_root = std::env::var("MEDIA_ROOT")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::Missing("MEDIA_ROOT"))?;

        if !media_root.is_dir() {
            return Err(ConfigError::MediaRootMissing(media_root));
        }

        let transcode_dir = std::env::var("TRANSCODE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./transcode"));

        let job_db_path = std::env::var("JOB_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./homestream-jobs.db"));

        let ffmpeg_path = std::env::var("FFMPEG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("ffmpeg"));

        let ffprobe_path = std::env::var("FFPROBE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("ffprobe"));

        let http_port = std::env::var("HTTP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("HTTP_PORT"))?;

        let transcribe_server_url = std::env::var("TRANSCRIBE_SERVER_URL").ok();
        let cloud_transcribe_api_key = std::env::var("CLOUD_TRANSCRIBE_API_KEY").ok();
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();
        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();

        let openai_translate_model =
            std::env::var("OPENAI_TRANSLATE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let gemini_translate_model = std::env::var("GEMINI_TRANSLATE_MODEL")
            .unwrap_or_else(|_| "gemini-2.0-flash".to_string());

        Ok(Self {
            media_root,
            transcode_dir,
            job_db_path,
            ffmpeg_path,
            ffprobe_path,
            http_port,
            transcribe_server_url,
            cloud_transcribe_api_key,
            gemini_api_key,
            openai_api_key,
            openai_translate_model,
            gemini_translate_model,
        })
    }
}
