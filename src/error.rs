use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),

    #[error("Media root does not exist: {0}")]
    MediaRootMissing(PathBuf),
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("No usable streams: {0}")]
    Unreadable(String),

    #[error("Probe failed: {0}")]
    Probe(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Transcoder could not be started: {0}")]
    EncoderStartup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by transcribe/translate handlers. `Transient` is retried
/// with backoff; `Fatal` fails the job with the message; `Cancelled` maps to
/// the terminal `cancelled` job status.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Classify a reqwest failure. Connection-level failures and timeouts are
    /// retryable; anything else from the client side is not.
    pub fn from_request(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }

    /// Classify an HTTP status + body pair. 5xx is transient unless the body
    /// matches an out-of-memory pattern; 4xx is fatal.
    pub fn from_response(status: reqwest::StatusCode, body: &str) -> Self {
        if looks_like_oom(body) {
            return Self::Fatal(format!("engine out of memory: {}", truncate(body, 200)));
        }
        if status.is_server_error() {
            Self::Transient(format!("server error {}: {}", status, truncate(body, 200)))
        } else {
            Self::Fatal(format!("request rejected {}: {}", status, truncate(body, 200)))
        }
    }
}

fn looks_like_oom(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("out of memory")
        || lower.contains("cuda error")
        || lower.contains("oom")
        || lower.contains("insufficient memory")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("Job {id} is {status}, expected one of: {expected}")]
    InvalidState {
        id: uuid::Uuid,
        status: String,
        expected: &'static str,
    },

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("Internal job error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
