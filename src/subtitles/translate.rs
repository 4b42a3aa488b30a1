use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::HandlerError;
use crate::jobs::queue::ProgressReporter;
use crate::jobs::types::TranslateConfig;
use crate::subtitles::cues::Cue;

/// Cues per LLM call. Larger batches amortize the prompt; smaller ones
/// bound the blast radius of a refused batch.
pub const BATCH_SIZE: usize = 50;

/// Separates cue texts in the prompt and in the expected completion.
pub const CUE_DELIMITER: &str = "\n<<<CUE>>>\n";

const RETRY_BACKOFF_SECS: [u64; 3] = [2, 4, 8];

#[derive(Error, Debug)]
pub enum TranslateError {
    /// The model refused the content (safety filter). Not retryable as-is;
    /// the batch gets subdivided instead.
    #[error("content blocked by the model")]
    Blocked,

    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<TranslateError> for HandlerError {
    fn from(err: TranslateError) -> Self {
        match err {
            TranslateError::Cancelled => HandlerError::Cancelled,
            TranslateError::Blocked => HandlerError::Fatal("content blocked".to_string()),
            TranslateError::Transient(m) => HandlerError::Transient(m),
            TranslateError::Fatal(m) => HandlerError::Fatal(m),
        }
    }
}

/// A chat-completion model. Implementations decide how refusals surface.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> Result<String, TranslateError>;
}

/// Build the instruction header for a batch from the preset.
pub fn build_prompt(config: &TranslateConfig, cue_count: usize) -> String {
    let style = match config.preset.as_str() {
        "anime" => {
            "These are anime subtitles. Keep honorifics (-san, -chan), \
             character voice, and casual register. Translate onomatopoeia \
             naturally."
        }
        "documentary" => {
            "These are documentary subtitles. Use precise, neutral language \
             and keep technical terms accurate."
        }
        "custom" => config.custom_prompt.as_deref().unwrap_or(""),
        _ => {
            "These are film subtitles. Keep the tone and brevity of spoken \
             dialogue."
        }
    };

    format!(
        "Translate the following {count} subtitle segments into {target}. {style}\n\
         Segments are separated by the marker {delim:?}. Reply with exactly \
         {count} translated segments separated by the same marker, in the \
         same order, with no numbering and no extra commentary.\n\n",
        count = cue_count,
        target = config.target_language,
        style = style,
        delim = CUE_DELIMITER.trim(),
    )
}

/// Translate all cues: fixed-size batches in order, recursive halving on
/// refused batches down to single cues, which pass through untranslated.
pub async fn translate_cues(
    client: &dyn LlmClient,
    cancel: &CancellationToken,
    cues: &[Cue],
    config: &TranslateConfig,
    progress: &ProgressReporter,
) -> Result<Vec<Cue>, HandlerError> {
    let mut translated: Vec<Cue> = Vec::with_capacity(cues.len());
    let batch_count = cues.len().div_ceil(BATCH_SIZE).max(1);

    for (batch_index, batch) in cues.chunks(BATCH_SIZE).enumerate() {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let outputs = translate_batch(client, cancel, config, &texts)
            .await
            .map_err(HandlerError::from)?;

        debug_assert_eq!(outputs.len(), batch.len());
        for (cue, text) in batch.iter().zip(outputs) {
            translated.push(Cue {
                index: translated.len(),
                start: cue.start,
                end: cue.end,
                text,
            });
        }

        progress
            .set((batch_index + 1) as f64 / batch_count as f64)
            .await;
    }

    info!(count = translated.len(), engine = client.name(), "translation complete");
    Ok(translated)
}

/// Translate one batch, halving on refusals. Worst case this costs
/// O(n log n) calls and still terminates: a single blocked cue passes
/// through with its original text.
fn translate_batch<'a>(
    client: &'a dyn LlmClient,
    cancel: &'a CancellationToken,
    config: &'a TranslateConfig,
    texts: &'a [String],
) -> BoxFuture<'a, Result<Vec<String>, TranslateError>> {
    async move {
        match call_model(client, cancel, config, texts).await {
            Ok(outputs) => Ok(outputs),
            Err(TranslateError::Blocked) => {
                if texts.len() == 1 {
                    warn!(text = %texts[0], "cue blocked at single-cue granularity, passing through");
                    return Ok(vec![texts[0].clone()]);
                }
                let mid = texts.len() / 2;
                debug!(size = texts.len(), "batch blocked, subdividing");
                let mut left = translate_batch(client, cancel, config, &texts[..mid]).await?;
                let right = translate_batch(client, cancel, config, &texts[mid..]).await?;
                left.extend(right);
                Ok(left)
            }
            Err(other) => Err(other),
        }
    }
    .boxed()
}

/// One model call with the transient-retry policy. A completion that does
/// not split back into the right number of segments is treated like a
/// refusal so subdivision can realign it; at single-cue size the whole
/// completion is the translation and the mismatch cannot recur.
async fn call_model(
    client: &dyn LlmClient,
    cancel: &CancellationToken,
    config: &TranslateConfig,
    texts: &[String],
) -> Result<Vec<String>, TranslateError> {
    let prompt = format!("{}{}", build_prompt(config, texts.len()), texts.join(CUE_DELIMITER));

    let mut attempt = 0;
    let completion = loop {
        match client.complete(cancel, &prompt).await {
            Err(TranslateError::Transient(msg)) if attempt < RETRY_BACKOFF_SECS.len() => {
                let delay = Duration::from_secs(RETRY_BACKOFF_SECS[attempt]);
                attempt += 1;
                warn!(attempt, error = %msg, "translate call failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
                }
            }
            other => break other?,
        }
    };

    if texts.len() == 1 {
        return Ok(vec![completion.trim().to_string()]);
    }

    let outputs: Vec<String> = completion
        .split(CUE_DELIMITER.trim())
        .map(|s| s.trim().to_string())
        .collect();

    if outputs.len() != texts.len() {
        warn!(
            expected = texts.len(),
            got = outputs.len(),
            "segment count mismatch, treating as blocked"
        );
        return Err(TranslateError::Blocked);
    }

    Ok(outputs)
}

/// Gemini generateContent API.
pub struct GeminiClient {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "promptFeedback")]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> Result<String, TranslateError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
            res = self.http.post(&url).json(&body).send() => {
                res.map_err(|e| classify_request_error(&e))?
            }
        };

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TranslateError::Transient(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let parsed: GeminiResponse = serde_json::from_str(&text)
            .map_err(|e| TranslateError::Fatal(format!("bad Gemini response: {}", e)))?;

        if parsed
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
            .is_some()
        {
            return Err(TranslateError::Blocked);
        }

        let Some(candidate) = parsed.candidates.into_iter().next() else {
            return Err(TranslateError::Blocked);
        };
        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Err(TranslateError::Blocked);
        }

        let completion = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect::<String>())
            .unwrap_or_default();
        if completion.is_empty() {
            return Err(TranslateError::Blocked);
        }
        Ok(completion)
    }
}

/// OpenAI-compatible chat completions API.
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn complete(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> Result<String, TranslateError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TranslateError::Cancelled),
            res = self.http.post(&url).bearer_auth(&self.api_key).json(&body).send() => {
                res.map_err(|e| classify_request_error(&e))?
            }
        };

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TranslateError::Transient(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| TranslateError::Fatal(format!("bad chat response: {}", e)))?;

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(TranslateError::Blocked);
        };
        if choice.finish_reason.as_deref() == Some("content_filter")
            || choice.message.refusal.is_some()
        {
            return Err(TranslateError::Blocked);
        }

        match choice.message.content {
            Some(content) if !content.is_empty() => Ok(content),
            _ => Err(TranslateError::Blocked),
        }
    }
}

fn classify_request_error(err: &reqwest::Error) -> TranslateError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        TranslateError::Transient(err.to_string())
    } else {
        TranslateError::Fatal(err.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> TranslateError {
    if status.as_u16() == 429 || status.is_server_error() {
        TranslateError::Transient(format!("{}: {}", status, body))
    } else {
        TranslateError::Fatal(format!("{}: {}", status, body))
    }
}

/// Pick the translation model by string discriminator.
pub fn client_for(
    engine: &str,
    gemini_key: Option<&str>,
    gemini_model: &str,
    openai_key: Option<&str>,
    openai_model: &str,
) -> Result<Box<dyn LlmClient>, HandlerError> {
    match engine.split(':').next().unwrap_or(engine) {
        "gemini" => {
            let key = gemini_key
                .ok_or_else(|| HandlerError::Fatal("GEMINI_API_KEY not configured".to_string()))?;
            Ok(Box::new(GeminiClient::new(
                key.to_string(),
                gemini_model.to_string(),
            )))
        }
        "openai" => {
            let key = openai_key
                .ok_or_else(|| HandlerError::Fatal("OPENAI_API_KEY not configured".to_string()))?;
            Ok(Box::new(OpenAiClient::new(
                "https://api.openai.com/v1".to_string(),
                key.to_string(),
                openai_model.to_string(),
            )))
        }
        other => Err(HandlerError::Fatal(format!(
            "unknown translation engine: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::JobStore;
    use parking_lot::Mutex;
    use uuid::Uuid;

    /// Mock model: blocks any prompt containing a poisoned cue until the
    /// batch is a single cue, and records every batch size it sees.
    struct MockLlm {
        poison: Option<String>,
        batch_sizes: Mutex<Vec<usize>>,
    }

    impl MockLlm {
        fn new(poison: Option<&str>) -> Self {
            Self {
                poison: poison.map(|s| s.to_string()),
                batch_sizes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn complete(
            &self,
            _cancel: &CancellationToken,
            prompt: &str,
        ) -> Result<String, TranslateError> {
            let body = prompt.split("\n\n").skip(1).collect::<Vec<_>>().join("\n\n");
            let segments: Vec<&str> = body.split(CUE_DELIMITER).collect();
            self.batch_sizes.lock().push(segments.len());

            if let Some(poison) = &self.poison {
                if segments.iter().any(|s| s.trim() == poison.as_str()) {
                    return Err(TranslateError::Blocked);
                }
            }

            Ok(segments
                .iter()
                .map(|s| format!("T:{}", s.trim()))
                .collect::<Vec<_>>()
                .join(CUE_DELIMITER))
        }
    }

    fn cues(n: usize) -> Vec<Cue> {
        (0..n)
            .map(|i| Cue {
                index: i,
                start: i as f64,
                end: i as f64 + 0.9,
                text: format!("line {}", i),
            })
            .collect()
    }

    fn config() -> TranslateConfig {
        TranslateConfig {
            engine: "mock".to_string(),
            target_language: "ko".to_string(),
            preset: "anime".to_string(),
            custom_prompt: None,
        }
    }

    fn reporter() -> ProgressReporter {
        ProgressReporter::new(JobStore::open_in_memory().unwrap(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_clean_batch_translates_in_order() {
        let client = MockLlm::new(None);
        let cancel = CancellationToken::new();
        let input = cues(75);

        let out = translate_cues(&client, &cancel, &input, &config(), &reporter())
            .await
            .unwrap();

        assert_eq!(out.len(), 75);
        for (i, cue) in out.iter().enumerate() {
            assert_eq!(cue.index, i);
            assert_eq!(cue.text, format!("T:line {}", i));
            assert_eq!(cue.start, input[i].start);
        }
        // 75 cues -> one 50-batch and one 25-batch.
        assert_eq!(*client.batch_sizes.lock(), vec![50, 25]);
    }

    #[tokio::test]
    async fn test_blocked_batch_subdivides_to_single_cue() {
        // Poison one cue in a full batch; the mock blocks every batch that
        // contains it until it stands alone.
        let client = MockLlm::new(Some("line 3"));
        let cancel = CancellationToken::new();
        let input = cues(50);

        let out = translate_cues(&client, &cancel, &input, &config(), &reporter())
            .await
            .unwrap();

        assert_eq!(out.len(), 50);
        // The poisoned cue passes through untranslated, everything else is
        // translated, order preserved.
        for (i, cue) in out.iter().enumerate() {
            if i == 3 {
                assert_eq!(cue.text, "line 3");
            } else {
                assert_eq!(cue.text, format!("T:line {}", i));
            }
        }

        // The halving path passes through the 50 -> 25 -> 12 -> 6 -> 3 -> 1 sizes.
        let sizes = client.batch_sizes.lock();
        for expected in [50usize, 25, 12, 6, 3, 1] {
            assert!(sizes.contains(&expected), "expected a batch of {} in {:?}", expected, *sizes);
        }
    }

    #[tokio::test]
    async fn test_count_mismatch_subdivides() {
        /// Returns one segment too few for multi-cue batches.
        struct Misaligned;

        #[async_trait]
        impl LlmClient for Misaligned {
            fn name(&self) -> &'static str {
                "misaligned"
            }
            async fn complete(
                &self,
                _cancel: &CancellationToken,
                prompt: &str,
            ) -> Result<String, TranslateError> {
                let body = prompt.split("\n\n").skip(1).collect::<Vec<_>>().join("\n\n");
                let mut segments: Vec<&str> = body.split(CUE_DELIMITER).collect();
                if segments.len() > 1 {
                    segments.pop();
                }
                Ok(segments
                    .iter()
                    .map(|s| format!("T:{}", s.trim()))
                    .collect::<Vec<_>>()
                    .join(CUE_DELIMITER))
            }
        }

        let cancel = CancellationToken::new();
        let input = cues(4);
        let out = translate_cues(&Misaligned, &cancel, &input, &config(), &reporter())
            .await
            .unwrap();

        assert_eq!(out.len(), 4);
        for (i, cue) in out.iter().enumerate() {
            assert_eq!(cue.text, format!("T:line {}", i));
        }
    }

    #[test]
    fn test_prompt_presets() {
        let mut cfg = config();
        assert!(build_prompt(&cfg, 10).contains("honorifics"));

        cfg.preset = "documentary".to_string();
        assert!(build_prompt(&cfg, 10).contains("neutral"));

        cfg.preset = "custom".to_string();
        cfg.custom_prompt = Some("Pirate speak only.".to_string());
        assert!(build_prompt(&cfg, 10).contains("Pirate speak only."));

        cfg.preset = "movie".to_string();
        assert!(build_prompt(&cfg, 10).contains("ko"));
    }
}
