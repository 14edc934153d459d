use crate::audio::DecodedAudio;
use crate::error::{EmotagError, Result};
use crate::recognize::{EmotionScores, Recognizer, TextClassifier};
use async_trait::async_trait;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Path of the batch audio emotion endpoint.
const AUDIO_ENDPOINT: &str = "/v1/emotion/audio";

/// Path of the text emotion endpoint.
const TEXT_ENDPOINT: &str = "/v1/emotion/text";

/// Maximum attempts per request.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 500;

/// Encode PCM samples as base64 little-endian `f32`.
pub fn encode_pcm(samples: &[f32]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// A failed attempt and whether it is worth repeating.
struct AttemptError {
    error: EmotagError,
    retryable: bool,
}

async fn post_once<B, R>(client: &reqwest::Client, url: &str, body: &B) -> std::result::Result<R, AttemptError>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let response = client.post(url).json(body).send().await.map_err(|e| AttemptError {
        error: e.into(),
        retryable: true,
    })?;

    let status = response.status();
    debug!("POST {} -> {}", url, status);

    if status.is_success() {
        let text = response.text().await.map_err(|e| AttemptError {
            error: e.into(),
            retryable: true,
        })?;
        return serde_json::from_str(&text).map_err(|e| AttemptError {
            error: e.into(),
            retryable: false,
        });
    }

    let body = response.text().await.unwrap_or_default();
    Err(AttemptError {
        error: EmotagError::Api(format!("{} returned {}: {}", url, status, body)),
        retryable: !status.is_client_error(),
    })
}

/// POST `body` as JSON, retrying transport and server errors with backoff.
async fn post_with_retry<B, R>(client: &reqwest::Client, url: &str, body: &B) -> Result<R>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    let mut last_error = None;

    for attempt in 0..MAX_RETRIES {
        if attempt > 0 {
            let delay = BASE_DELAY_MS * 2u64.pow(attempt - 1);
            debug!("Retry attempt {} after {}ms delay", attempt, delay);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match post_once(client, url, body).await {
            Ok(parsed) => return Ok(parsed),
            Err(AttemptError { error, retryable }) => {
                if !retryable {
                    return Err(error);
                }
                warn!("Attempt {} failed: {}", attempt + 1, error);
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| EmotagError::Api("Unknown error".to_string())))
}

#[derive(Debug, Serialize)]
struct AudioRequest {
    sample_rate: u32,
    granularity: &'static str,
    audio: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AudioResponse {
    results: Vec<EmotionScores>,
}

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

/// Client for an emotion2vec-style inference service.
pub struct HttpRecognizer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRecognizer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Use a preconfigured HTTP client (timeouts, proxies).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    async fn infer(&self, batch: &[DecodedAudio], sample_rate: u32) -> Result<Vec<EmotionScores>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let request = AudioRequest {
            sample_rate,
            granularity: "utterance",
            audio: batch.iter().map(|a| encode_pcm(&a.samples)).collect(),
        };

        let url = endpoint(&self.base_url, AUDIO_ENDPOINT);
        let response: AudioResponse = post_with_retry(&self.client, &url, &request).await?;

        if response.results.len() != batch.len() {
            return Err(EmotagError::Recognition(format!(
                "service returned {} results for {} clips",
                response.results.len(),
                batch.len()
            )));
        }

        Ok(response.results)
    }

    fn name(&self) -> &'static str {
        "HTTP emotion service"
    }
}

/// Client for a text emotion classification service.
pub struct HttpTextClassifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTextClassifier {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl TextClassifier for HttpTextClassifier {
    async fn classify(&self, text: &str) -> Result<EmotionScores> {
        let url = endpoint(&self.base_url, TEXT_ENDPOINT);
        post_with_retry(&self.client, &url, &TextRequest { text }).await
    }

    fn name(&self) -> &'static str {
        "HTTP text classifier"
    }
}
