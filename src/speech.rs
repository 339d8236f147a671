use crate::config::SpeechConfig;
use crate::error::{StageError, StageResult};
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

/// Playable rendering of a notification, valid for one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechArtifact {
    pub source_url: String,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, language: &str) -> StageResult<SpeechArtifact>;
}

pub fn speech_url(endpoint: &str, text: &str, language: &str) -> StageResult<Url> {
    let len = text.chars().count().to_string();
    Url::parse_with_params(
        endpoint,
        &[
            ("ie", "UTF-8"),
            ("q", text),
            ("tl", language),
            ("client", "tw-ob"),
            ("total", "1"),
            ("idx", "0"),
            ("textlen", len.as_str()),
        ],
    )
    .map_err(|e| StageError::Synthesis(format!("invalid speech endpoint {}: {}", endpoint, e)))
}

/// Cast speakers fetch the audio themselves and some refuse TLS, so the
/// device always handed them a plain http URL.
pub fn downgrade_scheme(url: &mut Url) {
    if url.scheme() == "https" && url.set_scheme("http").is_err() {
        log::warn!("Cannot downgrade scheme of {}", url);
    }
}

/// Speech through the Google Translate TTS endpoint.
pub struct TranslateTts {
    config: SpeechConfig,
    user_agent: String,
    timeout: Duration,
}

impl TranslateTts {
    pub fn new(config: SpeechConfig, user_agent: String, timeout: Duration) -> Self {
        Self {
            config,
            user_agent,
            timeout,
        }
    }

    fn check_text(&self, text: &str) -> StageResult<()> {
        if text.trim().is_empty() {
            return Err(StageError::Synthesis("nothing to synthesize".into()));
        }
        let chars = text.chars().count();
        if chars > self.config.max_chars {
            return Err(StageError::Synthesis(format!(
                "text is {} characters, limit is {}",
                chars, self.config.max_chars
            )));
        }
        Ok(())
    }

    // One GET to make sure the service actually renders audio for this URL.
    async fn probe(&self, url: &Url) -> StageResult<()> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| StageError::Synthesis(format!("cannot build HTTP client: {}", e)))?;

        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| StageError::Synthesis(format!("speech request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StageError::Synthesis(format!("speech service returned {}", status)));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("audio/") {
            return Err(StageError::Synthesis(format!(
                "speech service returned {:?} instead of audio",
                content_type
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechSynthesizer for TranslateTts {
    async fn synthesize(&self, text: &str, language: &str) -> StageResult<SpeechArtifact> {
        log::info!("Synthesizing ({}): {}", language, text);
        self.check_text(text)?;

        let mut url = speech_url(&self.config.endpoint, text, language)?;
        self.probe(&url).await?;

        if self.config.plain_http {
            downgrade_scheme(&mut url);
        }
        log::info!("speech url={}", url);
        Ok(SpeechArtifact {
            source_url: url.into(),
        })
    }
}
