use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::ProviderError;
use crate::messages::TokenUsage;
use crate::providers::{ChatMessage, CompletionRequest, CompletionResponse, LLMProvider};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

impl OpenAIConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

/// Chat-completions client for OpenAI and API-compatible endpoints.
#[derive(Debug, Clone)]
pub struct OpenAI {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAI {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::from_config(OpenAIConfig::new(api_key))
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| ProviderError::MissingApiKey("OPENAI_API_KEY"))?;
        let mut config = OpenAIConfig::new(api_key);
        if let Ok(base_url) = env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        Self::from_config(config)
    }

    pub fn from_config(config: OpenAIConfig) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: ChatMessage,
}

#[async_trait]
impl LLMProvider for OpenAI {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Provider(format!(
                "{status}: {}",
                body.chars().take(512).collect::<String>()
            )));
        }

        let parsed: WireResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(ProviderError::InvalidResponse("response has no choices"))?;

        Ok(CompletionResponse {
            message: choice.message,
            usage: parsed.usage,
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
