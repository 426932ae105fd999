use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::OllamaConfig;
use crate::error::{AppError, Result};

/// Anything that can turn a system prompt and a user prompt into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Client for an Ollama-style `/api/generate` endpoint.
pub struct OllamaClient {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    async fn send(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let body = GenerateRequest {
            model: &self.model,
            prompt: user_prompt,
            system: system_prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        let res = self.client.post(&self.endpoint).json(&body).send().await?;

        let status = res.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), endpoint = %self.endpoint, "generation endpoint returned an error");
            return Err(AppError::UpstreamError {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        let reply: GenerateResponse = res.json().await?;
        Ok(reply.response)
    }
}

#[async_trait]
impl TextGenerator for OllamaClient {
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        debug!(model = %self.model, prompt_len = user_prompt.len(), "requesting generation");

        // Dropping the request future on cancellation aborts the HTTP exchange.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            res = self.send(system_prompt, user_prompt) => res,
        }
    }
}
