//! Ollama LLM adapter.
//!
//! One small client shared by the guardian and the explainer. Callers treat
//! the LLM as best-effort: any transport, status, or decode failure returns
//! `None` and the caller falls back to its deterministic path.

use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::Config;

#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.ollama_url.clone(),
            cfg.ollama_model.clone(),
            cfg.ollama_timeout(),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a completion, or `None` on any failure. Low temperature for
    /// consistent analysis; response length capped.
    pub async fn generate(&self, prompt: &str) -> Option<String> {
        let start = Instant::now();
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.3,
                "num_predict": 500,
            },
        });

        let result = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await;

        let resp = match result {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!(status = %resp.status(), "ollama returned non-success");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "ollama unreachable");
                return None;
            }
        };

        match resp.json::<GenerateResponse>().await {
            Ok(parsed) if !parsed.response.trim().is_empty() => {
                debug!(
                    model = %self.model,
                    latency_ms = start.elapsed().as_millis() as u64,
                    chars = parsed.response.len(),
                    "ollama completion"
                );
                Some(parsed.response)
            }
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "ollama response decode failed");
                None
            }
        }
    }
}
