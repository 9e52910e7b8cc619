//! Extraction collaborator over an HTTP model gateway
//!
//! The gateway receives `{stage, prompt, variables}` and answers with the model's
//! reply, either as a JSON document or as text wrapping one.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use super::{CollaboratorError, Extractor};
use crate::pipeline::stages::ExtractionStage;
use crate::pipeline::variables::VariableBag;

/// Longest reply excerpt carried in an error message
const REPLY_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Serialize)]
struct ExtractionRequest<'a> {
    stage: &'a str,
    prompt: &'a str,
    variables: &'a VariableBag,
}

pub struct HttpExtractor {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpExtractor {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(
        &self,
        stage: ExtractionStage,
        prompt_key: &str,
        variables: &VariableBag,
    ) -> Result<Value, CollaboratorError> {
        let mut request = self.client.post(&self.endpoint).json(&ExtractionRequest {
            stage: stage.as_str(),
            prompt: prompt_key,
            variables,
        });
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(CollaboratorError::Status {
                status: response.status().as_u16(),
                url: self.endpoint.clone(),
            });
        }

        let body = response.text().await?;
        parse_model_reply(&body).ok_or_else(|| {
            let excerpt: String = body.chars().take(REPLY_EXCERPT_CHARS).collect();
            CollaboratorError::InvalidResponse(format!("non-JSON reply for {}: {}", stage, excerpt))
        })
    }
}

/// Parse a model reply as JSON, falling back to the outermost `{...}` block
pub fn parse_model_reply(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(text.trim()) {
        return Some(value);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
