use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::config::AnalyzerConfig;
use super::{AnalysisRequest, Analyzer, AnalyzerError};

/// Analyzer reached over HTTP.
///
/// Posts `{kind, vehicle_id, context}` as JSON and expects `{"text": "..."}`.
pub struct HttpAnalyzer {
    endpoint: String,
    api_key: Option<String>,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct AnalyzerReply {
    text: Option<String>,
}

impl HttpAnalyzer {
    pub fn new(config: &AnalyzerConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .context("analyzer.endpoint is not configured")?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build analyzer HTTP client")?;

        Ok(Self {
            endpoint,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            headers: config.headers.clone(),
            client,
        })
    }
}

fn classify_transport(e: reqwest::Error) -> AnalyzerError {
    if e.is_timeout() {
        AnalyzerError::Timeout(e.to_string())
    } else if e.is_decode() {
        AnalyzerError::Malformed(e.to_string())
    } else {
        AnalyzerError::Upstream(e.to_string())
    }
}

pub(crate) fn classify_status(status: StatusCode) -> Option<AnalyzerError> {
    if status.is_success() {
        return None;
    }
    let detail = format!("HTTP {}", status);
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => AnalyzerError::RateLimited(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AnalyzerError::Timeout(detail),
        _ => AnalyzerError::Upstream(detail),
    })
}

pub(crate) fn reply_text(body: &[u8]) -> Result<String, AnalyzerError> {
    let reply: AnalyzerReply = serde_json::from_slice(body)
        .map_err(|e| AnalyzerError::Malformed(format!("invalid reply body: {}", e)))?;
    reply
        .text
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AnalyzerError::Malformed("reply has no text".into()))
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    fn name(&self) -> &str { "http" }

    async fn call(&self, request: &AnalysisRequest) -> Result<String, AnalyzerError> {
        let payload = json!({
            "kind": request.kind,
            "vehicle_id": &request.vehicle_id,
            "context": &request.context,
        });

        let mut req = self.client.post(&self.endpoint).json(&payload);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }

        let resp = req.send().await.map_err(classify_transport)?;
        if let Some(err) = classify_status(resp.status()) {
            return Err(err);
        }

        let body = resp.bytes().await.map_err(classify_transport)?;
        let text = reply_text(&body)?;
        tracing::debug!(kind = %request.kind, chars = text.len(), "Analyzer replied");
        Ok(text)
    }
}
