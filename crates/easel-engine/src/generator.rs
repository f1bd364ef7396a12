use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use easel_contracts::requests::GenerationRequest;
use easel_contracts::sources::ReferenceRole;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::config::GeminiConfig;
use crate::error::{FetchError, FetchResult};
use crate::resolver::ResolvedBytes;

const DIAGNOSTIC_CHARS: usize = 512;

/// Reference material already fetched for one generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerationInputs {
    pub references: Vec<(ReferenceRole, ResolvedBytes)>,
    pub pose: Option<ResolvedBytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime: Option<String>,
}

pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;

    fn generate(
        &self,
        request: &GenerationRequest,
        inputs: &GenerationInputs,
        api_key_override: Option<&str>,
    ) -> FetchResult<GeneratedImage>;

    fn has_credentials(&self, api_key_override: Option<&str>) -> bool;
}

pub struct GeminiGenerator {
    config: GeminiConfig,
    http: HttpClient,
}

impl GeminiGenerator {
    pub fn new(config: GeminiConfig) -> anyhow::Result<Self> {
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build Gemini HTTP client")?;
        Ok(Self { config, http })
    }

    fn api_key<'a>(&'a self, api_key_override: Option<&'a str>) -> Option<&'a str> {
        let usable = |value: &'a str| Some(value.trim()).filter(|value| !value.is_empty());
        api_key_override
            .and_then(usable)
            .or_else(|| self.config.api_key.as_deref().and_then(usable))
    }

    fn endpoint_for_model(&self) -> String {
        let api_base = self.config.api_base.trim().trim_end_matches('/');
        let trimmed = self.config.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{api_base}/{model_path}:generateContent")
    }

    /// References in role order, then the pose, then the prompt text.
    pub fn build_parts(request: &GenerationRequest, inputs: &GenerationInputs) -> Vec<Value> {
        let mut parts = Vec::new();
        for (_, resolved) in &inputs.references {
            parts.push(inline_part(resolved));
        }
        if let Some(pose) = inputs.pose.as_ref() {
            parts.push(inline_part(pose));
        }
        parts.push(json!({ "text": request.prompt() }));
        parts
    }

    pub fn build_payload(request: &GenerationRequest, inputs: &GenerationInputs) -> Value {
        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            Value::Array(vec![json!({
                "role": "user",
                "parts": Self::build_parts(request, inputs),
            })]),
        );
        payload.insert(
            "generationConfig".to_string(),
            json!({
                "responseModalities": ["IMAGE"],
                "imageConfig": { "aspectRatio": request.aspect_ratio() },
            }),
        );
        Value::Object(payload)
    }

    fn extract_first_image(response_payload: &Value) -> FetchResult<Option<GeneratedImage>> {
        let candidates = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                let Some(inline) = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                else {
                    continue;
                };
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let bytes = BASE64.decode(data.as_bytes()).map_err(|err| {
                    FetchError::Upstream(format!("Gemini image base64 decode failed: {err}"))
                })?;
                let mime = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return Ok(Some(GeneratedImage { bytes, mime }));
            }
        }
        Ok(None)
    }
}

impl ImageGenerator for GeminiGenerator {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        inputs: &GenerationInputs,
        api_key_override: Option<&str>,
    ) -> FetchResult<GeneratedImage> {
        let Some(api_key) = self.api_key(api_key_override) else {
            return Err(FetchError::Upstream("GEMINI_API_KEY not configured".to_string()));
        };
        let endpoint = self.endpoint_for_model();
        let payload = Self::build_payload(request, inputs);
        tracing::info!(
            model = %self.config.model,
            category = ?request.category(),
            references = inputs.references.len(),
            pose = inputs.pose.is_some(),
            "requesting generation"
        );

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .json(&payload)
            .send()
            .map_err(|err| FetchError::Upstream(format!("Gemini request failed: {err}")))?;
        let response_payload = response_json_or_error("Gemini", response)?;
        match Self::extract_first_image(&response_payload)? {
            Some(image) => Ok(image),
            None => Err(FetchError::Upstream(format!(
                "Gemini returned no image: {}",
                truncate_text(&response_payload.to_string(), DIAGNOSTIC_CHARS)
            ))),
        }
    }

    fn has_credentials(&self, api_key_override: Option<&str>) -> bool {
        self.api_key(api_key_override).is_some()
    }
}

fn inline_part(resolved: &ResolvedBytes) -> Value {
    json!({
        "inlineData": {
            "mimeType": resolved.mime,
            "data": BASE64.encode(&resolved.bytes),
        }
    })
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> FetchResult<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| FetchError::Upstream(format!("{provider} response body read failed: {err}")))?;
    if !status.is_success() {
        return Err(FetchError::Upstream(format!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, DIAGNOSTIC_CHARS)
        )));
    }
    serde_json::from_str(&body).map_err(|_| {
        FetchError::Upstream(format!(
            "{provider} returned invalid JSON payload: {}",
            truncate_text(&body, DIAGNOSTIC_CHARS)
        ))
    })
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
