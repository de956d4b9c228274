use async_trait::async_trait;
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::{
    Config, IMAGE_REFERENCE_INSTRUCTION, IMAGE_SYSTEM_PROMPT, PROMPT_SYSTEM_PROMPT,
};
use crate::db::models::CharacterTraits;
use crate::jobs::resilience::normalize_json_error;
use crate::llm::gateway::{Credentials, GatewayError, ModelGateway};
use crate::llm::media::{mime_type_for_base64, split_data_url};
use crate::utils::http::get_http_client;
use crate::utils::timing::log_llm_timing;

pub const NO_DESCRIPTION_MESSAGE: &str = "No description generated from the source image";

const REFUSAL_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
    "IMAGE_SAFETY",
    "IMAGE_PROHIBITED_CONTENT",
    "RECITATION",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
    block_reason_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
    finish_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
    Other(IgnoredAny),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub base_url: String,
    pub prompt_model: String,
    pub image_model: String,
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub max_output_tokens: i32,
    pub safety_profile: String,
}

impl GeminiSettings {
    pub fn from_config(config: &Config) -> Self {
        GeminiSettings {
            base_url: config.gemini_base_url.clone(),
            prompt_model: config.gemini_prompt_model.clone(),
            image_model: config.gemini_image_model.clone(),
            temperature: config.gemini_temperature,
            top_k: config.gemini_top_k,
            top_p: config.gemini_top_p,
            max_output_tokens: config.gemini_max_output_tokens,
            safety_profile: config.gemini_safety_settings.clone(),
        }
    }
}

/// Gemini `generateContent` client. Holds no credential of its own; the key
/// is resolved for every request.
#[derive(Debug, Clone)]
pub struct GeminiGateway {
    settings: GeminiSettings,
    credentials: Credentials,
}

impl GeminiGateway {
    pub fn new(settings: GeminiSettings, credentials: Credentials) -> Self {
        GeminiGateway {
            settings,
            credentials,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            GeminiSettings::from_config(config),
            Credentials::from_env("GEMINI_API_KEY", config.gemini_api_key.clone()),
        )
    }

    async fn generate_content(
        &self,
        model: &str,
        payload: Value,
    ) -> Result<GeminiResponse, GatewayError> {
        let api_key = self
            .credentials
            .resolve()
            .ok_or(GatewayError::MissingCredential)?;
        let url = format!(
            "{}/models/{}:generateContent",
            self.settings.base_url, model
        );

        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(target: "llm.gemini", model = model, payload = %summarize_gemini_payload(&payload));
        }

        let response = get_http_client()
            .post(&url)
            .header("x-goog-api-key", &api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                let err_text = redact_api_key(&err.to_string(), &api_key);
                warn!(
                    "Gemini request failed to send: {} (timeout={}, connect={})",
                    err_text,
                    err.is_timeout(),
                    err.is_connect()
                );
                GatewayError::Transport(err_text)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (message, body_summary) = summarize_error_body(&body);
            warn!("Gemini API error: status={}, body={}", status, body_summary);
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message: message.unwrap_or(body_summary),
            });
        }

        let value = response
            .json::<GeminiResponse>()
            .await
            .map_err(|err| GatewayError::Transport(format!("invalid Gemini response: {err}")))?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(target: "llm.gemini", model = model, response = %summarize_gemini_response(&value));
        }
        Ok(value)
    }

    fn generation_config(&self) -> Value {
        json!({
            "temperature": self.settings.temperature,
            "topK": self.settings.top_k,
            "topP": self.settings.top_p,
            "maxOutputTokens": self.settings.max_output_tokens,
        })
    }

    fn build_prompt_payload(&self, source_image: &str, traits: &CharacterTraits) -> Value {
        json!({
            "systemInstruction": { "parts": [{ "text": PROMPT_SYSTEM_PROMPT }] },
            "contents": [{
                "role": "user",
                "parts": [
                    inline_image_part(source_image),
                    { "text": format_traits(traits) },
                ],
            }],
            "generationConfig": self.generation_config(),
            "safetySettings": build_safety_settings(&self.settings.safety_profile),
        })
    }

    fn build_image_payload(&self, prompt: &str, reference_image: Option<&str>) -> Value {
        let mut parts = vec![json!({ "text": prompt })];
        if let Some(reference) = reference_image {
            parts.push(json!({ "text": IMAGE_REFERENCE_INSTRUCTION }));
            parts.push(inline_image_part(reference));
        }

        json!({
            "systemInstruction": { "parts": [{ "text": IMAGE_SYSTEM_PROMPT }] },
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": { "responseModalities": ["TEXT", "IMAGE"] },
            "safetySettings": build_safety_settings(&self.settings.safety_profile),
        })
    }
}

#[async_trait]
impl ModelGateway for GeminiGateway {
    async fn synthesize_prompt(
        &self,
        source_image: &str,
        traits: &CharacterTraits,
    ) -> Result<String, GatewayError> {
        let model = self.settings.prompt_model.as_str();
        let payload = self.build_prompt_payload(source_image, traits);
        log_llm_timing("gemini", model, "synthesize_prompt", None, || async move {
            let response = self.generate_content(model, payload).await?;
            prompt_from_response(response)
        })
        .await
    }

    async fn synthesize_image(
        &self,
        prompt: &str,
        reference_image: Option<&str>,
    ) -> Result<String, GatewayError> {
        let model = self.settings.image_model.as_str();
        let payload = self.build_image_payload(prompt, reference_image);
        let metadata = json!({ "hasReference": reference_image.is_some() });
        log_llm_timing("gemini", model, "synthesize_image", Some(metadata), || async move {
            let response = self.generate_content(model, payload).await?;
            image_from_response(response, model)
        })
        .await
    }

    fn has_credential(&self) -> bool {
        self.credentials.resolve().is_some()
    }
}

fn redact_api_key(text: &str, api_key: &str) -> String {
    if api_key.trim().is_empty() {
        return text.to_string();
    }
    text.replace(api_key, "[redacted]")
}

fn build_safety_settings(profile: &str) -> Vec<Value> {
    let threshold = match profile {
        "standard" => "BLOCK_MEDIUM_AND_ABOVE",
        _ => "OFF",
    };

    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
        "HARM_CATEGORY_CIVIC_INTEGRITY",
    ]
    .iter()
    .map(|category| json!({ "category": category, "threshold": threshold }))
    .collect()
}

fn inline_image_part(image: &str) -> Value {
    let (_, payload) = split_data_url(image);
    json!({
        "inlineData": {
            "mimeType": mime_type_for_base64(image),
            "data": payload.trim(),
        }
    })
}

fn format_traits(traits: &CharacterTraits) -> String {
    format!(
        "CHARACTER TRAITS\n\
         - Hair color: {}\n\
         - Hair length: {}\n\
         - Hair texture: {}\n\
         - Eye color: {}\n\
         - Skin tone: {}",
        traits.hair_color.trim(),
        traits.hair_length_or_default(),
        traits.hair_texture_or_default(),
        traits.eye_color.trim(),
        traits.skin_color.trim()
    )
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_gemini_payload(payload: &Value) -> Value {
    let mut summary = Map::new();
    if let Some(contents) = payload.get("contents").and_then(Value::as_array) {
        let parts: Vec<Value> = contents
            .iter()
            .filter_map(|content| content.get("parts").and_then(Value::as_array))
            .flatten()
            .map(|part| {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    json!({ "text": truncate_for_log(text, 200) })
                } else if let Some(inline_data) = part.get("inlineData") {
                    let data_len = inline_data
                        .get("data")
                        .and_then(Value::as_str)
                        .map(str::len)
                        .unwrap_or(0);
                    json!({ "inlineData": { "mimeType": inline_data.get("mimeType"), "dataLen": data_len } })
                } else {
                    json!({ "unknownPart": true })
                }
            })
            .collect();
        summary.insert("parts".to_string(), Value::Array(parts));
    }
    if let Some(config) = payload.get("generationConfig") {
        summary.insert("generationConfig".to_string(), config.clone());
    }
    Value::Object(summary)
}

fn summarize_gemini_response(response: &GeminiResponse) -> Value {
    let mut text_parts = 0usize;
    let mut image_parts = 0usize;
    for part in response_parts(response) {
        match part {
            GeminiPart::Text { .. } => text_parts += 1,
            GeminiPart::InlineData { inline_data } if inline_data.mime_type.starts_with("image/") => {
                image_parts += 1
            }
            _ => {}
        }
    }

    json!({
        "candidates": response.candidates.as_ref().map(Vec::len).unwrap_or(0),
        "textParts": text_parts,
        "imageParts": image_parts,
        "blockReason": response.prompt_feedback.as_ref().and_then(|feedback| feedback.block_reason.clone()),
    })
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return (
            Some(normalize_json_error(&value)),
            truncate_for_log(&value.to_string(), 2000),
        );
    }

    (None, truncate_for_log(trimmed, 2000))
}

fn response_parts(response: &GeminiResponse) -> impl Iterator<Item = &GeminiPart> {
    response
        .candidates
        .iter()
        .flatten()
        .filter_map(|candidate| candidate.content.as_ref())
        .filter_map(|content| content.parts.as_ref())
        .flatten()
}

fn refusal_in(response: &GeminiResponse) -> Option<GatewayError> {
    if let Some(feedback) = &response.prompt_feedback {
        if let Some(reason) = feedback.block_reason.as_deref().filter(|r| !r.is_empty()) {
            return Some(GatewayError::Refusal {
                reason: reason.to_string(),
                message: feedback
                    .block_reason_message
                    .clone()
                    .unwrap_or_else(|| "The request was blocked by the model's safety filters".to_string()),
            });
        }
    }

    response
        .candidates
        .iter()
        .flatten()
        .find_map(|candidate| {
            let reason = candidate.finish_reason.as_deref()?;
            if !REFUSAL_FINISH_REASONS.contains(&reason) {
                return None;
            }
            Some(GatewayError::Refusal {
                reason: reason.to_string(),
                message: candidate
                    .finish_message
                    .clone()
                    .unwrap_or_else(|| "The model declined to produce a result".to_string()),
            })
        })
}

fn collect_text(response: &GeminiResponse) -> String {
    response_parts(response)
        .filter_map(|part| match part {
            GeminiPart::Text { text } if !text.trim().is_empty() => Some(text.trim()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn prompt_from_response(response: GeminiResponse) -> Result<String, GatewayError> {
    let text = collect_text(&response);
    if !text.is_empty() {
        return Ok(text);
    }
    if let Some(refusal) = refusal_in(&response) {
        return Err(refusal);
    }
    Err(GatewayError::EmptyResult(NO_DESCRIPTION_MESSAGE.to_string()))
}

fn image_from_response(response: GeminiResponse, model: &str) -> Result<String, GatewayError> {
    let image = response_parts(&response).find_map(|part| match part {
        GeminiPart::InlineData { inline_data }
            if inline_data.mime_type.starts_with("image/") && !inline_data.data.is_empty() =>
        {
            Some(inline_data.data.clone())
        }
        _ => None,
    });
    if let Some(image) = image {
        return Ok(image);
    }
    if let Some(refusal) = refusal_in(&response) {
        return Err(refusal);
    }

    let text = collect_text(&response);
    let detail = if text.is_empty() {
        String::new()
    } else {
        format!(": {}", truncate_for_log(&text, 300))
    };
    Err(GatewayError::EmptyResult(format!(
        "No image returned by the model (model: {model}){detail}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> GeminiResponse {
        serde_json::from_value(value).unwrap()
    }

    fn gateway() -> GeminiGateway {
        GeminiGateway::new(
            GeminiSettings {
                base_url: "http://127.0.0.1:9/v1beta".to_string(),
                prompt_model: "prompt-model".to_string(),
                image_model: "image-model".to_string(),
                temperature: 0.4,
                top_k: 40,
                top_p: 0.95,
                max_output_tokens: 2048,
                safety_profile: "standard".to_string(),
            },
            Credentials::with_resolver(|| None),
        )
    }

    fn traits() -> CharacterTraits {
        CharacterTraits {
            hair_color: "brown".to_string(),
            eye_color: "green".to_string(),
            skin_color: "fair".to_string(),
            hair_length: Some("long".to_string()),
            hair_texture: None,
        }
    }

    #[test]
    fn prompt_text_is_joined_across_parts() {
        let response = parse(json!({
            "candidates": [{
                "content": { "parts": [{ "text": " A woman " }, { "thoughtSignature": "x" }, { "text": "smiling" }] },
                "finishReason": "STOP"
            }]
        }));
        assert_eq!(prompt_from_response(response).unwrap(), "A woman\nsmiling");
    }

    #[test]
    fn blocked_prompt_is_a_refusal() {
        let response = parse(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        }));
        let err = prompt_from_response(response).unwrap_err();
        assert!(matches!(err, GatewayError::Refusal { ref reason, .. } if reason == "SAFETY"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn blank_prompt_is_an_empty_result() {
        let response = parse(json!({
            "candidates": [{ "content": { "parts": [{ "text": "   " }] }, "finishReason": "STOP" }]
        }));
        assert_eq!(
            prompt_from_response(response).unwrap_err(),
            GatewayError::EmptyResult(NO_DESCRIPTION_MESSAGE.to_string())
        );
    }

    #[test]
    fn first_inline_image_is_returned() {
        let response = parse(json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "Here you go" },
                    { "inlineData": { "mimeType": "image/png", "data": "SU1H" } }
                ] }
            }]
        }));
        assert_eq!(image_from_response(response, "image-model").unwrap(), "SU1H");
    }

    #[test]
    fn image_safety_finish_is_a_refusal() {
        let response = parse(json!({
            "candidates": [{ "finishReason": "IMAGE_SAFETY", "finishMessage": "Unable to show" }]
        }));
        assert_eq!(
            image_from_response(response, "image-model").unwrap_err(),
            GatewayError::Refusal {
                reason: "IMAGE_SAFETY".to_string(),
                message: "Unable to show".to_string(),
            }
        );
    }

    #[test]
    fn text_only_image_response_is_an_empty_result() {
        let response = parse(json!({
            "candidates": [{ "content": { "parts": [{ "text": "I cannot draw that" }] }, "finishReason": "STOP" }]
        }));
        match image_from_response(response, "image-model").unwrap_err() {
            GatewayError::EmptyResult(message) => {
                assert!(message.contains("No image returned"));
                assert!(message.contains("I cannot draw that"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn error_body_message_is_extracted() {
        let (message, summary) =
            summarize_error_body(r#"{"error": {"code": 429, "message": "Resource exhausted"}}"#);
        assert_eq!(message.as_deref(), Some("Resource exhausted"));
        assert!(summary.contains("429"));

        let (message, summary) = summarize_error_body("<html>Bad gateway</html>");
        assert_eq!(message, None);
        assert_eq!(summary, "<html>Bad gateway</html>");
    }

    #[test]
    fn prompt_payload_carries_image_and_traits() {
        let payload = gateway().build_prompt_payload("data:image/png;base64,AAAA", &traits());
        let parts = payload.pointer("/contents/0/parts").unwrap();
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[0]["inlineData"]["data"], "AAAA");
        let text = parts[1]["text"].as_str().unwrap();
        assert!(text.contains("Hair color: brown"));
        assert!(text.contains("Hair length: long"));
        assert!(text.contains("Hair texture: straight"));
        assert_eq!(
            payload["safetySettings"][0]["threshold"],
            "BLOCK_MEDIUM_AND_ABOVE"
        );
    }

    #[test]
    fn image_payload_attaches_reference_only_when_present() {
        let without = gateway().build_image_payload("P", None);
        assert_eq!(without.pointer("/contents/0/parts").unwrap().as_array().unwrap().len(), 1);

        let with = gateway().build_image_payload("P", Some("SU1H"));
        let parts = with.pointer("/contents/0/parts").unwrap().as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2]["inlineData"]["data"], "SU1H");
        assert_eq!(
            with.pointer("/generationConfig/responseModalities/1").unwrap(),
            "IMAGE"
        );
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let gateway = gateway();
        assert!(!gateway.has_credential());
        assert_eq!(
            gateway.synthesize_prompt("SU1H", &traits()).await.unwrap_err(),
            GatewayError::MissingCredential
        );
    }

    #[test]
    fn api_key_is_redacted_from_errors() {
        assert_eq!(
            redact_api_key("GET https://x/?key=secret failed", "secret"),
            "GET https://x/?key=[redacted] failed"
        );
    }
}
