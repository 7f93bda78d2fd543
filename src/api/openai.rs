use crate::api::generation::{GeneratedMedia, GenerationRequest, GenerationService};
use crate::config::Config;
use crate::error::{Result, StoryboardError};
use crate::logw;
use crate::script::{ScriptAnalyzer, ScriptDraft, draft_from_model_text};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

const ERROR_SNIPPET_CHARS: usize = 800;

const STRUCTURE_INSTRUCTIONS: &str = "Break the following script into a shot list for a film storyboard.\n\
- Group shots into scenes by location, in script order.\n\
- Every scene needs at least one shot. Every shot needs a concrete, drawable action.\n\
- shotType is one of: extreme wide, wide, establishing, medium, medium close-up, close-up, extreme close-up, over-the-shoulder, point-of-view, two-shot, insert.\n\
- Return STRICT JSON with this shape ONLY:\n\
  {\"title\":\"...\",\"scenes\":[{\"location\":\"...\",\"sceneDescription\":\"...\",\"shots\":[{\"shotType\":\"wide\",\"cameraMovement\":\"static\",\"composition\":\"...\",\"lighting\":\"...\",\"action\":\"...\",\"dialogue\":\"...\",\"styleNotes\":\"...\"}]}]}\n\
- Omit dialogue when nobody speaks.\n\nSCRIPT:\n";

fn trim_copy_utf8_safe(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return input.to_string();
    }

    let mut cut = max_bytes.min(input.len());
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    input[..cut].to_string()
}

fn snippet(raw: &str) -> String {
    raw.chars().take(ERROR_SNIPPET_CHARS).collect()
}

/// `error.message` of an OpenAI error envelope, logging type/code on the way.
fn openai_error_message(root: &Value) -> Option<String> {
    let err = root.get("error")?;
    if let Some(typ) = err.get("type").and_then(|v| v.as_str()) {
        logw(format!("OpenAI error type: {}", typ));
    }
    if let Some(code) = err.get("code").and_then(|v| v.as_str()) {
        logw(format!("OpenAI error code: {}", code));
    }
    Some(
        err.get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string(),
    )
}

fn openai_extract_output_text(root: &Value) -> Option<String> {
    let output = root.get("output")?.as_array()?;
    for item in output {
        let content = item.get("content").and_then(|v| v.as_array());
        if let Some(content) = content {
            for entry in content {
                let typ = entry.get("type").and_then(|v| v.as_str());
                let text = entry.get("text").and_then(|v| v.as_str());
                if typ == Some("output_text") {
                    if let Some(text) = text {
                        return Some(text.to_string());
                    }
                }
            }
        }
    }

    None
}

/// First image of an Images API response, as a URL or inline PNG.
fn openai_extract_image(root: &Value) -> Option<GeneratedMedia> {
    let first = root.get("data")?.as_array()?.first()?;
    if let Some(b64) = first.get("b64_json").and_then(|v| v.as_str()) {
        let mime_type = match root.get("output_format").and_then(|v| v.as_str()) {
            Some("jpeg") => "image/jpeg",
            Some("webp") => "image/webp",
            _ => "image/png",
        };
        return Some(GeneratedMedia::Inline {
            mime_type: mime_type.to_string(),
            base64: b64.to_string(),
        });
    }
    first
        .get("url")
        .and_then(|v| v.as_str())
        .map(|url| GeneratedMedia::Url(url.to_string()))
}

async fn post_json(client: &Client, url: &str, key: &str, body: &Value, timeout: Option<Duration>) -> Result<Value> {
    let mut req = client.post(url).bearer_auth(key).json(body);
    if let Some(timeout) = timeout {
        req = req.timeout(timeout);
    }
    let resp = req.send().await?;

    let status = resp.status();
    let raw = resp.text().await.unwrap_or_default();
    let root: Option<Value> = serde_json::from_str(&raw).ok();

    if !status.is_success() {
        logw(format!("OpenAI HTTP {}", status.as_u16()));
        let message = root
            .as_ref()
            .and_then(openai_error_message)
            .unwrap_or_else(|| snippet(&raw));
        return Err(StoryboardError::Generation(format!(
            "HTTP {}: {}",
            status.as_u16(),
            message
        )));
    }

    root.ok_or_else(|| {
        logw(format!("OpenAI raw body: {}", snippet(&raw)));
        StoryboardError::Generation("response body is not JSON".to_string())
    })
}

/// Images API client. Prompts without a reference go to `images/generations`;
/// prompts with a reference sketch go to `images/edits`.
pub struct OpenAiImageService {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    size: String,
    timeout: Option<Duration>,
}

impl OpenAiImageService {
    pub fn new(client: Client, cfg: &Config) -> Self {
        Self {
            client,
            api_key: cfg.openai_key.clone(),
            base_url: cfg.openai_base_url.trim_end_matches('/').to_string(),
            model: cfg.image_model.clone(),
            size: cfg.image_size.clone(),
            timeout: cfg.request_timeout(),
        }
    }

    fn request_body(&self, request: &GenerationRequest) -> (String, Value) {
        match &request.reference_image {
            None => (
                format!("{}/images/generations", self.base_url),
                json!({
                    "model": self.model,
                    "prompt": request.prompt,
                    "size": self.size,
                    "n": 1,
                }),
            ),
            Some(reference) => (
                format!("{}/images/edits", self.base_url),
                json!({
                    "model": self.model,
                    "prompt": request.prompt,
                    "size": self.size,
                    "n": 1,
                    "images": [{ "image_url": reference }],
                }),
            ),
        }
    }
}

#[async_trait]
impl GenerationService for OpenAiImageService {
    async fn submit(&self, request: &GenerationRequest) -> Result<GeneratedMedia> {
        let (url, body) = self.request_body(request);
        let root = post_json(&self.client, &url, &self.api_key, &body, self.timeout).await?;
        openai_extract_image(&root).ok_or_else(|| {
            logw(format!("OpenAI image response without data: {}", snippet(&root.to_string())));
            StoryboardError::Generation("image response contained no image".to_string())
        })
    }

    fn name(&self) -> &'static str {
        "openai-images"
    }
}

/// Responses API client that turns script prose into a `ScriptDraft`.
pub struct OpenAiScriptAnalyzer {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_chars: usize,
    timeout: Option<Duration>,
}

impl OpenAiScriptAnalyzer {
    pub fn new(client: Client, cfg: &Config) -> Self {
        Self {
            client,
            api_key: cfg.openai_key.clone(),
            base_url: cfg.openai_base_url.trim_end_matches('/').to_string(),
            model: cfg.text_model.clone(),
            max_chars: cfg.max_script_chars,
            timeout: cfg.request_timeout(),
        }
    }
}

#[async_trait]
impl ScriptAnalyzer for OpenAiScriptAnalyzer {
    async fn analyze(&self, text: &str) -> Result<ScriptDraft> {
        let trimmed = trim_copy_utf8_safe(text, self.max_chars);
        if trimmed.len() < text.len() {
            logw(format!(
                "Script truncated from {} to {} bytes for analysis",
                text.len(),
                trimmed.len()
            ));
        }

        let body = json!({
            "model": self.model,
            "input": [
                {"role": "system", "content": "You are a film storyboard supervisor designed to output JSON."},
                {"role": "user", "content": format!("{}{}", STRUCTURE_INSTRUCTIONS, trimmed)},
            ],
            "text": {"format": {"type": "json_object"}},
        });

        let url = format!("{}/responses", self.base_url);
        let root = post_json(&self.client, &url, &self.api_key, &body, self.timeout)
            .await
            .map_err(|e| StoryboardError::Parse(format!("script analysis request failed: {}", e)))?;

        let out_text = openai_extract_output_text(&root).ok_or_else(|| {
            logw("OpenAI response parse failed.".to_string());
            StoryboardError::Parse("analysis response contained no output text".to_string())
        })?;
        draft_from_model_text(&out_text)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_on_char_boundary() {
        assert_eq!(trim_copy_utf8_safe("héllo", 2), "h");
        assert_eq!(trim_copy_utf8_safe("abc", 10), "abc");
    }

    #[test]
    fn output_text_is_found_in_responses_envelope() {
        let root = json!({
            "output": [
                {"type": "reasoning", "content": []},
                {"type": "message", "content": [{"type": "output_text", "text": "{\"scenes\":[]}"}]}
            ]
        });
        assert_eq!(openai_extract_output_text(&root).as_deref(), Some("{\"scenes\":[]}"));
        assert!(openai_extract_output_text(&json!({"output": []})).is_none());
    }

    #[test]
    fn image_response_prefers_inline_data() {
        let inline = json!({"data": [{"b64_json": "AAAA"}], "output_format": "webp"});
        assert_eq!(
            openai_extract_image(&inline),
            Some(GeneratedMedia::Inline {
                mime_type: "image/webp".into(),
                base64: "AAAA".into()
            })
        );
        let url = json!({"data": [{"url": "https://img/1.png"}]});
        assert_eq!(
            openai_extract_image(&url),
            Some(GeneratedMedia::Url("https://img/1.png".into()))
        );
        assert!(openai_extract_image(&json!({"data": []})).is_none());
    }

    #[test]
    fn reference_image_switches_to_edits_endpoint() {
        let service = OpenAiImageService::new(Client::new(), &Config::default());
        let (url, body) = service.request_body(&GenerationRequest::text("a"));
        assert_eq!(url, "https://api.openai.com/v1/images/generations");
        assert!(body.get("images").is_none());

        let (url, body) =
            service.request_body(&GenerationRequest::with_reference("b", "data:image/png;base64,QQ=="));
        assert_eq!(url, "https://api.openai.com/v1/images/edits");
        assert_eq!(body["images"][0]["image_url"], "data:image/png;base64,QQ==");
    }

    #[test]
    fn error_envelope_message_is_extracted() {
        let root = json!({"error": {"message": "Rate limit reached", "type": "requests", "code": "rate_limit_exceeded"}});
        assert_eq!(openai_error_message(&root).as_deref(), Some("Rate limit reached"));
    }
}
