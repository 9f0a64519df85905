use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;

/// OpenAI-compatible Responses API settings shared by the planner and vision.
#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_base: String,      // e.g. "https://api.openai.com/v1"
    pub api_key: String,       // env OPENAI_API_KEY
    pub planner_model: String, // text-only, called once per step
    pub vision_model: String,  // must accept input_image
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            planner_model: env::var("DESKPILOT_PLANNER_MODEL").unwrap_or_else(|_| "gpt-4.1-mini".into()),
            vision_model: env::var("DESKPILOT_VISION_MODEL").unwrap_or_else(|_| "gpt-4.1".into()),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    cfg: LlmConfig,
}

impl LlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("OPENAI_API_KEY missing");
        }
        let http = Client::builder().timeout(cfg.request_timeout).build()?;
        Ok(Self { http, cfg })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.cfg
    }

    /// One stateless turn: instructions + user text (+ optional PNG) in, text out.
    pub async fn respond(&self, model: &str, instructions: &str, text: &str, image_png: Option<&[u8]>) -> Result<String> {
        let url = format!("{}/responses", self.cfg.api_base.trim_end_matches('/'));
        let mut content = vec![json!({ "type": "input_text", "text": text })];
        if let Some(png) = image_png {
            content.push(json!({
                "type": "input_image",
                "image_url": format!("data:image/png;base64,{}", B64.encode(png)),
            }));
        }
        let req = json!({
          "model": model,
          "instructions": instructions,
          "input": [{ "role": "user", "content": content }],
        });

        let resp = self.http.post(url).bearer_auth(&self.cfg.api_key).json(&req).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            bail!("LLM provider error {}: {}", status, body);
        }
        let v: Value = serde_json::from_str(&body).context("failed to parse Responses API JSON")?;
        Self::output_text(&v)
    }

    fn output_text(v: &Value) -> Result<String> {
        // Responses API: { output: [ { type: "message", content: [ { type: "output_text", text } ] } ] }
        if let Some(text) = v.get("output_text").and_then(Value::as_str) {
            return Ok(text.to_string());
        }
        let outputs = v.get("output").and_then(Value::as_array).cloned().unwrap_or_default();
        let mut text = String::new();
        for o in outputs.iter().filter(|o| o.get("type").and_then(Value::as_str) == Some("message")) {
            for part in o.get("content").and_then(Value::as_array).into_iter().flatten() {
                if let Some(t) = part.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
        }
        if text.is_empty() {
            bail!("response carried no message text");
        }
        Ok(text)
    }
}

/// Strip markdown fences and surrounding prose, leaving the outermost JSON object.
pub fn extract_json(text: &str) -> &str {
    let t = text.trim();
    match (t.find('{'), t.rfind('}')) {
        (Some(start), Some(end)) if end > start => &t[start..=end],
        _ => t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json() {
        let raw = "```json\n{\"type\": \"WAIT\", \"seconds\": 1}\n```";
        assert_eq!(extract_json(raw), "{\"type\": \"WAIT\", \"seconds\": 1}");
        assert_eq!(extract_json("no json here"), "no json here");
    }

    #[test]
    fn collects_message_text() {
        let v = json!({"id": "resp_1", "output": [
            {"type": "reasoning", "summary": []},
            {"type": "message", "content": [{"type": "output_text", "text": "{\"a\":1}"}]}
        ]});
        assert_eq!(LlmClient::output_text(&v).unwrap(), "{\"a\":1}");
        assert!(LlmClient::output_text(&json!({"output": []})).is_err());
    }

    #[test]
    fn refuses_to_build_without_a_key() {
        let cfg = LlmConfig { api_key: String::new(), ..LlmConfig::default() };
        assert!(LlmClient::new(cfg).is_err());
    }
}
