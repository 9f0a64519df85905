use crate::action::Action;
use crate::error::VisionError;
use crate::llm::{extract_json, LlmClient};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What the controller tells the vision fallback about the failed step.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VisionContext {
    pub step: usize,
    pub expected_anchor: String,
    pub found_title: String,
    pub url: Option<String>,
    pub history: Vec<String>,
    /// Vision was forced by the consecutive-failure counter.
    pub forced: bool,
}

impl VisionContext {
    fn describe(&self) -> String {
        let mut s = format!(
            "Local verification failed at step {}. Expected anchor: '{}', found window title: '{}'.",
            self.step, self.expected_anchor, self.found_title
        );
        if let Some(url) = &self.url {
            s.push_str(&format!(" Current URL: {url}."));
        }
        if self.forced {
            s.push_str(" Several steps in a row failed; look for a popup, dialog or overlay blocking progress.");
        }
        s
    }
}

/// Screenshot in, exactly one corrective action out.
#[async_trait]
pub trait Vision: Send + Sync {
    async fn next_action(&self, screenshot: &[u8], goal: &str, context: &VisionContext) -> Result<Action, VisionError>;
}

const VISION_INSTRUCTIONS: &str = r#"You control a desktop by looking at a screenshot and choosing ONE action.

Output ONLY one JSON object, no markdown. Every object has "type" and "reason":
  {"type": "CLICK", "x": <int>, "y": <int>, "reason": "..."}
  {"type": "TYPE", "text": "...", "reason": "..."}
  {"type": "SCROLL", "amount": <int, positive = down>, "reason": "..."}
  {"type": "PRESS_KEY", "key": "ENTER | TAB | ESCAPE | CTRL+L | ...", "reason": "..."}
  {"type": "WAIT", "seconds": <0.1-10.0>, "reason": "..."}
  {"type": "DONE", "final_answer": "...", "reason": "..."}
  {"type": "FAIL", "error": "...", "reason": "..."}
Prefer the single action that unblocks progress: dismiss overlays, focus the right field, open the right window."#;

pub struct VisionClient {
    client: LlmClient,
    max_attempts: usize,
}

impl VisionClient {
    pub fn new(client: LlmClient) -> Self {
        Self { client, max_attempts: 3 }
    }

    pub fn with_max_attempts(mut self, n: usize) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    fn user_message(goal: &str, context: &VisionContext, last_error: Option<&VisionError>) -> String {
        let mut parts = vec![format!("GOAL: {goal}"), context.describe()];
        if !context.history.is_empty() {
            parts.push("RECENT STEPS:".into());
            parts.extend(context.history.iter().rev().take(5).rev().map(|h| format!("- {h}")));
        }
        if let Some(e) = last_error {
            parts.push(format!("Your previous reply was rejected ({e}). Reply with exactly one valid JSON action."));
        }
        parts.push("Analyze the screenshot and return your next action as JSON.".into());
        parts.join("\n")
    }
}

/// Parse and validate one vision reply.
pub fn parse_action(text: &str) -> Result<Action, VisionError> {
    let action: Action =
        serde_json::from_str(extract_json(text)).map_err(|e| VisionError::Parse(format!("{e}: {text}")))?;
    action.validate().map_err(VisionError::Validation)?;
    Ok(action)
}

#[async_trait]
impl Vision for VisionClient {
    async fn next_action(&self, screenshot: &[u8], goal: &str, context: &VisionContext) -> Result<Action, VisionError> {
        let model = self.client.config().vision_model.clone();
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            let msg = Self::user_message(goal, context, last_error.as_ref());
            let result = match self.client.respond(&model, VISION_INSTRUCTIONS, &msg, Some(screenshot)).await {
                Ok(text) => parse_action(&text),
                Err(e) => Err(VisionError::Transport(format!("{e:#}"))),
            };
            match result {
                Ok(action) => {
                    info!(attempt, action = %action, "vision proposed action");
                    return Ok(action);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "vision reply rejected");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| VisionError::Unavailable("no attempts made".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_validates_replies() {
        assert_eq!(
            parse_action("```json\n{\"type\": \"PRESS_KEY\", \"key\": \"ESCAPE\", \"reason\": \"close popup\"}\n```").unwrap(),
            Action::PressKey { key: "ESCAPE".into() }
        );
        assert!(matches!(parse_action("click the button"), Err(VisionError::Parse(_))));
        assert!(matches!(
            parse_action(r#"{"type": "WAIT", "seconds": 60, "reason": "slow"}"#),
            Err(VisionError::Validation(_))
        ));
    }

    #[test]
    fn retry_message_carries_the_previous_error() {
        let ctx = VisionContext { step: 4, expected_anchor: "Gmail".into(), forced: true, ..Default::default() };
        let msg = VisionClient::user_message("read mail", &ctx, Some(&VisionError::Parse("eof".into())));
        assert!(msg.contains("Expected anchor: 'Gmail'"));
        assert!(msg.contains("popup"));
        assert!(msg.contains("previous reply was rejected"));
    }
}
