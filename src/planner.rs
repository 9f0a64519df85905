use crate::action::{parse_sequence, Action, RejectedToken};
use crate::elements::{render_elements, ElementHint};
use crate::error::AgentError;
use crate::llm::{extract_json, LlmClient};
use crate::snapshot::{truncate_chars, Snapshot};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

// ========================= Planner Contract =========================

/// Everything the planner sees for one Decide call.
#[derive(Clone, Copy, Debug)]
pub struct PlannerInput<'a> {
    pub goal: &'a str,
    /// 1-based.
    pub step: usize,
    pub history: &'a [String],
    pub snapshot: &'a Snapshot,
    pub app_knowledge: &'a str,
}

/// Raw planner output before the token sequence is parsed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanDraft {
    pub action_sequence: String,
    pub expected_anchor: Option<String>,
    #[serde(deserialize_with = "comma_list_or_array")]
    pub success_indicators: Vec<String>,
    pub sub_goals: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListOrString {
    List(Vec<String>),
    Text(String),
    Null(()),
}

fn comma_list_or_array<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    let items = match ListOrString::deserialize(d)? {
        ListOrString::List(v) => v,
        ListOrString::Text(s) => s.split(',').map(str::to_string).collect(),
        ListOrString::Null(()) => Vec::new(),
    };
    Ok(items.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn decide(&self, input: &PlannerInput<'_>) -> Result<PlanDraft, AgentError>;
}

#[async_trait]
impl<T: Planner + ?Sized> Planner for std::sync::Arc<T> {
    async fn decide(&self, input: &PlannerInput<'_>) -> Result<PlanDraft, AgentError> {
        (**self).decide(input).await
    }
}

// ========================= Plan Step =========================

/// A parsed, bounded plan for one step. Discarded once the step resolves.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub actions: Vec<Action>,
    pub expected_anchor: Option<String>,
    /// Non-empty only when the step claims to finish the goal.
    pub success_indicators: Vec<String>,
    pub sub_goals: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedToken>,
    /// Tokens beyond the action bound that were cut.
    #[serde(default)]
    pub truncated: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<PlanViolation>,
}

impl PlanStep {
    pub fn from_draft(draft: PlanDraft, max_actions: usize) -> Self {
        let (mut actions, rejected) = parse_sequence(&draft.action_sequence);
        let truncated = actions.len().saturating_sub(max_actions);
        actions.truncate(max_actions);
        Self {
            actions,
            expected_anchor: draft.expected_anchor.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()),
            success_indicators: draft.success_indicators,
            sub_goals: draft.sub_goals,
            rejected,
            truncated,
            violations: Vec::new(),
        }
    }

    pub fn anchor(&self) -> &str {
        self.expected_anchor.as_deref().unwrap_or("")
    }

    pub fn claims_completion(&self) -> bool {
        !self.success_indicators.is_empty()
    }
}

// ========================= Plan Validation =========================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanViolation {
    /// A click follows typing into a search box in the same sequence. The
    /// suggestion list re-renders after typing, so the click's index comes
    /// from a snapshot that no longer describes the page.
    TypeThenClick { type_position: usize, click_position: usize, element_index: usize },
    IndexOutOfRange { position: usize, element_index: usize, len: usize },
}

impl PlanViolation {
    /// Position of the offending action within the sequence.
    pub fn position(&self) -> usize {
        match self {
            PlanViolation::TypeThenClick { click_position, .. } => *click_position,
            PlanViolation::IndexOutOfRange { position, .. } => *position,
        }
    }
}

/// Check a plan against the snapshot it was produced from.
pub fn validate_plan(plan: &PlanStep, snapshot: &Snapshot) -> Vec<PlanViolation> {
    let elements = snapshot.elements();
    let mut violations = Vec::new();
    let mut typed_into_search: Option<usize> = None;
    for (pos, action) in plan.actions.iter().enumerate() {
        if let Some(idx) = action.element_index() {
            if snapshot.is_browser_active() && idx >= elements.len() {
                violations.push(PlanViolation::IndexOutOfRange { position: pos, element_index: idx, len: elements.len() });
            }
        }
        match action {
            Action::BrowserType { element_index, .. } => {
                let is_search = elements.get(*element_index).is_some_and(|el| {
                    el.hint == ElementHint::LikelySearchInput || matches!(el.role.as_str(), "combobox" | "searchbox")
                });
                if is_search && typed_into_search.is_none() {
                    typed_into_search = Some(pos);
                }
            }
            Action::BrowserClick { element_index } => {
                if let Some(type_position) = typed_into_search {
                    violations.push(PlanViolation::TypeThenClick {
                        type_position,
                        click_position: pos,
                        element_index: *element_index,
                    });
                }
            }
            _ => {}
        }
    }
    violations
}

// ========================= LLM Planner =========================

pub const DEFAULT_APP_KNOWLEDGE: &str = "\
- Open an app: PRESS_KEY(Alt+F2); WAIT(1); TYPE(app_name); PRESS_KEY(ENTER)
- Open a URL on the desktop: PRESS_KEY(Ctrl+L); WAIT(0.5); TYPE(url); PRESS_KEY(ENTER)
- Firefox window class is 'Navigator'/'firefox'; Chrome is 'Google-chrome'; Chromium is 'Chromium'.
- After TYPE into a search box, stop and observe: suggestions appear and element indices change.";

const PLANNER_INSTRUCTIONS: &str = r#"You drive a Linux desktop and a Chromium browser toward a goal, one short action sequence per call.

Reply with ONE JSON object and nothing else:
{"action_sequence": "...", "expected_anchor": "...", "success_indicators": "...", "sub_goals": "..."}

action_sequence: actions separated by ';' using exactly these forms:
  CLICK(x, y)  TYPE(text)  SCROLL(n)  PRESS_KEY(key)  WAIT(seconds 0.1-10)
  DONE(final answer)  FAIL(reason)
  BROWSER_NAVIGATE(url)  BROWSER_CLICK(index)  BROWSER_TYPE(index, text)
  BROWSER_* actions are valid only when a browser page is listed below, and indices refer to that list.
  BROWSER_TYPE never submits; follow it with PRESS_KEY(Enter) to submit.
  Never BROWSER_CLICK after BROWSER_TYPE into a search box in the same sequence; end the sequence and look again.
  At most 8 actions.
expected_anchor: a short, generic word expected in the window title, app class or URL once the sequence ran.
success_indicators: comma-separated text visible on screen ONLY when the whole goal is done; empty otherwise.
sub_goals: a short checklist of what remains."#;

pub struct LlmPlanner {
    client: LlmClient,
    visible_text_chars: usize,
}

impl LlmPlanner {
    pub fn new(client: LlmClient) -> Self {
        Self { client, visible_text_chars: 1500 }
    }

    pub fn prompt(&self, input: &PlannerInput<'_>) -> String {
        let snap = input.snapshot;
        let mut s = format!("GOAL: {}\nSTEP: {}\n", input.goal, input.step);
        s.push_str(&format!("ACTIVE APP: {}\nWINDOW TITLE: {}\n", or_unknown(&snap.app_class), or_unknown(&snap.window_title)));
        if let Some(f) = &snap.focused_element {
            s.push_str(&format!("FOCUSED: {f}\n"));
        }
        match &snap.browser {
            Some(b) => {
                s.push_str(&format!("BROWSER URL: {}\nPAGE TITLE: {}\n", b.url, b.title));
                if b.is_loading {
                    s.push_str("PAGE IS STILL LOADING\n");
                }
                s.push_str("ELEMENTS:\n");
                s.push_str(&render_elements(&b.elements));
                s.push_str("VISIBLE TEXT:\n");
                s.push_str(&truncate_chars(&b.visible_text, self.visible_text_chars));
                s.push('\n');
            }
            None => s.push_str("BROWSER: not in front (BROWSER_* actions unavailable)\n"),
        }
        if !input.history.is_empty() {
            s.push_str("HISTORY:\n");
            for line in input.history {
                s.push_str("- ");
                s.push_str(line);
                s.push('\n');
            }
        }
        if !input.app_knowledge.trim().is_empty() {
            s.push_str("APP KNOWLEDGE:\n");
            s.push_str(input.app_knowledge);
            s.push('\n');
        }
        s
    }
}

fn or_unknown(s: &str) -> &str {
    if s.is_empty() {
        "unknown"
    } else {
        s
    }
}

pub fn parse_draft(text: &str) -> Result<PlanDraft, AgentError> {
    serde_json::from_str(extract_json(text)).map_err(|e| AgentError::PlanParse(format!("{e}: {text}")))
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn decide(&self, input: &PlannerInput<'_>) -> Result<PlanDraft, AgentError> {
        let model = self.client.config().planner_model.clone();
        let text = self
            .client
            .respond(&model, PLANNER_INSTRUCTIONS, &self.prompt(input), None)
            .await
            .map_err(|e| AgentError::Planner(format!("{e:#}")))?;
        debug!(step = input.step, raw = %text, "planner reply");
        parse_draft(&text)
    }
}
