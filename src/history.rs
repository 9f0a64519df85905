use crate::action::Action;
use crate::planner::PlanStep;
use crate::verify::AnchorMatch;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutedAction {
    pub attempt: usize,
    pub action: Action,
    /// `None` when the primitive succeeded.
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Anchor matched within the local attempts.
    Verified,
    /// Anchor matched and the completion criteria held.
    Completed,
    /// Local attempts failed; escalation brought the surface back.
    Resolved,
    /// Local attempts and escalation both failed.
    Unresolved,
    /// The plan issued DONE.
    Done,
    /// The plan issued FAIL.
    Failed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPath {
    #[default]
    None,
    Cdp,
    Vision,
}

/// One resolved step. Immutable once appended to [`RunHistory`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub plan: PlanStep,
    pub executed: Vec<ExecutedAction>,
    pub outcome: StepOutcome,
    pub anchor_match: Option<AnchorMatch>,
    pub escalation: EscalationPath,
    pub vision_action: Option<Action>,
    pub screenshot_ref: Option<String>,
    pub snapshot_id: String,
    pub timestamp_ms: u128,
}

impl StepRecord {
    /// History line handed back to the planner.
    pub fn summary(&self) -> String {
        let actions = self
            .plan
            .actions
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        let actions = if actions.is_empty() { "(no actions)".to_string() } else { actions };
        let mut line = match self.outcome {
            StepOutcome::Verified => format!("Step {}: {actions} -> STEP SUCCESS", self.step),
            StepOutcome::Completed => format!("Step {}: {actions} -> SUCCESS (goal indicators found)", self.step),
            StepOutcome::Resolved => format!("Step {}: {actions} -> RECOVERED via escalation", self.step),
            StepOutcome::Unresolved => format!("Step {}: {actions} -> FAIL (anchor mismatch)", self.step),
            StepOutcome::Done => format!("Step {}: {actions} -> DONE", self.step),
            StepOutcome::Failed => format!("Step {}: {actions} -> FAILED", self.step),
        };
        if let Some(anchor) = self.plan.expected_anchor.as_deref().filter(|a| !a.trim().is_empty()) {
            line.push_str(&format!(" [anchor '{anchor}']"));
        }
        if let Some(a) = &self.vision_action {
            line.push_str(&format!(" [vision: {a}]"));
        }
        if let Some(err) = self.executed.iter().rev().find_map(|e| e.error.as_deref()) {
            line.push_str(&format!(" [last error: {err}]"));
        }
        if !self.plan.sub_goals.trim().is_empty() {
            line.push_str(&format!(" [checklist: {}]", self.plan.sub_goals.trim()));
        }
        line
    }
}

/// Append-only step log addressed by position.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunHistory {
    records: Vec<StepRecord>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends and returns the record's index.
    pub fn push(&mut self, record: StepRecord) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    pub fn get(&self, idx: usize) -> Option<&StepRecord> {
        self.records.get(idx)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepRecord> {
        self.records.iter()
    }

    pub fn last(&self) -> Option<&StepRecord> {
        self.records.last()
    }

    /// The newest `n` records, oldest first.
    pub fn recent(&self, n: usize) -> &[StepRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    pub fn planner_lines(&self, n: usize) -> Vec<String> {
        self.recent(n).iter().map(StepRecord::summary).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: usize, outcome: StepOutcome) -> StepRecord {
        StepRecord {
            step,
            plan: PlanStep {
                actions: vec![Action::BrowserNavigate { url: "example.com".into() }],
                expected_anchor: Some("example.com".into()),
                ..Default::default()
            },
            executed: vec![],
            outcome,
            anchor_match: None,
            escalation: EscalationPath::None,
            vision_action: None,
            screenshot_ref: None,
            snapshot_id: "s".into(),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn recent_returns_a_bounded_window() {
        let mut h = RunHistory::new();
        for i in 1..=5 {
            assert_eq!(h.push(record(i, StepOutcome::Verified)), i - 1);
        }
        let steps: Vec<usize> = h.recent(2).iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![4, 5]);
        assert_eq!(h.recent(10).len(), 5);
        assert_eq!(h.get(0).map(|r| r.step), Some(1));
    }

    #[test]
    fn summary_mentions_actions_and_outcome() {
        let line = record(3, StepOutcome::Unresolved).summary();
        assert_eq!(line, "Step 3: BROWSER_NAVIGATE(example.com) -> FAIL (anchor mismatch) [anchor 'example.com']");
    }
}
