use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single actuation primitive (desktop input or browser element op).
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionError {
    #[error("action failed: {0}")]
    Failed(String),
    /// The page navigated away while the primitive was running.
    #[error("execution context destroyed: {0}")]
    ContextDestroyed(String),
    #[error("browser action outside a browser-active snapshot: {0}")]
    BrowserInactive(String),
    #[error("element index {index} out of range ({len} elements)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("element at index {index} no longer matches the snapshot")]
    StaleIndex { index: usize },
    #[error("unsupported action: {0}")]
    Unsupported(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("cancelled")]
    Cancelled,
}

impl ActionError {
    /// Heuristic: an evaluate that dies because the JS context went away usually
    /// means the click or keystroke started a navigation.
    pub fn is_context_destroyed_message(msg: &str) -> bool {
        let m = msg.to_lowercase();
        m.contains("execution context was destroyed")
            || m.contains("cannot find context with specified id")
            || m.contains("inspected target navigated or closed")
    }

    /// Classify a raw adapter error message.
    pub fn from_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        if Self::is_context_destroyed_message(&msg) {
            ActionError::ContextDestroyed(msg)
        } else {
            ActionError::Failed(msg)
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum VisionError {
    #[error("vision output could not be parsed: {0}")]
    Parse(String),
    #[error("vision output failed validation: {0}")]
    Validation(String),
    #[error("vision transport error: {0}")]
    Transport(String),
    #[error("vision unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum AgentError {
    #[error("perception degraded: {0}")]
    PerceptionDegraded(String),
    #[error("action execution error: {0}")]
    ActionExecution(#[from] ActionError),
    #[error("plan parse error: {0}")]
    PlanParse(String),
    #[error("verification timeout: anchor {anchor:?} not seen within {waited_ms} ms")]
    VerificationTimeout { anchor: String, waited_ms: u128 },
    #[error("vision provider error: {0}")]
    VisionProvider(#[from] VisionError),
    #[error("step budget exhausted after {max_steps} steps")]
    BudgetExhausted { max_steps: usize },
    #[error("run cancelled")]
    Cancelled,
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("planner error: {0}")]
    Planner(String),
    #[error("run sink error: {0}")]
    Sink(String),
    #[error("config error: {0}")]
    Config(String),
}
