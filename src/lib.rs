pub mod action;
pub mod agent;
pub mod browser;
pub mod desktop;
pub mod elements;
pub mod error;
pub mod escalation;
pub mod executor;
pub mod history;
pub mod llm;
pub mod observer;
pub mod ocr;
pub mod planner;
pub mod recorder;
pub mod snapshot;
pub mod verify;
pub mod vision;

pub use action::{Action, ActionFamily};
pub use agent::{duration_from_secs, Agent, AgentConfig, Phase, RunReport, Task, TaskResult};
pub use browser::{BrowserConfig, ChromiumDesktop, ChromiumPage, PageHandle};
pub use desktop::{Desktop, XdotoolDesktop};
pub use elements::{ElementHint, InteractiveElement};
pub use error::{ActionError, AgentError, VisionError};
pub use llm::{LlmClient, LlmConfig};
pub use observer::{ObserverConfig, StateObserver};
pub use planner::{LlmPlanner, PlanDraft, PlanStep, Planner, PlannerInput};
pub use recorder::{DiskRunSink, NullRunSink, RunSink};
pub use snapshot::Snapshot;
pub use verify::{AnchorMatch, AnchorVerifier, VerifierConfig};
pub use vision::{Vision, VisionClient, VisionContext};
