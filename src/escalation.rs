use crate::action::Action;
use crate::desktop::Desktop;
use crate::error::AgentError;
use crate::executor::Executor;
use crate::history::EscalationPath;
use crate::observer::StateObserver;
use crate::snapshot::Snapshot;
use crate::verify::AnchorVerifier;
use crate::vision::{Vision, VisionContext};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Consecutive unresolved steps. Mutated only at step boundaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FailureCounter(usize);

impl FailureCounter {
    pub fn get(&self) -> usize {
        self.0
    }

    pub fn increment(&mut self) -> usize {
        self.0 += 1;
        self.0
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationOutcome {
    pub path: EscalationPath,
    pub resolved: bool,
    pub forced: bool,
    pub vision_action: Option<Action>,
    pub error: Option<String>,
}

/// The failed step, as the ladder sees it.
#[derive(Clone, Copy, Debug)]
pub struct EscalationRequest<'a> {
    pub step: usize,
    pub goal: &'a str,
    pub anchor: &'a str,
    pub indicators: &'a [String],
    pub snapshot: &'a Snapshot,
    pub history: &'a [String],
}

/// Cheap browser re-check first, vision second, vision forced after repeated
/// failures. Never decides the task; it only perturbs state and reports.
pub struct EscalationLadder<'a> {
    pub observer: &'a StateObserver,
    pub executor: &'a Executor,
    pub verifier: &'a AnchorVerifier,
    pub vision: Option<&'a dyn Vision>,
    pub forced_threshold: usize,
}

impl EscalationLadder<'_> {
    pub async fn escalate(
        &self,
        desktop: &dyn Desktop,
        req: &EscalationRequest<'_>,
        failures: &FailureCounter,
        cancel: &CancellationToken,
    ) -> EscalationOutcome {
        let mut out = EscalationOutcome::default();

        let (cheap_ok, latest) = if req.snapshot.is_browser_active() {
            out.path = EscalationPath::Cdp;
            let snap = self.observer.observe(desktop).await;
            let ok = self.verifier.cheap_recheck(&snap, req.anchor, req.indicators);
            info!(step = req.step, resolved = ok, url = ?snap.url(), "cheap browser re-check");
            (ok, snap)
        } else {
            (false, req.snapshot.clone())
        };

        out.forced = failures.get() >= self.forced_threshold;
        let vision = match self.vision {
            Some(v) if (!cheap_ok || out.forced) && !cancel.is_cancelled() => v,
            _ => {
                out.resolved = cheap_ok;
                return out;
            }
        };
        if out.forced {
            info!(step = req.step, failures = failures.get(), "forcing vision escalation");
        }

        out.path = EscalationPath::Vision;
        let screenshot = match desktop.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                warn!(step = req.step, error = %e, "screenshot for vision failed");
                out.error = Some(e.to_string());
                out.resolved = cheap_ok;
                return out;
            }
        };
        let ctx = VisionContext {
            step: req.step,
            expected_anchor: req.anchor.to_string(),
            found_title: latest.window_title.clone(),
            url: latest.url().map(str::to_string),
            history: req.history.to_vec(),
            forced: out.forced,
        };
        let reply = tokio::select! {
            _ = cancel.cancelled() => {
                info!(step = req.step, "vision escalation cancelled");
                out.error = Some(AgentError::Cancelled.to_string());
                out.resolved = cheap_ok;
                return out;
            }
            r = vision.next_action(&screenshot, req.goal, &ctx) => r,
        };
        let action = match reply {
            Ok(a) => a,
            Err(e) => {
                let e = AgentError::VisionProvider(e);
                warn!(step = req.step, error = %e, "vision gave no usable action; step left unresolved");
                out.error = Some(e.to_string());
                out.resolved = cheap_ok;
                return out;
            }
        };
        out.vision_action = Some(action.clone());
        if action.is_terminal() {
            warn!(step = req.step, action = %action, "ignoring terminal action from vision");
            out.resolved = cheap_ok;
            return out;
        }

        if let Err(e) = self.executor.execute(desktop, &action, &latest, cancel).await {
            warn!(step = req.step, action = %action, error = %e, "vision action failed");
            out.error = Some(e.to_string());
        }
        // one re-check, no polling
        let after = self.observer.observe(desktop).await;
        out.resolved = self.verifier.verify(&after, req.anchor)
            || self.verifier.indicators_detected(&after, req.indicators, None);
        info!(step = req.step, action = %action, resolved = out.resolved, "vision escalation finished");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::PageHandle;
    use crate::error::{ActionError, VisionError};
    use crate::observer::ObserverConfig;
    use crate::snapshot::WindowInfo;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct Screen {
        title: Mutex<String>,
    }

    #[async_trait]
    impl Desktop for Screen {
        async fn active_window(&self) -> Result<WindowInfo, ActionError> {
            Ok(WindowInfo { title: self.title.lock().unwrap().clone(), app_class: "Chromium".into() })
        }
        async fn screenshot(&self) -> Result<Vec<u8>, ActionError> {
            Ok(vec![0x89, b'P', b'N', b'G'])
        }
        async fn execute(&self, _action: &Action) -> Result<(), ActionError> {
            *self.title.lock().unwrap() = "Inbox - Gmail".into();
            Ok(())
        }
    }

    struct Page(&'static str);

    #[async_trait]
    impl PageHandle for Page {
        async fn evaluate(&self, script: &str) -> Result<Value, ActionError> {
            if script.contains("readyState") {
                Ok(json!({"url": self.0, "title": "", "ready_state": "complete", "text": ""}))
            } else {
                Ok(json!([]))
            }
        }
        async fn navigate(&self, _url: &str) -> Result<(), ActionError> {
            Ok(())
        }
        async fn insert_text(&self, _text: &str) -> Result<(), ActionError> {
            Ok(())
        }
        async fn press_key(&self, _key: &str) -> Result<(), ActionError> {
            Ok(())
        }
        async fn screenshot_png(&self) -> Result<Vec<u8>, ActionError> {
            Ok(Vec::new())
        }
    }

    struct ScriptedVision {
        calls: AtomicUsize,
        reply: Result<Action, VisionError>,
    }

    #[async_trait]
    impl Vision for ScriptedVision {
        async fn next_action(&self, _png: &[u8], _goal: &str, _ctx: &VisionContext) -> Result<Action, VisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    struct HangingVision;

    #[async_trait]
    impl Vision for HangingVision {
        async fn next_action(&self, _png: &[u8], _goal: &str, _ctx: &VisionContext) -> Result<Action, VisionError> {
            std::future::pending().await
        }
    }

    struct Rig {
        observer: StateObserver,
        executor: Executor,
        verifier: AnchorVerifier,
    }

    fn rig(url: &'static str) -> Rig {
        let page: Arc<dyn PageHandle> = Arc::new(Page(url));
        Rig {
            observer: StateObserver::new(ObserverConfig::default(), Some(page.clone())),
            executor: Executor::new(Some(page)),
            verifier: AnchorVerifier::default(),
        }
    }

    async fn run(
        rig: &Rig,
        vision: Option<&dyn Vision>,
        failures: usize,
        anchor: &str,
    ) -> (EscalationOutcome, Screen) {
        run_until(rig, vision, failures, anchor, &CancellationToken::new()).await
    }

    async fn run_until(
        rig: &Rig,
        vision: Option<&dyn Vision>,
        failures: usize,
        anchor: &str,
        cancel: &CancellationToken,
    ) -> (EscalationOutcome, Screen) {
        let screen = Screen { title: Mutex::new("Loading".into()) };
        let snapshot = rig.observer.observe(&screen).await;
        let ladder = EscalationLadder {
            observer: &rig.observer,
            executor: &rig.executor,
            verifier: &rig.verifier,
            vision,
            forced_threshold: 3,
        };
        let req = EscalationRequest { step: 4, goal: "read mail", anchor, indicators: &[], snapshot: &snapshot, history: &[] };
        let mut counter = FailureCounter::default();
        for _ in 0..failures {
            counter.increment();
        }
        let out = ladder.escalate(&screen, &req, &counter, cancel).await;
        (out, screen)
    }

    #[tokio::test]
    async fn cheap_check_resolves_without_vision() {
        let rig = rig("https://mail.google.com/");
        let vision = ScriptedVision { calls: AtomicUsize::new(0), reply: Ok(Action::PressKey { key: "Escape".into() }) };
        let (out, _) = run(&rig, Some(&vision), 0, "mail.google.com").await;
        assert!(out.resolved);
        assert_eq!(out.path, EscalationPath::Cdp);
        assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn vision_is_forced_after_threshold_even_if_cheap_check_passes() {
        let rig = rig("https://mail.google.com/");
        let vision = ScriptedVision { calls: AtomicUsize::new(0), reply: Ok(Action::PressKey { key: "Escape".into() }) };
        let (out, _) = run(&rig, Some(&vision), 3, "mail.google.com").await;
        assert!(out.forced);
        assert_eq!(out.path, EscalationPath::Vision);
        assert_eq!(vision.calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.vision_action, Some(Action::PressKey { key: "Escape".into() }));
    }

    #[tokio::test]
    async fn vision_action_runs_then_one_recheck() {
        let rig = rig("https://accounts.test/");
        let vision = ScriptedVision { calls: AtomicUsize::new(0), reply: Ok(Action::Click { x: 10, y: 10 }) };
        let (out, screen) = run(&rig, Some(&vision), 0, "Gmail").await;
        assert!(out.resolved);
        assert_eq!(*screen.title.lock().unwrap(), "Inbox - Gmail");
    }

    #[tokio::test]
    async fn terminal_vision_actions_are_ignored() {
        let rig = rig("https://accounts.test/");
        let vision = ScriptedVision { calls: AtomicUsize::new(0), reply: Ok(Action::Done { final_answer: None }) };
        let (out, screen) = run(&rig, Some(&vision), 0, "Gmail").await;
        assert!(!out.resolved);
        assert_eq!(*screen.title.lock().unwrap(), "Loading");
    }

    #[tokio::test]
    async fn no_vision_and_failed_cheap_check_is_unresolved() {
        let rig = rig("https://accounts.test/");
        let (out, _) = run(&rig, None, 5, "Gmail").await;
        assert!(!out.resolved);
        assert_eq!(out.path, EscalationPath::Cdp);
    }

    #[tokio::test]
    async fn vision_errors_leave_the_step_unresolved() {
        let rig = rig("https://accounts.test/");
        let vision = ScriptedVision { calls: AtomicUsize::new(0), reply: Err(VisionError::Parse("eof".into())) };
        let (out, _) = run(&rig, Some(&vision), 0, "Gmail").await;
        assert!(!out.resolved);
        assert!(out.error.unwrap().contains("eof"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_pending_vision_call() {
        let rig = rig("https://accounts.test/");
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let ((out, screen), ()) = tokio::join!(run_until(&rig, Some(&HangingVision), 0, "Gmail", &cancel), async {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            cancel.cancel();
        });
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert!(!out.resolved);
        assert_eq!(out.path, EscalationPath::Vision);
        assert_eq!(out.vision_action, None);
        assert_eq!(out.error.as_deref(), Some("run cancelled"));
        assert_eq!(*screen.title.lock().unwrap(), "Loading");
    }
}
