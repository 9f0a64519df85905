use crate::agent::{Task, TaskResult};
use crate::error::AgentError;
use crate::history::StepRecord;
use crate::snapshot::now_ms;
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;

/// Where a run's artifacts go. Failures are logged by the caller and never
/// stop the run.
#[async_trait]
pub trait RunSink: Send + Sync {
    /// Store a step screenshot and return a reference to it.
    async fn save_screenshot(&self, run_id: &str, step: usize, png: &[u8]) -> Result<String, AgentError>;
    async fn record(
        &self,
        run_id: &str,
        step: usize,
        screenshot_ref: Option<&str>,
        record: &StepRecord,
    ) -> Result<(), AgentError>;
    async fn finish(&self, run_id: &str, task: &Task, result: &TaskResult) -> Result<(), AgentError>;
}

pub struct NullRunSink;

#[async_trait]
impl RunSink for NullRunSink {
    async fn save_screenshot(&self, _run_id: &str, step: usize, _png: &[u8]) -> Result<String, AgentError> {
        Ok(format!("step_{step:03}.png"))
    }

    async fn record(&self, _run_id: &str, _step: usize, _shot: Option<&str>, _record: &StepRecord) -> Result<(), AgentError> {
        Ok(())
    }

    async fn finish(&self, _run_id: &str, _task: &Task, _result: &TaskResult) -> Result<(), AgentError> {
        Ok(())
    }
}

/// `<base>/<run_id>/step_NNN.png`, `steps.jsonl` and `metadata.json`.
pub struct DiskRunSink {
    base_dir: PathBuf,
}

impl DiskRunSink {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }

    async fn run_dir(&self, run_id: &str) -> Result<PathBuf, AgentError> {
        let dir = self.base_dir.join(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentError::Sink(format!("create_dir {}: {e}", dir.display())))?;
        Ok(dir)
    }
}

#[async_trait]
impl RunSink for DiskRunSink {
    async fn save_screenshot(&self, run_id: &str, step: usize, png: &[u8]) -> Result<String, AgentError> {
        let path = self.run_dir(run_id).await?.join(format!("step_{step:03}.png"));
        async_fs::write(&path, png)
            .await
            .map_err(|e| AgentError::Sink(format!("write: {e}")))?;
        Ok(path.display().to_string())
    }

    async fn record(
        &self,
        run_id: &str,
        step: usize,
        screenshot_ref: Option<&str>,
        record: &StepRecord,
    ) -> Result<(), AgentError> {
        let path = self.run_dir(run_id).await?.join("steps.jsonl");
        let line = json!({ "step": step, "screenshot": screenshot_ref, "record": record });
        let mut f = async_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AgentError::Sink(format!("open: {e}")))?;
        f.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| AgentError::Sink(format!("append: {e}")))?;
        Ok(())
    }

    async fn finish(&self, run_id: &str, task: &Task, result: &TaskResult) -> Result<(), AgentError> {
        let path = self.run_dir(run_id).await?.join("metadata.json");
        let meta = json!({
            "run_id": run_id,
            "goal": task.goal,
            "max_steps": task.max_steps,
            "success": result.success,
            "steps_taken": result.steps_taken,
            "final_answer": result.final_answer,
            "error": result.error,
            "finished_at_ms": now_ms().to_string(),
        });
        let body = serde_json::to_vec_pretty(&meta).map_err(|e| AgentError::Sink(e.to_string()))?;
        async_fs::write(&path, body)
            .await
            .map_err(|e| AgentError::Sink(format!("write: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{EscalationPath, StepOutcome};
    use crate::planner::PlanStep;

    fn record(step: usize) -> StepRecord {
        StepRecord {
            step,
            plan: PlanStep::default(),
            executed: vec![],
            outcome: StepOutcome::Verified,
            anchor_match: None,
            escalation: EscalationPath::None,
            vision_action: None,
            screenshot_ref: None,
            snapshot_id: "snap".into(),
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn writes_screenshots_steps_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DiskRunSink::new(dir.path());
        let shot = sink.save_screenshot("run1", 1, b"png").await.unwrap();
        assert!(shot.ends_with("step_001.png"));
        sink.record("run1", 1, Some(&shot), &record(1)).await.unwrap();
        sink.record("run1", 2, None, &record(2)).await.unwrap();

        let task = Task::new("open example.com", 5).unwrap().with_run_id("run1");
        let result = TaskResult {
            success: true,
            steps_taken: 2,
            final_answer: Some("loaded".into()),
            error: None,
            run_id: "run1".into(),
        };
        sink.finish("run1", &task, &result).await.unwrap();

        let run_dir = dir.path().join("run1");
        let steps = std::fs::read_to_string(run_dir.join("steps.jsonl")).unwrap();
        assert_eq!(steps.lines().count(), 2);
        let meta: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("metadata.json")).unwrap()).unwrap();
        assert_eq!(meta["goal"], "open example.com");
        assert_eq!(meta["success"], true);
        assert_eq!(std::fs::read(run_dir.join("step_001.png")).unwrap(), b"png");
    }
}
