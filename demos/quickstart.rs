use anyhow::Result;
use deskpilot::{
    Agent, AgentConfig, BrowserConfig, ChromiumDesktop, ChromiumPage, DiskRunSink, LlmClient, LlmConfig, LlmPlanner,
    PageHandle, Task, VisionClient,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// Headless Chromium stands in for the whole desktop, so no X display is needed.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let page = Arc::new(ChromiumPage::launch(BrowserConfig::default()).await?);
    let llm = LlmClient::new(LlmConfig::default())?;
    let runs_dir = std::env::temp_dir().join("deskpilot_runs");

    let agent = Agent::new(LlmPlanner::new(llm.clone()), ChromiumDesktop::new(page.clone()), AgentConfig::default())
        .with_browser(page as Arc<dyn PageHandle>)
        .with_vision(Arc::new(VisionClient::new(llm)))
        .with_run_sink(Arc::new(DiskRunSink::new(&runs_dir)));

    let task = Task::new("Navigate to example.com and confirm the page loaded", 6)?;
    let result = agent.run(&task, &CancellationToken::new()).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    println!("artifacts: {}", runs_dir.join(&result.run_id).display());
    Ok(())
}
