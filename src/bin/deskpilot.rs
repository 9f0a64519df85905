use anyhow::{Context, Result};
use clap::Parser;
use deskpilot::ocr::TesseractOcr;
use deskpilot::{
    duration_from_secs, Agent, AgentConfig, BrowserConfig, ChromiumDesktop, ChromiumPage, Desktop, DiskRunSink, LlmClient, LlmConfig,
    LlmPlanner, PageHandle, Task, TaskResult, VisionClient, XdotoolDesktop,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Drive the desktop or a browser toward a goal.
#[derive(Parser, Debug)]
#[command(name = "deskpilot", version, about)]
struct Cli {
    /// What to accomplish, in plain words.
    goal: String,

    #[arg(long, default_value_t = 15)]
    max_steps: usize,

    /// Run artifacts land in <runs-dir>/<run-id>/.
    #[arg(long, default_value = "runs")]
    runs_dir: PathBuf,

    /// Attach to a running browser instead of launching one.
    #[arg(long, env = "CHROME_WS_URL")]
    cdp_url: Option<String>,

    /// Drive the X11 desktop with xdotool; the browser (if any) only feeds page state.
    #[arg(long)]
    desktop: bool,

    /// Launch Chromium without a window.
    #[arg(long)]
    headless: bool,

    /// Never escalate to the vision model.
    #[arg(long)]
    no_vision: bool,

    /// Check success indicators with tesseract as well as page text.
    #[arg(long)]
    ocr: bool,

    #[arg(long, default_value_t = 2)]
    max_attempts: usize,

    #[arg(long, default_value_t = 5.0)]
    poll_timeout_secs: f64,

    #[arg(long, default_value_t = 3)]
    forced_vision_threshold: usize,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deskpilot=info")))
        .init();

    let cli = Cli::parse();
    let task = Task::new(cli.goal.clone(), cli.max_steps)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            on_signal.cancel();
        }
    });

    let page = match (&cli.cdp_url, cli.desktop) {
        (Some(ws), _) => Some(Arc::new(
            ChromiumPage::connect(ws, 5, Duration::from_secs(1))
                .await
                .with_context(|| format!("attach to {ws}"))?,
        )),
        (None, false) => Some(Arc::new(
            ChromiumPage::launch(BrowserConfig { headless: cli.headless, ..Default::default() }).await?,
        )),
        (None, true) => None,
    };

    let result = if cli.desktop {
        run(&cli, &task, XdotoolDesktop::new(), page.map(|p| p as Arc<dyn PageHandle>), &cancel).await?
    } else {
        let page = page.context("no browser page")?;
        let desktop = ChromiumDesktop::new(page.clone());
        run(&cli, &task, desktop, Some(page as Arc<dyn PageHandle>), &cancel).await?
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn run<D: Desktop>(
    cli: &Cli,
    task: &Task,
    desktop: D,
    page: Option<Arc<dyn PageHandle>>,
    cancel: &CancellationToken,
) -> Result<TaskResult> {
    let llm = LlmClient::new(LlmConfig::default())?;
    let cfg = AgentConfig {
        max_attempts: cli.max_attempts,
        poll_timeout: duration_from_secs("poll_timeout_secs", cli.poll_timeout_secs)?,
        forced_vision_threshold: cli.forced_vision_threshold,
        ..Default::default()
    };
    cfg.validate()?;
    let mut agent = Agent::new(LlmPlanner::new(llm.clone()), desktop, cfg)
        .with_run_sink(Arc::new(DiskRunSink::new(&cli.runs_dir)));
    if let Some(page) = page {
        agent = agent.with_browser(page);
    }
    if !cli.no_vision {
        agent = agent.with_vision(Arc::new(VisionClient::new(llm)));
    }
    if cli.ocr {
        agent = agent.with_text_extractor(Arc::new(TesseractOcr::default()));
    }
    info!(run_id = %task.run_id, runs_dir = %cli.runs_dir.display(), "starting");
    Ok(agent.run(task, cancel).await)
}
