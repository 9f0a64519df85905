use crate::action::Action;
use crate::desktop::Desktop;
use crate::error::ActionError;
use crate::snapshot::WindowInfo;
use anyhow::Result;
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams, DispatchMouseEventType,
    InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{info, warn};

// ========================= Page Seam =========================

/// A live browser page. The enumeration routine and the browser actuator both
/// talk to the page only through this trait.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Evaluate an expression and return its JSON value (`Null` for undefined).
    async fn evaluate(&self, script: &str) -> Result<Value, ActionError>;
    async fn navigate(&self, url: &str) -> Result<(), ActionError>;
    /// Insert text into the focused element without key events that could submit.
    async fn insert_text(&self, text: &str) -> Result<(), ActionError>;
    async fn press_key(&self, key: &str) -> Result<(), ActionError>;
    async fn screenshot_png(&self) -> Result<Vec<u8>, ActionError>;
}

/// Prefix `https://` when the planner hands over a bare host.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    const SCHEMES: [&str; 6] = ["http://", "https://", "file://", "about:", "chrome://", "data:"];
    if SCHEMES.iter().any(|s| url.starts_with(s)) {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

// ========================= Chromium Adapter =========================

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, viewport: (1280, 800) }
    }
}

pub struct ChromiumPage {
    page: Page,
    viewport: (u32, u32),
    _browser: OxideBrowser,
}

impl ChromiumPage {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique profile per run; a shared one trips Chromium's ProcessSingleton lock.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("deskpilot-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        let this = Self { page, viewport: cfg.viewport, _browser: browser };
        this.force_viewport().await;
        Ok(this)
    }

    /// Attach to a running browser (`--remote-debugging-port`), retrying with
    /// exponential backoff while it comes up.
    pub async fn connect(ws_url: &str, retries: u32, initial_delay: Duration) -> Result<Self> {
        let mut delay = initial_delay;
        let mut last_err = None;
        for attempt in 1..=retries.max(1) {
            match Self::try_connect(ws_url).await {
                Ok(page) => {
                    info!(attempt, ws_url, "attached to browser over CDP");
                    return Ok(page);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "CDP connect failed");
                    last_err = Some(e);
                    if attempt < retries {
                        sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("CDP connect failed")))
    }

    async fn try_connect(ws_url: &str) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        // The first existing tab is the one the user sees.
        let page = match browser.pages().await?.into_iter().next() {
            Some(p) => p,
            None => browser.new_page("about:blank").await?,
        };
        Ok(Self { page, viewport: (1280, 800), _browser: browser })
    }

    async fn force_viewport(&self) {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.0 as i64)
            .height(self.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build();
        if let Ok(p) = params {
            let _ = self.page.execute(p).await;
        }
    }

    pub async fn title(&self) -> Result<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    pub async fn click_at(&self, x: f64, y: f64) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder()
            .x(x)
            .y(y)
            .button(MouseButton::Left)
            .click_count(1);
        let press = cmd
            .clone()
            .r#type(DispatchMouseEventType::MousePressed)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        let release = cmd
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.page.move_mouse(Point { x, y }).await?.execute(press).await?;
        self.page.execute(release).await?;
        Ok(())
    }

    pub async fn scroll_by(&self, dy: i64) -> Result<()> {
        let eval = EvaluateParams::builder()
            .expression(format!("window.scrollBy(0, {dy});"))
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.page.execute(eval).await?;
        Ok(())
    }

    async fn take_screenshot(&self) -> Result<Vec<u8>> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParams::builder().full_page(false).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    self.force_viewport().await;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(take().await?);
                }
                Err(e.into())
            }
        }
    }
}

/// Chrome key names for the CDP key event: (key, code, virtual key code, text).
fn cdp_key(key: &str) -> (String, String, i64, Option<&'static str>) {
    match key.trim().to_lowercase().as_str() {
        "enter" | "return" => ("Enter".into(), "Enter".into(), 13, Some("\r")),
        "tab" => ("Tab".into(), "Tab".into(), 9, None),
        "escape" | "esc" => ("Escape".into(), "Escape".into(), 27, None),
        "backspace" => ("Backspace".into(), "Backspace".into(), 8, None),
        "delete" => ("Delete".into(), "Delete".into(), 46, None),
        "arrowdown" | "down" => ("ArrowDown".into(), "ArrowDown".into(), 40, None),
        "arrowup" | "up" => ("ArrowUp".into(), "ArrowUp".into(), 38, None),
        "pagedown" | "page_down" => ("PageDown".into(), "PageDown".into(), 34, None),
        "pageup" | "page_up" => ("PageUp".into(), "PageUp".into(), 33, None),
        _ => (key.to_string(), key.to_string(), 0, None),
    }
}

fn cdp_err(e: impl std::fmt::Display) -> ActionError {
    ActionError::from_message(e.to_string())
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn evaluate(&self, script: &str) -> Result<Value, ActionError> {
        let result = self.page.evaluate(script.to_string()).await.map_err(cdp_err)?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn navigate(&self, url: &str) -> Result<(), ActionError> {
        self.page.goto(url).await.map_err(cdp_err)?;
        self.page.wait_for_navigation().await.map_err(cdp_err)?;
        Ok(())
    }

    async fn insert_text(&self, text: &str) -> Result<(), ActionError> {
        self.page
            .execute(InsertTextParams { text: text.to_string() })
            .await
            .map_err(cdp_err)?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), ActionError> {
        let (key, code, vk, text) = cdp_key(key);
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let mut b = DispatchKeyEventParams::builder()
                .r#type(kind.clone())
                .key(key.clone())
                .code(code.clone())
                .windows_virtual_key_code(vk)
                .native_virtual_key_code(vk);
            if let (DispatchKeyEventType::KeyDown, Some(t)) = (&kind, text) {
                b = b.text(t);
            }
            let params = b.build().map_err(ActionError::Failed)?;
            self.page.execute(params).await.map_err(cdp_err)?;
        }
        Ok(())
    }

    async fn screenshot_png(&self) -> Result<Vec<u8>, ActionError> {
        self.take_screenshot().await.map_err(cdp_err)
    }
}

/// Lets a chromium page stand in for the whole desktop when no X display exists.
pub struct ChromiumDesktop {
    page: std::sync::Arc<ChromiumPage>,
}

impl ChromiumDesktop {
    pub const APP_CLASS: &'static str = "Chromium";

    pub fn new(page: std::sync::Arc<ChromiumPage>) -> Self {
        Self { page }
    }
}

#[async_trait]
impl Desktop for ChromiumDesktop {
    async fn active_window(&self) -> Result<WindowInfo, ActionError> {
        let title = self.page.title().await.map_err(cdp_err)?;
        Ok(WindowInfo { title, app_class: Self::APP_CLASS.to_string() })
    }

    async fn screenshot(&self) -> Result<Vec<u8>, ActionError> {
        self.page.screenshot_png().await
    }

    async fn execute(&self, action: &Action) -> Result<(), ActionError> {
        match action {
            Action::Click { x, y } => self.page.click_at(*x as f64, *y as f64).await.map_err(cdp_err),
            Action::Type { text } => self.page.insert_text(text).await,
            Action::PressKey { key } => self.page.press_key(key).await,
            // one wheel notch is roughly 100px
            Action::Scroll { amount } => self.page.scroll_by(*amount as i64 * 100).await.map_err(cdp_err),
            other => Err(ActionError::Unsupported(format!("{} on chromium desktop", other.kind()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_get_a_scheme() {
        assert_eq!(normalize_url("example.com"), "https://example.com");
        assert_eq!(normalize_url(" http://x.org "), "http://x.org");
        assert_eq!(normalize_url("about:blank"), "about:blank");
    }

    #[test]
    fn enter_carries_a_carriage_return() {
        let (key, _, vk, text) = cdp_key("RETURN");
        assert_eq!(key, "Enter");
        assert_eq!(vk, 13);
        assert_eq!(text, Some("\r"));
        assert_eq!(cdp_key("a").0, "a");
    }
}
