use crate::action::Action;
use crate::error::ActionError;
use crate::snapshot::WindowInfo;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// The desktop: window-manager queries, screen capture and input injection.
#[async_trait]
pub trait Desktop: Send + Sync {
    async fn active_window(&self) -> Result<WindowInfo, ActionError>;
    /// PNG bytes of the current screen.
    async fn screenshot(&self) -> Result<Vec<u8>, ActionError>;
    /// Execute one desktop-family primitive.
    async fn execute(&self, action: &Action) -> Result<(), ActionError>;
}

#[async_trait]
impl<T: Desktop + ?Sized> Desktop for std::sync::Arc<T> {
    async fn active_window(&self) -> Result<WindowInfo, ActionError> {
        (**self).active_window().await
    }

    async fn screenshot(&self) -> Result<Vec<u8>, ActionError> {
        (**self).screenshot().await
    }

    async fn execute(&self, action: &Action) -> Result<(), ActionError> {
        (**self).execute(action).await
    }
}

/// Map LLM/X11-style key names to xdotool keysyms. Combos like `ctrl+l` are
/// normalised part by part.
pub fn normalize_key(key: &str) -> String {
    key.split('+')
        .map(|part| {
            let p = part.trim().to_lowercase();
            match p.as_str() {
                "super_l" | "super_r" | "super" | "meta" | "meta_l" | "meta_r" | "win" | "winleft"
                | "winright" => "super".to_string(),
                "control" | "control_l" | "control_r" | "ctrl" => "ctrl".to_string(),
                "alt_l" | "alt_r" | "alt" => "alt".to_string(),
                "shift_l" | "shift_r" | "shift" => "shift".to_string(),
                "return" | "enter" => "Return".to_string(),
                "escape" | "esc" => "Escape".to_string(),
                "tab" => "Tab".to_string(),
                "space" => "space".to_string(),
                "page_up" | "pageup" => "Prior".to_string(),
                "page_down" | "pagedown" => "Next".to_string(),
                "delete" | "del" => "Delete".to_string(),
                "backspace" | "back" => "BackSpace".to_string(),
                "up" | "down" | "left" | "right" | "home" | "end" => {
                    let mut c = p.chars();
                    c.next()
                        .map(|f| f.to_uppercase().collect::<String>() + c.as_str())
                        .unwrap_or_default()
                }
                _ if p.len() > 1 && p.starts_with('f') && p[1..].parse::<u8>().is_ok() => p.to_uppercase(),
                _ => part.trim().to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("+")
}

/// X11 desktop driven through `xdotool` and captured with `scrot`.
#[derive(Clone)]
pub struct XdotoolDesktop {
    query_timeout: Duration,
    /// Upper bound for input and capture commands; long TYPE strings take a while.
    command_timeout: Duration,
    type_delay_ms: u32,
}

impl Default for XdotoolDesktop {
    fn default() -> Self {
        Self { query_timeout: Duration::from_secs(2), command_timeout: Duration::from_secs(30), type_delay_ms: 20 }
    }
}

impl XdotoolDesktop {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let out = timeout(self.command_timeout, Command::new(program).args(args).output())
            .await
            .with_context(|| format!("{program} timed out"))?
            .with_context(|| format!("failed to spawn {program}"))?;
        if !out.status.success() {
            bail!("{program} {:?} exited with {}: {}", args, out.status, String::from_utf8_lossy(&out.stderr).trim());
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    async fn query(&self, args: &[&str]) -> Result<String> {
        let out = timeout(self.query_timeout, Command::new("xdotool").args(args).output())
            .await
            .context("xdotool query timed out")??;
        if !out.status.success() {
            bail!("xdotool {:?} failed", args);
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

fn xerr(e: anyhow::Error) -> ActionError {
    ActionError::Failed(format!("{e:#}"))
}

#[async_trait]
impl Desktop for XdotoolDesktop {
    async fn active_window(&self) -> Result<WindowInfo, ActionError> {
        let id = self.query(&["getactivewindow"]).await.map_err(xerr)?;
        // title and class are best-effort individually
        let title = self.query(&["getwindowname", &id]).await.unwrap_or_default();
        let app_class = self.query(&["getwindowclassname", &id]).await.unwrap_or_default();
        Ok(WindowInfo { title, app_class })
    }

    async fn screenshot(&self) -> Result<Vec<u8>, ActionError> {
        let path = std::env::temp_dir().join(format!("deskpilot-{}.png", nanoid::nanoid!()));
        let path_str = path.to_string_lossy().to_string();
        self.run("scrot", &["-o", &path_str]).await.map_err(xerr)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| ActionError::Failed(format!("read screenshot: {e}")))?;
        let _ = tokio::fs::remove_file(&path).await;
        Ok(bytes)
    }

    async fn execute(&self, action: &Action) -> Result<(), ActionError> {
        debug!(action = %action, "xdotool execute");
        match action {
            Action::Click { x, y } => {
                let (x, y) = (x.to_string(), y.to_string());
                self.run("xdotool", &["mousemove", &x, &y, "click", "1"]).await.map_err(xerr)?;
            }
            Action::Type { text } => {
                let delay = self.type_delay_ms.to_string();
                self.run("xdotool", &["type", "--delay", &delay, "--", text]).await.map_err(xerr)?;
            }
            Action::PressKey { key } => {
                let key = normalize_key(key);
                self.run("xdotool", &["key", "--clearmodifiers", &key]).await.map_err(xerr)?;
            }
            Action::Scroll { amount } => {
                // positive scrolls down (button 5), negative up (button 4)
                let button = if *amount >= 0 { "5" } else { "4" };
                let repeat = amount.unsigned_abs().max(1).to_string();
                self.run("xdotool", &["click", "--repeat", &repeat, button]).await.map_err(xerr)?;
            }
            other => {
                return Err(ActionError::Unsupported(format!("{} is not a desktop primitive", other.kind())))
            }
        }
        Ok(())
    }
}
