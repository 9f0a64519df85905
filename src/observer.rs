use crate::browser::PageHandle;
use crate::desktop::Desktop;
use crate::elements;
use crate::error::{ActionError, AgentError};
use crate::snapshot::{truncate_chars, BrowserState, Snapshot, WindowInfo};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct ObserverConfig {
    /// Lowercase substrings of an app class that identify the browser.
    pub browser_classes: Vec<String>,
    pub visible_text_limit: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            browser_classes: ["chrome", "chromium", "firefox", "navigator", "brave", "edge"]
                .into_iter()
                .map(String::from)
                .collect(),
            visible_text_limit: 3000,
        }
    }
}

const PAGE_STATE_SCRIPT: &str = r#"(() => {
  const a = document.activeElement;
  let active = '';
  if (a && a !== document.body) {
    const name = a.getAttribute('aria-label') || a.getAttribute('placeholder') || a.getAttribute('name') || a.id || '';
    active = a.tagName.toLowerCase() + (name ? ' "' + name + '"' : '');
  }
  return {
    url: location.href,
    title: document.title,
    ready_state: document.readyState,
    text: document.body ? document.body.innerText : '',
    active,
  };
})()"#;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PageState {
    url: String,
    title: String,
    ready_state: String,
    text: String,
    active: String,
}

/// Merges window-manager state and, when the browser is in front, page state
/// into one [`Snapshot`]. Never fails: missing pieces degrade the snapshot.
#[derive(Clone)]
pub struct StateObserver {
    config: ObserverConfig,
    page: Option<Arc<dyn PageHandle>>,
}

impl StateObserver {
    pub fn new(config: ObserverConfig, page: Option<Arc<dyn PageHandle>>) -> Self {
        Self { config, page }
    }

    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    pub fn is_browser_class(&self, app_class: &str) -> bool {
        let class = app_class.to_lowercase();
        !class.is_empty() && self.config.browser_classes.iter().any(|b| class.contains(b.as_str()))
    }

    pub async fn observe(&self, desktop: &dyn Desktop) -> Snapshot {
        let (window, wm_available) = match desktop.active_window().await {
            Ok(w) => (w, true),
            Err(e) => {
                debug!(error = %e, "window manager query failed");
                (WindowInfo::default(), false)
            }
        };

        let browser_in_front = self.is_browser_class(&window.app_class) || (!wm_available && self.page.is_some());
        let page = match (&self.page, browser_in_front) {
            (Some(page), true) => page,
            _ => return Snapshot::desktop(window),
        };

        match self.read_page(page.as_ref()).await {
            Ok((state, focused)) => Snapshot::new(window, focused, Some(state)),
            Err(e) => {
                let degraded = AgentError::PerceptionDegraded(e.to_string());
                warn!(error = %degraded, app_class = %window.app_class, "browser state unavailable; desktop-only snapshot");
                Snapshot::desktop(window)
            }
        }
    }

    async fn read_page(&self, page: &dyn PageHandle) -> Result<(BrowserState, Option<String>), ActionError> {
        let raw = page.evaluate(PAGE_STATE_SCRIPT).await?;
        let ps: PageState = serde_json::from_value(raw)
            .map_err(|e| ActionError::Failed(format!("page state returned bad shape: {e}")))?;
        let elements = elements::enumerate(page).await?;
        let focused = (!ps.active.is_empty()).then_some(ps.active);
        Ok((
            BrowserState {
                url: ps.url,
                title: ps.title,
                elements,
                visible_text: truncate_chars(ps.text.trim(), self.config.visible_text_limit),
                is_loading: ps.ready_state != "complete",
            },
            focused,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Wm(Option<WindowInfo>);

    #[async_trait]
    impl Desktop for Wm {
        async fn active_window(&self) -> Result<WindowInfo, ActionError> {
            self.0.clone().ok_or_else(|| ActionError::Failed("no display".into()))
        }
        async fn screenshot(&self) -> Result<Vec<u8>, ActionError> {
            Ok(Vec::new())
        }
        async fn execute(&self, _action: &Action) -> Result<(), ActionError> {
            Ok(())
        }
    }

    struct Page {
        broken: bool,
    }

    #[async_trait]
    impl PageHandle for Page {
        async fn evaluate(&self, script: &str) -> Result<Value, ActionError> {
            if self.broken {
                return Err(ActionError::Failed("websocket closed".into()));
            }
            if script.contains("readyState") {
                Ok(json!({"url": "https://example.com/", "title": "Example Domain",
                          "ready_state": "complete", "text": "Example Domain ".repeat(500), "active": ""}))
            } else {
                Ok(json!([{"tag": "a", "text": "More information...", "fingerprint": "a||More information...",
                           "x": 1.0, "y": 1.0, "width": 10.0, "height": 10.0}]))
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

    fn chrome() -> Option<WindowInfo> {
        Some(WindowInfo { title: "Example Domain - Google Chrome".into(), app_class: "Google-chrome".into() })
    }

    #[tokio::test]
    async fn merges_browser_state_when_browser_is_in_front() {
        let obs = StateObserver::new(ObserverConfig::default(), Some(Arc::new(Page { broken: false })));
        let snap = obs.observe(&Wm(chrome())).await;
        assert!(snap.is_browser_active());
        assert_eq!(snap.url(), Some("https://example.com/"));
        assert_eq!(snap.elements().len(), 1);
        assert_eq!(snap.visible_text().chars().count(), 3000);
        assert!(!snap.browser.as_ref().unwrap().is_loading);
    }

    #[tokio::test]
    async fn non_browser_window_yields_desktop_snapshot() {
        let obs = StateObserver::new(ObserverConfig::default(), Some(Arc::new(Page { broken: false })));
        let snap = obs
            .observe(&Wm(Some(WindowInfo { title: "Terminal".into(), app_class: "xfce4-terminal".into() })))
            .await;
        assert!(!snap.is_browser_active());
        assert_eq!(snap.window_title, "Terminal");
    }

    #[tokio::test]
    async fn broken_page_degrades_instead_of_failing() {
        let obs = StateObserver::new(ObserverConfig::default(), Some(Arc::new(Page { broken: true })));
        let snap = obs.observe(&Wm(chrome())).await;
        assert!(!snap.is_browser_active());
        assert_eq!(snap.app_class, "Google-chrome");
    }

    #[tokio::test]
    async fn missing_window_manager_is_not_fatal() {
        let obs = StateObserver::new(ObserverConfig::default(), None);
        let snap = obs.observe(&Wm(None)).await;
        assert_eq!(snap.window_title, "");
        assert_eq!(snap.app_class, "");

        let obs = StateObserver::new(ObserverConfig::default(), Some(Arc::new(Page { broken: false })));
        assert!(obs.observe(&Wm(None)).await.is_browser_active());
    }
}
