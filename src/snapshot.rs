use crate::elements::InteractiveElement;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};

/// What the window manager reports about the focused window.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub title: String,
    pub app_class: String,
}

/// Browser half of a snapshot; present only when the browser is the active surface.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserState {
    pub url: String,
    pub title: String,
    pub elements: Vec<InteractiveElement>,
    /// Truncated `document.body.innerText`.
    pub visible_text: String,
    pub is_loading: bool,
}

/// World state at one instant. Never mutated; the next observe supersedes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub window_title: String,
    pub app_class: String,
    pub focused_element: Option<String>,
    pub browser: Option<BrowserState>,
    pub captured_at_ms: u128,
}

impl Snapshot {
    pub fn new(window: WindowInfo, focused_element: Option<String>, browser: Option<BrowserState>) -> Self {
        Self {
            id: nanoid!(),
            window_title: window.title,
            app_class: window.app_class,
            focused_element,
            browser,
            captured_at_ms: now_ms(),
        }
    }

    pub fn desktop(window: WindowInfo) -> Self {
        Self::new(window, None, None)
    }

    pub fn is_browser_active(&self) -> bool {
        self.browser.is_some()
    }

    pub fn url(&self) -> Option<&str> {
        self.browser.as_ref().map(|b| b.url.as_str())
    }

    pub fn visible_text(&self) -> &str {
        self.browser.as_ref().map(|b| b.visible_text.as_str()).unwrap_or("")
    }

    pub fn elements(&self) -> &[InteractiveElement] {
        self.browser.as_ref().map(|b| b.elements.as_slice()).unwrap_or(&[])
    }
}

pub(crate) fn now_ms() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Truncate on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desktop_snapshot_has_no_browser_fields() {
        let s = Snapshot::desktop(WindowInfo { title: "Terminal".into(), app_class: "xterm".into() });
        assert!(!s.is_browser_active());
        assert_eq!(s.url(), None);
        assert_eq!(s.visible_text(), "");
        assert!(s.elements().is_empty());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
