use crate::snapshot::Snapshot;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Which signal confirmed an anchor. Variants are listed in precedence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorMatch {
    AppClass,
    Title,
    Url,
    Fuzzy,
}

#[derive(Clone, Debug)]
pub struct VerifierConfig {
    /// Fraction of anchor tokens that must be present; the match is strict (`>`).
    pub fuzzy_threshold: f64,
    /// Leading host labels (after `www.`) of search engines, e.g. `google` for `www.google.co.uk`.
    pub search_engine_hosts: Vec<String>,
    /// Lowercase page-title endings of a results page.
    pub search_title_suffixes: Vec<String>,
    /// Lowercase window-title endings the browser appends to the page title.
    pub browser_title_suffixes: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.5,
            search_engine_hosts: owned(&["google", "bing", "duckduckgo"]),
            search_title_suffixes: owned(&["- google search", "- bing", "- search", "at duckduckgo"]),
            browser_title_suffixes: owned(&[
                "- google chrome",
                "- chromium",
                "- mozilla firefox",
                "\u{2014} mozilla firefox",
                "- brave",
                "- microsoft edge",
            ]),
        }
    }
}

fn tokens(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    !haystack.is_empty() && haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[derive(Clone, Debug, Default)]
pub struct AnchorVerifier {
    config: VerifierConfig,
}

impl AnchorVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// First applicable rule wins: app class, title, URL (browser only), fuzzy.
    /// A blank anchor never matches.
    pub fn match_anchor(&self, snap: &Snapshot, anchor: &str) -> Option<AnchorMatch> {
        let anchor = anchor.trim();
        if anchor.is_empty() {
            return None;
        }
        let hit = if contains_ci(&snap.app_class, anchor) {
            Some(AnchorMatch::AppClass)
        } else if contains_ci(&snap.window_title, anchor) {
            Some(AnchorMatch::Title)
        } else if snap.url().is_some_and(|u| contains_ci(u, anchor)) {
            Some(AnchorMatch::Url)
        } else if self.fuzzy_match(snap, anchor) {
            Some(AnchorMatch::Fuzzy)
        } else {
            None
        };
        debug!(anchor, rule = ?hit, "anchor check");
        hit
    }

    pub fn verify(&self, snap: &Snapshot, anchor: &str) -> bool {
        self.match_anchor(snap, anchor).is_some()
    }

    fn fuzzy_match(&self, snap: &Snapshot, anchor: &str) -> bool {
        let expected: HashSet<String> = tokens(anchor).into_iter().collect();
        if expected.is_empty() {
            return false;
        }
        let browser_title = snap.browser.as_ref().map(|b| b.title.as_str()).unwrap_or("");
        let combined = format!(
            "{} {} {} {}",
            snap.window_title,
            browser_title,
            snap.url().unwrap_or(""),
            snap.visible_text()
        );
        let present: HashSet<String> = tokens(&combined).into_iter().collect();
        let found = expected.iter().filter(|t| present.contains(*t)).count();
        (found as f64 / expected.len() as f64) > self.config.fuzzy_threshold
    }

    /// Any indicator appears (case-insensitive) in the page's visible text or
    /// in `extracted_text` from an OCR pass. Empty indicator sets detect nothing.
    pub fn indicators_detected(&self, snap: &Snapshot, indicators: &[String], extracted_text: Option<&str>) -> bool {
        let visible = snap.visible_text().to_lowercase();
        let ocr = extracted_text.unwrap_or("").to_lowercase();
        indicators
            .iter()
            .map(|i| i.trim().to_lowercase())
            .filter(|i| !i.is_empty())
            .any(|i| visible.contains(&i) || ocr.contains(&i))
    }

    /// A search engine results page: an engine host with a search path or `q`
    /// query, or a page title ending like a results page. The browser's own
    /// window-title suffix is ignored.
    pub fn on_search_engine(&self, snap: &Snapshot) -> bool {
        self.results_url(snap.url().unwrap_or("")) || self.results_title(&self.page_title(snap))
    }

    fn results_url(&self, url: &str) -> bool {
        let Ok(url) = Url::parse(url) else {
            return false;
        };
        let host = url.host_str().unwrap_or("").to_lowercase();
        let host = host.strip_prefix("www.").unwrap_or(&host);
        let engine = host
            .split('.')
            .next()
            .is_some_and(|label| host.contains('.') && self.config.search_engine_hosts.iter().any(|h| h == label));
        engine && (url.path().starts_with("/search") || url.query_pairs().any(|(k, _)| k == "q"))
    }

    fn results_title(&self, title: &str) -> bool {
        let title = title.trim();
        !title.is_empty() && self.config.search_title_suffixes.iter().any(|m| title.ends_with(m.as_str()))
    }

    /// The page title when the browser reported one, else the window title
    /// with any browser suffix removed. Lowercase.
    fn page_title(&self, snap: &Snapshot) -> String {
        if let Some(b) = snap.browser.as_ref().filter(|b| !b.title.trim().is_empty()) {
            return b.title.to_lowercase();
        }
        let title = snap.window_title.trim().to_lowercase();
        self.config
            .browser_title_suffixes
            .iter()
            .find_map(|sfx| title.strip_suffix(sfx.as_str()))
            .map(|t| t.trim_end().to_string())
            .unwrap_or(title)
    }

    /// Stricter than an anchor match: the anchor matches, at least one indicator
    /// is on screen, and the surface is not a search results page.
    pub fn is_complete(
        &self,
        snap: &Snapshot,
        anchor: &str,
        indicators: &[String],
        extracted_text: Option<&str>,
    ) -> bool {
        if indicators.iter().all(|i| i.trim().is_empty()) {
            return false;
        }
        if self.on_search_engine(snap) {
            debug!("completion suppressed on a search results page");
            return false;
        }
        self.verify(snap, anchor) && self.indicators_detected(snap, indicators, extracted_text)
    }

    /// Screenshot-free re-check used before spending a vision call: URL
    /// contains the anchor, or an indicator is in the page text.
    pub fn cheap_recheck(&self, snap: &Snapshot, anchor: &str, indicators: &[String]) -> bool {
        let anchor = anchor.trim();
        let url_hit = !anchor.is_empty() && snap.url().is_some_and(|u| contains_ci(u, anchor));
        url_hit || self.indicators_detected(snap, indicators, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{BrowserState, WindowInfo};

    fn browser_snap(app_class: &str, title: &str, url: &str, text: &str) -> Snapshot {
        Snapshot::new(
            WindowInfo { title: title.into(), app_class: app_class.into() },
            None,
            Some(BrowserState {
                url: url.into(),
                title: title.into(),
                visible_text: text.into(),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn title_rule_wins_over_url_and_fuzzy() {
        let v = AnchorVerifier::default();
        let snap = browser_snap("Chrome", "Inbox (3) - Gmail", "https://mail.google.com/mail/u/0/", "");
        assert_eq!(v.match_anchor(&snap, "Gmail"), Some(AnchorMatch::Title));
    }

    #[test]
    fn app_class_is_checked_first() {
        let v = AnchorVerifier::default();
        let snap = Snapshot::desktop(WindowInfo { title: "Untitled — Mousepad".into(), app_class: "Mousepad".into() });
        assert_eq!(v.match_anchor(&snap, "mousepad"), Some(AnchorMatch::AppClass));
    }

    #[test]
    fn url_rule_only_applies_in_the_browser() {
        let v = AnchorVerifier::default();
        let snap = browser_snap("Chromium", "Example Domain", "https://example.com/", "");
        assert_eq!(v.match_anchor(&snap, "example.com"), Some(AnchorMatch::Url));
        let desk = Snapshot::desktop(WindowInfo { title: "Terminal".into(), app_class: "xterm".into() });
        assert_eq!(v.match_anchor(&desk, "example.com"), None);
    }

    #[test]
    fn fuzzy_needs_a_strict_majority() {
        let v = AnchorVerifier::default();
        let snap = browser_snap("Chromium", "Shop", "https://shop.test/cart", "Your shopping cart has 2 items");
        assert_eq!(v.match_anchor(&snap, "shopping cart page"), Some(AnchorMatch::Fuzzy));
        // 1 of 2 tokens is exactly half, not a majority
        assert_eq!(v.match_anchor(&snap, "cart checkout"), None);
    }

    #[test]
    fn blank_anchor_never_matches() {
        let v = AnchorVerifier::default();
        let snap = browser_snap("Chromium", "", "", "");
        assert_eq!(v.match_anchor(&snap, "   "), None);
    }

    #[test]
    fn anchor_match_with_empty_text_is_not_completion() {
        let v = AnchorVerifier::default();
        let snap = browser_snap("Chromium", "Checkout", "https://shop.test/checkout/done", "");
        let indicators = vec!["Order Confirmed".to_string()];
        assert!(v.verify(&snap, "checkout"));
        assert!(!v.is_complete(&snap, "checkout", &indicators, None));

        let snap = browser_snap("Chromium", "Checkout", "https://shop.test/checkout/done", "ORDER CONFIRMED #123");
        assert!(v.is_complete(&snap, "checkout", &indicators, None));
        assert!(!v.is_complete(&snap, "checkout", &[], None));
    }

    #[test]
    fn ocr_text_counts_as_visible_content() {
        let v = AnchorVerifier::default();
        let snap = Snapshot::desktop(WindowInfo { title: "Calculator".into(), app_class: "gnome-calculator".into() });
        let indicators = vec!["42".to_string()];
        assert!(!v.is_complete(&snap, "Calculator", &indicators, None));
        assert!(v.is_complete(&snap, "Calculator", &indicators, Some("= 42")));
    }

    #[test]
    fn search_results_never_complete() {
        let v = AnchorVerifier::default();
        let snap = browser_snap("Chromium", "rust - Google Search", "https://www.google.com/search?q=rust", "Rust Programming Language");
        let indicators = vec!["Rust Programming Language".to_string()];
        assert!(!v.is_complete(&snap, "rust", &indicators, None));

        let ddg = browser_snap("Chromium", "rust at DuckDuckGo", "https://duckduckgo.com/?q=rust", "Rust Programming Language");
        assert!(v.on_search_engine(&ddg));
        let bing = Snapshot::desktop(WindowInfo { title: "rust - Search - Microsoft Edge".into(), app_class: "Microsoft-edge".into() });
        assert!(v.on_search_engine(&bing));
    }

    #[test]
    fn ordinary_pages_on_engine_domains_can_complete() {
        let v = AnchorVerifier::default();
        let gmail = browser_snap("Chromium", "Inbox (3) - Gmail", "https://mail.google.com/mail/u/0/", "Compose Inbox");
        assert!(!v.on_search_engine(&gmail));
        assert!(v.is_complete(&gmail, "Gmail", &["Compose".to_string()], None));

        let research = browser_snap("Chromium", "Research", "https://shop.test/research?search=lamps", "Order Confirmed");
        assert!(!v.on_search_engine(&research));
        assert!(v.is_complete(&research, "research", &["Order Confirmed".to_string()], None));
    }

    #[test]
    fn browser_window_suffix_is_not_a_search_marker() {
        let v = AnchorVerifier::default();
        let chrome = Snapshot::desktop(WindowInfo { title: "Thank you - Google Chrome".into(), app_class: "Google-chrome".into() });
        assert!(!v.on_search_engine(&chrome));
        assert!(v.is_complete(&chrome, "Thank you", &["Order Confirmed".to_string()], Some("Order Confirmed #881")));

        let results = Snapshot::desktop(WindowInfo {
            title: "thank you cards - Google Search - Google Chrome".into(),
            app_class: "Google-chrome".into(),
        });
        assert!(v.on_search_engine(&results));
    }

    #[test]
    fn cheap_recheck_uses_url_or_text() {
        let v = AnchorVerifier::default();
        let snap = browser_snap("Chromium", "Loading", "https://example.com/", "");
        assert!(v.cheap_recheck(&snap, "example.com", &[]));
        assert!(!v.cheap_recheck(&snap, "Loading", &[]));
        let snap = browser_snap("Chromium", "x", "https://a.test/", "Welcome back");
        assert!(v.cheap_recheck(&snap, "zzz", &["welcome".into()]));
    }
}
