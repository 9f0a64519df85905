//! Index-based element addressing.
//!
//! Every `InteractiveElement` sequence in the crate is produced by [`enumerate`],
//! and every index-addressed browser operation runs against the same
//! [`ELEMENTS_PRELUDE`]. Perception and execution therefore always agree on
//! what index `n` means for a given DOM state. Indices are only valid for the
//! snapshot they were produced in; the DOM may mutate at any time after.

use crate::browser::PageHandle;
use crate::error::ActionError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Interactive-role selector. Links, buttons, form inputs and the ARIA roles
/// that behave like them.
pub const INTERACTIVE_SELECTOR: &str = concat!(
    "a, button, input, select, textarea, ",
    "[role=\"button\"], [role=\"link\"], [role=\"tab\"], [role=\"checkbox\"], ",
    "[role=\"option\"], [role=\"menuitem\"], [role=\"combobox\"], [role=\"searchbox\"], ",
    "[role=\"textbox\"], [onclick]"
);

/// Builds `__dpEls`, the ordered list of visible interactive elements, plus the
/// helpers used to describe and fingerprint them. Pure read of the DOM.
pub const ELEMENTS_PRELUDE: &str = r#"
  const __dpSel = __DP_SELECTOR__;
  const __dpForm = new Set(['INPUT', 'TEXTAREA', 'SELECT']);
  const __dpHidden = (el) => {
    for (let n = el; n && n.nodeType === 1; n = n.parentElement) {
      const s = getComputedStyle(n);
      if (s.display === 'none' || s.visibility === 'hidden') return true;
    }
    return false;
  };
  const __dpVisible = (el) => {
    const r = el.getBoundingClientRect();
    if (!(r.width > 0 && r.height > 0 && r.bottom > 0 && r.right > 0
          && r.top < window.innerHeight && r.left < window.innerWidth)) return false;
    return !__dpHidden(el);
  };
  const __dpLabel = (el) => {
    const value = el.type === 'password' ? '' : (el.value || '');
    return String(el.innerText || value || el.getAttribute('aria-label')
      || el.getAttribute('placeholder') || el.title || '')
      .trim().replace(/\s+/g, ' ').slice(0, 120);
  };
  const __dpKey = (el) => {
    const tag = el.tagName.toLowerCase();
    const role = el.getAttribute('role') || '';
    const name = __dpForm.has(el.tagName)
      ? (el.getAttribute('placeholder') || el.getAttribute('aria-label') || el.getAttribute('name') || el.id || '')
      : __dpLabel(el);
    return tag + '|' + role + '|' + name;
  };
  const __dpEls = [];
  for (const el of document.querySelectorAll(__dpSel)) {
    if (!__dpVisible(el)) continue;
    if (!__dpLabel(el) && !__dpForm.has(el.tagName)) continue;
    __dpEls.push(el);
  }
  const __dpDescribe = (el) => {
    const r = el.getBoundingClientRect();
    return {
      tag: el.tagName.toLowerCase(),
      role: el.getAttribute('role') || '',
      text: __dpLabel(el),
      input_type: el.getAttribute('type') || '',
      placeholder: el.getAttribute('placeholder') || '',
      aria_label: el.getAttribute('aria-label') || '',
      name: el.getAttribute('name') || '',
      fingerprint: __dpKey(el),
      x: r.left, y: r.top, width: r.width, height: r.height,
    };
  };
"#;

fn with_elements(body: &str) -> String {
    let selector = serde_json::to_string(INTERACTIVE_SELECTOR).unwrap_or_default();
    format!(
        "(() => {{{}\n{}\n}})()",
        ELEMENTS_PRELUDE.replace("__DP_SELECTOR__", &selector),
        body
    )
}

pub fn enumerate_script() -> String {
    with_elements("return __dpEls.map(__dpDescribe);")
}

fn element_op_script(index: usize, expected: Option<&str>, op: &str) -> String {
    let expected = expected
        .map(|e| serde_json::to_string(e).unwrap_or_else(|_| "null".into()))
        .unwrap_or_else(|| "null".into());
    with_elements(&format!(
        r#"
  const el = __dpEls[{index}];
  if (!el) return {{ ok: false, reason: 'out_of_range', len: __dpEls.length }};
  const expected = {expected};
  if (expected !== null && __dpKey(el) !== expected) return {{ ok: false, reason: 'stale', len: __dpEls.length }};
  {op}
  return {{ ok: true, len: __dpEls.length }};"#
    ))
}

/// Clicks the element at `index` if it still carries `expected` as fingerprint.
pub fn click_script(index: usize, expected: Option<&str>) -> String {
    element_op_script(index, expected, "el.click();")
}

/// Focuses the element at `index`; text is inserted separately so nothing submits.
pub fn focus_script(index: usize, expected: Option<&str>) -> String {
    element_op_script(index, expected, "el.focus(); el.click();")
}

// ========================= Element Types =========================

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElementHint {
    #[default]
    None,
    LikelySearchInput,
    LikelyDropdownOption,
    LikelyPopupCloser,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InteractiveElement {
    pub index: usize,
    pub tag: String,
    pub role: String,
    pub text: String,
    pub hint: ElementHint,
    pub bbox: BoundingBox,
    /// Identity used to detect a stale index at execution time.
    pub fingerprint: String,
}

/// Shape returned by the enumeration script.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct RawElement {
    tag: String,
    role: String,
    text: String,
    input_type: String,
    placeholder: String,
    aria_label: String,
    name: String,
    fingerprint: String,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

const CLOSER_LABELS: &[&str] = &[
    "×", "x", "✕", "close", "dismiss", "no thanks", "not now", "got it", "accept",
    "accept all", "reject all", "i agree", "skip",
];

fn classify(raw: &RawElement) -> ElementHint {
    let tag = raw.tag.as_str();
    let role = raw.role.to_ascii_lowercase();
    let is_text_field = matches!(tag, "input" | "textarea")
        || matches!(role.as_str(), "searchbox" | "combobox" | "textbox");
    let naming = format!("{} {} {} {}", raw.placeholder, raw.aria_label, raw.name, raw.text).to_lowercase();
    if is_text_field
        && (raw.input_type.eq_ignore_ascii_case("search")
            || matches!(role.as_str(), "searchbox" | "combobox")
            || naming.contains("search")
            || raw.name == "q")
    {
        return ElementHint::LikelySearchInput;
    }
    if matches!(role.as_str(), "option" | "menuitem") {
        return ElementHint::LikelyDropdownOption;
    }
    let label = raw.text.trim().to_lowercase();
    let aria = raw.aria_label.to_lowercase();
    if CLOSER_LABELS.contains(&label.as_str()) || aria.contains("close") || aria.contains("dismiss") {
        return ElementHint::LikelyPopupCloser;
    }
    ElementHint::None
}

impl InteractiveElement {
    fn from_raw(index: usize, raw: RawElement) -> Self {
        let hint = classify(&raw);
        Self {
            index,
            hint,
            bbox: BoundingBox { x: raw.x, y: raw.y, width: raw.width, height: raw.height },
            tag: raw.tag,
            role: raw.role,
            text: raw.text,
            fingerprint: raw.fingerprint,
        }
    }

    pub fn is_text_input(&self) -> bool {
        matches!(self.tag.as_str(), "input" | "textarea")
            || matches!(self.role.as_str(), "searchbox" | "combobox" | "textbox")
    }
}

/// Parse the enumeration script's output. Indices follow array order, 0-based.
pub fn elements_from_value(value: serde_json::Value) -> Result<Vec<InteractiveElement>, ActionError> {
    let raw: Vec<RawElement> = serde_json::from_value(value)
        .map_err(|e| ActionError::Failed(format!("element enumeration returned bad shape: {e}")))?;
    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(i, r)| InteractiveElement::from_raw(i, r))
        .collect())
}

/// The only producer of `InteractiveElement` sequences.
pub async fn enumerate(page: &dyn PageHandle) -> Result<Vec<InteractiveElement>, ActionError> {
    let value = page.evaluate(&enumerate_script()).await?;
    let elements = elements_from_value(value)?;
    debug!(count = elements.len(), "enumerated interactive elements");
    Ok(elements)
}

#[derive(Debug, Deserialize)]
struct ElementOpResult {
    ok: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    len: usize,
}

/// Interpret the value returned by [`click_script`] / [`focus_script`].
pub fn element_op_outcome(index: usize, value: serde_json::Value) -> Result<(), ActionError> {
    let out: ElementOpResult = serde_json::from_value(value)
        .map_err(|e| ActionError::Failed(format!("element op returned bad shape: {e}")))?;
    if out.ok {
        return Ok(());
    }
    match out.reason.as_deref() {
        Some("out_of_range") => Err(ActionError::IndexOutOfRange { index, len: out.len }),
        Some("stale") => Err(ActionError::StaleIndex { index }),
        other => Err(ActionError::Failed(format!(
            "element op on index {index} failed: {}",
            other.unwrap_or("unknown")
        ))),
    }
}

/// One line per element, the form planners read.
pub fn render_elements(elements: &[InteractiveElement]) -> String {
    let mut out = String::new();
    for el in elements {
        let role = if el.role.is_empty() { String::new() } else { format!(" role={}", el.role) };
        let hint = match el.hint {
            ElementHint::None => "",
            ElementHint::LikelySearchInput => " <likely-search-input>",
            ElementHint::LikelyDropdownOption => " <likely-dropdown-option>",
            ElementHint::LikelyPopupCloser => " <likely-popup-closer>",
        };
        out.push_str(&format!("[{}] {}{} \"{}\"{}\n", el.index, el.tag, role, el.text, hint));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    struct StaticDom {
        elements: Value,
        scripts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PageHandle for StaticDom {
        async fn evaluate(&self, script: &str) -> Result<Value, ActionError> {
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(self.elements.clone())
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

    fn dom() -> StaticDom {
        StaticDom {
            elements: json!([
                {"tag": "input", "input_type": "search", "placeholder": "Search", "fingerprint": "input||Search",
                 "x": 10.0, "y": 10.0, "width": 300.0, "height": 30.0},
                {"tag": "li", "role": "option", "text": "rust lang", "fingerprint": "li|option|rust lang",
                 "x": 10.0, "y": 40.0, "width": 300.0, "height": 20.0},
                {"tag": "button", "text": "×", "aria_label": "Close dialog", "fingerprint": "button||×",
                 "x": 500.0, "y": 5.0, "width": 20.0, "height": 20.0},
                {"tag": "a", "text": "About", "fingerprint": "a||About",
                 "x": 0.0, "y": 100.0, "width": 50.0, "height": 16.0}
            ]),
            scripts: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn enumeration_is_idempotent_for_a_fixed_dom() {
        let page = dom();
        let first = enumerate(&page).await.unwrap();
        let second = enumerate(&page).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.iter().map(|e| e.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn hints_are_classified() {
        let els = enumerate(&dom()).await.unwrap();
        assert_eq!(els[0].hint, ElementHint::LikelySearchInput);
        assert!(els[0].is_text_input());
        assert_eq!(els[1].hint, ElementHint::LikelyDropdownOption);
        assert_eq!(els[2].hint, ElementHint::LikelyPopupCloser);
        assert_eq!(els[3].hint, ElementHint::None);
        assert_eq!(els[2].bbox.center(), (510.0, 15.0));
    }

    #[test]
    fn perception_and_execution_share_one_prelude() {
        let selector = serde_json::to_string(INTERACTIVE_SELECTOR).unwrap();
        let prelude = ELEMENTS_PRELUDE.replace("__DP_SELECTOR__", &selector);
        for script in [enumerate_script(), click_script(3, Some("a||About")), focus_script(0, None)] {
            assert!(script.contains(&prelude));
        }
        assert!(click_script(3, Some("a||About")).contains("__dpEls[3]"));
        assert!(click_script(3, Some("a||About")).contains("\"a||About\""));
    }

    #[test]
    fn element_op_outcomes() {
        assert!(element_op_outcome(1, json!({"ok": true, "len": 4})).is_ok());
        assert_eq!(
            element_op_outcome(9, json!({"ok": false, "reason": "out_of_range", "len": 4})),
            Err(ActionError::IndexOutOfRange { index: 9, len: 4 })
        );
        assert_eq!(
            element_op_outcome(1, json!({"ok": false, "reason": "stale", "len": 4})),
            Err(ActionError::StaleIndex { index: 1 })
        );
    }

    #[test]
    fn renders_one_line_per_element() {
        let els = elements_from_value(dom().elements).unwrap();
        let text = render_elements(&els);
        assert!(text.starts_with("[0] input \"\" <likely-search-input>\n"));
        assert!(text.contains("[1] li role=option \"rust lang\" <likely-dropdown-option>"));
    }
}
