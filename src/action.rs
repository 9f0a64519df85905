use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

// ========================= Action Model =========================

/// One primitive the controller can execute. Serialised as JSON tagged by
/// `"type"`, which is also the wire format vision providers answer in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    // desktop family
    Click { x: u32, y: u32 },
    Type { text: String },
    Scroll { amount: i32 },
    PressKey { key: String },
    Wait { seconds: f64 },
    Done {
        #[serde(default)]
        final_answer: Option<String>,
    },
    Fail { error: String },
    // browser family
    BrowserNavigate { url: String },
    BrowserClick { element_index: usize },
    /// Focuses and types; never submits.
    BrowserType { element_index: usize, text: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionFamily {
    Desktop,
    Browser,
}

pub const MIN_WAIT_SECONDS: f64 = 0.1;
pub const MAX_WAIT_SECONDS: f64 = 10.0;

impl Action {
    pub fn family(&self) -> ActionFamily {
        match self {
            Action::BrowserNavigate { .. } | Action::BrowserClick { .. } | Action::BrowserType { .. } => {
                ActionFamily::Browser
            }
            _ => ActionFamily::Desktop,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Done { .. } | Action::Fail { .. })
    }

    pub fn element_index(&self) -> Option<usize> {
        match self {
            Action::BrowserClick { element_index } | Action::BrowserType { element_index, .. } => {
                Some(*element_index)
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "CLICK",
            Action::Type { .. } => "TYPE",
            Action::Scroll { .. } => "SCROLL",
            Action::PressKey { .. } => "PRESS_KEY",
            Action::Wait { .. } => "WAIT",
            Action::Done { .. } => "DONE",
            Action::Fail { .. } => "FAIL",
            Action::BrowserNavigate { .. } => "BROWSER_NAVIGATE",
            Action::BrowserClick { .. } => "BROWSER_CLICK",
            Action::BrowserType { .. } => "BROWSER_TYPE",
        }
    }

    /// Field-level constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Action::Type { text } | Action::BrowserType { text, .. } if text.is_empty() => {
                Err(format!("{}: text must not be empty", self.kind()))
            }
            Action::PressKey { key } if key.trim().is_empty() => {
                Err("PRESS_KEY: key must not be empty".into())
            }
            Action::Wait { seconds } if !(MIN_WAIT_SECONDS..=MAX_WAIT_SECONDS).contains(seconds) => {
                Err(format!(
                    "WAIT: {seconds} outside {MIN_WAIT_SECONDS}..={MAX_WAIT_SECONDS} seconds"
                ))
            }
            Action::BrowserNavigate { url } if url.trim().is_empty() => {
                Err("BROWSER_NAVIGATE: url must not be empty".into())
            }
            Action::Fail { error } if error.trim().is_empty() => Err("FAIL: error must not be empty".into()),
            _ => Ok(()),
        }
    }
}

/// Renders the token form the planner speaks, e.g. `BROWSER_TYPE(2, cats)`.
impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Click { x, y } => write!(f, "CLICK({x}, {y})"),
            Action::Type { text } => write!(f, "TYPE({text})"),
            Action::Scroll { amount } => write!(f, "SCROLL({amount})"),
            Action::PressKey { key } => write!(f, "PRESS_KEY({key})"),
            Action::Wait { seconds } => write!(f, "WAIT({seconds})"),
            Action::Done { final_answer } => write!(f, "DONE({})", final_answer.as_deref().unwrap_or("")),
            Action::Fail { error } => write!(f, "FAIL({error})"),
            Action::BrowserNavigate { url } => write!(f, "BROWSER_NAVIGATE({url})"),
            Action::BrowserClick { element_index } => write!(f, "BROWSER_CLICK({element_index})"),
            Action::BrowserType { element_index, text } => {
                write!(f, "BROWSER_TYPE({element_index}, {text})")
            }
        }
    }
}

// ========================= Token Grammar =========================

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^([A-Za-z_]+)\s*(?:\((.*)\))?$").expect("token regex is valid")
});

/// A planner token that could not be turned into an [`Action`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RejectedToken {
    pub token: String,
    pub reason: String,
}

fn unquote(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '"' || c == '\'')
}

fn split_pair(param: &str) -> Option<(&str, &str)> {
    let (a, b) = param.split_once(',')?;
    Some((unquote(a), unquote(b)))
}

/// Parse one `NAME(param)` token.
pub fn parse_token(token: &str) -> Result<Action, String> {
    let token = token.trim();
    let caps = TOKEN_RE
        .captures(token)
        .ok_or_else(|| format!("not of the form NAME(param): {token:?}"))?;
    let name = caps[1].to_ascii_uppercase();
    let param = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let p = unquote(param);

    let action = match name.as_str() {
        "CLICK" => {
            let (x, y) = split_pair(param).ok_or("CLICK needs x, y")?;
            Action::Click {
                x: x.parse().map_err(|_| format!("bad x coordinate {x:?}"))?,
                y: y.parse().map_err(|_| format!("bad y coordinate {y:?}"))?,
            }
        }
        "TYPE" => Action::Type { text: p.to_string() },
        "SCROLL" => Action::Scroll {
            amount: p.parse().map_err(|_| format!("bad scroll amount {p:?}"))?,
        },
        "PRESS_KEY" | "KEY" => Action::PressKey { key: p.to_string() },
        "WAIT" => Action::Wait {
            seconds: if p.is_empty() {
                1.0
            } else {
                p.parse().map_err(|_| format!("bad wait seconds {p:?}"))?
            },
        },
        "DONE" => Action::Done {
            final_answer: (!p.is_empty()).then(|| p.to_string()),
        },
        "FAIL" => Action::Fail {
            error: if p.is_empty() { "Task failed".to_string() } else { p.to_string() },
        },
        "BROWSER_NAVIGATE" | "NAVIGATE" => Action::BrowserNavigate { url: p.to_string() },
        "BROWSER_CLICK" => Action::BrowserClick {
            element_index: p.parse().map_err(|_| format!("bad element index {p:?}"))?,
        },
        "BROWSER_TYPE" => {
            let (idx, text) = split_pair(param).ok_or("BROWSER_TYPE needs index, text")?;
            Action::BrowserType {
                element_index: idx.parse().map_err(|_| format!("bad element index {idx:?}"))?,
                text: text.to_string(),
            }
        }
        other => return Err(format!("unknown action {other}")),
    };
    action.validate()?;
    Ok(action)
}

/// Parse a `;`-separated sequence. Malformed tokens are dropped and reported,
/// never fatal to the rest of the sequence.
pub fn parse_sequence(sequence: &str) -> (Vec<Action>, Vec<RejectedToken>) {
    let mut actions = Vec::new();
    let mut rejected = Vec::new();
    for token in sequence.split(';').map(str::trim).filter(|t| !t.is_empty()) {
        match parse_token(token) {
            Ok(a) => actions.push(a),
            Err(reason) => rejected.push(RejectedToken { token: token.to_string(), reason }),
        }
    }
    (actions, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_desktop_skill_sequence() {
        let (actions, rejected) = parse_sequence("PRESS_KEY(Alt+F2); WAIT(1); TYPE(firefox); PRESS_KEY(ENTER)");
        assert!(rejected.is_empty());
        assert_eq!(
            actions,
            vec![
                Action::PressKey { key: "Alt+F2".into() },
                Action::Wait { seconds: 1.0 },
                Action::Type { text: "firefox".into() },
                Action::PressKey { key: "ENTER".into() },
            ]
        );
    }

    #[test]
    fn parses_browser_tokens_with_quotes() {
        let (actions, rejected) =
            parse_sequence(r#"BROWSER_NAVIGATE("example.com"); BROWSER_TYPE(2, "rust, the language"); BROWSER_CLICK(7)"#);
        assert!(rejected.is_empty());
        assert_eq!(actions[0], Action::BrowserNavigate { url: "example.com".into() });
        assert_eq!(
            actions[1],
            Action::BrowserType { element_index: 2, text: "rust, the language".into() }
        );
        assert_eq!(actions[2].element_index(), Some(7));
        assert_eq!(actions[2].family(), ActionFamily::Browser);
    }

    #[test]
    fn malformed_tokens_are_dropped_not_fatal() {
        let (actions, rejected) = parse_sequence("CLICK(12); garbage!!; WAIT(99); TYPE(hi); TELEPORT(3)");
        assert_eq!(actions, vec![Action::Type { text: "hi".into() }]);
        assert_eq!(rejected.len(), 4);
        assert!(rejected.iter().any(|r| r.reason.contains("WAIT")));
        assert!(rejected.iter().any(|r| r.reason.contains("unknown action TELEPORT")));
    }

    #[test]
    fn bare_done_and_fail_defaults() {
        let (actions, _) = parse_sequence("DONE; FAIL()");
        assert_eq!(actions[0], Action::Done { final_answer: None });
        assert_eq!(actions[1], Action::Fail { error: "Task failed".into() });
        assert!(actions.iter().all(Action::is_terminal));
    }

    #[test]
    fn vision_json_format() {
        let a: Action =
            serde_json::from_str(r#"{"type":"CLICK","x":10,"y":20,"reason":"open menu"}"#).unwrap();
        assert_eq!(a, Action::Click { x: 10, y: 20 });
        let a: Action = serde_json::from_str(r#"{"type":"DONE"}"#).unwrap();
        assert_eq!(a, Action::Done { final_answer: None });
        let v = serde_json::to_value(Action::BrowserClick { element_index: 3 }).unwrap();
        assert_eq!(v["type"], "BROWSER_CLICK");
    }

    #[test]
    fn display_round_trips_through_the_parser() {
        let a = Action::BrowserType { element_index: 4, text: "hello".into() };
        assert_eq!(parse_token(&a.to_string()).unwrap(), a);
    }
}
