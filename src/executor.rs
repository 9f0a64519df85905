use crate::action::{Action, ActionFamily};
use crate::browser::{normalize_url, PageHandle};
use crate::desktop::Desktop;
use crate::elements::{click_script, element_op_outcome, focus_script};
use crate::error::ActionError;
use crate::snapshot::Snapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Where an action goes, decided against the snapshot it was planned on.
#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    /// WAIT, DONE, FAIL: handled by the executor itself.
    Control,
    Desktop,
    Browser,
    /// A browser navigate expressed as a keyboard skill for a non-browser surface.
    Keyboard(Vec<Action>),
    Reject(ActionError),
}

pub fn route(action: &Action, browser_active: bool, page_available: bool) -> Route {
    match action {
        Action::Wait { .. } | Action::Done { .. } | Action::Fail { .. } => Route::Control,
        a if a.family() == ActionFamily::Desktop => Route::Desktop,
        _ if browser_active && page_available => Route::Browser,
        Action::BrowserNavigate { url } => Route::Keyboard(vec![
            Action::PressKey { key: "ctrl+l".into() },
            Action::Type { text: normalize_url(url) },
            Action::PressKey { key: "Return".into() },
        ]),
        other => Route::Reject(ActionError::BrowserInactive(other.to_string())),
    }
}

/// Dispatches actions to the desktop or the page. Browser click/type address
/// elements through the same prelude the observer enumerated with.
#[derive(Clone, Default)]
pub struct Executor {
    page: Option<Arc<dyn PageHandle>>,
}

impl Executor {
    pub fn new(page: Option<Arc<dyn PageHandle>>) -> Self {
        Self { page }
    }

    pub async fn execute(
        &self,
        desktop: &dyn Desktop,
        action: &Action,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<(), ActionError> {
        if cancel.is_cancelled() {
            return Err(ActionError::Cancelled);
        }
        let route = route(action, snapshot.is_browser_active(), self.page.is_some());
        debug!(action = %action, route = ?route, "execute");
        let run = async {
            match &route {
                Route::Control => self.control(action, cancel).await,
                Route::Desktop => desktop.execute(action).await,
                Route::Keyboard(skill) => {
                    for a in skill {
                        desktop.execute(a).await?;
                    }
                    Ok(())
                }
                Route::Browser => self.browser(action, snapshot).await,
                Route::Reject(e) => Err(e.clone()),
            }
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ActionError::Cancelled),
            r = run => r,
        };
        match result {
            Err(ActionError::ContextDestroyed(msg)) if route == Route::Browser => {
                // Usually the action navigated, which is what was wanted; it can also
                // hide a renderer crash.
                warn!(action = %action, error = %msg, "execution context destroyed; counting as success (false-positive risk)");
                Ok(())
            }
            other => other,
        }
    }

    async fn control(&self, action: &Action, cancel: &CancellationToken) -> Result<(), ActionError> {
        if let Action::Wait { seconds } = action {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ActionError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))) => {}
            }
        }
        Ok(())
    }

    async fn browser(&self, action: &Action, snapshot: &Snapshot) -> Result<(), ActionError> {
        let page = self
            .page
            .as_deref()
            .ok_or_else(|| ActionError::BrowserInactive("no page handle".into()))?;
        match action {
            Action::BrowserNavigate { url } => page.navigate(&normalize_url(url)).await,
            Action::BrowserClick { element_index } => {
                let expected = expected_fingerprint(snapshot, *element_index)?;
                let out = page.evaluate(&click_script(*element_index, Some(expected))).await?;
                element_op_outcome(*element_index, out)
            }
            Action::BrowserType { element_index, text } => {
                let expected = expected_fingerprint(snapshot, *element_index)?;
                let out = page.evaluate(&focus_script(*element_index, Some(expected))).await?;
                element_op_outcome(*element_index, out)?;
                page.insert_text(text).await
            }
            other => Err(ActionError::Unsupported(other.kind().to_string())),
        }
    }
}

fn expected_fingerprint(snapshot: &Snapshot, index: usize) -> Result<&str, ActionError> {
    let elements = snapshot.elements();
    elements
        .get(index)
        .map(|el| el.fingerprint.as_str())
        .ok_or(ActionError::IndexOutOfRange { index, len: elements.len() })
}
