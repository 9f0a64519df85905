use crate::error::ActionError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Turns a screenshot into plain text for success-indicator checks.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, png: &[u8]) -> Result<String, ActionError>;
}

/// `tesseract stdin stdout`.
#[derive(Clone, Debug)]
pub struct TesseractOcr {
    pub binary: String,
    pub timeout: Duration,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self { binary: "tesseract".into(), timeout: Duration::from_secs(20) }
    }
}

#[async_trait]
impl TextExtractor for TesseractOcr {
    async fn extract(&self, png: &[u8]) -> Result<String, ActionError> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ActionError::Failed(format!("spawn {}: {e}", self.binary)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(png)
                .await
                .map_err(|e| ActionError::Failed(format!("ocr stdin: {e}")))?;
        }
        let out = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ActionError::Timeout("ocr".into()))?
            .map_err(|e| ActionError::Failed(format!("ocr: {e}")))?;
        if !out.status.success() {
            return Err(ActionError::Failed(format!("{} exited with {}", self.binary, out.status)));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}
