//! Print engine seam: where jobs are rendered and capabilities come from.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::domain::job::PrintJob;

#[derive(Debug, Error)]
pub enum BackendError {
    /// The local engine failed to start, exited non-zero, timed out or
    /// produced unusable output.
    #[error("print engine failed: `{command}`: {stderr}")]
    RenderEngine { command: String, stderr: String },
    /// The remote print service could not be reached or answered badly.
    #[error("print service unavailable: {message}")]
    Unavailable { message: String },
}

impl BackendError {
    pub fn render_engine(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::RenderEngine {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Strategy that turns a print job into PDF bytes.
#[async_trait]
pub trait PrintBackend: Send + Sync {
    /// Short label used in logs.
    fn kind(&self) -> &'static str;

    /// Static capabilities document of the engine (layouts, scales, DPIs).
    async fn describe_capabilities(&self) -> Result<Value, BackendError>;

    async fn render(&self, job: &PrintJob) -> Result<Bytes, BackendError>;
}

/// First bytes of every PDF document.
pub const PDF_MAGIC: &[u8] = b"%PDF-";

pub fn looks_like_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}
