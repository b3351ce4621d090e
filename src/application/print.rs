//! Print dispatch: filter, render, register, convert and describe.

use std::{fmt, sync::Arc, time::Duration, time::Instant};

use bytes::Bytes;
use geoprint_api_types::{OutputFormatEntry, RetrievalDescriptor};
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    application::{
        backend::{BackendError, PrintBackend},
        conversion::{ConversionError, ConversionStage},
        filter::JobFilter,
        topics::{Requester, TopicCatalog},
    },
    domain::{
        OutputFormat,
        artifact::{ArtifactRef, split_file_name},
        job::{PrintJob, RequestOrigin},
    },
    infra::artifacts::{ArtifactError, ArtifactStore},
};

/// Path of the create endpoint, advertised as `createURL`.
pub const CREATE_PATH: &str = "/print/create.json";
/// Prefix of artifact retrieval URLs.
pub const ARTIFACT_PATH: &str = "/print";

#[derive(Debug, Error)]
pub enum PrintError {
    #[error("invalid print job: {0}")]
    Validation(String),
    #[error("print engine failed")]
    RenderEngine(#[source] BackendError),
    #[error("print backend unavailable")]
    BackendUnavailable(#[source] BackendError),
    #[error("output format `{0}` is not available")]
    ConversionUnavailable(OutputFormat),
    #[error("conversion failed")]
    Conversion(#[source] ConversionError),
    #[error("artifact not found")]
    NotFound,
    #[error("artifact storage failed")]
    Storage(#[source] ArtifactError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl PrintError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<BackendError> for PrintError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::RenderEngine { .. } => Self::RenderEngine(error),
            BackendError::Unavailable { .. } => Self::BackendUnavailable(error),
        }
    }
}

impl From<ArtifactError> for PrintError {
    fn from(error: ArtifactError) -> Self {
        match error {
            ArtifactError::NotFound => Self::NotFound,
            other => Self::Storage(other),
        }
    }
}

/// Stages a print job moves through; `Failed` is reachable from rendering and converting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Received,
    LayersFiltered,
    Rendering,
    Converting,
    Registered,
    Done,
    Failed,
}

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::Received => "received",
            JobStage::LayersFiltered => "layers_filtered",
            JobStage::Rendering => "rendering",
            JobStage::Converting => "converting",
            JobStage::Registered => "registered",
            JobStage::Done => "done",
            JobStage::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful create call.
#[derive(Debug, Clone)]
pub struct PrintOutcome {
    pub descriptor: RetrievalDescriptor,
    pub artifact: ArtifactRef,
    /// Layers dropped because the requester may not see their topic.
    pub layers_removed: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct PrintOptions {
    pub retention: Duration,
    pub cache_capabilities: bool,
}

pub struct PrintService {
    backend: Arc<dyn PrintBackend>,
    store: Arc<ArtifactStore>,
    conversion: Arc<ConversionStage>,
    topics: Arc<TopicCatalog>,
    filter: JobFilter,
    options: PrintOptions,
    capabilities: OnceCell<Value>,
}

impl PrintService {
    pub fn new(
        backend: Arc<dyn PrintBackend>,
        store: Arc<ArtifactStore>,
        conversion: Arc<ConversionStage>,
        topics: Arc<TopicCatalog>,
        filter: JobFilter,
        options: PrintOptions,
    ) -> Self {
        Self {
            backend,
            store,
            conversion,
            topics,
            filter,
            options,
            capabilities: OnceCell::new(),
        }
    }

    pub fn topics(&self) -> &TopicCatalog {
        &self.topics
    }

    /// Capabilities document of the engine merged with this node's output formats.
    pub async fn describe(&self, origin: &RequestOrigin) -> Result<Value, PrintError> {
        let capabilities = if self.options.cache_capabilities {
            self.capabilities
                .get_or_try_init(|| self.backend.describe_capabilities())
                .await?
                .clone()
        } else {
            self.backend.describe_capabilities().await?
        };

        let Value::Object(mut document) = capabilities else {
            return Err(BackendError::render_engine(
                self.backend.kind(),
                "capabilities document is not a JSON object",
            )
            .into());
        };

        let formats: Vec<OutputFormatEntry> = self
            .conversion
            .supported_formats()
            .iter()
            .map(|&name| OutputFormatEntry { name })
            .collect();
        let formats = serde_json::to_value(formats)
            .map_err(|err| PrintError::Unexpected(format!("output formats: {err}")))?;

        document.insert("outputFormats".to_string(), formats);
        document.insert(
            "createURL".to_string(),
            Value::from(format!("{}{CREATE_PATH}", origin.base_url())),
        );
        Ok(Value::Object(document))
    }

    /// Run one print job to completion and describe where its output lives.
    pub async fn create(
        &self,
        mut job: PrintJob,
        requester: &Requester,
        origin: &RequestOrigin,
    ) -> Result<PrintOutcome, PrintError> {
        let started_at = Instant::now();
        let job_id = Uuid::new_v4();
        let format = job.output_format;
        log_stage(job_id, JobStage::Received, started_at);

        if job.dpi == 0 {
            return Err(PrintError::validation("dpi must be greater than zero"));
        }
        if !self.conversion.supports(format) {
            return Err(PrintError::ConversionUnavailable(format));
        }

        let purged = self.store.purge_expired(self.options.retention).await;
        if purged.removed > 0 || purged.failed > 0 {
            info!(
                target = "geoprint::print",
                op = "print::create",
                job = %job_id,
                removed = purged.removed,
                failed = purged.failed,
                "Expired artifacts swept"
            );
        }

        let report = self.filter.apply(&mut job, requester, origin, &self.topics);
        counter!("geoprint_layers_filtered_total").increment(report.layers_removed as u64);
        if report.layers_removed > 0 {
            info!(
                target = "geoprint::print",
                op = "print::create",
                job = %job_id,
                layers_removed = report.layers_removed,
                layers_kept = report.layers_kept,
                topics = ?report.removed_topics,
                "Layers of unauthorized topics removed from job"
            );
        }
        log_stage(job_id, JobStage::LayersFiltered, started_at);

        log_stage(job_id, JobStage::Rendering, started_at);
        let pdf = match self.backend.render(&job).await {
            Ok(pdf) => pdf,
            Err(err) => return Err(self.fail(job_id, format, started_at, err.into())),
        };

        let mut artifact = match self.store.register(&pdf, OutputFormat::Pdf).await {
            Ok(artifact) => artifact,
            Err(err) => return Err(self.fail(job_id, format, started_at, err.into())),
        };

        if format.requires_conversion() {
            log_stage(job_id, JobStage::Converting, started_at);
            artifact = match self.conversion.convert(artifact, format, job.dpi).await {
                Ok(converted) => converted,
                Err(ConversionError::Unavailable) => {
                    return Err(self.fail(
                        job_id,
                        format,
                        started_at,
                        PrintError::ConversionUnavailable(format),
                    ));
                }
                Err(err) => {
                    return Err(self.fail(
                        job_id,
                        format,
                        started_at,
                        PrintError::Conversion(err),
                    ));
                }
            };
        }
        log_stage(job_id, JobStage::Registered, started_at);

        let descriptor = match self.descriptor(artifact, origin) {
            Ok(descriptor) => descriptor,
            Err(err) => return Err(self.fail(job_id, format, started_at, err)),
        };
        counter!("geoprint_jobs_total", "result" => "ok", "format" => format.extension())
            .increment(1);
        info!(
            target = "geoprint::print",
            op = "print::create",
            job = %job_id,
            stage = %JobStage::Done,
            result = "ok",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            backend = self.backend.kind(),
            artifact = %artifact.file_name(),
            "Print job finished"
        );

        Ok(PrintOutcome {
            descriptor,
            artifact,
            layers_removed: report.layers_removed,
        })
    }

    /// Fetch an artifact by its public file name (`<id>.<extension>`).
    pub async fn fetch(&self, file_name: &str) -> Result<(Bytes, OutputFormat), PrintError> {
        let (id, extension) = split_file_name(file_name).ok_or(PrintError::NotFound)?;
        let format = OutputFormat::from_extension(extension).ok_or(PrintError::NotFound)?;
        let bytes = self.store.read(id, extension).await?;
        Ok((bytes, format))
    }

    fn descriptor(
        &self,
        artifact: ArtifactRef,
        origin: &RequestOrigin,
    ) -> Result<RetrievalDescriptor, PrintError> {
        let expires_at = time::Duration::try_from(self.options.retention)
            .ok()
            .and_then(|retention| OffsetDateTime::now_utc().checked_add(retention))
            .ok_or_else(|| {
                PrintError::Unexpected("retention period overflows the expiry timestamp".into())
            })?
            .format(&Rfc3339)
            .map_err(|err| PrintError::Unexpected(format!("expiry timestamp: {err}")))?;

        Ok(RetrievalDescriptor {
            get_url: format!(
                "{}{ARTIFACT_PATH}/{}",
                origin.base_url(),
                artifact.file_name()
            ),
            expires_at,
        })
    }

    fn fail(
        &self,
        job_id: Uuid,
        format: OutputFormat,
        started_at: Instant,
        error: PrintError,
    ) -> PrintError {
        counter!("geoprint_jobs_total", "result" => "failed", "format" => format.extension())
            .increment(1);
        warn!(
            target = "geoprint::print",
            op = "print::create",
            job = %job_id,
            stage = %JobStage::Failed,
            result = "error",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            backend = self.backend.kind(),
            error = %error,
            "Print job failed"
        );
        error
    }
}

fn log_stage(job_id: Uuid, stage: JobStage, started_at: Instant) {
    debug!(
        target = "geoprint::print",
        op = "print::create",
        job = %job_id,
        stage = %stage,
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        "Print job stage"
    );
}

#[cfg(test)]
mod tests;
