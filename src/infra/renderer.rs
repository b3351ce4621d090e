use std::{ffi::OsString, path::PathBuf, sync::Arc, time::Duration, time::Instant};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::histogram;
use serde_json::Value;
use tokio::process::Command;
use tracing::{info, warn};

use crate::{
    application::backend::{BackendError, PrintBackend},
    config::RendererSettings,
    domain::job::PrintJob,
    infra::{
        artifacts::ArtifactStore,
        process::{ProcessError, run_with_timeout, stderr_text},
    },
};

/// Runs the print engine as a child process per request.
pub struct LocalProcessBackend {
    program: PathBuf,
    args: Vec<String>,
    config_path: PathBuf,
    timeout: Duration,
    store: Arc<ArtifactStore>,
}

impl LocalProcessBackend {
    pub fn new(settings: &RendererSettings, store: Arc<ArtifactStore>) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
            config_path: settings.config_path.clone(),
            timeout: settings.timeout,
            store,
        }
    }

    fn command_args(&self, mode: OsString) -> Vec<OsString> {
        let mut config_arg = OsString::from("--config=");
        config_arg.push(&self.config_path);

        let mut args: Vec<OsString> = self.args.iter().map(OsString::from).collect();
        args.push(config_arg);
        args.push(mode);
        args
    }

    fn command_line(&self, args: &[OsString]) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(args.iter().map(OsString::as_os_str))
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn invoke(
        &self,
        op: &'static str,
        mode: OsString,
        stdin: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, BackendError> {
        let started_at = Instant::now();
        let args = self.command_args(mode);
        let command_line = self.command_line(&args);

        let mut command = Command::new(&self.program);
        command.args(&args);

        let output = run_with_timeout(command, stdin, self.timeout)
            .await
            .map_err(|err| {
                let error_code = match &err {
                    ProcessError::TimedOut { .. } => "timeout",
                    ProcessError::Spawn { .. } => "spawn",
                    ProcessError::Io { .. } => "io",
                };
                warn!(
                    target = "geoprint::renderer",
                    op,
                    result = "error",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    error_code,
                    command = %command_line,
                    error = %err,
                    "Print engine invocation failed"
                );
                BackendError::render_engine(command_line.clone(), err.to_string())
            })?;

        if !output.status.success() {
            let exit_code = output.status.code().map(i64::from).unwrap_or(-1);
            let stderr = stderr_text(&output);
            warn!(
                target = "geoprint::renderer",
                op,
                result = "error",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                exit_code,
                error_code = "engine_exit",
                command = %command_line,
                stderr = %stderr,
                "Print engine exited unsuccessfully"
            );
            return Err(BackendError::render_engine(command_line, stderr));
        }

        info!(
            target = "geoprint::renderer",
            op,
            result = "ok",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            stdout_bytes = output.stdout.len(),
            "Print engine finished"
        );

        Ok(output.stdout)
    }
}

#[async_trait]
impl PrintBackend for LocalProcessBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn describe_capabilities(&self) -> Result<Value, BackendError> {
        let stdout = self
            .invoke(
                "renderer::describe_capabilities",
                OsString::from("--clientConfig"),
                None,
            )
            .await?;

        serde_json::from_slice(&stdout).map_err(|err| {
            BackendError::render_engine(
                self.command_line(&self.command_args(OsString::from("--clientConfig"))),
                format!("capabilities are not valid JSON: {err}"),
            )
        })
    }

    async fn render(&self, job: &PrintJob) -> Result<Bytes, BackendError> {
        let started_at = Instant::now();
        let document = job.engine_document().map_err(|err| {
            BackendError::render_engine(
                self.program.display().to_string(),
                format!("failed to serialize print job: {err}"),
            )
        })?;

        // Removed when the handle drops, whatever the outcome.
        let scratch = self.store.scratch_file(".pdf").map_err(|err| {
            BackendError::render_engine(
                self.program.display().to_string(),
                format!("failed to create scratch output: {err}"),
            )
        })?;
        let mut output_arg = OsString::from("--output=");
        output_arg.push(scratch.path());

        self.invoke("renderer::render", output_arg.clone(), Some(document))
            .await?;

        let pdf = tokio::fs::read(scratch.path()).await.map_err(|err| {
            BackendError::render_engine(
                self.command_line(&self.command_args(output_arg.clone())),
                format!("failed to read engine output: {err}"),
            )
        })?;
        if pdf.is_empty() {
            return Err(BackendError::render_engine(
                self.command_line(&self.command_args(output_arg)),
                "engine produced an empty document",
            ));
        }

        histogram!("geoprint_render_ms", "backend" => "local")
            .record(started_at.elapsed().as_millis() as f64);

        Ok(Bytes::from(pdf))
    }
}
