use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{info, warn};

use crate::{
    application::conversion::{ConversionError, Rasterizer},
    config::ConversionSettings,
    infra::process::{run_with_timeout, stderr_text},
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const OUTPUT_STEM: &str = "page";

/// Poppler's `pdftoppm`, rendering the first page of a PDF to PNG.
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    program: PathBuf,
    timeout: Duration,
}

impl PdftoppmRasterizer {
    pub fn new(program: PathBuf, timeout: Duration) -> Self {
        Self { program, timeout }
    }

    /// Return a rasterizer when conversion is enabled and `pdftoppm -v` can be run.
    ///
    /// The exit status is ignored: older poppler releases exit non-zero for `-v`.
    pub async fn probe(settings: &ConversionSettings) -> Option<Self> {
        if !settings.enabled {
            info!(
                target = "geoprint::rasterizer",
                op = "rasterizer::probe",
                result = "disabled",
                "Raster conversion disabled by configuration"
            );
            return None;
        }

        let mut command = Command::new(&settings.rasterizer_path);
        command.arg("-v");
        match run_with_timeout(command, None, PROBE_TIMEOUT).await {
            Ok(output) => {
                let banner = stderr_text(&output);
                info!(
                    target = "geoprint::rasterizer",
                    op = "rasterizer::probe",
                    result = "available",
                    program = %settings.rasterizer_path.display(),
                    version = banner.lines().next().unwrap_or_default(),
                    "Rasterizer available"
                );
                Some(Self::new(
                    settings.rasterizer_path.clone(),
                    settings.timeout,
                ))
            }
            Err(err) => {
                warn!(
                    target = "geoprint::rasterizer",
                    op = "rasterizer::probe",
                    result = "unavailable",
                    program = %settings.rasterizer_path.display(),
                    error = %err,
                    "Rasterizer unavailable; only pdf output will be offered"
                );
                None
            }
        }
    }
}

#[async_trait]
impl Rasterizer for PdftoppmRasterizer {
    async fn rasterize_png(&self, pdf: &Path, dpi: u32) -> Result<Vec<u8>, ConversionError> {
        let started_at = Instant::now();
        let workdir = TempDir::new()
            .map_err(|err| ConversionError::rasterizer(format!("scratch directory: {err}")))?;
        let output_prefix = workdir.path().join(OUTPUT_STEM);

        let mut command = Command::new(&self.program);
        command
            .args(["-f", "1", "-l", "1", "-r"])
            .arg(dpi.to_string())
            .args(["-png", "-singlefile"])
            .arg(pdf)
            .arg(&output_prefix);

        let output = run_with_timeout(command, None, self.timeout)
            .await
            .map_err(|err| ConversionError::rasterizer(err.to_string()))?;

        if !output.status.success() {
            let exit_code = output.status.code().map(i64::from).unwrap_or(-1);
            let stderr = stderr_text(&output);
            warn!(
                target = "geoprint::rasterizer",
                op = "rasterizer::rasterize_png",
                result = "error",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                exit_code,
                error_code = "rasterizer_exit",
                stderr = %stderr,
                "pdftoppm failed"
            );
            return Err(ConversionError::rasterizer(format!(
                "exit {exit_code}: {stderr}"
            )));
        }

        // `-singlefile` suppresses the page-number suffix.
        let png_path = output_prefix.with_extension("png");
        tokio::fs::read(&png_path).await.map_err(|err| {
            ConversionError::rasterizer(format!(
                "missing output {}: {err}",
                png_path.display()
            ))
        })
    }
}
