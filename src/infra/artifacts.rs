//! Temporary print artifact storage on a (possibly shared) flat directory.
//!
//! Artifacts are named `<prefix><id>.<extension>`. There is no index: file
//! existence and mtime are the only metadata, so several nodes may share the
//! directory without coordination.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use metrics::counter;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use crate::config::ArtifactSettings;
use crate::domain::OutputFormat;
use crate::domain::artifact::{ArtifactId, ArtifactRef};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found")]
    NotFound,
    #[error("no free artifact identifier after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Counts reported by a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct ArtifactStore {
    directory: PathBuf,
    prefix: String,
    register_attempts: u32,
}

impl ArtifactStore {
    /// Initialise storage rooted at the configured directory, creating it if necessary.
    pub fn new(settings: &ArtifactSettings) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&settings.directory)?;
        Ok(Self {
            directory: settings.directory.clone(),
            prefix: settings.file_prefix.clone(),
            register_attempts: settings.register_attempts.get(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Absolute path of an artifact, whether or not it exists.
    pub fn path(&self, artifact: ArtifactRef) -> PathBuf {
        self.directory.join(format!(
            "{}{}.{}",
            self.prefix,
            artifact.id,
            artifact.format.extension()
        ))
    }

    /// Write `bytes` under a fresh identifier.
    ///
    /// Files are created exclusively; an identifier already present on disk is
    /// skipped rather than overwritten.
    pub async fn register(
        &self,
        bytes: &[u8],
        format: OutputFormat,
    ) -> Result<ArtifactRef, ArtifactError> {
        for attempt in 1..=self.register_attempts {
            let artifact = ArtifactRef::new(ArtifactId::random(), format);
            let path = self.path(artifact);

            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    warn!(
                        target = "geoprint::artifacts",
                        op = "artifacts::register",
                        attempt,
                        path = %path.display(),
                        "artifact identifier collision; drawing a new one"
                    );
                    continue;
                }
                Err(err) => return Err(ArtifactError::Io(err)),
            };

            if let Err(err) = write_all(&mut file, bytes).await {
                drop(file);
                let _ = fs::remove_file(&path).await;
                return Err(ArtifactError::Io(err));
            }

            debug!(
                target = "geoprint::artifacts",
                op = "artifacts::register",
                artifact = %artifact.file_name(),
                bytes = bytes.len(),
                "artifact registered"
            );
            return Ok(artifact);
        }

        Err(ArtifactError::Exhausted {
            attempts: self.register_attempts,
        })
    }

    /// Read an artifact by identifier and raw extension.
    ///
    /// Unknown extensions are reported as [`ArtifactError::NotFound`].
    pub async fn read(&self, id: ArtifactId, extension: &str) -> Result<Bytes, ArtifactError> {
        let format = OutputFormat::from_extension(extension).ok_or(ArtifactError::NotFound)?;
        self.read_artifact(ArtifactRef::new(id, format)).await
    }

    pub async fn read_artifact(&self, artifact: ArtifactRef) -> Result<Bytes, ArtifactError> {
        match fs::read(self.path(artifact)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(ArtifactError::NotFound),
            Err(err) => Err(ArtifactError::Io(err)),
        }
    }

    /// Remove an artifact. Missing files are treated as success.
    pub async fn delete(&self, artifact: ArtifactRef) -> Result<(), ArtifactError> {
        match fs::remove_file(self.path(artifact)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ArtifactError::Io(err)),
        }
    }

    /// Create an empty scratch file in the artifact directory.
    ///
    /// The name carries the artifact prefix and `suffix`, so a scratch file
    /// orphaned by a crash is eventually removed by the retention sweep. The
    /// file is deleted when the handle drops.
    pub fn scratch_file(&self, suffix: &str) -> Result<NamedTempFile, std::io::Error> {
        tempfile::Builder::new()
            .prefix(&format!("{}scratch-", self.prefix))
            .suffix(suffix)
            .tempfile_in(&self.directory)
    }

    /// Delete managed files whose mtime is older than `now - ttl`.
    ///
    /// Only names starting with the prefix and ending in a known extension are
    /// considered. Failures on individual files are logged and skipped.
    pub async fn purge_expired(&self, ttl: Duration) -> PurgeSummary {
        let started_at = Instant::now();
        let mut summary = PurgeSummary::default();
        let cutoff = SystemTime::now()
            .checked_sub(ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    target = "geoprint::artifacts",
                    op = "artifacts::purge_expired",
                    directory = %self.directory.display(),
                    error = %err,
                    "failed to scan artifact directory"
                );
                return summary;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        target = "geoprint::artifacts",
                        op = "artifacts::purge_expired",
                        error = %err,
                        "artifact directory scan aborted"
                    );
                    break;
                }
            };

            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !self.is_managed(name) {
                continue;
            }
            summary.scanned += 1;

            let path = entry.path();
            let modified = match entry.metadata().await.and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                // Another sweeper got there first.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        target = "geoprint::artifacts",
                        op = "artifacts::purge_expired",
                        path = %path.display(),
                        error = %err,
                        "failed to read artifact mtime"
                    );
                    continue;
                }
            };

            if modified >= cutoff {
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => summary.removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => summary.removed += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        target = "geoprint::artifacts",
                        op = "artifacts::purge_expired",
                        path = %path.display(),
                        error = %err,
                        "failed to delete expired artifact"
                    );
                }
            }
        }

        counter!("geoprint_artifacts_purged_total").increment(summary.removed as u64);
        debug!(
            target = "geoprint::artifacts",
            op = "artifacts::purge_expired",
            scanned = summary.scanned,
            removed = summary.removed,
            failed = summary.failed,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "retention sweep finished"
        );

        summary
    }

    fn is_managed(&self, name: &str) -> bool {
        let Some(rest) = name.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        rest.rsplit_once('.')
            .and_then(|(_, extension)| OutputFormat::from_extension(extension))
            .is_some()
    }
}

async fn write_all(file: &mut fs::File, bytes: &[u8]) -> Result<(), std::io::Error> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}
