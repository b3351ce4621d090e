//! Startup wiring of the print backend.

use std::sync::Arc;

use tracing::info;

use crate::{
    application::backend::PrintBackend,
    config::Settings,
    infra::{
        artifacts::ArtifactStore, error::InfraError, remote::RemoteServiceBackend,
        renderer::LocalProcessBackend,
    },
};

/// Remote service when an endpoint is configured, local renderer otherwise.
pub fn select_backend(
    settings: &Settings,
    store: Arc<ArtifactStore>,
) -> Result<Arc<dyn PrintBackend>, InfraError> {
    let backend: Arc<dyn PrintBackend> = match settings.remote.as_ref() {
        Some(remote) => Arc::new(
            RemoteServiceBackend::new(remote)
                .map_err(|err| InfraError::configuration(err.to_string()))?,
        ),
        None => Arc::new(LocalProcessBackend::new(&settings.renderer, store)),
    };

    info!(
        target = "geoprint::backend",
        backend = backend.kind(),
        "Print backend selected"
    );
    Ok(backend)
}
