use std::{future::IntoFuture, process, sync::Arc};

use axum::http::HeaderName;
use geoprint::{
    application::{
        conversion::{ConversionStage, Rasterizer},
        error::AppError,
        filter::JobFilter,
        print::{PrintOptions, PrintService},
        topics::TopicCatalog,
    },
    config,
    domain::job::RequestOrigin,
    infra::{
        artifacts::ArtifactStore,
        backend::select_backend,
        error::InfraError,
        http::{self, HttpState},
        rasterizer::PdftoppmRasterizer,
        telemetry,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Info(args) => run_info(settings, args).await,
        config::Command::Purge(_) => run_purge(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let print = build_print_service(&settings).await?;
    let trusted_topics_header = settings
        .server
        .trusted_topics_header
        .as_deref()
        .map(HeaderName::try_from)
        .transpose()
        .map_err(|err| {
            AppError::from(InfraError::configuration(format!(
                "server.trusted_topics_header: {err}"
            )))
        })?;

    let state = HttpState {
        print,
        trusted_topics_header,
    };
    serve_http(&settings, state).await
}

async fn run_info(settings: config::Settings, args: config::InfoArgs) -> Result<(), AppError> {
    let print = build_print_service(&settings).await?;
    let origin = RequestOrigin::new("http", args.public_host);
    let document = print.describe(&origin).await?;

    let rendered = serde_json::to_string_pretty(&document)
        .map_err(|err| AppError::unexpected(format!("failed to render capabilities: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn run_purge(settings: config::Settings) -> Result<(), AppError> {
    let store = ArtifactStore::new(&settings.artifacts).map_err(InfraError::from)?;
    let summary = store.purge_expired(settings.artifacts.ttl).await;

    info!(
        target = "geoprint::purge",
        directory = %store.directory().display(),
        scanned = summary.scanned,
        removed = summary.removed,
        failed = summary.failed,
        "Retention sweep completed"
    );
    println!(
        "scanned={} removed={} failed={}",
        summary.scanned, summary.removed, summary.failed
    );

    if summary.failed > 0 {
        return Err(AppError::unexpected(format!(
            "{} expired artifacts could not be deleted",
            summary.failed
        )));
    }
    Ok(())
}

async fn build_print_service(settings: &config::Settings) -> Result<Arc<PrintService>, AppError> {
    let store = Arc::new(ArtifactStore::new(&settings.artifacts).map_err(InfraError::from)?);
    let backend = select_backend(settings, store.clone())?;

    let rasterizer = PdftoppmRasterizer::probe(&settings.conversion)
        .await
        .map(|rasterizer| Arc::new(rasterizer) as Arc<dyn Rasterizer>);
    let conversion = Arc::new(ConversionStage::new(rasterizer, store.clone()));
    let topics = Arc::new(TopicCatalog::new(&settings.topics, &settings.print));

    info!(
        target = "geoprint::startup",
        backend = backend.kind(),
        conversion = conversion.is_available(),
        artifacts = %store.directory().display(),
        topics = settings.topics.len(),
        "Print service configured"
    );

    Ok(Arc::new(PrintService::new(
        backend,
        store,
        conversion,
        topics,
        JobFilter::new(&settings.print),
        PrintOptions {
            retention: settings.artifacts.ttl,
            cache_capabilities: settings.print.cache_capabilities,
        },
    )))
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "geoprint::startup",
        addr = %settings.server.addr,
        "Listening"
    );

    let (stopping_tx, mut stopping_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = stopping_tx.send(true);
        })
        .into_future();

    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        if stopping_rx.wait_for(|stopping| *stopping).await.is_ok() {
            tokio::time::sleep(grace).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        () = deadline => {
            warn!(
                target = "geoprint::shutdown",
                grace_ms = grace.as_millis() as u64,
                "Graceful shutdown timed out; dropping in-flight requests"
            );
        }
    }

    info!(target = "geoprint::shutdown", "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "geoprint::shutdown", error = %err, "Ctrl-C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "geoprint::shutdown", error = %err, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!(
        target = "geoprint::shutdown",
        "Shutdown requested; draining in-flight requests"
    );
}
