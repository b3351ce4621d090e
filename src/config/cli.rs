use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the geoprint binary.
#[derive(Debug, Parser)]
#[command(name = "geoprint", version, about = "Map print dispatch service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "GEOPRINT_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the print HTTP service.
    Serve(Box<ServeArgs>),
    /// Query the print backend and write the capabilities document to stdout.
    Info(InfoArgs),
    /// Delete expired print artifacts once and exit.
    Purge(PurgeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct BackendOverrides {
    /// Forward print jobs to this remote print service instead of the local renderer.
    #[arg(long = "remote-url", value_name = "URL")]
    pub remote_url: Option<String>,

    /// Override the print engine configuration file handed to the local renderer.
    #[arg(long = "renderer-config", value_name = "PATH")]
    pub renderer_config_path: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ArtifactOverrides {
    /// Override the directory holding rendered artifacts.
    #[arg(long = "artifacts-directory", value_name = "PATH")]
    pub artifacts_directory: Option<PathBuf>,

    /// Override the artifact retention period.
    #[arg(long = "artifacts-ttl-seconds", value_name = "SECONDS")]
    pub artifacts_ttl_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub backend: BackendOverrides,

    #[command(flatten)]
    pub artifacts: ArtifactOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct InfoArgs {
    #[command(flatten)]
    pub backend: BackendOverrides,

    /// Host written into the `createURL` of the printed document.
    #[arg(long = "public-host", value_name = "HOST", default_value = "localhost")]
    pub public_host: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub artifacts: ArtifactOverrides,
}
