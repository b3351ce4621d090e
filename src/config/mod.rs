//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    collections::HashSet, net::SocketAddr, num::NonZeroU32, path::PathBuf, str::FromStr,
    time::Duration,
};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{
    ArtifactOverrides, BackendOverrides, CliArgs, Command, InfoArgs, PurgeArgs, ServeArgs,
    ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "geoprint";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 10;
const DEFAULT_ARTIFACT_DIR: &str = "tmp/print";
const DEFAULT_ARTIFACT_PREFIX: &str = "mfPrintTempFile";
pub(crate) const DEFAULT_ARTIFACT_TTL_SECS: u64 = 600;
const MAX_ARTIFACT_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_REGISTER_ATTEMPTS: u32 = 5;
const DEFAULT_RENDERER_PROGRAM: &str = "java";
const DEFAULT_RENDERER_ARGS: [&str; 3] = [
    "-cp",
    "lib/print/print-standalone.jar",
    "org.mapfish.print.ShellMapPrinter",
];
const DEFAULT_RENDERER_CONFIG: &str = "config/print.yml";
const DEFAULT_RENDERER_TIMEOUT_SECS: u64 = 120;
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_RASTERIZER_PATH: &str = "pdftoppm";
const DEFAULT_CONVERSION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_LOOPBACK_HOST: &str = "127.0.0.1";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Fully-resolved deployment settings, loaded once at startup and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub artifacts: ArtifactSettings,
    pub renderer: RendererSettings,
    /// Present when print jobs are forwarded to a remote print service.
    pub remote: Option<RemoteSettings>,
    pub conversion: ConversionSettings,
    pub print: PrintSettings,
    pub topics: Vec<TopicSettings>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    /// Header set by an authenticating proxy listing additional authorized topics.
    pub trusted_topics_header: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct ArtifactSettings {
    pub directory: PathBuf,
    pub file_prefix: String,
    pub ttl: Duration,
    pub register_attempts: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub config_path: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub url: Url,
    pub info_url: Option<Url>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ConversionSettings {
    pub enabled: bool,
    pub rasterizer_path: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PrintSettings {
    pub default_disclaimer: String,
    pub local_graphics_host: Option<String>,
    pub loopback_host: String,
    pub wms: Option<WmsRewriteSettings>,
    pub cache_capabilities: bool,
}

#[derive(Debug, Clone)]
pub struct WmsRewriteSettings {
    pub hosts: Vec<String>,
    pub mapserver_url: String,
    pub mapserver_cgi_url: Option<String>,
    pub map_dir: String,
    pub layer_filter_prefix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TopicSettings {
    pub name: String,
    pub disclaimer: Option<String>,
    pub public: bool,
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("GEOPRINT").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Info(args)) => raw.apply_backend_overrides(&args.backend),
        Some(Command::Purge(args)) => raw.apply_artifact_overrides(&args.artifacts),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    use clap::Parser;

    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    artifacts: RawArtifactSettings,
    renderer: RawRendererSettings,
    remote: RawRemoteSettings,
    conversion: RawConversionSettings,
    print: RawPrintSettings,
    topics: Vec<RawTopicSettings>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }

        self.apply_backend_overrides(&overrides.backend);
        self.apply_artifact_overrides(&overrides.artifacts);
    }

    fn apply_backend_overrides(&mut self, overrides: &BackendOverrides) {
        if let Some(url) = overrides.remote_url.as_ref() {
            self.remote.url = Some(url.clone());
        }
        if let Some(path) = overrides.renderer_config_path.as_ref() {
            self.renderer.config_path = Some(path.clone());
        }
    }

    fn apply_artifact_overrides(&mut self, overrides: &ArtifactOverrides) {
        if let Some(directory) = overrides.artifacts_directory.as_ref() {
            self.artifacts.directory = Some(directory.clone());
        }
        if let Some(ttl) = overrides.artifacts_ttl_seconds {
            self.artifacts.ttl_seconds = Some(ttl);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            artifacts,
            renderer,
            remote,
            conversion,
            print,
            topics,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let artifacts = build_artifact_settings(artifacts)?;
        let renderer = build_renderer_settings(renderer, &artifacts)?;
        let remote = build_remote_settings(remote)?;
        let conversion = build_conversion_settings(conversion)?;
        let print = build_print_settings(print)?;
        let topics = build_topic_settings(topics)?;

        Ok(Self {
            server,
            logging,
            artifacts,
            renderer,
            remote,
            conversion,
            print,
            topics,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_shutdown_seconds = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_shutdown_seconds),
        trusted_topics_header: non_blank(server.trusted_topics_header)
            .map(|header| header.to_ascii_lowercase()),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_artifact_settings(artifacts: RawArtifactSettings) -> Result<ArtifactSettings, LoadError> {
    let directory = artifacts
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "artifacts.directory",
            "path must not be empty",
        ));
    }

    let file_prefix = artifacts
        .file_prefix
        .unwrap_or_else(|| DEFAULT_ARTIFACT_PREFIX.to_string());
    if file_prefix.is_empty() {
        return Err(LoadError::invalid(
            "artifacts.file_prefix",
            "prefix must not be empty",
        ));
    }
    if file_prefix.contains(['/', '\\', '.']) {
        return Err(LoadError::invalid(
            "artifacts.file_prefix",
            "prefix must be a plain file name fragment",
        ));
    }

    let ttl_seconds = artifacts.ttl_seconds.unwrap_or(DEFAULT_ARTIFACT_TTL_SECS);
    if ttl_seconds == 0 {
        return Err(LoadError::invalid(
            "artifacts.ttl_seconds",
            "must be greater than zero",
        ));
    }
    if ttl_seconds > MAX_ARTIFACT_TTL_SECS {
        return Err(LoadError::invalid(
            "artifacts.ttl_seconds",
            format!("must not exceed {MAX_ARTIFACT_TTL_SECS} seconds"),
        ));
    }

    let attempts = artifacts
        .register_attempts
        .unwrap_or(DEFAULT_REGISTER_ATTEMPTS);
    let register_attempts = non_zero_u32(attempts.into(), "artifacts.register_attempts")?;

    Ok(ArtifactSettings {
        directory,
        file_prefix,
        ttl: Duration::from_secs(ttl_seconds),
        register_attempts,
    })
}

fn build_renderer_settings(
    renderer: RawRendererSettings,
    artifacts: &ArtifactSettings,
) -> Result<RendererSettings, LoadError> {
    let program = renderer
        .program
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDERER_PROGRAM));
    if program.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "renderer.program",
            "path must not be empty",
        ));
    }

    let args = renderer.args.unwrap_or_else(|| {
        DEFAULT_RENDERER_ARGS
            .iter()
            .map(|arg| arg.to_string())
            .collect()
    });

    let config_path = renderer
        .config_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDERER_CONFIG));
    if config_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "renderer.config_path",
            "path must not be empty",
        ));
    }

    let timeout_seconds = renderer
        .timeout_seconds
        .unwrap_or(DEFAULT_RENDERER_TIMEOUT_SECS);
    if timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "renderer.timeout_seconds",
            "must be greater than zero",
        ));
    }
    let timeout = Duration::from_secs(timeout_seconds);
    // Scratch output lives next to the artifacts and falls under the same sweep.
    if timeout >= artifacts.ttl {
        return Err(LoadError::invalid(
            "renderer.timeout_seconds",
            "must be shorter than artifacts.ttl_seconds",
        ));
    }

    Ok(RendererSettings {
        program,
        args,
        config_path,
        timeout,
    })
}

fn build_remote_settings(remote: RawRemoteSettings) -> Result<Option<RemoteSettings>, LoadError> {
    let Some(raw_url) = non_blank(remote.url) else {
        return Ok(None);
    };

    let url = parse_http_url(&raw_url, "remote.url")?;
    let info_url = non_blank(remote.info_url)
        .map(|value| parse_http_url(&value, "remote.info_url"))
        .transpose()?;

    let timeout_seconds = remote.timeout_seconds.unwrap_or(DEFAULT_REMOTE_TIMEOUT_SECS);
    if timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "remote.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(Some(RemoteSettings {
        url,
        info_url,
        timeout: Duration::from_secs(timeout_seconds),
    }))
}

fn build_conversion_settings(
    conversion: RawConversionSettings,
) -> Result<ConversionSettings, LoadError> {
    let rasterizer_path = conversion
        .rasterizer_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RASTERIZER_PATH));
    if rasterizer_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "conversion.rasterizer_path",
            "path must not be empty",
        ));
    }

    let timeout_seconds = conversion
        .timeout_seconds
        .unwrap_or(DEFAULT_CONVERSION_TIMEOUT_SECS);
    if timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "conversion.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ConversionSettings {
        enabled: conversion.enabled.unwrap_or(true),
        rasterizer_path,
        timeout: Duration::from_secs(timeout_seconds),
    })
}

fn build_print_settings(print: RawPrintSettings) -> Result<PrintSettings, LoadError> {
    let loopback_host =
        non_blank(print.loopback_host).unwrap_or_else(|| DEFAULT_LOOPBACK_HOST.to_string());

    let wms = match non_blank(print.mapserver_url) {
        Some(mapserver_url) => {
            let map_dir = non_blank(print.map_dir).ok_or_else(|| {
                LoadError::invalid(
                    "print.map_dir",
                    "required when print.mapserver_url is set",
                )
            })?;
            let hosts: Vec<String> = print
                .local_wms_hosts
                .into_iter()
                .filter_map(|host| non_blank(Some(host)))
                .map(|host| host.to_ascii_lowercase())
                .collect();
            Some(WmsRewriteSettings {
                hosts,
                mapserver_url,
                mapserver_cgi_url: non_blank(print.mapserver_cgi_url),
                map_dir: map_dir.trim_end_matches('/').to_string(),
                layer_filter_prefix: non_blank(print.layer_filter_prefix),
            })
        }
        None => None,
    };

    Ok(PrintSettings {
        default_disclaimer: print.default_disclaimer.unwrap_or_default(),
        local_graphics_host: non_blank(print.local_graphics_host),
        loopback_host,
        wms,
        cache_capabilities: print.cache_capabilities.unwrap_or(true),
    })
}

fn build_topic_settings(topics: Vec<RawTopicSettings>) -> Result<Vec<TopicSettings>, LoadError> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(topics.len());

    for topic in topics {
        let Some(name) = non_blank(topic.name) else {
            return Err(LoadError::invalid("topics.name", "must not be empty"));
        };
        if !seen.insert(name.clone()) {
            return Err(LoadError::invalid(
                "topics.name",
                format!("duplicate topic `{name}`"),
            ));
        }
        resolved.push(TopicSettings {
            name,
            disclaimer: topic.disclaimer,
            public: topic.public.unwrap_or(false),
        });
    }

    Ok(resolved)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    trusted_topics_header: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawArtifactSettings {
    directory: Option<PathBuf>,
    file_prefix: Option<String>,
    ttl_seconds: Option<u64>,
    register_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRendererSettings {
    program: Option<PathBuf>,
    args: Option<Vec<String>>,
    config_path: Option<PathBuf>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRemoteSettings {
    url: Option<String>,
    info_url: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawConversionSettings {
    enabled: Option<bool>,
    rasterizer_path: Option<PathBuf>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPrintSettings {
    default_disclaimer: Option<String>,
    local_graphics_host: Option<String>,
    loopback_host: Option<String>,
    local_wms_hosts: Vec<String>,
    mapserver_url: Option<String>,
    mapserver_cgi_url: Option<String>,
    map_dir: Option<String>,
    layer_filter_prefix: Option<String>,
    cache_capabilities: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTopicSettings {
    name: Option<String>,
    disclaimer: Option<String>,
    public: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_http_url(value: &str, key: &'static str) -> Result<Url, LoadError> {
    let url = Url::parse(value)
        .map_err(|err| LoadError::invalid(key, format!("invalid URL `{value}`: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(LoadError::invalid(
            key,
            format!("unsupported scheme `{other}`"),
        )),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
