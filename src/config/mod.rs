//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::{
    application::render::{PoolPolicy, RenderPipelineConfig, local_base_url},
    infra::engine::{ChromiumOptions, Viewport},
};

pub use cli::{
    AssetOverrides, CliArgs, Command, EngineOverrides, LoggingOverrides, PoolOverrides,
    ProbeArgs, RenderArgs, RenderOverrides, ServeArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "waves-render";
const ENV_PREFIX: &str = "WAVES_RENDER";

const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_USES: u64 = 1000;
const DEFAULT_IDLE_TTL_SECS: u64 = 3600;
const DEFAULT_SELECTOR: &str = ".container";
const DEFAULT_VIEWPORT_WIDTH: u64 = 1200;
const DEFAULT_VIEWPORT_HEIGHT: u64 = 1000;
const DEFAULT_QUIESCENCE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_SELECTOR_TIMEOUT_MS: u64 = 2000;
const DEFAULT_SETTLE_DELAY_MS: u64 = 50;
const DEFAULT_JPEG_QUALITY: u8 = 90;
const DEFAULT_TEMPLATES_DIR: &str = "templates";
const DEFAULT_ASSET_HOST: &str = "0.0.0.0";
const DEFAULT_ASSET_PORT: u16 = 8765;
const DEFAULT_FONTS_DIR: &str = "resources/fonts";
const DEFAULT_MOUNT_PATH: &str = "/waves/fonts";
const DEFAULT_STYLESHEET: &str = "fonts.css";
const DEFAULT_TEXTURE_DIR: &str = "resources/texture2d";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub engine: EngineSettings,
    pub pool: PoolSettings,
    pub render: RenderSettings,
    pub assets: AssetSettings,
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
pub struct EngineSettings {
    pub executable: Option<PathBuf>,
    pub headless: bool,
    pub no_sandbox: bool,
    pub launch_timeout: Duration,
}

impl EngineSettings {
    pub fn chromium_options(&self) -> ChromiumOptions {
        ChromiumOptions {
            executable: self.executable.clone(),
            headless: self.headless,
            no_sandbox: self.no_sandbox,
            launch_timeout: self.launch_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_uses: NonZeroU64,
    pub idle_ttl: Duration,
}

impl PoolSettings {
    pub fn policy(&self) -> PoolPolicy {
        PoolPolicy {
            max_uses: self.max_uses.get(),
            idle_ttl: self.idle_ttl,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub selector: String,
    pub viewport_width: NonZeroU32,
    pub viewport_height: NonZeroU32,
    pub quiescence_timeout: Duration,
    pub selector_timeout: Duration,
    pub settle_delay: Duration,
    pub jpeg_quality: u8,
    pub templates_dir: PathBuf,
}

impl RenderSettings {
    pub fn pipeline_config(&self) -> RenderPipelineConfig {
        RenderPipelineConfig {
            selector: self.selector.clone(),
            viewport: Viewport::new(self.viewport_width.get(), self.viewport_height.get()),
            quiescence_timeout: self.quiescence_timeout,
            selector_timeout: self.selector_timeout,
            settle_delay: self.settle_delay,
            jpeg_quality: self.jpeg_quality,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssetSettings {
    pub bind_addr: SocketAddr,
    pub host: String,
    pub port: u16,
    pub fonts_dir: PathBuf,
    pub mount_path: String,
    pub stylesheet: String,
    pub texture_dir: PathBuf,
}

impl AssetSettings {
    /// URL the rendering engine uses to reach the asset server.
    pub fn base_url(&self) -> String {
        local_base_url(&self.host, self.port)
    }
}

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

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_command_overrides(cli.command.as_ref());

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    engine: RawEngineSettings,
    pool: RawPoolSettings,
    render: RawRenderSettings,
    assets: RawAssetSettings,
}

impl RawSettings {
    fn apply_command_overrides(&mut self, command: Option<&Command>) {
        match command {
            Some(Command::Serve(args)) => self.apply_serve_overrides(args),
            Some(Command::Render(args)) => self.apply_render_args(args),
            Some(Command::Probe(args)) => {
                self.apply_logging_overrides(&args.logging);
                self.apply_engine_overrides(&args.engine);
            }
            None => self.apply_serve_overrides(&ServeArgs::default()),
        }
    }

    fn apply_serve_overrides(&mut self, args: &ServeArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_engine_overrides(&args.engine);
        self.apply_asset_overrides(&args.assets);
    }

    fn apply_render_args(&mut self, args: &RenderArgs) {
        self.apply_logging_overrides(&args.logging);
        self.apply_engine_overrides(&args.engine);
        self.apply_pool_overrides(&args.pool);
        self.apply_render_overrides(&args.render);
        self.apply_asset_overrides(&args.assets);
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_engine_overrides(&mut self, overrides: &EngineOverrides) {
        if let Some(path) = overrides.executable.as_ref() {
            self.engine.executable = Some(path.clone());
        }
        if let Some(headless) = overrides.headless {
            self.engine.headless = Some(headless);
        }
        if let Some(no_sandbox) = overrides.no_sandbox {
            self.engine.no_sandbox = Some(no_sandbox);
        }
        if let Some(seconds) = overrides.launch_timeout_seconds {
            self.engine.launch_timeout_seconds = Some(seconds);
        }
    }

    fn apply_pool_overrides(&mut self, overrides: &PoolOverrides) {
        if let Some(max_uses) = overrides.max_uses {
            self.pool.max_uses = Some(max_uses);
        }
        if let Some(seconds) = overrides.idle_ttl_seconds {
            self.pool.idle_ttl_seconds = Some(seconds);
        }
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(selector) = overrides.selector.as_ref() {
            self.render.selector = Some(selector.clone());
        }
        if let Some(quality) = overrides.jpeg_quality {
            self.render.jpeg_quality = Some(quality.into());
        }
        if let Some(dir) = overrides.templates_dir.as_ref() {
            self.render.templates_dir = Some(dir.clone());
        }
    }

    fn apply_asset_overrides(&mut self, overrides: &AssetOverrides) {
        if let Some(host) = overrides.host.as_ref() {
            self.assets.host = Some(host.clone());
        }
        if let Some(port) = overrides.port {
            self.assets.port = Some(port);
        }
        if let Some(dir) = overrides.fonts_dir.as_ref() {
            self.assets.fonts_dir = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            engine,
            pool,
            render,
            assets,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let engine = build_engine_settings(engine)?;
        let pool = build_pool_settings(pool)?;
        let render = build_render_settings(render)?;
        let assets = build_asset_settings(assets)?;

        Ok(Self {
            logging,
            engine,
            pool,
            render,
            assets,
        })
    }
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

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let executable = engine
        .executable
        .filter(|path| !path.as_os_str().is_empty());

    let launch_timeout = non_zero_duration(
        engine
            .launch_timeout_seconds
            .unwrap_or(DEFAULT_LAUNCH_TIMEOUT_SECS),
        Duration::from_secs,
        "engine.launch_timeout_seconds",
    )?;

    Ok(EngineSettings {
        executable,
        headless: engine.headless.unwrap_or(true),
        no_sandbox: engine.no_sandbox.unwrap_or(true),
        launch_timeout,
    })
}

fn build_pool_settings(pool: RawPoolSettings) -> Result<PoolSettings, LoadError> {
    let max_uses = NonZeroU64::new(pool.max_uses.unwrap_or(DEFAULT_MAX_USES))
        .ok_or_else(|| LoadError::invalid("pool.max_uses", "must be greater than zero"))?;
    let idle_ttl = non_zero_duration(
        pool.idle_ttl_seconds.unwrap_or(DEFAULT_IDLE_TTL_SECS),
        Duration::from_secs,
        "pool.idle_ttl_seconds",
    )?;

    Ok(PoolSettings { max_uses, idle_ttl })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let selector = render
        .selector
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_SELECTOR.to_string());
    if selector.is_empty() {
        return Err(LoadError::invalid("render.selector", "must not be empty"));
    }

    let viewport_width = non_zero_u32(
        render.viewport_width.unwrap_or(DEFAULT_VIEWPORT_WIDTH),
        "render.viewport_width",
    )?;
    let viewport_height = non_zero_u32(
        render.viewport_height.unwrap_or(DEFAULT_VIEWPORT_HEIGHT),
        "render.viewport_height",
    )?;

    let quiescence_timeout = non_zero_duration(
        render
            .quiescence_timeout_ms
            .unwrap_or(DEFAULT_QUIESCENCE_TIMEOUT_MS),
        Duration::from_millis,
        "render.quiescence_timeout_ms",
    )?;
    let selector_timeout = non_zero_duration(
        render
            .selector_timeout_ms
            .unwrap_or(DEFAULT_SELECTOR_TIMEOUT_MS),
        Duration::from_millis,
        "render.selector_timeout_ms",
    )?;
    let settle_delay = non_zero_duration(
        render.settle_delay_ms.unwrap_or(DEFAULT_SETTLE_DELAY_MS),
        Duration::from_millis,
        "render.settle_delay_ms",
    )?;

    let quality = render
        .jpeg_quality
        .unwrap_or(u64::from(DEFAULT_JPEG_QUALITY));
    if !(1..=100).contains(&quality) {
        return Err(LoadError::invalid(
            "render.jpeg_quality",
            "must be between 1 and 100",
        ));
    }

    let templates_dir = render
        .templates_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATES_DIR));
    if templates_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "render.templates_dir",
            "path must not be empty",
        ));
    }

    Ok(RenderSettings {
        selector,
        viewport_width,
        viewport_height,
        quiescence_timeout,
        selector_timeout,
        settle_delay,
        jpeg_quality: quality as u8,
        templates_dir,
    })
}

fn build_asset_settings(assets: RawAssetSettings) -> Result<AssetSettings, LoadError> {
    let host = assets
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_ASSET_HOST.to_string());

    let port = assets.port.unwrap_or(DEFAULT_ASSET_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "assets.port",
            "port must be greater than zero",
        ));
    }

    let bind_addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("assets.bind_addr", reason))?;

    let mount_path = assets
        .mount_path
        .unwrap_or_else(|| DEFAULT_MOUNT_PATH.to_string());
    let mount_path = format!("/{}", mount_path.trim().trim_matches('/'));
    if mount_path == "/" {
        return Err(LoadError::invalid(
            "assets.mount_path",
            "must name a sub-path such as /waves/fonts",
        ));
    }

    let stylesheet = assets
        .stylesheet
        .unwrap_or_else(|| DEFAULT_STYLESHEET.to_string());
    if stylesheet.trim().is_empty() || stylesheet.contains('/') {
        return Err(LoadError::invalid(
            "assets.stylesheet",
            "must be a plain file name",
        ));
    }

    Ok(AssetSettings {
        bind_addr,
        host,
        port,
        fonts_dir: assets
            .fonts_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FONTS_DIR)),
        mount_path,
        stylesheet,
        texture_dir: assets
            .texture_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEXTURE_DIR)),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    executable: Option<PathBuf>,
    headless: Option<bool>,
    no_sandbox: Option<bool>,
    launch_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPoolSettings {
    max_uses: Option<u64>,
    idle_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    selector: Option<String>,
    viewport_width: Option<u64>,
    viewport_height: Option<u64>,
    quiescence_timeout_ms: Option<u64>,
    selector_timeout_ms: Option<u64>,
    settle_delay_ms: Option<u64>,
    jpeg_quality: Option<u64>,
    templates_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAssetSettings {
    host: Option<String>,
    port: Option<u16>,
    fonts_dir: Option<PathBuf>,
    mount_path: Option<String>,
    stylesheet: Option<String>,
    texture_dir: Option<PathBuf>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
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

fn non_zero_duration(
    value: u64,
    unit: fn(u64) -> Duration,
    key: &'static str,
) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(unit(value))
}
