use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the waves-render binary.
#[derive(Debug, Parser)]
#[command(
    name = "waves-render",
    version,
    about = "Render HTML cards to JPEG through a headless browser"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "WAVES_RENDER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve local font assets over loopback until interrupted.
    Serve(Box<ServeArgs>),
    /// Render one template to a JPEG file.
    Render(Box<RenderArgs>),
    /// Report whether the rendering engine can be launched.
    Probe(ProbeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub engine: EngineOverrides,

    #[command(flatten)]
    pub assets: AssetOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderArgs {
    /// Template id (file stem inside the templates directory).
    #[arg(long = "template", value_name = "ID")]
    pub template: String,

    /// JSON object passed to the template.
    #[arg(long = "context", value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub context: Option<PathBuf>,

    /// Where to write the JPEG.
    #[arg(long = "output", value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub engine: EngineOverrides,

    #[command(flatten)]
    pub pool: PoolOverrides,

    #[command(flatten)]
    pub render: RenderOverrides,

    #[command(flatten)]
    pub assets: AssetOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(flatten)]
    pub engine: EngineOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
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
pub struct EngineOverrides {
    /// Override the browser executable path.
    #[arg(long = "engine-executable", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub executable: Option<PathBuf>,

    /// Run the browser headless.
    #[arg(
        long = "engine-headless",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub headless: Option<bool>,

    /// Disable the browser sandbox.
    #[arg(
        long = "engine-no-sandbox",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub no_sandbox: Option<bool>,

    /// Override the browser launch timeout.
    #[arg(long = "engine-launch-timeout-seconds", value_name = "SECONDS")]
    pub launch_timeout_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PoolOverrides {
    /// Override how many sessions a browser serves before it is recycled.
    #[arg(long = "pool-max-uses", value_name = "COUNT")]
    pub max_uses: Option<u64>,

    /// Override how long an idle browser is kept.
    #[arg(long = "pool-idle-ttl-seconds", value_name = "SECONDS")]
    pub idle_ttl_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the capture selector.
    #[arg(long = "render-selector", value_name = "SELECTOR")]
    pub selector: Option<String>,

    /// Override the JPEG quality (1-100).
    #[arg(long = "render-jpeg-quality", value_name = "QUALITY")]
    pub jpeg_quality: Option<u8>,

    /// Override the templates directory.
    #[arg(long = "render-templates-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub templates_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct AssetOverrides {
    /// Override the asset server host.
    #[arg(long = "assets-host", value_name = "HOST")]
    pub host: Option<String>,

    /// Override the asset server port.
    #[arg(long = "assets-port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Override the fonts directory.
    #[arg(long = "assets-fonts-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub fonts_dir: Option<PathBuf>,
}
