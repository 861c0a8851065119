use std::{path::Path, process, sync::Arc};

use serde_json::Value;
use tokio::{net::TcpListener, signal};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use waves_render::{
    application::{
        error::AppError,
        render::{
            AssetLocator, BrowserPool, DocumentContext, FallbackDispatcher, HandlebarsProducer,
            PlainTextFallback, RenderPipeline,
        },
    },
    config,
    infra::{
        assets,
        engine::{ChromiumLauncher, EngineLauncher},
        error::InfraError,
        telemetry,
    },
};

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
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, *args).await,
        config::Command::Probe(_) => run_probe(settings),
    }
}

fn build_pipeline(settings: &config::Settings, producer: HandlebarsProducer) -> RenderPipeline {
    let launcher: Arc<dyn EngineLauncher> =
        Arc::new(ChromiumLauncher::new(settings.engine.chromium_options()));
    let pool = Arc::new(BrowserPool::new(launcher, settings.pool.policy()));
    let locator = AssetLocator::new(
        settings.assets.base_url(),
        &settings.assets.fonts_dir,
        &settings.assets.mount_path,
        &settings.assets.stylesheet,
    )
    .with_texture_dir(&settings.assets.texture_dir);

    RenderPipeline::new(pool, settings.render.pipeline_config())
        .with_assets(locator)
        .with_producer(Arc::new(producer))
}

/// Serve the font directory for renders running in other processes.
async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let launcher = ChromiumLauncher::new(settings.engine.chromium_options());
    let engine_available = match launcher.probe() {
        Ok(()) => true,
        Err(err) => {
            warn!(
                target = "waves_render::serve",
                error = %err,
                "Rendering engine unavailable; renders will use the fallback"
            );
            false
        }
    };

    let router = assets::router(&settings.assets.fonts_dir, &settings.assets.mount_path);
    let listener = TcpListener::bind(settings.assets.bind_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "waves_render::serve",
        addr = %settings.assets.bind_addr,
        base_url = %settings.assets.base_url(),
        mount_path = %settings.assets.mount_path,
        engine_available,
        "Asset server listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    info!(target = "waves_render::serve", "Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(
            target = "waves_render::serve",
            error = %err,
            "Failed to listen for Ctrl-C; shutting down"
        );
    }
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let context = match args.context.as_deref() {
        Some(path) => read_context(path).await?,
        None => DocumentContext::new(),
    };
    let producer = HandlebarsProducer::from_directory(&settings.render.templates_dir)?;
    let pipeline = build_pipeline(&settings, producer);

    let outcome = pipeline.render_template(&args.template, context).await;
    pipeline.pool().shutdown().await;

    match outcome {
        Ok(image) => {
            tokio::fs::write(&args.output, &image.bytes)
                .await
                .map_err(|err| AppError::from(InfraError::from(err)))?;
            info!(
                target = "waves_render::render",
                template = %args.template,
                output = %args.output.display(),
                bytes = image.len(),
                "Render written"
            );
            Ok(())
        }
        Err(err) => {
            let fallback = PlainTextFallback::new(std::io::stderr());
            fallback.dispatch(&args.template, &err).await;
            Err(AppError::from(err))
        }
    }
}

async fn read_context(path: &Path) -> Result<DocumentContext, AppError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AppError::validation(format!(
            "context file `{}` must contain a JSON object",
            path.display()
        ))),
        Err(err) => Err(AppError::validation(format!(
            "context file `{}` is not valid JSON: {err}",
            path.display()
        ))),
    }
}

fn run_probe(settings: config::Settings) -> Result<(), AppError> {
    let launcher = ChromiumLauncher::new(settings.engine.chromium_options());
    match launcher.probe() {
        Ok(()) => {
            info!(
                target = "waves_render::probe",
                result = "available",
                "Rendering engine available"
            );
            Ok(())
        }
        Err(err) => Err(AppError::from(InfraError::from(err))),
    }
}
