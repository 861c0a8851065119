use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chromiumoxide::{
    Page,
    browser::{Browser, BrowserConfig},
    cdp::{
        browser_protocol::{
            browser::BrowserContextId,
            emulation::SetDeviceMetricsOverrideParams,
            page::{CaptureScreenshotFormat, Viewport as ClipViewport},
            target::{
                CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
            },
        },
        js_protocol::runtime::EvaluateParams,
    },
    js::EvaluationResult,
    page::ScreenshotParams,
};
use futures::StreamExt;
use metrics::counter;
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{
    ContentBox, EngineError, EngineLauncher, EngineProcess, EngineSurface,
    METRIC_HOUSEKEEPING_FAILURE_TOTAL, Viewport,
};

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(50);

const QUIESCENCE_SCRIPT: &str = r#"(async () => {
    if (document.fonts && document.fonts.ready) {
        await document.fonts.ready;
    }
    const pending = Array.from(document.images).filter((img) => !img.complete);
    await Promise.all(pending.map((img) => new Promise((resolve) => {
        img.addEventListener("load", resolve, { once: true });
        img.addEventListener("error", resolve, { once: true });
    })));
    return true;
})()"#;

/// Launch options for headless Chromium.
#[derive(Debug, Clone)]
pub struct ChromiumOptions {
    pub executable: Option<PathBuf>,
    pub headless: bool,
    pub no_sandbox: bool,
    pub launch_timeout: Duration,
}

impl Default for ChromiumOptions {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            no_sandbox: true,
            launch_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    options: ChromiumOptions,
}

impl ChromiumLauncher {
    pub fn new(options: ChromiumOptions) -> Self {
        Self { options }
    }

    fn browser_config(&self) -> Result<BrowserConfig, EngineError> {
        let mut builder = BrowserConfig::builder()
            .launch_timeout(self.options.launch_timeout)
            .viewport(None);
        if !self.options.headless {
            builder = builder.with_head();
        }
        if self.options.no_sandbox {
            builder = builder.no_sandbox().arg("--disable-setuid-sandbox");
        }
        if let Some(path) = self.options.executable.as_ref() {
            builder = builder.chrome_executable(path);
        }
        // Fails when no executable is configured and none can be detected.
        builder.build().map_err(EngineError::NotInstalled)
    }
}

#[async_trait]
impl EngineLauncher for ChromiumLauncher {
    fn probe(&self) -> Result<(), EngineError> {
        if let Some(path) = self.options.executable.as_ref() {
            if !path.exists() {
                return Err(EngineError::NotInstalled(format!(
                    "configured executable `{}` does not exist",
                    path.display()
                )));
            }
        }
        self.browser_config().map(|_| ())
    }

    async fn launch(&self) -> Result<Box<dyn EngineProcess>, EngineError> {
        let started_at = Instant::now();
        let config = self.browser_config()?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| EngineError::Launch(err.to_string()))?;

        let connected = Arc::new(AtomicBool::new(true));
        let handler_connected = Arc::clone(&connected);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(
                        target = "infra::engine::chromium",
                        op = "chromium::handler",
                        error = %err,
                        "Chromium handler stopped"
                    );
                    break;
                }
            }
            handler_connected.store(false, Ordering::Release);
        });

        info!(
            target = "infra::engine::chromium",
            op = "chromium::launch",
            result = "ok",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Chromium launched"
        );

        Ok(Box::new(ChromiumProcess {
            browser: Arc::new(RwLock::new(browser)),
            connected,
            handler_task,
        }))
    }
}

struct ChromiumProcess {
    browser: Arc<RwLock<Browser>>,
    connected: Arc<AtomicBool>,
    handler_task: JoinHandle<()>,
}

#[async_trait]
impl EngineProcess for ChromiumProcess {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.handler_task.is_finished()
    }

    async fn open_surface(
        &self,
        viewport: Viewport,
    ) -> Result<Box<dyn EngineSurface>, EngineError> {
        if !self.is_connected() {
            return Err(EngineError::Disconnected);
        }

        let browser = self.browser.read().await;
        let context_id = browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(EngineError::protocol)?
            .result
            .browser_context_id;

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(EngineError::Protocol)?;
        let page = match browser.new_page(target).await {
            Ok(page) => page,
            Err(err) => {
                if let Err(dispose_err) = browser
                    .execute(DisposeBrowserContextParams::new(context_id))
                    .await
                {
                    report_cleanup_failure(
                        "chromium::dispose_context",
                        &EngineError::protocol(dispose_err),
                    );
                }
                return Err(EngineError::protocol(err));
            }
        };
        drop(browser);

        let surface = ChromiumSurface {
            browser: Arc::clone(&self.browser),
            page,
            context_id,
        };
        if let Err(err) = surface.set_viewport(viewport).await {
            if let Err(close_err) = surface.close().await {
                report_cleanup_failure("chromium::close_surface", &close_err);
            }
            return Err(err);
        }
        Ok(Box::new(surface))
    }

    async fn close(&self) -> Result<(), EngineError> {
        let mut browser = self.browser.write().await;
        let result = browser.close().await.map(|_| ()).map_err(EngineError::protocol);
        if let Err(err) = browser.wait().await {
            warn!(
                target = "infra::engine::chromium",
                op = "chromium::close",
                error = %err,
                "Failed to reap Chromium process"
            );
        }
        self.handler_task.abort();
        self.connected.store(false, Ordering::Release);
        result
    }
}

struct ChromiumSurface {
    browser: Arc<RwLock<Browser>>,
    page: Page,
    context_id: BrowserContextId,
}

impl ChromiumSurface {
    async fn evaluate(&self, script: &str) -> Result<EvaluationResult, EngineError> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(EngineError::Protocol)?;
        self.page
            .evaluate_expression(params)
            .await
            .map_err(EngineError::protocol)
    }
}

#[async_trait]
impl EngineSurface for ChromiumSurface {
    async fn set_content(&self, markup: &str) -> Result<(), EngineError> {
        self.page
            .set_content(markup)
            .await
            .map(|_| ())
            .map_err(EngineError::protocol)
    }

    async fn wait_for_quiescence(&self) -> Result<(), EngineError> {
        self.evaluate(QUIESCENCE_SCRIPT).await.map(|_| ())
    }

    async fn wait_for_selector(&self, selector: &str) -> Result<(), EngineError> {
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
        }
    }

    async fn measure(&self, selector: &str) -> Result<ContentBox, EngineError> {
        let quoted = serde_json::to_string(selector).map_err(EngineError::protocol)?;
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({quoted});
                if (!el) return null;
                const rect = el.getBoundingClientRect();
                return {{
                    width: Math.ceil(Math.max(rect.width, el.scrollWidth)),
                    height: Math.ceil(Math.max(rect.height, el.scrollHeight)),
                }};
            }})()"#
        );
        let measured: Option<ContentBox> = self
            .evaluate(&script)
            .await?
            .into_value()
            .map_err(EngineError::protocol)?;
        measured.ok_or_else(|| EngineError::MissingElement {
            selector: selector.to_string(),
        })
    }

    async fn set_viewport(&self, viewport: Viewport) -> Result<(), EngineError> {
        let params = SetDeviceMetricsOverrideParams::new(
            i64::from(viewport.width),
            i64::from(viewport.height),
            1.0,
            false,
        );
        self.page
            .execute(params)
            .await
            .map(|_| ())
            .map_err(EngineError::protocol)
    }

    async fn capture_jpeg(&self, selector: &str, quality: u8) -> Result<Vec<u8>, EngineError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| EngineError::MissingElement {
                selector: selector.to_string(),
            })?;
        element
            .scroll_into_view()
            .await
            .map_err(EngineError::protocol)?;
        let bounds = element.bounding_box().await.map_err(EngineError::protocol)?;
        let clip = ClipViewport {
            x: bounds.x,
            y: bounds.y,
            width: bounds.width,
            height: bounds.height,
            scale: 1.0,
        };
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Jpeg)
            .quality(i64::from(quality))
            .clip(clip)
            .build();
        self.page
            .screenshot(params)
            .await
            .map_err(EngineError::protocol)
    }

    async fn close(&self) -> Result<(), EngineError> {
        let page_result = self
            .page
            .clone()
            .close()
            .await
            .map_err(EngineError::protocol);
        let dispose_result = self
            .browser
            .read()
            .await
            .execute(DisposeBrowserContextParams::new(self.context_id.clone()))
            .await
            .map(|_| ())
            .map_err(EngineError::protocol);
        page_result.and(dispose_result)
    }
}

fn report_cleanup_failure(op: &'static str, err: &EngineError) {
    counter!(METRIC_HOUSEKEEPING_FAILURE_TOTAL).increment(1);
    warn!(
        target = "infra::engine::chromium",
        op,
        result = "housekeeping_failure",
        error = %err,
        "Failed to clean up after surface open error; ignoring"
    );
}
