//! End-to-end rendering of one document into a JPEG.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use bytes::Bytes;
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::infra::engine::EngineError;

use super::{
    assets::AssetLocator,
    document::{DocumentContext, DocumentProducer},
    pool::BrowserPool,
    session::RenderSession,
    types::{RenderError, RenderPipelineConfig, RenderRequest, RenderedImage},
};

pub(crate) const METRIC_REQUEST_TOTAL: &str = "waves_render_request_total";
pub(crate) const METRIC_RENDER_MS: &str = "waves_render_ms";

const SOURCE: &str = "application::render::pipeline";

/// Orchestrates document production, session handling and capture.
///
/// The pipeline never retries; every non-success is reported once as a
/// [`RenderError`] and callers decide whether to fall back.
pub struct RenderPipeline {
    pool: Arc<BrowserPool>,
    config: RenderPipelineConfig,
    producer: Option<Arc<dyn DocumentProducer>>,
    assets: Option<AssetLocator>,
}

impl RenderPipeline {
    pub fn new(pool: Arc<BrowserPool>, config: RenderPipelineConfig) -> Self {
        Self {
            pool,
            config,
            producer: None,
            assets: None,
        }
    }

    pub fn with_producer(mut self, producer: Arc<dyn DocumentProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn with_assets(mut self, assets: AssetLocator) -> Self {
        self.assets = Some(assets);
        self
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    pub fn config(&self) -> &RenderPipelineConfig {
        &self.config
    }

    /// Produce the document for `template_id`, then render it.
    ///
    /// Producer failures surface as [`RenderError::Document`] before the
    /// engine is touched.
    pub async fn render_template(
        &self,
        template_id: &str,
        context: DocumentContext,
    ) -> Result<RenderedImage, RenderError> {
        let started_at = Instant::now();
        let markup = match self.produce(template_id, context) {
            Ok(markup) => markup,
            Err(err) => return self.finish(started_at, Err(err)),
        };

        let request = RenderRequest::new(markup).with_selector(self.config.selector.clone());
        self.render(request).await
    }

    fn produce(
        &self,
        template_id: &str,
        mut context: DocumentContext,
    ) -> Result<String, RenderError> {
        let producer = self.producer.as_ref().ok_or_else(|| RenderError::Document {
            message: "no document producer configured".to_string(),
        })?;

        if let Some(assets) = self.assets.as_ref() {
            assets.inject(&mut context);
        }

        producer.produce(template_id, &context).map_err(|err| {
            warn!(
                target = SOURCE,
                op = "pipeline::produce",
                result = "document_error",
                template = template_id,
                error = %err,
                "Failed to produce document"
            );
            RenderError::Document {
                message: err.to_string(),
            }
        })
    }

    /// Render raw markup.
    pub async fn render(&self, request: RenderRequest) -> Result<RenderedImage, RenderError> {
        let started_at = Instant::now();
        let result = self.render_inner(request).await;
        self.finish(started_at, result)
    }

    async fn render_inner(&self, mut request: RenderRequest) -> Result<RenderedImage, RenderError> {
        if !self.pool.is_available() {
            return Err(RenderError::Unavailable);
        }

        self.resolve_assets(&mut request);

        let lease = self.pool.acquire().await?;
        let handle_id = lease.handle_id();
        let mut session = RenderSession::open(lease, self.config.viewport)
            .await
            .map_err(engine_failure)?;

        let outcome = AssertUnwindSafe(self.capture(&session, &request))
            .catch_unwind()
            .await;
        session.close().await;

        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(
                    target = SOURCE,
                    op = "pipeline::render",
                    result = "panic",
                    handle_id,
                    error = %message,
                    "Render step panicked"
                );
                Err(RenderError::capture_failed(format!("render panicked: {message}")))
            }
        }
    }

    fn resolve_assets(&self, request: &mut RenderRequest) {
        let Some(assets) = self.assets.as_ref() else {
            return;
        };
        if request.asset_base_url.is_none() {
            request.asset_base_url = Some(assets.base_url().to_string());
        }
        if assets.font_css_url().is_none() {
            debug!(
                target = SOURCE,
                op = "pipeline::resolve_assets",
                result = "missing",
                "Local font stylesheet unavailable; rendering with original font links"
            );
        }
    }

    async fn capture(
        &self,
        session: &RenderSession,
        request: &RenderRequest,
    ) -> Result<RenderedImage, RenderError> {
        let surface = session
            .surface()
            .ok_or_else(|| RenderError::capture_failed("render session already closed"))?;
        let selector = request.selector.as_str();

        surface
            .set_content(&request.resolved_markup())
            .await
            .map_err(engine_failure)?;

        match timeout(self.config.quiescence_timeout, surface.wait_for_quiescence()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(
                target = SOURCE,
                op = "pipeline::quiescence",
                result = "error",
                error = %err,
                "Quiescence wait failed; continuing"
            ),
            Err(_) => debug!(
                target = SOURCE,
                op = "pipeline::quiescence",
                result = "timeout",
                timeout_ms = self.config.quiescence_timeout.as_millis() as u64,
                "Document still loading; continuing"
            ),
        }

        match timeout(self.config.selector_timeout, surface.wait_for_selector(selector)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(engine_failure(err)),
            Err(_) => {
                return Err(RenderError::ResourceTimeout {
                    selector: selector.to_string(),
                    timeout_ms: self.config.selector_timeout.as_millis() as u64,
                });
            }
        }

        let content_box = surface.measure(selector).await.map_err(engine_failure)?;
        surface
            .set_viewport(content_box.as_viewport())
            .await
            .map_err(engine_failure)?;
        sleep(self.config.settle_delay).await;

        let bytes = surface
            .capture_jpeg(selector, self.config.jpeg_quality)
            .await
            .map_err(engine_failure)?;
        if bytes.is_empty() {
            return Err(RenderError::capture_failed("engine returned an empty image"));
        }

        Ok(RenderedImage {
            bytes: Bytes::from(bytes),
            content_box,
        })
    }

    fn finish(
        &self,
        started_at: Instant,
        result: Result<RenderedImage, RenderError>,
    ) -> Result<RenderedImage, RenderError> {
        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind(),
        };
        counter!(METRIC_REQUEST_TOTAL, "outcome" => outcome).increment(1);
        histogram!(METRIC_RENDER_MS).record(elapsed_ms);

        match &result {
            Ok(image) => info!(
                target = SOURCE,
                op = "pipeline::render",
                result = "ok",
                bytes = image.len(),
                width = image.content_box.width,
                height = image.content_box.height,
                elapsed_ms = elapsed_ms as u64,
                "Document rendered"
            ),
            Err(err) => warn!(
                target = SOURCE,
                op = "pipeline::render",
                result = outcome,
                elapsed_ms = elapsed_ms as u64,
                error = %err,
                "Document not rendered"
            ),
        }
        result
    }
}

fn engine_failure(err: EngineError) -> RenderError {
    RenderError::capture_failed(err.to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::atomic::Ordering, time::Duration};

    use metrics_util::debugging::DebuggingRecorder;
    use serde_json::{Value, json};

    use super::*;
    use crate::application::render::{
        document::HandlebarsProducer,
        pool::PoolPolicy,
        testing::{FAKE_JPEG, FakeEngine, SurfaceScript},
        types::DEFAULT_SELECTOR_TIMEOUT,
    };

    const MARKUP: &str = r#"<html><head></head><body><div class="container">hi</div></body></html>"#;

    fn pipeline(engine: &Arc<FakeEngine>, policy: PoolPolicy) -> RenderPipeline {
        let pool = Arc::new(BrowserPool::new(engine.launcher(), policy));
        RenderPipeline::new(pool, RenderPipelineConfig::default())
    }

    async fn assert_released(pipeline: &RenderPipeline, engine: &FakeEngine) {
        assert_eq!(pipeline.pool().stats().await.open_sessions, 0);
        assert_eq!(engine.open_surfaces(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_engine_never_launches() {
        let engine = FakeEngine::new();
        let pool = Arc::new(BrowserPool::new(
            engine.missing_launcher(),
            PoolPolicy::default(),
        ));
        let pipeline = RenderPipeline::new(pool, RenderPipelineConfig::default());

        let err = pipeline.render(RenderRequest::new(MARKUP)).await.unwrap_err();
        assert_eq!(err, RenderError::Unavailable);
        assert_eq!(engine.launch_attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_pool_renders_an_image() {
        let engine = FakeEngine::new();
        let pipeline = pipeline(&engine, PoolPolicy::default());

        let image = pipeline
            .render(RenderRequest::new(MARKUP))
            .await
            .expect("image");

        assert_eq!(image.bytes.as_ref(), FAKE_JPEG);
        assert_eq!(image.content_box, engine.content_box);
        assert_eq!(pipeline.pool().stats().await.uses, 1);
        assert_eq!(
            *engine.last_viewport.lock().unwrap(),
            Some(engine.content_box.as_viewport())
        );
        assert_released(&pipeline, &engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_selector_times_out_and_releases() {
        let engine = FakeEngine::new();
        engine.set_script(SurfaceScript::SelectorNeverAppears);
        let pipeline = pipeline(&engine, PoolPolicy::default());

        let err = pipeline
            .render(RenderRequest::new(MARKUP))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RenderError::ResourceTimeout {
                selector: ".container".into(),
                timeout_ms: DEFAULT_SELECTOR_TIMEOUT.as_millis() as u64,
            }
        );
        assert_eq!(pipeline.pool().stats().await.uses, 1);
        assert_released(&pipeline, &engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_quiescence_is_not_fatal() {
        let engine = FakeEngine::new();
        engine.set_script(SurfaceScript::QuiescenceHangs);
        let pipeline = pipeline(&engine, PoolPolicy::default());

        let image = pipeline.render(RenderRequest::new(MARKUP)).await;
        assert!(image.is_ok());
        assert_released(&pipeline, &engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn capture_failure_releases_session() {
        let engine = FakeEngine::new();
        engine.set_script(SurfaceScript::CaptureFails);
        let pipeline = pipeline(&engine, PoolPolicy::default());

        let err = pipeline
            .render(RenderRequest::new(MARKUP))
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::CaptureFailed { .. }));
        assert_released(&pipeline, &engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn panic_during_capture_is_contained() {
        let engine = FakeEngine::new();
        engine.set_script(SurfaceScript::CapturePanics);
        let pipeline = pipeline(&engine, PoolPolicy::default());

        let err = pipeline
            .render(RenderRequest::new(MARKUP))
            .await
            .unwrap_err();
        match err {
            RenderError::CaptureFailed { message } => {
                assert!(message.contains("scripted capture panic"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_released(&pipeline, &engine).await;

        engine.set_script(SurfaceScript::Normal);
        assert!(pipeline.render(RenderRequest::new(MARKUP)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_render_still_releases() {
        let engine = FakeEngine::new();
        engine.set_script(SurfaceScript::SlowCapture(Duration::from_secs(30)));
        let pipeline = pipeline(&engine, PoolPolicy::default());

        let cancelled = timeout(
            Duration::from_secs(1),
            pipeline.render(RenderRequest::new(MARKUP)),
        )
        .await;
        assert!(cancelled.is_err());

        tokio::task::yield_now().await;
        assert_released(&pipeline, &engine).await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_happens_exactly_once_after_use_limit() {
        let engine = FakeEngine::new();
        let pipeline = pipeline(&engine, PoolPolicy::default());

        for _ in 0..1000 {
            pipeline
                .render(RenderRequest::new(MARKUP))
                .await
                .expect("image");
        }
        assert_eq!(engine.launches(), 1);

        pipeline
            .render(RenderRequest::new(MARKUP))
            .await
            .expect("image");
        assert_eq!(engine.launches(), 2);
        assert_eq!(engine.closes(), 1);
        assert_eq!(pipeline.pool().stats().await.uses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_renders_finish_on_old_process_before_restart() {
        let engine = FakeEngine::new();
        engine.set_script(SurfaceScript::SlowCapture(Duration::from_millis(500)));
        let policy = PoolPolicy {
            max_uses: 1,
            ..PoolPolicy::default()
        };
        let pipeline = Arc::new(pipeline(&engine, policy));

        // Puts the process at its use limit while keeping it busy.
        let held = pipeline.pool().acquire().await.expect("lease");
        let original = held.handle_id();

        let first = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.render(RenderRequest::new(MARKUP)).await }
        });
        let second = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.render(RenderRequest::new(MARKUP)).await }
        });

        // Both renders acquire while the restart is due and sit in capture.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(pipeline.pool().stats().await.open_sessions, 3);
        drop(held);

        assert!(first.await.expect("join").is_ok());
        assert!(second.await.expect("join").is_ok());
        assert_eq!(engine.launches(), 1);
        assert_eq!(engine.closes(), 0);

        let next = pipeline.pool().acquire().await.expect("lease");
        assert_ne!(next.handle_id(), original);
        assert_eq!(engine.launches(), 2);
        assert_eq!(engine.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn template_failures_do_not_touch_the_engine() {
        let engine = FakeEngine::new();
        let pipeline = pipeline(&engine, PoolPolicy::default())
            .with_producer(Arc::new(HandlebarsProducer::new()));

        let err = pipeline
            .render_template("missing", DocumentContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Document { .. }));
        assert_eq!(engine.launch_attempts.load(Ordering::SeqCst), 0);

        let without_producer = RenderPipeline::new(
            Arc::clone(pipeline.pool()),
            RenderPipelineConfig::default(),
        );
        let err = without_producer
            .render_template("any", DocumentContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Document { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn template_render_receives_font_stylesheet() {
        let fonts = tempfile::tempdir().expect("tempdir");
        std::fs::write(fonts.path().join("fonts.css"), "").expect("write");

        let mut producer = HandlebarsProducer::new();
        producer
            .register(
                "card",
                r#"<html><head><link href="{{font_css_url}}"></head><body><div class="container">{{name}}</div></body></html>"#,
            )
            .expect("register");

        let engine = FakeEngine::new();
        let pipeline = pipeline(&engine, PoolPolicy::default())
            .with_producer(Arc::new(producer))
            .with_assets(AssetLocator::new(
                "http://127.0.0.1:8765",
                fonts.path(),
                "/waves/fonts",
                "fonts.css",
            ));

        let context = match json!({ "name": "Rover" }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let image = pipeline
            .render_template("card", context)
            .await
            .expect("image");
        assert!(!image.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn template_render_receives_footer_and_logo() {
        let fonts = tempfile::tempdir().expect("tempdir");
        let textures = tempfile::tempdir().expect("tempdir");
        std::fs::write(textures.path().join("footer_black.png"), [0u8]).expect("write");
        std::fs::write(textures.path().join("kurobbs.png"), [0u8, 1]).expect("write");

        let mut producer = HandlebarsProducer::new();
        producer
            .register(
                "card",
                r#"<html><head></head><body><div class="container"><img src="{{{logo_b64}}}"><img src="{{{footer_b64}}}"></div></body></html>"#,
            )
            .expect("register");

        let engine = FakeEngine::new();
        let pipeline = pipeline(&engine, PoolPolicy::default())
            .with_producer(Arc::new(producer))
            .with_assets(
                AssetLocator::new(
                    "http://127.0.0.1:8765",
                    fonts.path(),
                    "/waves/fonts",
                    "fonts.css",
                )
                .with_texture_dir(textures.path()),
            );

        pipeline
            .render_template("card", DocumentContext::new())
            .await
            .expect("image");

        let markup = engine
            .last_markup
            .lock()
            .unwrap()
            .clone()
            .expect("markup loaded");
        assert!(markup.contains(r#"<img src="data:image/png;base64,AAE=">"#));
        assert!(markup.contains(r#"<img src="data:image/png;base64,AA==">"#));
    }

    #[test]
    fn render_outcomes_are_recorded() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .expect("runtime");

        metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let engine = FakeEngine::new();
                let pipeline = pipeline(&engine, PoolPolicy::default());
                pipeline
                    .render(RenderRequest::new(MARKUP))
                    .await
                    .expect("image");
                engine.set_script(SurfaceScript::CaptureFails);
                let _ = pipeline.render(RenderRequest::new(MARKUP)).await;
            });
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let names: HashSet<String> = snapshot
            .iter()
            .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
            .collect();
        for metric in [METRIC_REQUEST_TOTAL, METRIC_RENDER_MS] {
            assert!(names.contains(metric), "missing metric: {metric}");
        }

        let outcomes: HashSet<String> = snapshot
            .iter()
            .filter(|(composite_key, _, _, _)| composite_key.key().name() == METRIC_REQUEST_TOTAL)
            .flat_map(|(composite_key, _, _, _)| {
                composite_key
                    .key()
                    .labels()
                    .map(|label| label.value().to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        assert!(outcomes.contains("ok"));
        assert!(outcomes.contains("capture_failed"));
    }
}
