//! Rendering of HTML documents into JPEG images through a headless engine.
//!
//! A single [`BrowserPool`] owns the engine process and recycles it between
//! requests; [`RenderPipeline`] runs one request at a time per session and
//! reports every non-success as a [`RenderError`] so callers can fall back.

mod assets;
mod document;
mod fallback;
mod pipeline;
mod pool;
mod session;
#[cfg(test)]
mod testing;
mod types;

pub use assets::{
    AssetLocator, FONT_CSS_URL_KEY, FOOTER_KEY, FooterVariant, LOGO_FILE_NAME, LOGO_KEY,
    footer_data_uri, image_data_uri, local_base_url, logo_data_uri,
};
pub use document::{DocumentContext, DocumentError, DocumentProducer, HandlebarsProducer};
pub use fallback::{FallbackDispatcher, PlainTextFallback, fallback_message};
pub use pipeline::RenderPipeline;
pub use pool::{BrowserPool, DEFAULT_IDLE_TTL, DEFAULT_MAX_USES, HandleLease, PoolPolicy, PoolStats};
pub use session::RenderSession;
pub use types::{
    DEFAULT_JPEG_QUALITY, DEFAULT_QUIESCENCE_TIMEOUT, DEFAULT_SELECTOR, DEFAULT_SELECTOR_TIMEOUT,
    DEFAULT_SETTLE_DELAY, DEFAULT_VIEWPORT, RenderError, RenderPipelineConfig, RenderRequest,
    RenderedImage,
};
