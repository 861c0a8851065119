use std::{borrow::Cow, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infra::engine::{ContentBox, Viewport};

pub const DEFAULT_SELECTOR: &str = ".container";
pub const DEFAULT_VIEWPORT: Viewport = Viewport::new(1200, 1000);
pub const DEFAULT_QUIESCENCE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SELECTOR_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// A single document to rasterise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    /// Complete HTML document.
    pub markup: String,
    /// CSS selector of the element whose box is captured.
    pub selector: String,
    /// Base URL local assets (fonts) are served from, when known.
    #[serde(default)]
    pub asset_base_url: Option<String>,
}

impl RenderRequest {
    pub fn new(markup: impl Into<String>) -> Self {
        Self {
            markup: markup.into(),
            selector: DEFAULT_SELECTOR.to_string(),
            asset_base_url: None,
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = selector.into();
        self
    }

    pub fn with_asset_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let trimmed = base_url.trim().trim_end_matches('/');
        if !trimmed.is_empty() {
            self.asset_base_url = Some(trimmed.to_string());
        }
        self
    }

    /// Markup with a `<base>` element pointing at the asset base URL, so
    /// relative asset links resolve against the local asset server.
    ///
    /// Documents that already declare a base, or have no `<head>`, are left
    /// untouched.
    pub fn resolved_markup(&self) -> Cow<'_, str> {
        let Some(base_url) = self.asset_base_url.as_deref() else {
            return Cow::Borrowed(&self.markup);
        };
        let lowered = self.markup.to_ascii_lowercase();
        if lowered.contains("<base") {
            return Cow::Borrowed(&self.markup);
        }
        let Some(insert_at) = head_content_start(&lowered) else {
            return Cow::Borrowed(&self.markup);
        };

        let base = format!(r#"<base href="{base_url}/">"#);
        let mut markup = String::with_capacity(self.markup.len() + base.len());
        markup.push_str(&self.markup[..insert_at]);
        markup.push_str(&base);
        markup.push_str(&self.markup[insert_at..]);
        Cow::Owned(markup)
    }
}

fn head_content_start(lowered: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(found) = lowered[offset..].find("<head") {
        let start = offset + found;
        let rest = &lowered[start + "<head".len()..];
        if rest.starts_with('>') || rest.starts_with(char::is_whitespace) {
            return rest.find('>').map(|close| start + "<head".len() + close + 1);
        }
        offset = start + "<head".len();
    }
    None
}

/// Successful render: a complete JPEG of the captured region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub bytes: Bytes,
    pub content_box: ContentBox,
}

impl RenderedImage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Outcomes that cross the pipeline boundary. Callers fall back on any of them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    /// The rendering engine is not installed; permanent for this pool.
    #[error("rendering engine unavailable")]
    Unavailable,
    /// The capture region never appeared.
    #[error("selector `{selector}` did not appear within {timeout_ms} ms")]
    ResourceTimeout { selector: String, timeout_ms: u64 },
    /// Any other engine failure while loading, measuring or capturing.
    #[error("render failed: {message}")]
    CaptureFailed { message: String },
    /// The document producer failed before the engine was touched.
    #[error("document could not be produced: {message}")]
    Document { message: String },
}

impl RenderError {
    pub fn capture_failed(message: impl Into<String>) -> Self {
        Self::CaptureFailed {
            message: message.into(),
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::Unavailable => "unavailable",
            RenderError::ResourceTimeout { .. } => "resource_timeout",
            RenderError::CaptureFailed { .. } => "capture_failed",
            RenderError::Document { .. } => "document",
        }
    }
}

/// Tunables of the render protocol.
#[derive(Debug, Clone)]
pub struct RenderPipelineConfig {
    /// Selector used for template renders.
    pub selector: String,
    pub viewport: Viewport,
    pub quiescence_timeout: Duration,
    pub selector_timeout: Duration,
    pub settle_delay: Duration,
    pub jpeg_quality: u8,
}

impl Default for RenderPipelineConfig {
    fn default() -> Self {
        Self {
            selector: DEFAULT_SELECTOR.to_string(),
            viewport: DEFAULT_VIEWPORT,
            quiescence_timeout: DEFAULT_QUIESCENCE_TIMEOUT,
            selector_timeout: DEFAULT_SELECTOR_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}
