//! Rendering-engine adapters.
//!
//! The pool and pipeline only talk to the engine through these traits, so the
//! lifecycle logic can be exercised against a scripted engine in tests and
//! against headless Chromium in production.

mod chromium;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub use chromium::{ChromiumLauncher, ChromiumOptions};

/// Counter bumped whenever closing a process or surface fails and the error
/// is swallowed.
pub const METRIC_HOUSEKEEPING_FAILURE_TOTAL: &str = "waves_render_housekeeping_failure_total";

/// Size of a browsing surface in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Measured content box of the capture region.
///
/// Both dimensions already account for overflow beyond the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ContentBox {
    pub width: u32,
    pub height: u32,
}

impl ContentBox {
    /// Viewport large enough to show the whole box; never collapses to zero.
    pub fn as_viewport(&self) -> Viewport {
        Viewport::new(self.width.max(1), self.height.max(1))
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("rendering engine not installed: {0}")]
    NotInstalled(String),
    #[error("failed to launch rendering engine: {0}")]
    Launch(String),
    #[error("rendering engine disconnected")]
    Disconnected,
    #[error("element `{selector}` not found")]
    MissingElement { selector: String },
    #[error("engine protocol error: {0}")]
    Protocol(String),
}

impl EngineError {
    pub fn protocol(message: impl ToString) -> Self {
        Self::Protocol(message.to_string())
    }
}

/// Starts rendering-engine processes.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Check once whether the engine can be launched in this environment.
    fn probe(&self) -> Result<(), EngineError>;

    async fn launch(&self) -> Result<Box<dyn EngineProcess>, EngineError>;
}

/// A live engine process.
#[async_trait]
pub trait EngineProcess: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Create an isolated browsing context with the given initial viewport.
    async fn open_surface(&self, viewport: Viewport)
    -> Result<Box<dyn EngineSurface>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// One isolated browsing context (an incognito tab).
#[async_trait]
pub trait EngineSurface: Send + Sync {
    async fn set_content(&self, markup: &str) -> Result<(), EngineError>;

    /// Resolves once fonts and images have settled. Callers bound it.
    async fn wait_for_quiescence(&self) -> Result<(), EngineError>;

    /// Resolves once `selector` matches an element. Callers bound it.
    async fn wait_for_selector(&self, selector: &str) -> Result<(), EngineError>;

    async fn measure(&self, selector: &str) -> Result<ContentBox, EngineError>;

    async fn set_viewport(&self, viewport: Viewport) -> Result<(), EngineError>;

    /// Capture the element matched by `selector` as a JPEG.
    async fn capture_jpeg(&self, selector: &str, quality: u8) -> Result<Vec<u8>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}
