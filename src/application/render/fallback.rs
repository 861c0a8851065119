//! What callers do when a render does not produce an image.

use std::{
    io::Write,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use tracing::warn;

use super::types::RenderError;

/// Receives every non-successful render outcome.
#[async_trait]
pub trait FallbackDispatcher: Send + Sync {
    async fn dispatch(&self, template_id: &str, error: &RenderError);
}

/// User-facing text explaining why no image was produced.
pub fn fallback_message(template_id: &str, error: &RenderError) -> String {
    let reason = match error {
        RenderError::Unavailable => {
            "image rendering is not available on this host".to_string()
        }
        RenderError::ResourceTimeout { .. } => {
            "the page did not finish loading in time".to_string()
        }
        RenderError::CaptureFailed { .. } => "the page could not be captured".to_string(),
        RenderError::Document { message } => format!("the page could not be built ({message})"),
    };
    format!("[{template_id}] {reason}; showing text instead.")
}

/// Writes [`fallback_message`] lines to a sink (stderr in the CLI).
pub struct PlainTextFallback<W> {
    sink: Mutex<W>,
}

impl<W: Write + Send> PlainTextFallback<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub fn into_inner(self) -> W {
        self.sink.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<W: Write + Send> FallbackDispatcher for PlainTextFallback<W> {
    async fn dispatch(&self, template_id: &str, error: &RenderError) {
        let message = fallback_message(template_id, error);
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writeln!(sink, "{message}").and_then(|()| sink.flush()) {
            warn!(
                target = "application::render::fallback",
                op = "fallback::dispatch",
                result = "error",
                error = %err,
                "Failed to write fallback message"
            );
        }
    }
}
