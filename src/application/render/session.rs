use std::fmt;

use metrics::counter;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::infra::engine::{EngineError, EngineSurface, Viewport};

use super::pool::{HandleLease, METRIC_HOUSEKEEPING_FAILURE_TOTAL};

const SOURCE: &str = "application::render::session";

/// One isolated browsing context leased from the pool for a single request.
///
/// Dropping a session that was never closed still releases its lease at once
/// and hands surface teardown to a background task.
pub struct RenderSession {
    lease: Option<HandleLease>,
    surface: Option<Box<dyn EngineSurface>>,
}

impl RenderSession {
    /// Open a fresh surface on the leased process.
    ///
    /// On failure the lease is released before returning.
    pub async fn open(lease: HandleLease, viewport: Viewport) -> Result<Self, EngineError> {
        let surface = lease.process().open_surface(viewport).await?;
        debug!(
            target = SOURCE,
            op = "session::open",
            handle_id = lease.handle_id(),
            width = viewport.width,
            height = viewport.height,
            "Render session opened"
        );
        Ok(Self {
            lease: Some(lease),
            surface: Some(surface),
        })
    }

    /// The live surface, or `None` once closed.
    pub fn surface(&self) -> Option<&dyn EngineSurface> {
        self.surface.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.lease.is_none()
    }

    /// Close the surface and release the lease. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(surface) = self.surface.take() {
            close_surface(surface.as_ref()).await;
        }
        if let Some(mut lease) = self.lease.take() {
            lease.release();
            debug!(
                target = SOURCE,
                op = "session::close",
                handle_id = lease.handle_id(),
                "Render session closed"
            );
        }
    }
}

impl fmt::Debug for RenderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderSession")
            .field("lease", &self.lease)
            .field("open", &self.surface.is_some())
            .finish()
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        // Lease release is synchronous; only the surface needs a runtime.
        drop(self.lease.take());
        let Some(surface) = self.surface.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    close_surface(surface.as_ref()).await;
                });
            }
            Err(_) => {
                counter!(METRIC_HOUSEKEEPING_FAILURE_TOTAL).increment(1);
                warn!(
                    target = SOURCE,
                    op = "session::drop",
                    result = "housekeeping_failure",
                    "No runtime to close render surface; abandoning it"
                );
            }
        }
    }
}

async fn close_surface(surface: &dyn EngineSurface) {
    if let Err(err) = surface.close().await {
        counter!(METRIC_HOUSEKEEPING_FAILURE_TOTAL).increment(1);
        warn!(
            target = SOURCE,
            op = "session::close",
            result = "housekeeping_failure",
            error = %err,
            "Failed to close render surface; ignoring"
        );
    }
}
