//! Lifecycle manager for the single rendering-engine process.
//!
//! The pool keeps at most one current process. Every acquisition runs a short
//! critical section under an async mutex that decides whether the process must
//! be replaced (disconnected, used too often, idle too long). A due restart is
//! deferred while any lease on the current process is outstanding, so
//! housekeeping never interrupts a render in flight.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use metrics::{counter, gauge};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

pub(crate) use crate::infra::engine::METRIC_HOUSEKEEPING_FAILURE_TOTAL;
use crate::infra::engine::{EngineLauncher, EngineProcess};

use super::types::RenderError;

pub const DEFAULT_MAX_USES: u64 = 1000;
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(3600);

const INITIAL_LAUNCH_BACKOFF: Duration = Duration::from_secs(1);
const MAX_LAUNCH_BACKOFF: Duration = Duration::from_secs(60);

pub(crate) const METRIC_LAUNCH_TOTAL: &str = "waves_render_engine_launch_total";
pub(crate) const METRIC_LAUNCH_FAILED_TOTAL: &str = "waves_render_engine_launch_failed_total";
pub(crate) const METRIC_RESTART_TOTAL: &str = "waves_render_engine_restart_total";
pub(crate) const METRIC_RESTART_DEFERRED_TOTAL: &str =
    "waves_render_engine_restart_deferred_total";
pub(crate) const METRIC_OPEN_SESSIONS: &str = "waves_render_open_sessions";

const SOURCE: &str = "application::render::pool";

/// Recycling thresholds for the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPolicy {
    pub max_uses: u64,
    pub idle_ttl: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            max_uses: DEFAULT_MAX_USES,
            idle_ttl: DEFAULT_IDLE_TTL,
        }
    }
}

/// Point-in-time view of the pool, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub available: bool,
    pub handle_id: Option<u64>,
    pub uses: u64,
    pub open_sessions: usize,
    pub launches: u64,
    pub retiring: usize,
}

/// One live engine process plus its accounting.
pub(crate) struct ProcessHandle {
    id: u64,
    process: Box<dyn EngineProcess>,
    created_at: Instant,
    uses: AtomicU64,
    open_sessions: AtomicUsize,
}

impl ProcessHandle {
    fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::Acquire)
    }

    fn uses(&self) -> u64 {
        self.uses.load(Ordering::Acquire)
    }
}

/// Monotonic "last used" stamp shared between the pool and its leases.
///
/// Stored as microseconds past the pool epoch so releases can stamp it from
/// `Drop` without taking the async lock; zero means "never used".
struct LastUsed {
    epoch: Instant,
    offset_us: AtomicU64,
}

impl LastUsed {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_us: AtomicU64::new(0),
        }
    }

    fn stamp(&self, now: Instant) {
        let offset = now.saturating_duration_since(self.epoch).as_micros() as u64 + 1;
        self.offset_us.fetch_max(offset, Ordering::AcqRel);
    }

    fn get(&self) -> Option<Instant> {
        match self.offset_us.load(Ordering::Acquire) {
            0 => None,
            offset => Some(self.epoch + Duration::from_micros(offset - 1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartReason {
    Missing,
    UseLimit,
    Idle,
}

impl RestartReason {
    fn as_str(self) -> &'static str {
        match self {
            RestartReason::Missing => "missing",
            RestartReason::UseLimit => "use_limit",
            RestartReason::Idle => "idle",
        }
    }
}

#[derive(Debug, Default)]
struct LaunchBackoff {
    failures: u32,
    retry_at: Option<Instant>,
}

impl LaunchBackoff {
    fn blocked_until(&self, now: Instant) -> Option<Instant> {
        self.retry_at.filter(|retry_at| *retry_at > now)
    }

    fn record_failure(&mut self, now: Instant) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let exponent = self.failures.saturating_sub(1).min(16);
        let delay = INITIAL_LAUNCH_BACKOFF
            .saturating_mul(1u32 << exponent)
            .min(MAX_LAUNCH_BACKOFF);
        self.retry_at = Some(now + delay);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.retry_at = None;
    }
}

#[derive(Default)]
struct PoolState {
    current: Option<Arc<ProcessHandle>>,
    /// Disconnected handles that still had sessions when they were discarded.
    retiring: Vec<Arc<ProcessHandle>>,
    backoff: LaunchBackoff,
}

enum Availability {
    Ready,
    Missing(String),
}

/// Owner of the single rendering-engine process.
pub struct BrowserPool {
    launcher: Arc<dyn EngineLauncher>,
    policy: PoolPolicy,
    availability: Availability,
    state: Mutex<PoolState>,
    last_used: Arc<LastUsed>,
    next_handle_id: AtomicU64,
    launches: AtomicU64,
}

impl fmt::Debug for BrowserPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserPool")
            .field("policy", &self.policy)
            .field("available", &self.is_available())
            .field("launches", &self.launches.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BrowserPool {
    /// Build a pool, probing the engine once. A missing engine makes every
    /// later acquisition return [`RenderError::Unavailable`].
    pub fn new(launcher: Arc<dyn EngineLauncher>, policy: PoolPolicy) -> Self {
        let availability = match launcher.probe() {
            Ok(()) => Availability::Ready,
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "pool::new",
                    result = "unavailable",
                    error = %err,
                    "Rendering engine unavailable; callers will use the fallback renderer"
                );
                Availability::Missing(err.to_string())
            }
        };

        Self {
            launcher,
            policy,
            availability,
            state: Mutex::new(PoolState::default()),
            last_used: Arc::new(LastUsed::new()),
            next_handle_id: AtomicU64::new(1),
            launches: AtomicU64::new(0),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.availability, Availability::Ready)
    }

    /// Reason the engine is unavailable, when it is.
    pub fn unavailable_reason(&self) -> Option<&str> {
        match &self.availability {
            Availability::Ready => None,
            Availability::Missing(reason) => Some(reason.as_str()),
        }
    }

    pub fn policy(&self) -> PoolPolicy {
        self.policy
    }

    /// Lease the current process, launching or recycling it first if due.
    ///
    /// The returned lease already counts as an open session on the process, so
    /// no concurrent caller can retire the process between this call and the
    /// session opening its surface.
    pub async fn acquire(&self) -> Result<HandleLease, RenderError> {
        if !self.is_available() {
            return Err(RenderError::Unavailable);
        }

        let mut state = self.state.lock().await;
        let now = Instant::now();

        self.reap_retired(&mut state).await;
        self.discard_disconnected(&mut state).await;

        if let Some(reason) = self.restart_due(&state, now) {
            let busy = state
                .current
                .as_ref()
                .map_or(0, |handle| handle.open_sessions());
            if busy > 0 {
                counter!(METRIC_RESTART_DEFERRED_TOTAL).increment(1);
                debug!(
                    target = SOURCE,
                    op = "pool::acquire",
                    result = "restart_deferred",
                    reason = reason.as_str(),
                    open_sessions = busy,
                    "Engine restart due but sessions are open; deferring"
                );
            } else {
                if let Some(old) = state.current.take() {
                    counter!(METRIC_RESTART_TOTAL, "reason" => reason.as_str()).increment(1);
                    info!(
                        target = SOURCE,
                        op = "pool::acquire",
                        result = "restart",
                        reason = reason.as_str(),
                        handle_id = old.id,
                        uses = old.uses(),
                        age_s = now.saturating_duration_since(old.created_at).as_secs(),
                        "Retiring rendering engine"
                    );
                    close_handle(&old, "pool::restart").await;
                }
                let handle = self.launch(&mut state, now).await?;
                state.current = Some(handle);
            }
        }

        let Some(handle) = state.current.clone() else {
            return Err(RenderError::capture_failed("no rendering engine running"));
        };

        handle.uses.fetch_add(1, Ordering::AcqRel);
        handle.open_sessions.fetch_add(1, Ordering::AcqRel);
        gauge!(METRIC_OPEN_SESSIONS).increment(1.0);
        self.last_used.stamp(now);

        Ok(HandleLease {
            handle,
            last_used: Arc::clone(&self.last_used),
            released: false,
        })
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let current = state.current.as_ref();
        PoolStats {
            available: self.is_available(),
            handle_id: current.map(|handle| handle.id),
            uses: current.map_or(0, |handle| handle.uses()),
            open_sessions: current.map_or(0, |handle| handle.open_sessions()),
            launches: self.launches.load(Ordering::Acquire),
            retiring: state.retiring.len(),
        }
    }

    /// Close every process that has no open sessions. Returns how many
    /// processes were left running because sessions still reference them.
    pub async fn shutdown(&self) -> usize {
        let mut state = self.state.lock().await;
        self.reap_retired(&mut state).await;

        if let Some(current) = state.current.take() {
            if current.open_sessions() == 0 {
                close_handle(&current, "pool::shutdown").await;
            } else {
                state.retiring.push(current);
            }
        }

        let remaining = state.retiring.len();
        info!(
            target = SOURCE,
            op = "pool::shutdown",
            remaining,
            "Rendering pool shut down"
        );
        remaining
    }

    fn restart_due(&self, state: &PoolState, now: Instant) -> Option<RestartReason> {
        let Some(handle) = state.current.as_ref() else {
            return Some(RestartReason::Missing);
        };
        if handle.uses() >= self.policy.max_uses {
            return Some(RestartReason::UseLimit);
        }
        let idle = self
            .last_used
            .get()
            .is_some_and(|last| now.saturating_duration_since(last) > self.policy.idle_ttl);
        idle.then_some(RestartReason::Idle)
    }

    async fn discard_disconnected(&self, state: &mut PoolState) {
        let disconnected = state
            .current
            .as_ref()
            .is_some_and(|handle| !handle.process.is_connected());
        if !disconnected {
            return;
        }
        let Some(handle) = state.current.take() else {
            return;
        };

        warn!(
            target = SOURCE,
            op = "pool::acquire",
            result = "disconnected",
            handle_id = handle.id,
            open_sessions = handle.open_sessions(),
            "Rendering engine disconnected; discarding handle"
        );
        if handle.open_sessions() == 0 {
            close_handle(&handle, "pool::discard").await;
        } else {
            state.retiring.push(handle);
        }
    }

    async fn reap_retired(&self, state: &mut PoolState) {
        let mut still_busy = Vec::with_capacity(state.retiring.len());
        for handle in state.retiring.drain(..) {
            if handle.open_sessions() == 0 {
                close_handle(&handle, "pool::reap").await;
            } else {
                still_busy.push(handle);
            }
        }
        state.retiring = still_busy;
    }

    async fn launch(
        &self,
        state: &mut PoolState,
        now: Instant,
    ) -> Result<Arc<ProcessHandle>, RenderError> {
        if let Some(retry_at) = state.backoff.blocked_until(now) {
            let wait_ms = retry_at.saturating_duration_since(now).as_millis() as u64;
            debug!(
                target = SOURCE,
                op = "pool::launch",
                result = "backoff",
                retry_in_ms = wait_ms,
                "Skipping engine launch during backoff"
            );
            return Err(RenderError::capture_failed(format!(
                "rendering engine launch backing off for {wait_ms} ms"
            )));
        }

        let started_at = Instant::now();
        match self.launcher.launch().await {
            Ok(process) => {
                state.backoff.reset();
                let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
                self.launches.fetch_add(1, Ordering::AcqRel);
                counter!(METRIC_LAUNCH_TOTAL).increment(1);
                info!(
                    target = SOURCE,
                    op = "pool::launch",
                    result = "ok",
                    handle_id = id,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Rendering engine launched"
                );
                Ok(Arc::new(ProcessHandle {
                    id,
                    process,
                    created_at: Instant::now(),
                    uses: AtomicU64::new(0),
                    open_sessions: AtomicUsize::new(0),
                }))
            }
            Err(err) => {
                let delay = state.backoff.record_failure(now);
                counter!(METRIC_LAUNCH_FAILED_TOTAL).increment(1);
                warn!(
                    target = SOURCE,
                    op = "pool::launch",
                    result = "error",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    failures = state.backoff.failures,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Failed to launch rendering engine"
                );
                Err(RenderError::capture_failed(err.to_string()))
            }
        }
    }
}

async fn close_handle(handle: &ProcessHandle, op: &'static str) {
    if let Err(err) = handle.process.close().await {
        counter!(METRIC_HOUSEKEEPING_FAILURE_TOTAL).increment(1);
        warn!(
            target = SOURCE,
            op,
            result = "housekeeping_failure",
            handle_id = handle.id,
            error = %err,
            "Failed to close rendering engine; ignoring"
        );
    }
}

/// A reserved session slot on a process handle.
///
/// Releasing (explicitly or on drop) decrements the open-session counter
/// exactly once and stamps the pool's last-used time.
pub struct HandleLease {
    handle: Arc<ProcessHandle>,
    last_used: Arc<LastUsed>,
    released: bool,
}

impl HandleLease {
    pub fn handle_id(&self) -> u64 {
        self.handle.id
    }

    pub(crate) fn process(&self) -> &dyn EngineProcess {
        self.handle.process.as_ref()
    }

    pub(crate) fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.handle.open_sessions.fetch_sub(1, Ordering::AcqRel);
        gauge!(METRIC_OPEN_SESSIONS).decrement(1.0);
        self.last_used.stamp(Instant::now());
    }
}

impl fmt::Debug for HandleLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleLease")
            .field("handle_id", &self.handle.id)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        self.release();
    }
}
