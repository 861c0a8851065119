//! Scripted in-memory engine used by the render tests.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::infra::engine::{
    ContentBox, EngineError, EngineLauncher, EngineProcess, EngineSurface, Viewport,
};

pub(crate) const FAKE_JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];

/// How surfaces opened from the fake engine behave.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SurfaceScript {
    Normal,
    SelectorNeverAppears,
    QuiescenceHangs,
    CaptureFails,
    CapturePanics,
    SlowCapture(Duration),
}

pub(crate) struct FakeEngine {
    pub launch_attempts: AtomicUsize,
    pub launches: AtomicUsize,
    pub closes: AtomicUsize,
    pub open_surfaces: AtomicUsize,
    pub surfaces_closed: AtomicUsize,
    active_launches: AtomicUsize,
    pub max_concurrent_launches: AtomicUsize,
    failing_launches: AtomicUsize,
    failing_closes: AtomicBool,
    launch_delay: Duration,
    script: Mutex<SurfaceScript>,
    processes: Mutex<Vec<Arc<AtomicBool>>>,
    pub last_viewport: Mutex<Option<Viewport>>,
    pub last_markup: Mutex<Option<String>>,
    pub content_box: ContentBox,
}

impl FakeEngine {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_launch_delay(Duration::ZERO)
    }

    pub(crate) fn with_launch_delay(launch_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            launch_attempts: AtomicUsize::new(0),
            launches: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            open_surfaces: AtomicUsize::new(0),
            surfaces_closed: AtomicUsize::new(0),
            active_launches: AtomicUsize::new(0),
            max_concurrent_launches: AtomicUsize::new(0),
            failing_launches: AtomicUsize::new(0),
            failing_closes: AtomicBool::new(false),
            launch_delay,
            script: Mutex::new(SurfaceScript::Normal),
            processes: Mutex::new(Vec::new()),
            last_viewport: Mutex::new(None),
            last_markup: Mutex::new(None),
            content_box: ContentBox {
                width: 640,
                height: 1480,
            },
        })
    }

    pub(crate) fn launcher(self: &Arc<Self>) -> Arc<FakeLauncher> {
        Arc::new(FakeLauncher {
            engine: Arc::clone(self),
            installed: true,
        })
    }

    pub(crate) fn missing_launcher(self: &Arc<Self>) -> Arc<FakeLauncher> {
        Arc::new(FakeLauncher {
            engine: Arc::clone(self),
            installed: false,
        })
    }

    pub(crate) fn set_script(&self, script: SurfaceScript) {
        *self.script.lock().unwrap() = script;
    }

    pub(crate) fn fail_next_launches(&self, count: usize) {
        self.failing_launches.store(count, Ordering::SeqCst);
    }

    /// Make every process and surface close report an error. The close
    /// still takes effect.
    pub(crate) fn fail_closes(&self) {
        self.failing_closes.store(true, Ordering::SeqCst);
    }

    fn close_result(&self) -> Result<(), EngineError> {
        if self.failing_closes.load(Ordering::SeqCst) {
            Err(EngineError::protocol("scripted close failure"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn disconnect_all(&self) {
        for flag in self.processes.lock().unwrap().iter() {
            flag.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn open_surfaces(&self) -> usize {
        self.open_surfaces.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeLauncher {
    engine: Arc<FakeEngine>,
    installed: bool,
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    fn probe(&self) -> Result<(), EngineError> {
        if self.installed {
            Ok(())
        } else {
            Err(EngineError::NotInstalled("fake engine missing".into()))
        }
    }

    async fn launch(&self) -> Result<Box<dyn EngineProcess>, EngineError> {
        let engine = &self.engine;
        engine.launch_attempts.fetch_add(1, Ordering::SeqCst);
        let active = engine.active_launches.fetch_add(1, Ordering::SeqCst) + 1;
        engine
            .max_concurrent_launches
            .fetch_max(active, Ordering::SeqCst);
        if !engine.launch_delay.is_zero() {
            tokio::time::sleep(engine.launch_delay).await;
        }
        engine.active_launches.fetch_sub(1, Ordering::SeqCst);

        let failing = engine.failing_launches.load(Ordering::SeqCst);
        if failing > 0 {
            engine.failing_launches.store(failing - 1, Ordering::SeqCst);
            return Err(EngineError::Launch("scripted launch failure".into()));
        }

        engine.launches.fetch_add(1, Ordering::SeqCst);
        let connected = Arc::new(AtomicBool::new(true));
        engine
            .processes
            .lock()
            .unwrap()
            .push(Arc::clone(&connected));
        Ok(Box::new(FakeProcess {
            engine: Arc::clone(engine),
            connected,
        }))
    }
}

struct FakeProcess {
    engine: Arc<FakeEngine>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl EngineProcess for FakeProcess {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn open_surface(
        &self,
        viewport: Viewport,
    ) -> Result<Box<dyn EngineSurface>, EngineError> {
        if !self.is_connected() {
            return Err(EngineError::Disconnected);
        }
        self.engine.open_surfaces.fetch_add(1, Ordering::SeqCst);
        *self.engine.last_viewport.lock().unwrap() = Some(viewport);
        let script = self.engine.script.lock().unwrap().clone();
        Ok(Box::new(FakeSurface {
            engine: Arc::clone(&self.engine),
            script,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.engine.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.engine.close_result()
    }
}

struct FakeSurface {
    engine: Arc<FakeEngine>,
    script: SurfaceScript,
    closed: AtomicBool,
}

#[async_trait]
impl EngineSurface for FakeSurface {
    async fn set_content(&self, markup: &str) -> Result<(), EngineError> {
        *self.engine.last_markup.lock().unwrap() = Some(markup.to_string());
        Ok(())
    }

    async fn wait_for_quiescence(&self) -> Result<(), EngineError> {
        if self.script == SurfaceScript::QuiescenceHangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn wait_for_selector(&self, _selector: &str) -> Result<(), EngineError> {
        if self.script == SurfaceScript::SelectorNeverAppears {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn measure(&self, _selector: &str) -> Result<ContentBox, EngineError> {
        Ok(self.engine.content_box)
    }

    async fn set_viewport(&self, viewport: Viewport) -> Result<(), EngineError> {
        *self.engine.last_viewport.lock().unwrap() = Some(viewport);
        Ok(())
    }

    async fn capture_jpeg(&self, _selector: &str, _quality: u8) -> Result<Vec<u8>, EngineError> {
        match &self.script {
            SurfaceScript::CaptureFails => Err(EngineError::protocol("scripted capture failure")),
            SurfaceScript::CapturePanics => panic!("scripted capture panic"),
            SurfaceScript::SlowCapture(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(FAKE_JPEG.to_vec())
            }
            _ => Ok(FAKE_JPEG.to_vec()),
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.engine.open_surfaces.fetch_sub(1, Ordering::SeqCst);
            self.engine.surfaces_closed.fetch_add(1, Ordering::SeqCst);
        }
        self.engine.close_result()
    }
}
