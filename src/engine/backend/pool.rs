//! Model pool
//!
//! The SCRFD detector and the FER+ classifier are compiled lazily, cached per
//! model, and dropped again after `model_idle_timeout` seconds without use.
//! The server warms both up before accepting requests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use openvino::{CompiledModel, Core};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::InferenceConfig;
use crate::engine::ModelStatus;

/// OpenVINO core; only ever touched under the pool's write lock
struct SafeCore(Core);
unsafe impl Send for SafeCore {}
unsafe impl Sync for SafeCore {}

/// Shareable compiled model
#[derive(Clone)]
pub struct SafeCompiledModel(Arc<CompiledModel>);
unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

impl SafeCompiledModel {
    /// Create an inference request
    ///
    /// CompiledModel is thread-safe in the C++ runtime; the Rust bindings
    /// only ask for `&mut self` because of how the FFI call is declared.
    pub fn create_infer_request(&self) -> anyhow::Result<openvino::InferRequest> {
        unsafe {
            let ptr = Arc::as_ptr(&self.0) as *mut CompiledModel;
            (*ptr).create_infer_request().map_err(|e| e.into())
        }
    }
}

/// Model types that can be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    Detector,
    Emotion,
}

impl ModelType {
    pub const ALL: [ModelType; 2] = [ModelType::Detector, ModelType::Emotion];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Detector => "detector",
            ModelType::Emotion => "emotion",
        }
    }

    fn slot_index(self) -> usize {
        self as usize
    }
}

/// One model file and its compiled form, if resident
struct ModelSlot {
    path: PathBuf,
    resident: RwLock<Option<(SafeCompiledModel, Instant)>>,
}

impl ModelSlot {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            resident: RwLock::new(None),
        }
    }

    /// Resident model, refreshing its access time
    fn touch(&self) -> Option<SafeCompiledModel> {
        let mut guard = self.resident.write();
        guard.as_mut().map(|(model, last_access)| {
            *last_access = Instant::now();
            model.clone()
        })
    }

    fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.resident
            .read()
            .as_ref()
            .map(|(_, last_access)| now.duration_since(*last_access))
    }
}

/// Compiles models on first use and drops them after an idle period
pub struct ModelPool {
    core: RwLock<SafeCore>,
    device: String,
    /// Zero keeps models resident
    idle_timeout: Duration,
    slots: [ModelSlot; 2],
    shutdown: Notify,
}

impl ModelPool {
    pub fn new(config: &InferenceConfig, detector_path: &Path, emotion_path: &Path) -> anyhow::Result<Self> {
        let core = Core::new()?;

        Ok(Self {
            core: RwLock::new(SafeCore(core)),
            device: config.device.clone(),
            idle_timeout: Duration::from_secs(config.model_idle_timeout),
            slots: [ModelSlot::new(detector_path), ModelSlot::new(emotion_path)],
            shutdown: Notify::new(),
        })
    }

    fn slot(&self, model_type: ModelType) -> &ModelSlot {
        &self.slots[model_type.slot_index()]
    }

    /// Get or compile a model
    pub fn get_model(&self, model_type: ModelType) -> anyhow::Result<SafeCompiledModel> {
        let slot = self.slot(model_type);
        if let Some(model) = slot.touch() {
            return Ok(model);
        }

        // Compile under the core lock so two callers never compile the same file
        let mut core = self.core.write();
        if let Some(model) = slot.touch() {
            return Ok(model);
        }

        info!("Loading model: {} from {:?}", model_type.as_str(), slot.path);
        let start = Instant::now();

        let path = slot
            .path
            .to_str()
            .with_context(|| format!("Model path is not valid UTF-8: {:?}", slot.path))?;
        let model = core.0.read_model_from_file(path, "")?;
        let compiled = SafeCompiledModel(Arc::new(core.0.compile_model(&model, self.device.as_str().into())?));

        info!("Model {} loaded in {:?}", model_type.as_str(), start.elapsed());
        *slot.resident.write() = Some((compiled.clone(), Instant::now()));

        Ok(compiled)
    }

    /// Compile every model now so the first request does not pay for it
    pub fn warm_up(&self) -> anyhow::Result<()> {
        ModelType::ALL
            .into_iter()
            .try_for_each(|model_type| self.get_model(model_type).map(drop))
    }

    pub fn is_loaded(&self, model_type: ModelType) -> bool {
        self.slot(model_type).resident.read().is_some()
    }

    fn cleanup_idle_models(&self) {
        if self.idle_timeout.is_zero() {
            return;
        }

        let now = Instant::now();
        for model_type in ModelType::ALL {
            let slot = self.slot(model_type);
            if slot.idle_for(now).is_some_and(|idle| idle > self.idle_timeout) {
                info!("Unloading idle model: {}", model_type.as_str());
                *slot.resident.write() = None;
            }
        }
    }

    /// Periodically unload idle models until [`shutdown`](Self::shutdown)
    pub async fn start_cleanup_task(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("Running model cleanup check");
                    self.cleanup_idle_models();
                }
                _ = self.shutdown.notified() => {
                    info!("Model pool cleanup task shutting down");
                    break;
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl ModelStatus for ModelPool {
    fn loaded_models(&self) -> HashMap<String, bool> {
        ModelType::ALL
            .into_iter()
            .map(|t| (t.as_str().to_string(), self.is_loaded(t)))
            .collect()
    }
}

impl Drop for ModelPool {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}
