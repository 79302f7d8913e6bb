//! The owned runtime value: lifecycle, wiring, and memory reclaim.
//!
//! There is no process-wide singleton: [`LyraRuntime::initialize`] builds
//! an explicit value owning the tokio runtime, the engines, the model
//! manager, and the memory manager; [`LyraRuntime::shutdown`] tears it all
//! down. Components that need shared access receive `Arc`s.
//!
//! A background reclaim loop watches the host's available RAM against
//! floors derived from `memory_limit_bytes` and sheds idle models (LRU
//! first, pinned ones never) when the host runs tight.

use crate::backend::BackendFactory;
use crate::backend::stub::StubFactory;
use crate::config::{LogLevel, SdkConfig};
use crate::error::{ErrorCode, LyraError, Result};
use crate::handle::HandleAllocator;
use crate::llm::LlmEngine;
use crate::memory::{MemoryManager, host};
use crate::models::types::DeviceCapabilities;
use crate::models::{CatalogProvider, HttpCatalog, ModelManager};
use crate::pipeline::VoicePipeline;
use crate::stt::SttEngine;
use crate::tts::TtsEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Poll cadence of the background reclaim loop.
const RECLAIM_POLL: Duration = Duration::from_secs(15);

/// The assembled SDK: engines, managers, and the worker runtime.
pub struct LyraRuntime {
    config: SdkConfig,
    rt: tokio::runtime::Runtime,
    memory: Arc<MemoryManager>,
    models: Arc<ModelManager>,
    llm: Arc<LlmEngine>,
    stt: Arc<SttEngine>,
    tts: Arc<TtsEngine>,
    reclaim_cancel: CancellationToken,
}

impl LyraRuntime {
    /// Initialize with the default backend factory and the HTTPS catalog
    /// from the configured registry URL.
    ///
    /// # Errors
    ///
    /// Configuration validation errors; storage errors creating the model
    /// directory; resource errors building the worker pool.
    pub fn initialize(config: SdkConfig) -> Result<Self> {
        Self::initialize_with(config, Arc::new(StubFactory), None)
    }

    /// Initialize with an explicit backend factory and optional catalog
    /// provider (embedders wire their real inference stack through here).
    ///
    /// # Errors
    ///
    /// Same as [`LyraRuntime::initialize`].
    pub fn initialize_with(
        mut config: SdkConfig,
        factory: Arc<dyn BackendFactory>,
        catalog: Option<Box<dyn CatalogProvider>>,
    ) -> Result<Self> {
        config.validate()?;
        install_tracing(config.log_level);

        std::fs::create_dir_all(&config.model_directory).map_err(|e| {
            LyraError::from_io(
                format!("creating model directory {}", config.model_directory.display()),
                &e,
            )
        })?;

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.thread_count)
            .thread_name("lyra-worker")
            .enable_all()
            .build()
            .map_err(|e| {
                LyraError::new(
                    ErrorCode::ResourceThreadPoolExhausted,
                    "worker thread pool could not be created",
                    format!("tokio runtime build failed: {e}"),
                )
                .with_recovery("lower thread_count or free system resources")
            })?;

        let memory = Arc::new(MemoryManager::new(config.memory_limit_bytes));
        let allocator = Arc::new(HandleAllocator::new());
        let llm = Arc::new(LlmEngine::new(
            Arc::clone(&factory),
            Arc::clone(&memory),
            Arc::clone(&allocator),
        ));
        let stt = Arc::new(SttEngine::new(
            Arc::clone(&factory),
            Arc::clone(&memory),
            Arc::clone(&allocator),
        ));
        let tts = Arc::new(TtsEngine::new(
            Arc::clone(&factory),
            Arc::clone(&memory),
            Arc::clone(&allocator),
        ));

        let catalog =
            catalog.unwrap_or_else(|| Box::new(HttpCatalog::new(config.registry_url.clone())));
        let models = Arc::new(ModelManager::new(&config.model_directory, catalog)?);

        let reclaim_cancel = CancellationToken::new();
        rt.spawn(reclaim_loop(
            ReclaimPolicy::for_limit(config.memory_limit_bytes),
            Arc::clone(&memory),
            Arc::clone(&llm),
            Arc::clone(&stt),
            Arc::clone(&tts),
            reclaim_cancel.clone(),
        ));

        info!(
            model_dir = %config.model_directory.display(),
            threads = config.thread_count,
            memory_limit = config.memory_limit_bytes,
            "runtime initialized"
        );
        Ok(Self {
            config,
            rt,
            memory,
            models,
            llm,
            stt,
            tts,
            reclaim_cancel,
        })
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn models(&self) -> &ModelManager {
        &self.models
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn llm(&self) -> &LlmEngine {
        &self.llm
    }

    pub fn stt(&self) -> &SttEngine {
        &self.stt
    }

    pub fn tts(&self) -> &TtsEngine {
        &self.tts
    }

    /// Snapshot the host capabilities for catalog filtering.
    pub fn device_capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::detect(&self.config.model_directory)
    }

    /// Build a pipeline over this runtime's engines. The pipeline borrows
    /// the engines (shared `Arc`s); it never owns them.
    pub fn create_pipeline(&self) -> VoicePipeline {
        VoicePipeline::new(
            Arc::clone(&self.stt),
            Arc::clone(&self.llm),
            Arc::clone(&self.tts),
            self.rt.handle().clone(),
        )
    }

    /// Stop the reclaim loop, unload every model, and tear down the
    /// worker pool.
    pub fn shutdown(self) {
        self.reclaim_cancel.cancel();
        for handle in self.llm.loaded_handles() {
            let _ = self.llm.unload_model(handle);
        }
        for handle in self.stt.loaded_handles() {
            let _ = self.stt.unload_model(handle);
        }
        for handle in self.tts.loaded_handles() {
            let _ = self.tts.unload_model(handle);
        }
        self.rt.shutdown_timeout(std::time::Duration::from_secs(5));
        info!("runtime shut down");
    }
}

/// RAM floors derived from the configured model-memory limit.
///
/// The runtime starts shedding idle models once the host's available RAM
/// drops below half the limit, and sheds every unpinned model once it
/// drops below an eighth. A small limit therefore tolerates a tight host;
/// a generous one starts reclaiming early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReclaimPolicy {
    soft_floor_bytes: u64,
    hard_floor_bytes: u64,
}

impl ReclaimPolicy {
    fn for_limit(memory_limit_bytes: u64) -> Self {
        Self {
            soft_floor_bytes: memory_limit_bytes / 2,
            hard_floor_bytes: memory_limit_bytes / 8,
        }
    }

    /// How many bytes of tracked model memory to shed for a probe reading.
    ///
    /// Unknown readings shed nothing. Below the hard floor everything
    /// unpinned goes; between the floors only the shortfall (capped at
    /// what is actually tracked) is requested.
    fn bytes_to_shed(&self, available: Option<u64>, tracked_total: u64) -> u64 {
        let Some(available) = available else {
            return 0;
        };
        if available < self.hard_floor_bytes {
            return u64::MAX;
        }
        if available >= self.soft_floor_bytes {
            return 0;
        }
        (self.soft_floor_bytes - available).min(tracked_total)
    }
}

/// Periodically compare host RAM against the policy floors and shed idle
/// models until the token is cancelled.
async fn reclaim_loop(
    policy: ReclaimPolicy,
    memory: Arc<MemoryManager>,
    llm: Arc<LlmEngine>,
    stt: Arc<SttEngine>,
    tts: Arc<TtsEngine>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(RECLAIM_POLL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(
        soft_floor = policy.soft_floor_bytes,
        hard_floor = policy.hard_floor_bytes,
        "memory reclaim loop started"
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let available = host::available_ram_bytes();
                let needed = policy.bytes_to_shed(available, memory.total_usage());
                if needed > 0 {
                    warn!(
                        available_bytes = available.unwrap_or(0),
                        needed,
                        "host RAM is tight, shedding idle models"
                    );
                    shed_models(needed, &memory, &llm, &stt, &tts);
                }
            }
        }
    }
    info!("memory reclaim loop stopped");
}

/// Unload unpinned models in LRU order until roughly `required_bytes` are
/// freed (or the unpinned set runs out). Returns the bytes actually freed.
fn shed_models(
    required_bytes: u64,
    memory: &MemoryManager,
    llm: &LlmEngine,
    stt: &SttEngine,
    tts: &TtsEngine,
) -> u64 {
    let mut freed = 0u64;
    for handle in memory.eviction_candidates(required_bytes) {
        let size = memory.usage_of(handle).unwrap_or(0);
        let unloaded = (llm.is_loaded(handle) && llm.unload_model(handle).is_ok())
            || (stt.is_loaded(handle) && stt.unload_model(handle).is_ok())
            || (tts.is_loaded(handle) && tts.unload_model(handle).is_ok());
        if unloaded {
            freed = freed.saturating_add(size);
            warn!(%handle, size, "idle model unloaded to reclaim memory");
        }
    }
    freed
}

fn install_tracing(level: LogLevel) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_filter()));
    // Another subscriber may already be installed (tests, embedding app);
    // that is fine.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
