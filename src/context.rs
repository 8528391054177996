use crate::cache_model::CacheModel;
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Running aggregates maintained by the classifier across a run. Guarded by
/// a single lock; every classification entry point acquires it.
#[derive(Debug, Clone, Default)]
pub struct ClassifierStats {
    pub avg_miss_rate: f64,
    pub avg_latency: f64,
    pub total_samples: u64,
    pub hotspots_classified: u64,
}

impl ClassifierStats {
    /// Folds one hotspot's miss rate and latency into the running averages.
    pub fn record(&mut self, miss_rate: f64, avg_latency: f64, sample_count: u64) {
        let n = self.hotspots_classified as f64;
        self.avg_miss_rate = (self.avg_miss_rate * n + miss_rate) / (n + 1.0);
        self.avg_latency = (self.avg_latency * n + avg_latency) / (n + 1.0);
        self.hotspots_classified += 1;
        self.total_samples += sample_count;
    }
}

/// Everything one analysis run shares: the immutable cache snapshot, the
/// configuration, the cooperative stop flag, and the classifier statistics
/// block. Tests instantiate isolated contexts; nothing here is global.
pub struct Context {
    cache_model: Arc<CacheModel>,
    config: AnalysisConfig,
    stop: AtomicBool,
    stats: Mutex<ClassifierStats>,
}

impl Context {
    pub fn new(cache_model: CacheModel, config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cache_model: Arc::new(cache_model),
            config,
            stop: AtomicBool::new(false),
            stats: Mutex::new(ClassifierStats::default()),
        })
    }

    /// Default-configured context over a common desktop topology.
    pub fn with_defaults() -> Self {
        Self {
            cache_model: Arc::new(CacheModel::typical_desktop()),
            config: AnalysisConfig::default(),
            stop: AtomicBool::new(false),
            stats: Mutex::new(ClassifierStats::default()),
        }
    }

    pub fn cache_model(&self) -> &CacheModel {
        &self.cache_model
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Effective cache line size: the configured override, else the
    /// topology's L1 line.
    pub fn line_size(&self) -> u32 {
        self.config
            .cache_line_size
            .or_else(|| self.cache_model.line_size(0))
            .unwrap_or(64)
    }

    /// Requests cooperative cancellation. Long-running loops observe the
    /// flag at per-item granularity and return `Cancelled`.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.stop_requested() {
            Err(AnalysisError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn stats(&self) -> MutexGuard<'_, ClassifierStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
