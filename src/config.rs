use crate::error::{AnalysisError, Result};
use serde::{Deserialize, Serialize};

/// Per-run analysis configuration. Every heuristic constant used by the
/// extractor, aggregator, classifier, and detectors is exposed here so a
/// run can be tuned without code changes; the defaults are the calibrated
/// values the taxonomy was designed against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Classified patterns below this confidence are dropped.
    pub min_confidence_threshold: f64,
    /// A sample bucket becomes a hotspot once it holds this many samples.
    pub min_samples_per_hotspot: u32,
    /// Require distinct source locations on a cache line before confirming
    /// false sharing.
    pub require_different_vars: bool,
    /// Minimum write ratio for a false-sharing confirmation.
    pub min_write_ratio: f64,
    /// Cache line size override. None means "use the topology's L1 line".
    pub cache_line_size: Option<u32>,
    /// Run the LRU cache simulator during evaluation.
    pub enable_simulation: bool,
    /// Run Welch's t-test on baseline vs optimized timings.
    pub enable_statistical_analysis: bool,
    /// Confidence level for the significance test.
    pub confidence_level: f64,
    /// Timing iterations assumed when interpreting measurement vectors.
    pub sample_iterations: u32,

    /// Assumed element size in bytes for stride and footprint math.
    pub element_size: u32,
    /// Row-size heuristic for nested-loop (column-major) accesses when the
    /// array shape is unknown. Speedup estimates derived from it are
    /// indicative only.
    pub nested_outer_stride: i64,
    /// Allowed tile edge lengths, ascending. Tiling quantizes down into
    /// this set and never exceeds its maximum.
    pub tile_quantization: Vec<u32>,
    /// Two accesses to one bank within this window count as a conflict.
    pub bank_conflict_window_ns: u64,
    /// Share of equal address deltas required to call a bucket Sequential
    /// or Strided.
    pub sequential_dominance: f64,
    /// Unique-lines-per-sample ratio above which a bucket is Random.
    pub address_diversity_threshold: f64,
    /// Share of consecutive-address deltas that must agree on one stride
    /// to flag a strided bank conflict.
    pub strided_bank_agreement: f64,
    /// Share of power-of-two deltas that flags a power-of-two conflict.
    pub pow2_delta_share: f64,
    /// Minimum distinct threads on a cache line to consider false sharing.
    pub min_false_sharing_threads: u32,

    /// Confidence multiplier when a static pattern corroborates a hotspot.
    pub static_confidence_bump: f64,
    /// Severity multiplier when the corroborating pattern carries
    /// dependencies.
    pub dependency_severity_bump: f64,
    /// Confidence multiplier for translation units with many loops.
    pub many_loops_confidence_bump: f64,
    /// Confidence scale for hotspots with fewer than 10 samples.
    pub low_sample_confidence_scale: f64,
    /// Confidence scale for hotspots with more than 1000 samples.
    pub high_sample_confidence_scale: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_confidence_threshold: 0.6,
            min_samples_per_hotspot: 4,
            require_different_vars: false,
            min_write_ratio: 0.1,
            cache_line_size: None,
            enable_simulation: false,
            enable_statistical_analysis: true,
            confidence_level: 0.95,
            sample_iterations: 100,
            element_size: 8,
            nested_outer_stride: 1024,
            tile_quantization: vec![16, 32, 64, 128, 256],
            bank_conflict_window_ns: 1_000,
            sequential_dominance: 0.90,
            address_diversity_threshold: 0.80,
            strided_bank_agreement: 0.50,
            pow2_delta_share: 0.80,
            min_false_sharing_threads: 2,
            static_confidence_bump: 1.2,
            dependency_severity_bump: 1.1,
            many_loops_confidence_bump: 1.15,
            low_sample_confidence_scale: 0.7,
            high_sample_confidence_scale: 1.1,
        }
    }
}

impl AnalysisConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// High-precision preset: report only well-supported findings.
    pub fn strict() -> Self {
        Self {
            min_confidence_threshold: 0.8,
            min_samples_per_hotspot: 8,
            ..Default::default()
        }
    }

    /// Exploratory preset: surface weakly-supported findings too.
    pub fn permissive() -> Self {
        Self {
            min_confidence_threshold: 0.4,
            min_samples_per_hotspot: 2,
            ..Default::default()
        }
    }

    pub fn with_min_confidence(mut self, threshold: f64) -> Self {
        self.min_confidence_threshold = threshold;
        self
    }

    pub fn with_min_samples(mut self, samples: u32) -> Self {
        self.min_samples_per_hotspot = samples;
        self
    }

    pub fn with_cache_line_size(mut self, line_size: u32) -> Self {
        self.cache_line_size = Some(line_size);
        self
    }

    pub fn with_simulation(mut self, enabled: bool) -> Self {
        self.enable_simulation = enabled;
        self
    }

    pub fn with_nested_outer_stride(mut self, stride: i64) -> Self {
        self.nested_outer_stride = stride;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence_threshold) {
            return Err(AnalysisError::invalid_input(
                "min_confidence_threshold must be within [0, 1]",
            ));
        }
        if !(0.0..1.0).contains(&self.confidence_level) {
            return Err(AnalysisError::invalid_input(
                "confidence_level must be within [0, 1)",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_write_ratio) {
            return Err(AnalysisError::invalid_input(
                "min_write_ratio must be within [0, 1]",
            ));
        }
        for (name, value) in [
            ("sequential_dominance", self.sequential_dominance),
            ("address_diversity_threshold", self.address_diversity_threshold),
            ("strided_bank_agreement", self.strided_bank_agreement),
            ("pow2_delta_share", self.pow2_delta_share),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AnalysisError::invalid_input(format!(
                    "{} must be within [0, 1]",
                    name
                )));
            }
        }
        if self.element_size == 0 {
            return Err(AnalysisError::invalid_input("element_size must be non-zero"));
        }
        if self.nested_outer_stride <= 0 {
            return Err(AnalysisError::invalid_input(
                "nested_outer_stride must be positive",
            ));
        }
        if self.tile_quantization.is_empty() {
            return Err(AnalysisError::invalid_input(
                "tile_quantization must list at least one tile size",
            ));
        }
        if self.tile_quantization.windows(2).any(|w| w[0] >= w[1]) {
            return Err(AnalysisError::invalid_input(
                "tile_quantization must be strictly ascending",
            ));
        }
        if self.min_false_sharing_threads < 2 {
            return Err(AnalysisError::invalid_input(
                "min_false_sharing_threads must be at least 2",
            ));
        }
        if self.min_samples_per_hotspot == 0 {
            return Err(AnalysisError::invalid_input(
                "min_samples_per_hotspot must be non-zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AnalysisConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_confidence_threshold, 0.6);
        assert_eq!(config.min_samples_per_hotspot, 4);
        assert_eq!(config.nested_outer_stride, 1024);
        assert_eq!(config.tile_quantization, vec![16, 32, 64, 128, 256]);
        assert_eq!(config.bank_conflict_window_ns, 1_000);
        assert!(!config.enable_simulation);
        assert!(config.enable_statistical_analysis);
    }

    #[test]
    fn test_presets() {
        let strict = AnalysisConfig::strict();
        strict.validate().unwrap();
        assert_eq!(strict.min_confidence_threshold, 0.8);
        assert_eq!(strict.min_samples_per_hotspot, 8);

        let permissive = AnalysisConfig::permissive();
        permissive.validate().unwrap();
        assert_eq!(permissive.min_confidence_threshold, 0.4);
    }

    #[test]
    fn test_builder_setters() {
        let config = AnalysisConfig::new()
            .with_min_confidence(0.75)
            .with_min_samples(16)
            .with_cache_line_size(128);
        assert_eq!(config.min_confidence_threshold, 0.75);
        assert_eq!(config.min_samples_per_hotspot, 16);
        assert_eq!(config.cache_line_size, Some(128));
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        assert!(AnalysisConfig::new().with_min_confidence(1.5).validate().is_err());

        let mut config = AnalysisConfig::default();
        config.tile_quantization = vec![64, 32];
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.element_size = 0;
        assert!(config.validate().is_err());

        let mut config = AnalysisConfig::default();
        config.min_false_sharing_threads = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = AnalysisConfig::strict().with_cache_line_size(128);
        let json = serde_json::to_string(&config).unwrap();
        let restored: AnalysisConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.min_confidence_threshold, 0.8);
        assert_eq!(restored.cache_line_size, Some(128));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let restored: AnalysisConfig =
            serde_json::from_str(r#"{"min_samples_per_hotspot": 10}"#).unwrap();
        assert_eq!(restored.min_samples_per_hotspot, 10);
        assert_eq!(restored.min_confidence_threshold, 0.6);
    }
}
