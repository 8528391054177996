//! Before/after evaluation: a set-associative LRU cache simulator, the
//! derived locality metrics, and a Welch's t-test over timing vectors.
//!
//! Simulation is cooperative: the run checks the context's stop flag at
//! every simulated access, and a stop aborts with `Cancelled` so partial
//! counters never leak into a report.

use crate::cache_model::CacheModel;
use crate::context::Context;
use crate::error::{AnalysisError, Result};
use crate::hotspot_aggregator::Hotspot;
use crate::pattern_extractor::AccessPatternKind;
use crate::sample_arena::SampleArena;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSimMetrics {
    pub level_id: u8,
    pub hits: u64,
    pub misses: u64,
    pub miss_rate: f64,
}

#[derive(Debug, Clone, Copy)]
struct Way {
    tag: Option<u64>,
    /// Aged on every access to the set; reset on hit or fill. The way
    /// with the largest counter is the LRU victim.
    counter: u64,
}

struct LevelSim {
    level_id: u8,
    line_size: u64,
    num_sets: u64,
    associativity: usize,
    ways: Vec<Way>,
    hits: u64,
    misses: u64,
}

impl LevelSim {
    fn new(level_id: u8, size_bytes: u64, line_size: u32, associativity: u32) -> Self {
        let line_size = u64::from(line_size.max(1));
        let associativity = associativity.max(1) as usize;
        let num_sets = (size_bytes / (line_size * associativity as u64)).max(1);
        Self {
            level_id,
            line_size,
            num_sets,
            associativity,
            ways: vec![
                Way {
                    tag: None,
                    counter: 0,
                };
                (num_sets as usize) * associativity
            ],
            hits: 0,
            misses: 0,
        }
    }

    fn access(&mut self, addr: u64) -> bool {
        let tag = addr / self.line_size;
        let set = (tag % self.num_sets) as usize;
        let ways = &mut self.ways[set * self.associativity..(set + 1) * self.associativity];

        for way in ways.iter_mut() {
            way.counter += 1;
        }

        if let Some(way) = ways.iter_mut().find(|w| w.tag == Some(tag)) {
            way.counter = 0;
            self.hits += 1;
            return true;
        }

        self.misses += 1;
        let victim = ways
            .iter_mut()
            .max_by_key(|w| w.counter)
            .unwrap_or_else(|| unreachable!("associativity is at least 1"));
        victim.tag = Some(tag);
        victim.counter = 0;
        false
    }

    fn metrics(&self) -> CacheSimMetrics {
        let accesses = self.hits + self.misses;
        CacheSimMetrics {
            level_id: self.level_id,
            hits: self.hits,
            misses: self.misses,
            miss_rate: self.misses as f64 / accesses.max(1) as f64,
        }
    }
}

/// Inclusive multi-level LRU simulator: an access walks the hierarchy
/// until it hits.
pub struct CacheSimulator {
    levels: Vec<LevelSim>,
}

impl CacheSimulator {
    pub fn new(model: &CacheModel) -> Self {
        Self {
            levels: model
                .levels()
                .iter()
                .map(|l| LevelSim::new(l.level_id, l.size_bytes, l.line_size, l.associativity))
                .collect(),
        }
    }

    /// Returns the 0-based level that serviced the access, or the number
    /// of levels when it went to memory.
    pub fn access(&mut self, addr: u64) -> u8 {
        for (i, level) in self.levels.iter_mut().enumerate() {
            if level.access(addr) {
                return i as u8;
            }
        }
        self.levels.len() as u8
    }

    /// Simulates a full address trace; cancellable at every access.
    pub fn run(&mut self, ctx: &Context, addrs: &[u64]) -> Result<Vec<CacheSimMetrics>> {
        for &addr in addrs {
            ctx.check_cancelled()?;
            self.access(addr);
        }
        Ok(self.metrics())
    }

    pub fn metrics(&self) -> Vec<CacheSimMetrics> {
        self.levels.iter().map(LevelSim::metrics).collect()
    }
}

// ---------------------------------------------------------------------------
// Locality metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalityMetrics {
    pub cache_line_utilization_pct: f64,
    pub spatial_locality_pct: f64,
    pub temporal_locality_pct: f64,
}

/// Useful bytes over fetched bytes: distinct touched elements against the
/// full lines pulled in for them.
pub fn cache_line_utilization(arena: &SampleArena, line_size: u32, element_size: u32) -> f64 {
    if arena.is_empty() {
        return 0.0;
    }
    let line = u64::from(line_size.max(1));
    let element = u64::from(element_size.max(1));

    let mut elements: FxHashSet<u64> = FxHashSet::default();
    let mut lines: FxHashSet<u64> = FxHashSet::default();
    for (_, sample) in arena.iter() {
        elements.insert(sample.memory_addr / element);
        lines.insert(sample.memory_addr / line);
    }
    let useful = elements.len() as u64 * element;
    let fetched = lines.len() as u64 * line;
    useful as f64 / fetched.max(1) as f64 * 100.0
}

/// Share of hotspots with line-friendly dominant patterns; strided counts
/// half.
pub fn spatial_locality(hotspots: &[Hotspot]) -> f64 {
    if hotspots.is_empty() {
        return 0.0;
    }
    let score: f64 = hotspots
        .iter()
        .map(|h| match h.dominant_pattern {
            AccessPatternKind::Sequential => 100.0,
            AccessPatternKind::Strided { .. } => 50.0,
            _ => 0.0,
        })
        .sum();
    score / hotspots.len() as f64
}

/// Hit ratio over all hotspot accesses.
pub fn temporal_locality(hotspots: &[Hotspot]) -> f64 {
    let accesses: u64 = hotspots.iter().map(|h| h.total_accesses).sum();
    let misses: u64 = hotspots.iter().map(|h| h.total_misses).sum();
    if accesses == 0 {
        return 0.0;
    }
    (1.0 - misses as f64 / accesses as f64) * 100.0
}

// ---------------------------------------------------------------------------
// Significance testing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignificanceResult {
    pub t_statistic: f64,
    pub degrees_of_freedom: f64,
    pub p_value: f64,
    pub significant: bool,
    pub baseline_mean: f64,
    pub optimized_mean: f64,
    pub improvement_pct: f64,
}

/// Welch's unequal-variance t-test on two timing vectors. The p-value uses
/// the standard-normal approximation of the t distribution.
pub fn welch_t_test(
    baseline: &[f64],
    optimized: &[f64],
    confidence_level: f64,
) -> Result<SignificanceResult> {
    if baseline.len() < 2 || optimized.len() < 2 {
        return Err(AnalysisError::invalid_input(
            "significance testing needs at least two timings per side",
        ));
    }

    let (m1, v1) = mean_and_variance(baseline);
    let (m2, v2) = mean_and_variance(optimized);
    let n1 = baseline.len() as f64;
    let n2 = optimized.len() as f64;

    let se_sq = v1 / n1 + v2 / n2;
    let t_statistic = if se_sq > 0.0 {
        (m1 - m2) / se_sq.sqrt()
    } else {
        0.0
    };

    let degrees_of_freedom = if se_sq > 0.0 {
        se_sq * se_sq
            / ((v1 / n1) * (v1 / n1) / (n1 - 1.0) + (v2 / n2) * (v2 / n2) / (n2 - 1.0))
    } else {
        n1 + n2 - 2.0
    };

    // Two-sided p under N(0,1): 2 * (1 - Phi(|t|)) = erfc(|t| / sqrt(2)).
    let p_value = erfc(t_statistic.abs() / std::f64::consts::SQRT_2).clamp(0.0, 1.0);
    let alpha = 1.0 - confidence_level;

    let improvement_pct = if m1 != 0.0 {
        (m1 - m2) / m1 * 100.0
    } else {
        0.0
    };

    Ok(SignificanceResult {
        t_statistic,
        degrees_of_freedom,
        p_value,
        significant: p_value < alpha,
        baseline_mean: m1,
        optimized_mean: m2,
        improvement_pct,
    })
}

/// Sample mean and unbiased variance.
fn mean_and_variance(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
    (mean, variance)
}

// ---------------------------------------------------------------------------
// Combined report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImprovementReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_simulation: Option<Vec<CacheSimMetrics>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_simulation: Option<Vec<CacheSimMetrics>>,
    pub locality: LocalityMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub significance: Option<SignificanceResult>,
}

pub struct Evaluator<'a> {
    ctx: &'a Context,
}

impl<'a> Evaluator<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Compares a baseline run against an optimized one. Simulation and
    /// significance testing run only when enabled in the configuration.
    pub fn evaluate(
        &self,
        arena: &SampleArena,
        hotspots: &[Hotspot],
        baseline_addrs: &[u64],
        optimized_addrs: &[u64],
        baseline_times: &[f64],
        optimized_times: &[f64],
    ) -> Result<ImprovementReport> {
        let config = self.ctx.config();

        let (baseline_simulation, optimized_simulation) = if config.enable_simulation {
            let mut before = CacheSimulator::new(self.ctx.cache_model());
            let mut after = CacheSimulator::new(self.ctx.cache_model());
            (
                Some(before.run(self.ctx, baseline_addrs)?),
                Some(after.run(self.ctx, optimized_addrs)?),
            )
        } else {
            (None, None)
        };

        let locality = LocalityMetrics {
            cache_line_utilization_pct: cache_line_utilization(
                arena,
                self.ctx.line_size(),
                config.element_size,
            ),
            spatial_locality_pct: spatial_locality(hotspots),
            temporal_locality_pct: temporal_locality(hotspots),
        };

        let significance = if config.enable_statistical_analysis
            && baseline_times.len() >= 2
            && optimized_times.len() >= 2
        {
            Some(welch_t_test(
                baseline_times,
                optimized_times,
                config.confidence_level,
            )?)
        } else {
            None
        };

        Ok(ImprovementReport {
            baseline_simulation,
            optimized_simulation,
            locality,
            significance,
        })
    }
}

impl Default for LocalityMetrics {
    fn default() -> Self {
        Self {
            cache_line_utilization_pct: 0.0,
            spatial_locality_pct: 0.0,
            temporal_locality_pct: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_model::CacheLevel;
    use crate::sample_arena::CacheMissSample;
    use crate::source_location::SourceLocation;

    /// 2 sets x 2 ways x 64-byte lines.
    fn tiny_model() -> CacheModel {
        CacheModel::new([CacheLevel::new(1, 256, 64, 2)]).unwrap()
    }

    #[test]
    fn test_lru_replacement_order() {
        let mut sim = CacheSimulator::new(&tiny_model());

        assert_eq!(sim.access(0), 1); // miss -> memory
        assert_eq!(sim.access(256), 1); // same set, second way
        assert_eq!(sim.access(0), 0); // hit
        assert_eq!(sim.access(512), 1); // evicts 256 (LRU), not 0
        assert_eq!(sim.access(256), 1); // was evicted
        let metrics = sim.metrics();
        assert_eq!(metrics[0].hits, 1);
        assert_eq!(metrics[0].misses, 4);
    }

    #[test]
    fn test_same_line_hits() {
        let mut sim = CacheSimulator::new(&tiny_model());
        sim.access(0);
        // Every address inside the 64-byte line hits.
        assert_eq!(sim.access(8), 0);
        assert_eq!(sim.access(63), 0);
        assert_eq!(sim.metrics()[0].hits, 2);
    }

    #[test]
    fn test_set_isolation() {
        let mut sim = CacheSimulator::new(&tiny_model());
        // Odd tags map to set 1 and never disturb set 0.
        sim.access(0);
        sim.access(64);
        sim.access(192);
        sim.access(320);
        assert_eq!(sim.access(0), 0);
    }

    #[test]
    fn test_multi_level_walkdown() {
        let model = CacheModel::new([
            CacheLevel::new(1, 256, 64, 2),
            CacheLevel::new(2, 1024, 64, 4),
        ])
        .unwrap();
        let mut sim = CacheSimulator::new(&model);

        assert_eq!(sim.access(0), 2); // cold: misses both levels
        assert_eq!(sim.access(0), 0); // L1 hit

        // Blow L1 set 0 (2 ways) while staying within L2.
        sim.access(256);
        sim.access(512);
        // 0 was evicted from L1 but still resides in L2.
        assert_eq!(sim.access(0), 1);
    }

    #[test]
    fn test_working_set_larger_than_cache_thrashes() {
        let mut sim = CacheSimulator::new(&tiny_model());
        // 16 distinct lines cycled twice through a 4-line cache.
        for _ in 0..2 {
            for i in 0..16u64 {
                sim.access(i * 64);
            }
        }
        let metrics = sim.metrics();
        assert_eq!(metrics[0].misses, 32);
        assert_eq!(metrics[0].hits, 0);
        assert_eq!(metrics[0].miss_rate, 1.0);
    }

    #[test]
    fn test_simulation_cancellable() {
        let ctx = Context::with_defaults();
        ctx.request_stop();
        let mut sim = CacheSimulator::new(ctx.cache_model());
        let err = sim.run(&ctx, &[0, 64, 128]).unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));
    }

    #[test]
    fn test_cache_line_utilization() {
        // 8 distinct 8-byte elements inside one 64-byte line: 100%.
        let samples: Vec<CacheMissSample> = (0..8)
            .map(|i| CacheMissSample {
                ip: 0,
                memory_addr: i * 8,
                miss_latency_cycles: 10,
                cache_level_hit: 0,
                timestamp_ns: i,
                thread_id: 1,
                cpu_id: 0,
                is_write: false,
                source_location: None,
            })
            .collect();
        let arena = SampleArena::from_samples(samples);
        assert!((cache_line_utilization(&arena, 64, 8) - 100.0).abs() < 1e-9);

        // One element per line: 1/8 of each fetched line is useful.
        let samples: Vec<CacheMissSample> = (0..8)
            .map(|i| CacheMissSample {
                ip: 0,
                memory_addr: i * 64,
                miss_latency_cycles: 10,
                cache_level_hit: 0,
                timestamp_ns: i,
                thread_id: 1,
                cpu_id: 0,
                is_write: false,
                source_location: None,
            })
            .collect();
        let arena = SampleArena::from_samples(samples);
        assert!((cache_line_utilization(&arena, 64, 8) - 12.5).abs() < 1e-9);
    }

    fn hotspot(pattern: AccessPatternKind, accesses: u64, misses: u64) -> Hotspot {
        Hotspot {
            location: SourceLocation::new("main.c", 1),
            sample_count: accesses,
            total_accesses: accesses,
            total_misses: misses,
            miss_rate: misses as f64 / accesses.max(1) as f64,
            avg_latency_cycles: 100.0,
            address_range: (0, 4096),
            dominant_pattern: pattern,
            access_stride: 0,
            cache_levels_affected: 1,
            is_false_sharing: false,
            samples: vec![],
        }
    }

    #[test]
    fn test_locality_scores() {
        let hotspots = vec![
            hotspot(AccessPatternKind::Sequential, 100, 10),
            hotspot(AccessPatternKind::Strided { stride: 4 }, 100, 40),
            hotspot(AccessPatternKind::Random, 100, 90),
        ];
        assert!((spatial_locality(&hotspots) - 50.0).abs() < 1e-9);
        // 140 misses over 300 accesses.
        assert!((temporal_locality(&hotspots) - (1.0 - 140.0 / 300.0) * 100.0).abs() < 1e-9);

        assert_eq!(spatial_locality(&[]), 0.0);
        assert_eq!(temporal_locality(&[]), 0.0);
    }

    #[test]
    fn test_welch_t_test_known_values() {
        let baseline = [10.0, 11.0, 12.0, 13.0, 14.0];
        let optimized = [8.0, 9.0, 10.0, 11.0, 12.0];
        let result = welch_t_test(&baseline, &optimized, 0.95).unwrap();

        assert!((result.t_statistic - 2.0).abs() < 1e-9);
        assert!((result.degrees_of_freedom - 8.0).abs() < 1e-9);
        // erfc(2 / sqrt(2)) ~ 0.0455.
        assert!((result.p_value - 0.0455).abs() < 0.001);
        assert!(result.significant);
        assert!((result.improvement_pct - (2.0 / 12.0 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn test_welch_identical_samples_not_significant() {
        let timings = [5.0, 5.1, 4.9, 5.0, 5.05];
        let result = welch_t_test(&timings, &timings, 0.95).unwrap();
        assert!((result.t_statistic).abs() < 1e-9);
        assert!(!result.significant);
        assert!((result.p_value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_welch_zero_variance() {
        let result = welch_t_test(&[5.0, 5.0, 5.0], &[5.0, 5.0], 0.95).unwrap();
        assert_eq!(result.t_statistic, 0.0);
        assert!(!result.significant);
    }

    #[test]
    fn test_welch_rejects_tiny_samples() {
        assert!(welch_t_test(&[1.0], &[1.0, 2.0], 0.95).is_err());
    }

    #[test]
    fn test_evaluator_respects_config_gates() {
        let ctx = Context::with_defaults(); // simulation off, stats on
        let arena = SampleArena::from_samples(vec![]);
        let report = Evaluator::new(&ctx)
            .evaluate(&arena, &[], &[0, 64], &[0], &[10.0, 11.0, 12.0], &[8.0, 9.0, 10.0])
            .unwrap();
        assert!(report.baseline_simulation.is_none());
        assert!(report.significance.is_some());

        let model = CacheModel::typical_desktop();
        let config = crate::config::AnalysisConfig::default().with_simulation(true);
        let ctx = Context::new(model, config).unwrap();
        let report = Evaluator::new(&ctx)
            .evaluate(&arena, &[], &[0, 64], &[0], &[], &[])
            .unwrap();
        assert!(report.baseline_simulation.is_some());
        assert!(report.optimized_simulation.is_some());
        assert!(report.significance.is_none());
    }
}
