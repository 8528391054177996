//! Cache-line-granular write-contention analysis.
//!
//! Buckets every sample by cache line, tracks per-thread access and write
//! counts plus the distinct source locations touching the line, and scores
//! the contention. Candidates are confirmed only when at least two threads
//! actually write and the write ratio clears the configured floor.

use crate::context::Context;
use crate::sample_arena::SampleArena;
use crate::source_location::SourceLocation;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FalseSharingCandidate {
    pub cache_line_addr: u64,
    pub sample_count: u64,
    pub thread_count: u32,
    pub writing_threads: u32,
    pub write_ratio: f64,
    /// 0..100; built from thread spread, write share, per-thread imbalance,
    /// and location diversity.
    pub contention_score: f64,
    pub locations: Vec<SourceLocation>,
    pub confirmed: bool,
}

#[derive(Default)]
struct LineStats {
    access_count_by_thread: FxHashMap<u32, u64>,
    write_count_by_thread: FxHashMap<u32, u64>,
    locations: FxHashSet<SourceLocation>,
    total_accesses: u64,
    total_writes: u64,
}

pub struct FalseSharingDetector<'a> {
    ctx: &'a Context,
}

impl<'a> FalseSharingDetector<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Scans the full sample vector once and returns candidates sorted by
    /// contention score descending (line address breaks ties).
    pub fn detect(&self, arena: &SampleArena) -> Vec<FalseSharingCandidate> {
        let line_size = u64::from(self.ctx.line_size().max(1));
        let config = self.ctx.config();

        let mut lines: FxHashMap<u64, LineStats> = FxHashMap::default();
        for (_, sample) in arena.iter() {
            let line = sample.memory_addr & !(line_size - 1);
            let stats = lines.entry(line).or_default();
            *stats
                .access_count_by_thread
                .entry(sample.thread_id)
                .or_insert(0) += 1;
            stats.total_accesses += 1;
            if sample.is_write {
                *stats
                    .write_count_by_thread
                    .entry(sample.thread_id)
                    .or_insert(0) += 1;
                stats.total_writes += 1;
            }
            if let Some(loc) = &sample.source_location {
                stats.locations.insert(loc.clone());
            }
        }

        let mut line_addrs: Vec<u64> = lines.keys().copied().collect();
        line_addrs.sort_unstable();

        let mut candidates = Vec::new();
        for addr in line_addrs {
            let stats = match lines.remove(&addr) {
                Some(stats) => stats,
                None => continue,
            };
            let thread_count = stats.access_count_by_thread.len() as u32;
            if thread_count < config.min_false_sharing_threads {
                continue;
            }

            let writing_threads = stats.write_count_by_thread.len() as u32;
            let write_ratio = stats.total_writes as f64 / stats.total_accesses.max(1) as f64;

            let mut locations: Vec<SourceLocation> = stats.locations.into_iter().collect();
            locations.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
            let distinct_locations = locations.len();

            let contention_score = (f64::from(thread_count - 1) * 20.0
                + write_ratio * 40.0
                + access_imbalance(&stats.access_count_by_thread) * 20.0
                + if distinct_locations > 1 { 20.0 } else { 0.0 })
            .min(100.0);

            let confirmed = writing_threads >= 2
                && write_ratio >= config.min_write_ratio
                && (distinct_locations >= 2 || !config.require_different_vars);

            candidates.push(FalseSharingCandidate {
                cache_line_addr: addr,
                sample_count: stats.total_accesses,
                thread_count,
                writing_threads,
                write_ratio,
                contention_score,
                locations,
                confirmed,
            });
        }

        candidates.sort_by(|a, b| {
            b.contention_score
                .partial_cmp(&a.contention_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cache_line_addr.cmp(&b.cache_line_addr))
        });

        tracing::debug!(
            lines = candidates.len(),
            confirmed = candidates.iter().filter(|c| c.confirmed).count(),
            "false-sharing scan finished"
        );
        candidates
    }
}

/// Coefficient of variation of the per-thread access counts, a proxy for
/// asymmetric contention (one producer, many spinning readers).
fn access_imbalance(counts: &FxHashMap<u32, u64>) -> f64 {
    if counts.len() < 2 {
        return 0.0;
    }
    let n = counts.len() as f64;
    let mean = counts.values().sum::<u64>() as f64 / n;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = counts
        .values()
        .map(|&c| {
            let d = c as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    variance.sqrt() / mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample_arena::CacheMissSample;

    fn sample(addr: u64, tid: u32, is_write: bool, line: u32) -> CacheMissSample {
        CacheMissSample {
            ip: 0x400000,
            memory_addr: addr,
            miss_latency_cycles: 200,
            cache_level_hit: 3,
            timestamp_ns: 0,
            thread_id: tid,
            cpu_id: tid as u16,
            is_write,
            source_location: Some(SourceLocation::new("worker.c", line).with_function("tick")),
        }
    }

    fn detect(samples: Vec<CacheMissSample>) -> Vec<FalseSharingCandidate> {
        let ctx = Context::with_defaults();
        let arena = SampleArena::from_samples(samples);
        FalseSharingDetector::new(&ctx).detect(&arena)
    }

    #[test]
    fn test_contended_counter_line_confirmed() {
        // Four threads hammering adjacent counters in one 64-byte line.
        let mut samples = Vec::new();
        for _ in 0..8 {
            for tid in 0..4u32 {
                samples.push(sample(0x10000 + u64::from(tid) * 4, tid, true, 30 + tid));
            }
        }
        let candidates = detect(samples);
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.cache_line_addr, 0x10000);
        assert_eq!(c.thread_count, 4);
        assert_eq!(c.writing_threads, 4);
        assert!((c.write_ratio - 1.0).abs() < 1e-9);
        assert!(c.confirmed);
        // (4-1)*20 + 1.0*40 + 0 imbalance + 20 locations = 120 -> capped.
        assert_eq!(c.contention_score, 100.0);
        assert_eq!(c.locations.len(), 4);
    }

    #[test]
    fn test_single_thread_line_ignored() {
        let samples = (0..10).map(|i| sample(0x2000 + i % 16, 1, true, 5)).collect();
        assert!(detect(samples).is_empty());
    }

    #[test]
    fn test_read_mostly_line_not_confirmed() {
        // Two threads, but only one ever writes.
        let mut samples = Vec::new();
        for i in 0..10u64 {
            samples.push(sample(0x3000 + i % 8, 1, false, 7));
            samples.push(sample(0x3000 + i % 8, 2, i == 0, 8));
        }
        let candidates = detect(samples);
        assert_eq!(candidates.len(), 1);
        assert!(!candidates[0].confirmed);
        assert_eq!(candidates[0].writing_threads, 1);
    }

    #[test]
    fn test_write_ratio_floor() {
        // Two writers but writes are 2 of 40 accesses (ratio 0.05 < 0.1).
        let mut samples = Vec::new();
        for i in 0..20u64 {
            samples.push(sample(0x4000, 1, i == 0, 7));
            samples.push(sample(0x4008, 2, i == 0, 8));
        }
        let candidates = detect(samples);
        assert!(!candidates[0].confirmed);
        assert!(candidates[0].write_ratio < 0.1);
    }

    #[test]
    fn test_require_different_vars() {
        // Same source line on both threads: confirmed only when distinct
        // locations are not required.
        let build = || {
            let mut samples = Vec::new();
            for _ in 0..10 {
                samples.push(sample(0x5000, 1, true, 12));
                samples.push(sample(0x5004, 2, true, 12));
            }
            samples
        };

        let candidates = detect(build());
        assert!(candidates[0].confirmed);

        let model = crate::cache_model::CacheModel::typical_desktop();
        let mut config = crate::config::AnalysisConfig::default();
        config.require_different_vars = true;
        let ctx = Context::new(model, config).unwrap();
        let arena = SampleArena::from_samples(build());
        let candidates = FalseSharingDetector::new(&ctx).detect(&arena);
        assert!(!candidates[0].confirmed);
    }

    #[test]
    fn test_sorted_by_contention() {
        let mut samples = Vec::new();
        // Hot line: 4 threads writing.
        for tid in 0..4u32 {
            for _ in 0..4 {
                samples.push(sample(0x6000 + u64::from(tid) * 8, tid, true, 40 + tid));
            }
        }
        // Mild line: 2 threads, read-heavy.
        for i in 0..8u64 {
            samples.push(sample(0x9000 + i % 4, i as u32 % 2, i == 0, 50));
        }
        let candidates = detect(samples);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].cache_line_addr, 0x6000);
        assert!(candidates[0].contention_score > candidates[1].contention_score);
    }

    #[test]
    fn test_imbalance_term() {
        let mut counts = FxHashMap::default();
        counts.insert(1u32, 10u64);
        counts.insert(2, 10);
        assert!(access_imbalance(&counts).abs() < 1e-9);

        counts.insert(3, 100);
        assert!(access_imbalance(&counts) > 1.0);
    }
}
