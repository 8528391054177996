//! Converts the raw sample stream into spatially-clustered hotspots.
//!
//! Samples are bucketed by source line when debug info resolved, else by
//! instruction pointer rounded to 64 bytes. A bucket that accumulates
//! enough samples becomes a [`Hotspot`] carrying the dominant address
//! pattern observed in timestamp order.

use crate::context::Context;
use crate::pattern_extractor::AccessPatternKind;
use crate::sample_arena::{SampleArena, SampleId};
use crate::source_location::SourceLocation;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

/// Aggregated view of cache-miss samples co-located in source and memory.
/// Read-only once built; `samples` are sorted by timestamp ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hotspot {
    pub location: SourceLocation,
    pub sample_count: u64,
    pub total_accesses: u64,
    pub total_misses: u64,
    pub miss_rate: f64,
    pub avg_latency_cycles: f64,
    pub address_range: (u64, u64),
    pub dominant_pattern: AccessPatternKind,
    pub access_stride: i64,
    /// Bit k set when at least one sample missed at cache level k.
    pub cache_levels_affected: u8,
    pub is_false_sharing: bool,
    pub samples: Vec<SampleId>,
}

impl Hotspot {
    /// Span of the touched address range in bytes.
    pub fn working_set_bytes(&self) -> u64 {
        self.address_range.1 - self.address_range.0 + 1
    }

    pub fn affects_level(&self, level: u8) -> bool {
        self.cache_levels_affected & (1 << level) != 0
    }

    pub fn distinct_cpus(&self, arena: &SampleArena) -> u32 {
        let cpus: FxHashSet<u16> = self
            .samples
            .iter()
            .map(|&id| arena.get(id).cpu_id)
            .collect();
        cpus.len() as u32
    }

    pub fn distinct_threads(&self, arena: &SampleArena) -> u32 {
        let tids: FxHashSet<u32> = self
            .samples
            .iter()
            .map(|&id| arena.get(id).thread_id)
            .collect();
        tids.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum BucketKey {
    Source(String, u32),
    Ip(u64),
}

pub struct HotspotAggregator<'a> {
    ctx: &'a Context,
}

impl<'a> HotspotAggregator<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Groups the arena's samples into hotspots. An empty arena yields an
    /// empty list, not an error. Output is ordered by location so the same
    /// input always produces the same hotspot sequence.
    pub fn aggregate(&self, arena: &SampleArena) -> Vec<Hotspot> {
        if arena.is_empty() {
            return Vec::new();
        }

        let mut buckets: FxHashMap<BucketKey, Vec<SampleId>> = FxHashMap::default();
        for (id, sample) in arena.iter() {
            let key = match &sample.source_location {
                Some(loc) if loc.is_resolved() => {
                    BucketKey::Source(loc.file.clone(), loc.line)
                }
                _ => BucketKey::Ip(sample.ip & !63),
            };
            buckets.entry(key).or_default().push(id);
        }

        let min_samples = self.ctx.config().min_samples_per_hotspot as usize;

        // Drain through sorted keys: iteration order of the map must never
        // leak into the output.
        let mut keys: Vec<BucketKey> = buckets.keys().cloned().collect();
        keys.sort_unstable();

        let mut hotspots = Vec::new();
        for key in keys {
            let mut ids = match buckets.remove(&key) {
                Some(ids) => ids,
                None => continue,
            };
            if ids.len() < min_samples {
                continue;
            }
            ids.sort_by_key(|&id| (arena.get(id).timestamp_ns, id));
            hotspots.push(self.build_hotspot(arena, ids));
        }

        tracing::debug!(
            samples = arena.len(),
            hotspots = hotspots.len(),
            "hotspot aggregation finished"
        );
        hotspots
    }

    fn build_hotspot(&self, arena: &SampleArena, ids: Vec<SampleId>) -> Hotspot {
        let line_size = u64::from(self.ctx.line_size());
        let element_size = i64::from(self.ctx.config().element_size);

        let mut lo = u64::MAX;
        let mut hi = 0u64;
        let mut total_latency = 0u64;
        let mut total_misses = 0u64;
        let mut levels_affected = 0u8;

        for &id in &ids {
            let s = arena.get(id);
            lo = lo.min(s.memory_addr);
            hi = hi.max(s.memory_addr);
            total_latency += u64::from(s.miss_latency_cycles);
            if s.is_miss() {
                total_misses += 1;
            }
            for level in 0..4u8 {
                if s.missed_at_level(level) {
                    levels_affected |= 1 << level;
                }
            }
        }

        let total_accesses = ids.len() as u64;
        let (dominant_pattern, access_stride) =
            self.dominant_pattern(arena, &ids, line_size, element_size);
        let is_false_sharing = detect_multi_writer_line(arena, &ids, line_size);

        let location = ids
            .first()
            .and_then(|&id| arena.get(id).source_location.clone())
            .filter(|loc| loc.is_resolved())
            .unwrap_or_else(|| SourceLocation::unresolved(arena.get(ids[0]).ip & !63));

        Hotspot {
            location,
            sample_count: total_accesses,
            total_accesses,
            total_misses,
            miss_rate: total_misses as f64 / total_accesses.max(1) as f64,
            avg_latency_cycles: total_latency as f64 / total_accesses.max(1) as f64,
            address_range: (lo, hi),
            dominant_pattern,
            access_stride,
            cache_levels_affected: levels_affected,
            is_false_sharing,
            samples: ids,
        }
    }

    /// Pattern inferred from the intra-bucket address deltas in timestamp
    /// order: a dominant positive delta means sequential/strided movement,
    /// high line diversity means random, anything else gather/scatter.
    fn dominant_pattern(
        &self,
        arena: &SampleArena,
        ids: &[SampleId],
        line_size: u64,
        element_size: i64,
    ) -> (AccessPatternKind, i64) {
        if ids.len() < 2 {
            return (AccessPatternKind::GatherScatter, 0);
        }

        let mut delta_counts: FxHashMap<i64, usize> = FxHashMap::default();
        for pair in ids.windows(2) {
            let a = arena.get(pair[0]).memory_addr as i64;
            let b = arena.get(pair[1]).memory_addr as i64;
            *delta_counts.entry(b - a).or_insert(0) += 1;
        }
        let total_deltas = ids.len() - 1;

        // Smallest delta wins ties for a deterministic verdict.
        let dominant = delta_counts
            .iter()
            .map(|(&d, &count)| (count, std::cmp::Reverse(d)))
            .max()
            .map(|(count, rev)| (rev.0, count));

        if let Some((delta, count)) = dominant {
            let share = count as f64 / total_deltas as f64;
            if share >= self.ctx.config().sequential_dominance && delta > 0 {
                if delta <= element_size {
                    return (AccessPatternKind::Sequential, 1);
                }
                let stride = delta / element_size.max(1);
                return (AccessPatternKind::Strided { stride }, stride);
            }
        }

        let unique_lines: FxHashSet<u64> = ids
            .iter()
            .map(|&id| arena.get(id).memory_addr / line_size.max(1))
            .collect();
        let diversity = unique_lines.len() as f64 / ids.len() as f64;
        if diversity > self.ctx.config().address_diversity_threshold {
            (AccessPatternKind::Random, 0)
        } else {
            (AccessPatternKind::GatherScatter, 0)
        }
    }
}

/// True when one cache line inside the bucket is written by two or more
/// distinct threads.
fn detect_multi_writer_line(arena: &SampleArena, ids: &[SampleId], line_size: u64) -> bool {
    let mut writers_per_line: FxHashMap<u64, FxHashSet<u32>> = FxHashMap::default();
    for &id in ids {
        let s = arena.get(id);
        if s.is_write {
            writers_per_line
                .entry(s.memory_addr / line_size.max(1))
                .or_default()
                .insert(s.thread_id);
        }
    }
    writers_per_line.values().any(|tids| tids.len() >= 2)
}
