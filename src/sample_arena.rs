//! Run-scoped ownership of raw hardware samples.
//!
//! Every per-run product (hotspots, detector output) refers to sample
//! storage through [`SampleId`] indices rather than pointers, so the whole
//! run's allocations drop together when the arena goes out of scope.

use crate::source_location::SourceLocation;
use serde::{Deserialize, Serialize};

/// One raw hardware event delivered by the performance-counter sampler.
/// Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMissSample {
    pub ip: u64,
    pub memory_addr: u64,
    pub miss_latency_cycles: u32,
    /// Level at which the access finally hit: 0 = L1, 3 = memory.
    pub cache_level_hit: u8,
    pub timestamp_ns: u64,
    pub thread_id: u32,
    pub cpu_id: u16,
    pub is_write: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_location: Option<SourceLocation>,
}

impl CacheMissSample {
    /// Whether the access missed L1 at all (hit level above 0).
    pub fn is_miss(&self) -> bool {
        self.cache_level_hit > 0
    }

    /// Whether the access missed at cache level `level` (0-based).
    pub fn missed_at_level(&self, level: u8) -> bool {
        self.cache_level_hit > level
    }
}

/// Index of a sample inside its run's [`SampleArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleId(pub u32);

#[derive(Debug, Default)]
pub struct SampleArena {
    samples: Vec<CacheMissSample>,
}

impl SampleArena {
    pub fn from_samples(samples: Vec<CacheMissSample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, id: SampleId) -> &CacheMissSample {
        &self.samples[id.0 as usize]
    }

    pub fn ids(&self) -> impl Iterator<Item = SampleId> + '_ {
        (0..self.samples.len() as u32).map(SampleId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SampleId, &CacheMissSample)> {
        self.samples
            .iter()
            .enumerate()
            .map(|(i, s)| (SampleId(i as u32), s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(addr: u64) -> CacheMissSample {
        CacheMissSample {
            ip: 0x400000,
            memory_addr: addr,
            miss_latency_cycles: 120,
            cache_level_hit: 2,
            timestamp_ns: 0,
            thread_id: 1,
            cpu_id: 0,
            is_write: false,
            source_location: None,
        }
    }

    #[test]
    fn test_index_round_trip() {
        let arena = SampleArena::from_samples(vec![sample(0x1000), sample(0x2000)]);
        assert_eq!(arena.len(), 2);
        let ids: Vec<SampleId> = arena.ids().collect();
        assert_eq!(arena.get(ids[1]).memory_addr, 0x2000);
    }

    #[test]
    fn test_miss_level_predicates() {
        let s = sample(0x1000);
        assert!(s.is_miss());
        assert!(s.missed_at_level(0));
        assert!(s.missed_at_level(1));
        assert!(!s.missed_at_level(2));

        let mut hit = sample(0x1000);
        hit.cache_level_hit = 0;
        assert!(!hit.is_miss());
    }

    #[test]
    fn test_sample_json_round_trip() {
        let mut s = sample(0xdead0);
        s.source_location = Some(SourceLocation::new("main.c", 12).with_function("sum"));
        let json = serde_json::to_string(&s).unwrap();
        let restored: CacheMissSample = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.memory_addr, 0xdead0);
        assert_eq!(restored.source_location.unwrap().line, 12);

        // Samples without a source location omit the field entirely.
        let json = serde_json::to_string(&sample(0x10)).unwrap();
        assert!(!json.contains("source_location"));
    }
}
