use crate::error::{AnalysisError, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Parameters of a single cache level. All sizing thresholds used by the
/// analyzers are derived from these four numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLevel {
    pub size_bytes: u64,
    pub line_size: u32,
    pub associativity: u32,
    pub level_id: u8,
}

impl CacheLevel {
    pub fn new(level_id: u8, size_bytes: u64, line_size: u32, associativity: u32) -> Self {
        Self {
            size_bytes,
            line_size,
            associativity,
            level_id,
        }
    }

    pub fn num_sets(&self) -> u64 {
        let ways = u64::from(self.associativity.max(1));
        let line = u64::from(self.line_size.max(1));
        (self.size_bytes / (line * ways)).max(1)
    }
}

/// Immutable snapshot of the cache hierarchy for one analysis run.
/// Index 0 is L1; levels are ordered by capacity outward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheModel {
    levels: SmallVec<[CacheLevel; 3]>,
}

impl CacheModel {
    /// Builds a snapshot from 1..=3 levels ordered L1 outward.
    pub fn new(levels: impl IntoIterator<Item = CacheLevel>) -> Result<Self> {
        let levels: SmallVec<[CacheLevel; 3]> = levels.into_iter().collect();
        if levels.is_empty() {
            return Err(AnalysisError::UnsupportedTopology);
        }
        if levels.len() > 3 {
            return Err(AnalysisError::invalid_input(format!(
                "at most 3 cache levels are supported, got {}",
                levels.len()
            )));
        }
        for level in &levels {
            if level.size_bytes == 0 || level.line_size == 0 || level.associativity == 0 {
                return Err(AnalysisError::invalid_input(format!(
                    "cache level {} has a zero-sized parameter",
                    level.level_id
                )));
            }
        }
        Ok(Self { levels })
    }

    /// A common desktop topology: 32 KiB L1d, 1 MiB L2, 8 MiB L3, 64-byte lines.
    pub fn typical_desktop() -> Self {
        Self {
            levels: SmallVec::from_vec(vec![
                CacheLevel::new(1, 32 * 1024, 64, 8),
                CacheLevel::new(2, 1024 * 1024, 64, 16),
                CacheLevel::new(3, 8 * 1024 * 1024, 64, 16),
            ]),
        }
    }

    pub fn levels(&self) -> &[CacheLevel] {
        &self.levels
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Capacity of the level at `index` (0 = L1). None past the last level.
    pub fn capacity(&self, index: usize) -> Option<u64> {
        self.levels.get(index).map(|l| l.size_bytes)
    }

    pub fn line_size(&self, index: usize) -> Option<u32> {
        self.levels.get(index).map(|l| l.line_size)
    }

    /// Capacity of the outermost (last-level) cache.
    pub fn last_level_capacity(&self) -> u64 {
        self.levels[self.levels.len() - 1].size_bytes
    }
}

/// Memory bank layout used by the bank-conflict analyzer. Addresses are
/// interleaved across `num_banks` in `interleave_bytes` chunks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BankModel {
    pub num_banks: u32,
    pub bank_width: u32,
    pub interleave_bytes: u64,
}

impl Default for BankModel {
    fn default() -> Self {
        // DDR4-style channel interleave: 16 banks, 64-byte granularity.
        Self {
            num_banks: 16,
            bank_width: 8,
            interleave_bytes: 64,
        }
    }
}

impl BankModel {
    pub fn bank_of(&self, addr: u64) -> u32 {
        let interleave = self.interleave_bytes.max(1);
        ((addr / interleave) % u64::from(self.num_banks.max(1))) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_topology_rejected() {
        let result = CacheModel::new(std::iter::empty());
        assert!(matches!(result, Err(AnalysisError::UnsupportedTopology)));
    }

    #[test]
    fn test_too_many_levels_rejected() {
        let levels = (1..=4).map(|i| CacheLevel::new(i, 32 * 1024 << i, 64, 8));
        assert!(matches!(
            CacheModel::new(levels),
            Err(AnalysisError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_capacity_lookup() {
        let model = CacheModel::typical_desktop();
        assert_eq!(model.num_levels(), 3);
        assert_eq!(model.capacity(0), Some(32 * 1024));
        assert_eq!(model.capacity(2), Some(8 * 1024 * 1024));
        assert_eq!(model.capacity(3), None);
        assert_eq!(model.line_size(0), Some(64));
        assert_eq!(model.last_level_capacity(), 8 * 1024 * 1024);
    }

    #[test]
    fn test_num_sets() {
        let level = CacheLevel::new(1, 32 * 1024, 64, 8);
        assert_eq!(level.num_sets(), 64);
    }

    #[test]
    fn test_bank_mapping_wraps() {
        let model = BankModel::default();
        assert_eq!(model.bank_of(0), 0);
        assert_eq!(model.bank_of(64), 1);
        assert_eq!(model.bank_of(64 * 16), 0);
        assert_eq!(model.bank_of(64 * 17), 1);
    }

    #[test]
    fn test_single_level_topology_accepted() {
        let model = CacheModel::new([CacheLevel::new(1, 64 * 1024, 64, 4)]).unwrap();
        assert_eq!(model.num_levels(), 1);
        assert_eq!(model.last_level_capacity(), 64 * 1024);
    }
}
