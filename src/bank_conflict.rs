//! Memory-bank conflict analysis.
//!
//! Maps every sample to a bank through the interleave model, then looks
//! for the three conflict signatures: temporal clustering inside one bank,
//! a single stride that keeps landing on few banks, and power-of-two
//! address deltas that alias the bank index.

use crate::cache_model::BankModel;
use crate::context::Context;
use crate::sample_arena::SampleArena;
use crate::source_location::SourceLocation;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

/// Conflict verdict for a single bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankConflict {
    pub bank: u32,
    pub access_count: u64,
    pub thread_count: u32,
    /// Consecutive accesses inside the configured window.
    pub temporal_conflicts: u64,
    pub severity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

/// Whole-stream analysis output. `conflicts` lists only flagged banks,
/// most severe first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BankConflictReport {
    pub conflicts: Vec<BankConflict>,
    /// Dominant stride in bytes when the stream is strided onto few banks.
    pub strided_conflict: Option<i64>,
    /// Set when most address deltas are powers of two.
    pub power_of_two_conflict: bool,
}

impl BankConflictReport {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty() || self.strided_conflict.is_some() || self.power_of_two_conflict
    }
}

#[derive(Default)]
struct BankStats {
    timestamps: Vec<u64>,
    threads: FxHashSet<u32>,
    location: Option<SourceLocation>,
}

pub struct BankConflictAnalyzer<'a> {
    ctx: &'a Context,
    model: BankModel,
}

impl<'a> BankConflictAnalyzer<'a> {
    pub fn new(ctx: &'a Context, model: BankModel) -> Self {
        Self { ctx, model }
    }

    pub fn with_default_model(ctx: &'a Context) -> Self {
        Self::new(ctx, BankModel::default())
    }

    /// Runs once over the full sample vector.
    pub fn analyze(&self, arena: &SampleArena) -> BankConflictReport {
        if arena.is_empty() {
            return BankConflictReport::default();
        }

        let mut banks: FxHashMap<u32, BankStats> = FxHashMap::default();
        let mut ordered: Vec<(u64, u64)> = Vec::with_capacity(arena.len());
        for (_, sample) in arena.iter() {
            let bank = self.model.bank_of(sample.memory_addr);
            let stats = banks.entry(bank).or_default();
            stats.timestamps.push(sample.timestamp_ns);
            stats.threads.insert(sample.thread_id);
            if stats.location.is_none() {
                stats.location = sample.source_location.clone();
            }
            ordered.push((sample.timestamp_ns, sample.memory_addr));
        }
        ordered.sort_unstable();

        let window = self.ctx.config().bank_conflict_window_ns;
        let max_accesses = banks
            .values()
            .map(|s| s.timestamps.len() as u64)
            .max()
            .unwrap_or(1);

        let mut bank_ids: Vec<u32> = banks.keys().copied().collect();
        bank_ids.sort_unstable();

        let mut conflicts = Vec::new();
        for bank in bank_ids {
            let mut stats = match banks.remove(&bank) {
                Some(stats) => stats,
                None => continue,
            };
            stats.timestamps.sort_unstable();
            let temporal_conflicts = stats
                .timestamps
                .windows(2)
                .filter(|w| w[1] - w[0] <= window)
                .count() as u64;
            let thread_count = stats.threads.len() as u32;

            if temporal_conflicts == 0 && thread_count < 2 {
                continue;
            }

            let access_count = stats.timestamps.len() as u64;
            let access_rate = access_count as f64 / max_accesses as f64;
            let severity = (access_rate * 40.0
                + f64::from(thread_count.min(4)) * 10.0
                + (temporal_conflicts as f64 / 10_000.0).clamp(0.0, 1.0) * 20.0)
                .min(100.0);

            conflicts.push(BankConflict {
                bank,
                access_count,
                thread_count,
                temporal_conflicts,
                severity,
                location: stats.location,
            });
        }

        conflicts.sort_by(|a, b| {
            b.severity
                .partial_cmp(&a.severity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.bank.cmp(&b.bank))
        });

        let (strided_conflict, power_of_two_conflict) = self.delta_signatures(&ordered);

        tracing::debug!(
            banks = conflicts.len(),
            strided = strided_conflict.is_some(),
            pow2 = power_of_two_conflict,
            "bank-conflict scan finished"
        );
        BankConflictReport {
            conflicts,
            strided_conflict,
            power_of_two_conflict,
        }
    }

    /// Stream-level signatures over consecutive-address deltas in time
    /// order.
    fn delta_signatures(&self, ordered: &[(u64, u64)]) -> (Option<i64>, bool) {
        if ordered.len() < 2 {
            return (None, false);
        }

        let mut delta_counts: FxHashMap<i64, usize> = FxHashMap::default();
        let mut pow2_deltas = 0usize;
        let total = ordered.len() - 1;
        for pair in ordered.windows(2) {
            let delta = pair[1].1 as i64 - pair[0].1 as i64;
            *delta_counts.entry(delta).or_insert(0) += 1;
            if delta.unsigned_abs().is_power_of_two() {
                pow2_deltas += 1;
            }
        }

        let config = self.ctx.config();
        let power_of_two_conflict = pow2_deltas as f64 / total as f64 >= config.pow2_delta_share;

        let dominant = delta_counts
            .iter()
            .map(|(&d, &count)| (count, std::cmp::Reverse(d)))
            .max()
            .map(|(count, rev)| (rev.0, count));
        let strided_conflict = dominant.and_then(|(delta, count)| {
            if delta == 0 || (count as f64 / total as f64) < config.strided_bank_agreement {
                return None;
            }
            let touched: FxHashSet<u32> = ordered
                .iter()
                .map(|&(_, addr)| self.model.bank_of(addr))
                .collect();
            let limit = (ordered.len() as u64).min(u64::from(self.model.num_banks)) as usize;
            if touched.len() < limit {
                Some(delta)
            } else {
                None
            }
        });

        (strided_conflict, power_of_two_conflict)
    }
}
