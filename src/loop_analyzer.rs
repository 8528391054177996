//! Per-loop characteristics and the loop-transformation planner.
//!
//! Consumes the extractor's [`LoopInfo`] records together with the cache
//! snapshot and decides which transformations are worth recommending:
//! tiling, interchange, vectorization, parallelization, unrolling, and
//! prefetching. Tiling sizes are fitted per cache level and quantized to
//! the configured tile set.

use crate::context::Context;
use crate::pattern_extractor::{AccessPatternKind, LoopInfo, StaticPattern};
use crate::source_location::SourceLocation;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopCharacteristics {
    pub location: SourceLocation,
    pub nest_level: u32,
    pub working_set_bytes: u64,
    pub reuse_distance: f64,
    pub is_parallelizable: bool,
    pub is_vectorizable: bool,
    pub unroll_factor: u32,
}

/// Transformations judged applicable to a loop nest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopOptFlags {
    pub tile: bool,
    pub vectorize: bool,
    pub parallelize: bool,
    pub unroll: bool,
    pub prefetch: bool,
    pub interchange: bool,
}

/// A tiling proposal with per-cache-level tile edges. The speedup estimate
/// is indicative: it assumes the row-size heuristic, not measured shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilingPlan {
    pub dims: u8,
    pub tile_sizes: [u32; 3],
    pub estimated_speedup_pct: f64,
    pub rationale: String,
}

pub struct LoopAnalyzer<'a> {
    ctx: &'a Context,
}

impl<'a> LoopAnalyzer<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    pub fn characteristics(&self, info: &LoopInfo) -> LoopCharacteristics {
        let mut working_set: u64 = info
            .patterns
            .iter()
            .map(|p| p.estimated_footprint_bytes)
            .sum();
        if info.has_nested_loops {
            working_set = working_set.saturating_mul(2);
        }

        let reuse_distance = if info.patterns.is_empty() {
            0.0
        } else {
            info.patterns.iter().map(reuse_distance_of).sum::<f64>()
                / info.patterns.len() as f64
        };

        let element_size = self.ctx.config().element_size.max(1);
        let unroll_factor = (self.ctx.line_size() / element_size).clamp(2, 8);

        LoopCharacteristics {
            location: info.location.clone(),
            nest_level: info.nest_level,
            working_set_bytes: working_set,
            reuse_distance,
            is_parallelizable: !info.patterns.iter().any(|p| p.has_dependencies),
            is_vectorizable: !info.patterns.iter().any(|p| blocks_vectorization(p)),
            unroll_factor,
        }
    }

    /// Decides the applicable transformations for a loop nest, outermost
    /// level first.
    pub fn plan_transformations(&self, nest: &[LoopInfo]) -> LoopOptFlags {
        if nest.is_empty() {
            return LoopOptFlags::default();
        }
        let chars: Vec<LoopCharacteristics> =
            nest.iter().map(|l| self.characteristics(l)).collect();
        let l1 = self.ctx.cache_model().capacity(0).unwrap_or(u64::MAX);

        let tile = chars.iter().any(|c| c.working_set_bytes > l1);
        let vectorize = chars.iter().all(|c| c.is_vectorizable);
        let parallelize = chars[0].is_parallelizable
            && nest[0].estimated_trip_count.is_some_and(|t| t >= 100);
        let unroll = nest
            .iter()
            .zip(&chars)
            .any(|(l, c)| c.is_vectorizable && l.estimated_trip_count.is_some_and(|t| t >= 10));
        let prefetch = nest.iter().any(|l| {
            l.patterns
                .iter()
                .any(|p| matches!(p.kind, AccessPatternKind::Strided { stride } if stride.abs() > 1))
        });
        let interchange = nest.len() >= 2
            && nest[0].max_abs_stride() > nest[nest.len() - 1].max_abs_stride();

        LoopOptFlags {
            tile,
            vectorize,
            parallelize,
            unroll,
            prefetch,
            interchange,
        }
    }

    /// Fits one tile edge per cache level: a third of 80% of the level,
    /// split across an assumed three live arrays, square tiles of 8-byte
    /// elements.
    pub fn tiling_plan(&self, nest: &[LoopInfo]) -> TilingPlan {
        let model = self.ctx.cache_model();
        let quant = &self.ctx.config().tile_quantization;
        let max_tile = *quant.last().unwrap_or(&256);
        let min_tile = *quant.first().unwrap_or(&16);

        let mut tile_sizes = [0u32; 3];
        for (i, size) in tile_sizes.iter_mut().enumerate() {
            let Some(capacity) = model.capacity(i) else {
                break;
            };
            let usable = capacity as f64 * 0.8 / 3.0;
            let edge = (usable / 8.0).sqrt().floor() as u32;
            *size = quantize_down(edge, quant).unwrap_or(min_tile).min(max_tile);
        }

        let dims = model.num_levels().min(3) as u8;
        let speedup = self.estimate_tiling_speedup(nest);
        let rationale = format!(
            "tile edges fit {} cache level(s) assuming three live arrays; \
             speedup estimate is indicative (row-size heuristic {})",
            dims,
            self.ctx.config().nested_outer_stride
        );

        TilingPlan {
            dims,
            tile_sizes,
            estimated_speedup_pct: speedup,
            rationale,
        }
    }

    /// Miss-ratio model: untiled large-stride nests touch a fresh line per
    /// access, tiled execution fetches each line once.
    fn estimate_tiling_speedup(&self, nest: &[LoopInfo]) -> f64 {
        let element_size = u64::from(self.ctx.config().element_size.max(1));
        let line_size = u64::from(self.ctx.line_size().max(1));

        let working_set: u64 = nest
            .iter()
            .map(|l| self.characteristics(l).working_set_bytes)
            .max()
            .unwrap_or(0);
        if working_set == 0 {
            return 0.0;
        }

        let max_stride_bytes = nest
            .iter()
            .map(|l| l.max_abs_stride().unsigned_abs().saturating_mul(element_size))
            .max()
            .unwrap_or(0);

        let original_misses = if max_stride_bytes >= line_size {
            working_set / element_size
        } else {
            working_set / line_size
        };
        let tiled_misses = working_set / line_size;

        (100.0 * original_misses as f64 / (tiled_misses + 1) as f64).min(500.0)
    }

    /// Interchange is legal for adjacent levels when the inner loop calls
    /// no functions and its bound does not involve the outer induction
    /// variable (non-rectangular nests are rejected).
    pub fn can_interchange(&self, outer: &LoopInfo, inner: &LoopInfo) -> bool {
        if inner.nest_level != outer.nest_level + 1 {
            return false;
        }
        if inner.has_function_calls {
            return false;
        }
        if !outer.loop_var.is_empty() && inner.condition_text.contains(&outer.loop_var) {
            return false;
        }
        true
    }
}

fn reuse_distance_of(pattern: &StaticPattern) -> f64 {
    match pattern.kind {
        AccessPatternKind::Sequential => 1.0,
        AccessPatternKind::Strided { stride } => stride.abs().max(1) as f64,
        AccessPatternKind::Random | AccessPatternKind::Indirect => 1000.0,
        _ => 10.0,
    }
}

fn blocks_vectorization(pattern: &StaticPattern) -> bool {
    matches!(
        pattern.kind,
        AccessPatternKind::Random | AccessPatternKind::Indirect | AccessPatternKind::LoopCarriedDep
    )
}

/// Largest member of `quant` that does not exceed `edge`.
fn quantize_down(edge: u32, quant: &[u32]) -> Option<u32> {
    quant.iter().rev().find(|&&q| q <= edge).copied()
}
