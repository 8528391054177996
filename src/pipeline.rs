//! End-to-end orchestration of one analysis run: static extraction over
//! every translation unit, hotspot aggregation over the sample stream,
//! classification, the whole-stream detectors, and recommendation
//! generation.
//!
//! Per-translation-unit extractor failures become diagnostics and the run
//! continues; every other error aborts before any output is produced.

use crate::ast::TranslationUnit;
use crate::bank_conflict::{BankConflictAnalyzer, BankConflictReport};
use crate::cache_model::BankModel;
use crate::context::Context;
use crate::error::{AnalysisError, Result};
use crate::false_sharing::{FalseSharingCandidate, FalseSharingDetector};
use crate::hotspot_aggregator::{Hotspot, HotspotAggregator};
use crate::loop_analyzer::{LoopAnalyzer, LoopOptFlags, TilingPlan};
use crate::pattern_classifier::{
    export_report, ClassifiedPattern, PatternClassifier, PatternReport, StaticIndex,
};
use crate::pattern_extractor::{ExtractionResult, LoopInfo, PatternExtractor, StructInfo};
use crate::recommendation::{Recommendation, RecommendationEngine};
use crate::sample_arena::{CacheMissSample, SampleArena};
use crate::source_location::SourceLocation;
use serde::{Deserialize, Serialize};

/// Transformation verdict for one loop nest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopNestPlan {
    pub location: SourceLocation,
    pub depth: u32,
    pub flags: LoopOptFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tiling: Option<TilingPlan>,
}

/// Everything one run produced. Hotspots are ordered by classified
/// severity descending (unclassified ones trail in location order), and
/// `classified[i].hotspot_index` points into `hotspots`.
#[derive(Debug)]
pub struct AnalysisReport {
    pub arena: SampleArena,
    pub hotspots: Vec<Hotspot>,
    pub classified: Vec<ClassifiedPattern>,
    pub recommendations: Vec<Recommendation>,
    pub false_sharing: Vec<FalseSharingCandidate>,
    pub bank_conflicts: BankConflictReport,
    pub loops: Vec<LoopInfo>,
    pub structs: Vec<StructInfo>,
    pub loop_plans: Vec<LoopNestPlan>,
    pub diagnostics: Vec<String>,
}

impl AnalysisReport {
    pub fn pattern_report(&self) -> PatternReport {
        export_report(&self.classified)
    }
}

pub struct AnalysisPipeline<'a> {
    ctx: &'a Context,
    bank_model: BankModel,
}

impl<'a> AnalysisPipeline<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            bank_model: BankModel::default(),
        }
    }

    pub fn with_bank_model(mut self, model: BankModel) -> Self {
        self.bank_model = model;
        self
    }

    pub fn run(
        &self,
        units: &[TranslationUnit],
        samples: Vec<CacheMissSample>,
    ) -> Result<AnalysisReport> {
        let mut diagnostics = Vec::new();
        let extracted = self.extract_units(units, &mut diagnostics)?;
        let statics = StaticIndex::build(&extracted);

        let loops: Vec<LoopInfo> = extracted.iter().flat_map(|r| r.loops.clone()).collect();
        let structs: Vec<StructInfo> =
            extracted.iter().flat_map(|r| r.structs.clone()).collect();
        let loop_plans = self.plan_loops(&loops);

        let arena = SampleArena::from_samples(samples);
        let raw_hotspots = HotspotAggregator::new(self.ctx).aggregate(&arena);

        let classifier = PatternClassifier::new(self.ctx);
        let classified = classifier.classify_all(&raw_hotspots, &arena, &statics)?;
        let (hotspots, classified) = reorder_by_severity(raw_hotspots, classified);

        self.ctx.check_cancelled()?;
        let false_sharing = FalseSharingDetector::new(self.ctx).detect(&arena);
        let bank_conflicts =
            BankConflictAnalyzer::new(self.ctx, self.bank_model).analyze(&arena);

        let recommendations = RecommendationEngine::new(self.ctx).generate(
            &classified,
            &hotspots,
            &loops,
            &false_sharing,
            &bank_conflicts,
        );

        tracing::info!(
            hotspots = hotspots.len(),
            classified = classified.len(),
            recommendations = recommendations.len(),
            "analysis run finished"
        );

        Ok(AnalysisReport {
            arena,
            hotspots,
            classified,
            recommendations,
            false_sharing,
            bank_conflicts,
            loops,
            structs,
            loop_plans,
            diagnostics,
        })
    }

    fn extract_units(
        &self,
        units: &[TranslationUnit],
        diagnostics: &mut Vec<String>,
    ) -> Result<Vec<ExtractionResult>> {
        let extractor = PatternExtractor::new(self.ctx);
        let mut extracted = Vec::with_capacity(units.len());
        for unit in units {
            self.ctx.check_cancelled()?;
            match extractor.extract(unit) {
                Ok(result) => {
                    diagnostics.extend(result.diagnostics.iter().cloned());
                    extracted.push(result);
                }
                Err(AnalysisError::ExtractorFailed { diag }) => {
                    tracing::warn!(file = %unit.main_file, "skipping translation unit: {}", diag);
                    diagnostics.push(format!("{}: extraction failed: {}", unit.main_file, diag));
                }
                Err(other) => return Err(other),
            }
        }
        Ok(extracted)
    }

    /// Splits the outer-first loop list into nests (each starting at nest
    /// level 1) and plans transformations per nest.
    fn plan_loops(&self, loops: &[LoopInfo]) -> Vec<LoopNestPlan> {
        let analyzer = LoopAnalyzer::new(self.ctx);
        let mut plans = Vec::new();

        let mut start = 0;
        while start < loops.len() {
            let mut end = start + 1;
            while end < loops.len() && loops[end].nest_level > 1 {
                end += 1;
            }
            let nest = &loops[start..end];
            let flags = analyzer.plan_transformations(nest);
            let tiling = flags.tile.then(|| analyzer.tiling_plan(nest));
            plans.push(LoopNestPlan {
                location: nest[0].location.clone(),
                depth: nest.iter().map(|l| l.nest_level).max().unwrap_or(1),
                flags,
                tiling,
            });
            start = end;
        }
        plans
    }
}

/// Reorders hotspots to match classification severity; unclassified
/// hotspots keep their relative (location) order at the tail. Classified
/// patterns are re-pointed at the new positions.
fn reorder_by_severity(
    hotspots: Vec<Hotspot>,
    mut classified: Vec<ClassifiedPattern>,
) -> (Vec<Hotspot>, Vec<ClassifiedPattern>) {
    let mut order: Vec<usize> = classified.iter().map(|c| c.hotspot_index).collect();
    let mut taken = vec![false; hotspots.len()];
    for &i in &order {
        taken[i] = true;
    }
    order.extend((0..hotspots.len()).filter(|&i| !taken[i]));

    let mut slots: Vec<Option<Hotspot>> = hotspots.into_iter().map(Some).collect();
    let reordered: Vec<Hotspot> = order
        .iter()
        .filter_map(|&i| slots[i].take())
        .collect();

    for (new_index, pattern) in classified.iter_mut().enumerate() {
        pattern.hotspot_index = new_index;
    }
    (reordered, classified)
}
