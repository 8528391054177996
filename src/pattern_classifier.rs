//! Fuses dynamic hotspots with static extraction results and labels each
//! hotspot with a cache anti-pattern, a severity, a confidence, and a
//! miss-type diagnosis.
//!
//! Classification starts from a baseline keyed on the hotspot's dominant
//! pattern, then applies overrides (false sharing, thrashing, streaming
//! eviction) where a higher-severity diagnosis fits, then adjusts
//! confidence using corroborating static patterns and sample counts.

use crate::context::Context;
use crate::error::{AnalysisError, Result};
use crate::hotspot_aggregator::Hotspot;
use crate::pattern_extractor::{AccessPatternKind, ExtractionResult, LoopInfo, StaticPattern};
use crate::sample_arena::SampleArena;
use crate::source_location::SourceLocation;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

const MIB: u64 = 1024 * 1024;

/// Taxonomy of cache-adverse idioms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AntipatternKind {
    HotspotReuse,
    Thrashing,
    FalseSharing,
    IrregularGatherScatter,
    UncoalescedAccess,
    LoopCarriedDep,
    DeadStores,
    HighAssociativityPressure,
    StreamingEviction,
    BankConflict,
}

impl fmt::Display for AntipatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AntipatternKind::HotspotReuse => "hotspot reuse",
            AntipatternKind::Thrashing => "cache thrashing",
            AntipatternKind::FalseSharing => "false sharing",
            AntipatternKind::IrregularGatherScatter => "irregular gather/scatter",
            AntipatternKind::UncoalescedAccess => "uncoalesced access",
            AntipatternKind::LoopCarriedDep => "loop-carried dependency",
            AntipatternKind::DeadStores => "dead stores",
            AntipatternKind::HighAssociativityPressure => "associativity pressure",
            AntipatternKind::StreamingEviction => "streaming eviction",
            AntipatternKind::BankConflict => "bank conflict",
        };
        write!(f, "{}", name)
    }
}

/// Compulsory/capacity/conflict/coherence diagnosis for a hotspot's misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissType {
    Compulsory,
    Capacity,
    Conflict,
    Coherence,
    PrefetchFailed,
}

/// A hotspot labeled with its diagnosis. `hotspot_index` points into the
/// run's hotspot vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedPattern {
    pub hotspot_index: usize,
    pub antipattern: AntipatternKind,
    pub severity: f64,
    pub confidence: f64,
    pub primary_miss_type: MissType,
    pub affected_cache_levels: u8,
    pub performance_impact_pct: f64,
    pub description: String,
    pub root_cause: String,
    pub location: SourceLocation,
    pub miss_rate: f64,
    pub total_misses: u64,
}

/// Static extraction output indexed for correlation lookups by file.
#[derive(Debug, Default)]
pub struct StaticIndex {
    patterns: Vec<StaticPattern>,
    loops: Vec<LoopInfo>,
}

impl StaticIndex {
    pub fn build(results: &[ExtractionResult]) -> Self {
        let mut index = StaticIndex::default();
        for result in results {
            index.patterns.extend(result.patterns.iter().cloned());
            index.loops.extend(result.loops.iter().cloned());
        }
        index
    }

    pub fn loops(&self) -> &[LoopInfo] {
        &self.loops
    }

    fn patterns_near<'a>(
        &'a self,
        loc: &'a SourceLocation,
        max_line_diff: u32,
    ) -> impl Iterator<Item = &'a StaticPattern> {
        self.patterns.iter().filter(move |p| {
            p.location.file == loc.file && p.location.line.abs_diff(loc.line) < max_line_diff
        })
    }

    fn loops_near<'a>(
        &'a self,
        loc: &'a SourceLocation,
        max_line_diff: u32,
    ) -> impl Iterator<Item = &'a LoopInfo> {
        self.loops.iter().filter(move |l| {
            l.location.file == loc.file && l.location.line.abs_diff(loc.line) < max_line_diff
        })
    }

    fn loops_in_file(&self, file: &str) -> usize {
        self.loops.iter().filter(|l| l.location.file == file).count()
    }
}

pub struct PatternClassifier<'a> {
    ctx: &'a Context,
}

impl<'a> PatternClassifier<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Classifies every hotspot, in parallel, and returns the survivors
    /// sorted by severity descending. Hotspots whose final confidence
    /// falls below the configured threshold are dropped.
    pub fn classify_all(
        &self,
        hotspots: &[Hotspot],
        arena: &SampleArena,
        statics: &StaticIndex,
    ) -> Result<Vec<ClassifiedPattern>> {
        let classified: Result<Vec<Option<ClassifiedPattern>>> = hotspots
            .par_iter()
            .enumerate()
            .map(|(index, hotspot)| self.classify_hotspot(index, hotspot, arena, statics))
            .collect();

        let mut survivors: Vec<ClassifiedPattern> =
            classified?.into_iter().flatten().collect();
        survivors.sort_by(|a, b| {
            b.severity
                .partial_cmp(&a.severity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.location.sort_key().cmp(&b.location.sort_key()))
        });

        tracing::info!(
            hotspots = hotspots.len(),
            classified = survivors.len(),
            "classification finished"
        );
        Ok(survivors)
    }

    /// Labels one hotspot. Returns None when the diagnosis is too weak to
    /// report.
    pub fn classify_hotspot(
        &self,
        index: usize,
        hotspot: &Hotspot,
        arena: &SampleArena,
        statics: &StaticIndex,
    ) -> Result<Option<ClassifiedPattern>> {
        self.ctx.check_cancelled()?;
        self.ctx.stats().record(
            hotspot.miss_rate,
            hotspot.avg_latency_cycles,
            hotspot.sample_count,
        );

        let effective = self.effective_pattern(hotspot, statics);
        let (mut kind, mut confidence, mut severity) = self.baseline(effective, hotspot);

        for (o_kind, o_conf, o_sev) in self.overrides(hotspot, effective, arena) {
            if o_sev > severity {
                kind = o_kind;
                confidence = o_conf;
                severity = o_sev;
            }
        }

        let miss_type = self.miss_type(hotspot);
        (confidence, severity) = self.correlate_static(hotspot, statics, confidence, severity);

        // Sample-count confidence adjustment.
        let config = self.ctx.config();
        if hotspot.sample_count < 10 {
            confidence *= config.low_sample_confidence_scale;
        } else if hotspot.sample_count > 1000 {
            confidence *= config.high_sample_confidence_scale;
        }
        confidence = confidence.clamp(0.0, 1.0);
        severity = severity.clamp(0.0, 100.0);

        if confidence < config.min_confidence_threshold {
            tracing::debug!(
                location = %hotspot.location,
                confidence,
                "dropping low-confidence classification"
            );
            return Ok(None);
        }

        let impact = self.performance_impact(hotspot, kind);
        let (description, root_cause) = describe(kind, hotspot);

        Ok(Some(ClassifiedPattern {
            hotspot_index: index,
            antipattern: kind,
            severity,
            confidence,
            primary_miss_type: miss_type,
            affected_cache_levels: hotspot.cache_levels_affected,
            performance_impact_pct: impact,
            description,
            root_cause,
            location: hotspot.location.clone(),
            miss_rate: hotspot.miss_rate,
            total_misses: hotspot.total_misses,
        }))
    }

    /// Address deltas alone cannot reveal loop-carried dependencies or
    /// column-major nests; a corroborating static pattern on the same
    /// lines upgrades the dynamic verdict.
    fn effective_pattern(&self, hotspot: &Hotspot, statics: &StaticIndex) -> AccessPatternKind {
        let mut nested = None;
        for pattern in statics.patterns_near(&hotspot.location, 10) {
            match pattern.kind {
                AccessPatternKind::LoopCarriedDep => return AccessPatternKind::LoopCarriedDep,
                AccessPatternKind::NestedLoop { .. } if nested.is_none() => {
                    nested = Some(pattern.kind);
                }
                _ => {}
            }
        }
        nested.unwrap_or(hotspot.dominant_pattern)
    }

    fn baseline(&self, effective: AccessPatternKind, hotspot: &Hotspot) -> (AntipatternKind, f64, f64) {
        match effective {
            AccessPatternKind::Sequential => {
                if hotspot.miss_rate <= 0.5 {
                    (AntipatternKind::HotspotReuse, 0.9, 10.0)
                } else {
                    (AntipatternKind::StreamingEviction, 0.85, 60.0)
                }
            }
            AccessPatternKind::Strided { stride } => {
                if stride.abs() <= 8 {
                    (AntipatternKind::HotspotReuse, 0.7, 30.0)
                } else {
                    (
                        AntipatternKind::UncoalescedAccess,
                        0.8,
                        50.0 + stride.abs() as f64 / 4.0,
                    )
                }
            }
            AccessPatternKind::Random => (AntipatternKind::IrregularGatherScatter, 0.9, 80.0),
            AccessPatternKind::GatherScatter => {
                (AntipatternKind::IrregularGatherScatter, 0.95, 85.0)
            }
            AccessPatternKind::LoopCarriedDep => (AntipatternKind::LoopCarriedDep, 0.9, 70.0),
            AccessPatternKind::NestedLoop { .. } => (AntipatternKind::UncoalescedAccess, 0.95, 90.0),
            AccessPatternKind::Indirect => (AntipatternKind::IrregularGatherScatter, 0.8, 75.0),
        }
    }

    fn overrides(
        &self,
        hotspot: &Hotspot,
        effective: AccessPatternKind,
        arena: &SampleArena,
    ) -> Vec<(AntipatternKind, f64, f64)> {
        let mut candidates = Vec::new();
        let working_set = hotspot.working_set_bytes();

        // False sharing: flagged by the aggregator, or a tight multi-CPU
        // range with a poor miss rate.
        let cpus = hotspot.distinct_cpus(arena);
        if hotspot.is_false_sharing
            || (working_set <= 128 && hotspot.miss_rate > 0.4 && cpus >= 2)
        {
            let severity = (70.0 + 5.0 * f64::from(cpus)).min(100.0);
            candidates.push((AntipatternKind::FalseSharing, 0.95, severity));
        }

        // Thrashing: working set exceeds an affected level's capacity and
        // the misses corroborate it, or a streaming-shaped pattern with a
        // very poor miss rate. A mostly-hitting sweep over a big range is
        // not thrashing no matter how big the range is.
        let capacity_ratio = self.max_capacity_ratio(hotspot, working_set);
        let oversized = hotspot.miss_rate > 0.3 && capacity_ratio.map_or(false, |r| r > 1.2);
        let streaming_shape = matches!(
            effective,
            AccessPatternKind::Sequential | AccessPatternKind::Strided { .. }
        );
        if oversized || (hotspot.miss_rate > 0.6 && streaming_shape) {
            let ratio = capacity_ratio.unwrap_or(1.0);
            let severity = (60.0 + (ratio - 1.0) * 40.0).min(95.0);
            candidates.push((AntipatternKind::Thrashing, 0.85, severity));
        }

        // Streaming eviction: long sequential sweeps that never reuse.
        if effective == AccessPatternKind::Sequential
            && working_set > MIB
            && hotspot.miss_rate > 0.5
        {
            let large_bonus = if working_set > 10 * MIB { 10.0 } else { 0.0 };
            let severity =
                (50.0 + (hotspot.miss_rate - 0.5) * 40.0 + large_bonus).min(90.0);
            candidates.push((AntipatternKind::StreamingEviction, 0.85, severity));
        }

        candidates
    }

    /// Largest working-set-to-capacity ratio over the affected levels.
    fn max_capacity_ratio(&self, hotspot: &Hotspot, working_set: u64) -> Option<f64> {
        let model = self.ctx.cache_model();
        (0..model.num_levels())
            .filter(|&level| hotspot.affects_level(level as u8))
            .filter_map(|level| model.capacity(level))
            .map(|cap| working_set as f64 / cap as f64)
            .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    fn miss_type(&self, hotspot: &Hotspot) -> MissType {
        let working_set = hotspot.working_set_bytes();
        let model = self.ctx.cache_model();

        if hotspot.total_accesses < 2 * hotspot.total_misses {
            return MissType::Compulsory;
        }
        let exceeds_affected = (0..model.num_levels()).any(|level| {
            hotspot.affects_level(level as u8)
                && model.capacity(level).is_some_and(|cap| working_set > cap)
        });
        if exceeds_affected {
            return MissType::Capacity;
        }
        let l1 = model.capacity(0).unwrap_or(u64::MAX);
        if working_set < l1 && hotspot.miss_rate > 0.3 {
            return MissType::Conflict;
        }
        if hotspot.is_false_sharing {
            return MissType::Coherence;
        }
        MissType::Conflict
    }

    fn correlate_static(
        &self,
        hotspot: &Hotspot,
        statics: &StaticIndex,
        mut confidence: f64,
        mut severity: f64,
    ) -> (f64, f64) {
        let config = self.ctx.config();
        let mut corroborated = false;
        let mut has_dependencies = false;
        for pattern in statics.patterns_near(&hotspot.location, 10) {
            corroborated = true;
            has_dependencies |= pattern.has_dependencies;
        }
        if corroborated {
            confidence = (confidence * config.static_confidence_bump).min(1.0);
        }
        if has_dependencies {
            severity = (severity * config.dependency_severity_bump).min(100.0);
        }

        if statics
            .loops_near(&hotspot.location, 20)
            .any(|l| l.has_nested_loops)
        {
            severity = (severity * 1.5).min(100.0);
        }

        if statics.loops_in_file(&hotspot.location.file) >= 3 && severity > 50.0 {
            confidence = (confidence * config.many_loops_confidence_bump).min(1.0);
        }

        (confidence, severity)
    }

    fn performance_impact(&self, hotspot: &Hotspot, kind: AntipatternKind) -> f64 {
        let latency = hotspot.avg_latency_cycles.max(10.0);
        let x = hotspot.miss_rate * latency;
        let base = x / (1.0 + x) * 100.0;
        let multiplier = match kind {
            AntipatternKind::FalseSharing => 1.5,
            AntipatternKind::Thrashing => 1.3,
            AntipatternKind::StreamingEviction => 0.8,
            _ => 1.0,
        };
        (base * multiplier).min(90.0)
    }
}

fn describe(kind: AntipatternKind, hotspot: &Hotspot) -> (String, String) {
    let range_kib = hotspot.working_set_bytes() / 1024;
    match kind {
        AntipatternKind::HotspotReuse => (
            format!(
                "frequently revisited {} KiB region with {} accesses",
                range_kib.max(1),
                hotspot.total_accesses
            ),
            "repeated accesses to a small working set; residual misses come from first-touch \
             and occasional eviction"
                .to_string(),
        ),
        AntipatternKind::Thrashing => (
            format!(
                "working set of {} KiB overwhelms the affected cache levels \
                 (miss rate {:.0}%)",
                range_kib.max(1),
                hotspot.miss_rate * 100.0
            ),
            "cache lines are evicted before they are reused because the working set exceeds \
             capacity"
                .to_string(),
        ),
        AntipatternKind::FalseSharing => (
            "multiple threads contend for the same cache line".to_string(),
            "independent per-thread data shares a cache line, so every write invalidates the \
             other cores' copies"
                .to_string(),
        ),
        AntipatternKind::IrregularGatherScatter => (
            format!(
                "irregular access order over a {} KiB region",
                range_kib.max(1)
            ),
            "the address sequence has no exploitable spatial pattern, so hardware prefetching \
             and line reuse are ineffective"
                .to_string(),
        ),
        AntipatternKind::UncoalescedAccess => (
            format!(
                "large-stride traversal (stride {} elements)",
                hotspot.access_stride
            ),
            "each iteration touches a new cache line while using only a fraction of it"
                .to_string(),
        ),
        AntipatternKind::LoopCarriedDep => (
            "loop iterations depend on previous results".to_string(),
            "the recurrence serializes iterations and keeps the line hot in a single core"
                .to_string(),
        ),
        AntipatternKind::DeadStores => (
            "values stored but never re-read".to_string(),
            "stores consume write bandwidth and evict useful lines without any later reuse"
                .to_string(),
        ),
        AntipatternKind::HighAssociativityPressure => (
            "too many hot lines map to the same cache sets".to_string(),
            "the access pattern concentrates on a few sets and exhausts their ways".to_string(),
        ),
        AntipatternKind::StreamingEviction => (
            format!("single-pass stream over {} KiB", range_kib.max(1)),
            "streaming data evicts the resident working set without being reused itself"
                .to_string(),
        ),
        AntipatternKind::BankConflict => (
            "accesses serialize on a memory bank".to_string(),
            "concurrent accesses map to the same bank and are serviced one at a time"
                .to_string(),
        ),
    }
}

// ---------------------------------------------------------------------------
// JSON report
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportLocation {
    pub file: String,
    pub line: u32,
    pub function: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PatternReportEntry {
    #[serde(rename = "type")]
    pub antipattern: AntipatternKind,
    pub location: ReportLocation,
    pub severity: f64,
    pub confidence: f64,
    pub performance_impact: f64,
    pub miss_rate: f64,
    pub total_misses: u64,
    pub description: String,
    pub root_cause: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PatternReport {
    pub pattern_count: usize,
    pub patterns: Vec<PatternReportEntry>,
}

impl PatternReport {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| AnalysisError::internal(format!("report serialization failed: {}", e)))
    }
}

/// Renders classified patterns in the stable report shape. Field order is
/// fixed by the struct definitions, so equal inputs serialize identically.
pub fn export_report(patterns: &[ClassifiedPattern]) -> PatternReport {
    PatternReport {
        pattern_count: patterns.len(),
        patterns: patterns
            .iter()
            .map(|p| PatternReportEntry {
                antipattern: p.antipattern,
                location: ReportLocation {
                    file: p.location.file.clone(),
                    line: p.location.line,
                    function: p.location.function.clone(),
                },
                severity: p.severity,
                confidence: p.confidence,
                performance_impact: p.performance_impact_pct,
                miss_rate: p.miss_rate,
                total_misses: p.total_misses,
                description: p.description.clone(),
                root_cause: p.root_cause.clone(),
            })
            .collect(),
    }
}
