//! Dynamic-only analysis over a recorded sample file.
//!
//! Usage: analyze-samples <samples.json> [topology.json]
//!
//! The sample file is a JSON array of raw cache-miss records; the optional
//! topology file is a JSON array of cache levels (L1 first). Prints the
//! pattern report and the ranked recommendations as one JSON object.

use anyhow::{bail, Context as _, Result};
use cachesight::cache_model::{CacheLevel, CacheModel};
use cachesight::config::AnalysisConfig;
use cachesight::context::Context;
use cachesight::pattern_classifier::PatternReport;
use cachesight::pipeline::AnalysisPipeline;
use cachesight::recommendation::Recommendation;
use cachesight::sample_arena::CacheMissSample;
use serde::Serialize;
use std::fs;

#[derive(Serialize)]
struct FullReport {
    analysis: PatternReport,
    recommendations: Vec<Recommendation>,
    false_sharing_lines: usize,
    bank_conflicts: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let samples_path = match args.next() {
        Some(path) => path,
        None => bail!("usage: analyze-samples <samples.json> [topology.json]"),
    };

    let raw = fs::read_to_string(&samples_path)
        .with_context(|| format!("reading {}", samples_path))?;
    let samples: Vec<CacheMissSample> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", samples_path))?;
    tracing::info!(count = samples.len(), "loaded samples");

    let model = match args.next() {
        Some(topology_path) => {
            let raw = fs::read_to_string(&topology_path)
                .with_context(|| format!("reading {}", topology_path))?;
            let levels: Vec<CacheLevel> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", topology_path))?;
            CacheModel::new(levels)?
        }
        None => CacheModel::typical_desktop(),
    };

    let ctx = Context::new(model, AnalysisConfig::default())?;
    let report = AnalysisPipeline::new(&ctx).run(&[], samples)?;

    let full = FullReport {
        analysis: report.pattern_report(),
        recommendations: report.recommendations,
        false_sharing_lines: report
            .false_sharing
            .iter()
            .filter(|c| c.confirmed)
            .count(),
        bank_conflicts: report.bank_conflicts.conflicts.len(),
    };
    println!("{}", serde_json::to_string_pretty(&full)?);
    Ok(())
}
