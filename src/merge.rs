use crate::state::AssessmentState;
use crate::worker::BatchResults;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct MergedEntry {
    pub batch_id: String,
    pub document: PathBuf,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct MergeReport {
    pub session_id: String,
    pub merged_file: PathBuf,
    pub summary_file: PathBuf,
    pub total_entries: usize,
    pub status_counts: BTreeMap<String, usize>,
    pub batches_missing_results: Vec<String>,
}

/// Consolidate per-batch result files into one session-level artifact.
/// Spreadsheet/HTML rendering happens downstream; the merged JSON is the
/// hand-off.
pub fn merge_session(state: &AssessmentState) -> Result<MergeReport> {
    if !state.all_batches_terminal() {
        warn!(
            session_id = %state.session_id,
            "merging while some batches are not terminal; output will be partial"
        );
    }

    let mut entries: Vec<MergedEntry> = Vec::new();
    let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut missing = Vec::new();

    for batch in &state.batches {
        let path = batch.output_dir.join(format!("{}_results.json", batch.id));
        if !path.exists() {
            missing.push(batch.id.clone());
            continue;
        }
        let results: BatchResults = serde_json::from_slice(
            &std::fs::read(&path)
                .with_context(|| format!("reading results: {}", path.display()))?,
        )
        .with_context(|| format!("parsing results: {}", path.display()))?;

        for result in results.results {
            *status_counts.entry(result.status.clone()).or_insert(0) += 1;
            entries.push(MergedEntry {
                batch_id: batch.id.clone(),
                document: result.document,
                status: result.status,
                error: result.error,
                assessment: result.assessment,
            });
        }
    }

    let merged_file = state.output_dir.join("merged_results.json");
    std::fs::write(&merged_file, serde_json::to_vec_pretty(&entries)?)
        .with_context(|| format!("writing merged results: {}", merged_file.display()))?;

    let summary_file = state.output_dir.join("merged_summary.md");
    std::fs::write(&summary_file, render_summary(state, &entries, &status_counts, &missing))
        .with_context(|| format!("writing summary: {}", summary_file.display()))?;

    info!(
        session_id = %state.session_id,
        entries = entries.len(),
        missing_batches = missing.len(),
        "merge complete"
    );

    Ok(MergeReport {
        session_id: state.session_id.clone(),
        merged_file,
        summary_file,
        total_entries: entries.len(),
        status_counts,
        batches_missing_results: missing,
    })
}

fn render_summary(
    state: &AssessmentState,
    entries: &[MergedEntry],
    status_counts: &BTreeMap<String, usize>,
    missing: &[String],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Assessment results: {}\n\n", state.session_id));
    out.push_str(&format!(
        "- documents: {}\n- result entries: {}\n\n",
        state.total_documents,
        entries.len()
    ));

    out.push_str("| status | count |\n|---|---|\n");
    for (status, count) in status_counts {
        out.push_str(&format!("| {status} | {count} |\n"));
    }

    if !missing.is_empty() {
        out.push_str("\nBatches without a results file:\n");
        for id in missing {
            out.push_str(&format!("- {id}\n"));
        }
    }
    out
}
