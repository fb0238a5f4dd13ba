use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

const RUN_MANIFEST_FILENAME: &str = "run-manifest.json";

const RUN_ID_FORMAT: &[FormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second][subsecond digits:6]Z");

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";

/// One artifact embedded by a run, with its verified content digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub source: String,
    pub dest: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Durable record of one build run, written whether it succeeded or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub status: String,
    pub image_name: String,
    pub base_image: String,
    pub container_id: Option<String>,
    pub image_id: Option<String>,
    pub error: Option<String>,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
}

pub fn utc_timestamp() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting UTC timestamp")
}

/// Microsecond timestamp plus pid keeps ids unique across rapid re-runs.
pub fn new_run_id() -> Result<String> {
    let stamp = OffsetDateTime::now_utc()
        .format(&RUN_ID_FORMAT)
        .context("formatting run id timestamp")?;
    Ok(format!("{stamp}-{:05}", std::process::id()))
}

/// Per-image directory under the state dir. Image references may contain
/// path and tag separators, so they are flattened for the filesystem.
pub fn image_state_dir(state_dir: &Path, image_name: &str) -> PathBuf {
    let flat: String = image_name
        .chars()
        .map(|c| match c {
            '/' | ':' | '@' => '-',
            other => other,
        })
        .collect();
    state_dir.join(flat)
}

pub fn manifest_path(run_dir: &Path) -> PathBuf {
    run_dir.join(RUN_MANIFEST_FILENAME)
}

/// Write a run manifest under `<image_root>/<run_id>/`.
pub fn write_manifest(image_root: &Path, manifest: &RunManifest) -> Result<PathBuf> {
    let run_dir = image_root.join(&manifest.run_id);
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating run directory '{}'", run_dir.display()))?;
    let path = manifest_path(&run_dir);
    let bytes = serde_json::to_vec_pretty(manifest).context("encoding run manifest")?;
    fs::write(&path, bytes)
        .with_context(|| format!("writing run manifest '{}'", path.display()))?;
    Ok(path)
}

pub fn load_runs(image_root: &Path) -> Result<Vec<RunManifest>> {
    if !image_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs = Vec::new();
    for entry in fs::read_dir(image_root)
        .with_context(|| format!("reading runs directory '{}'", image_root.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating runs directory '{}'", image_root.display()))?;
        let run_dir = entry.path();
        if !run_dir.is_dir() {
            continue;
        }
        let Some(run_name) = run_dir.file_name().and_then(|part| part.to_str()) else {
            continue;
        };
        if run_name.starts_with('.') {
            continue;
        }
        let path = manifest_path(&run_dir);
        if !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("reading run manifest '{}'", path.display()))?;
        let parsed: RunManifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run manifest '{}'", path.display()))?;
        runs.push(parsed);
    }
    Ok(runs)
}

pub fn latest_successful_run(image_root: &Path) -> Result<Option<RunManifest>> {
    let mut runs = load_runs(image_root)?;
    runs.retain(|run| run.status == STATUS_SUCCESS);
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    Ok(runs.into_iter().next())
}

pub fn prune_old_runs(image_root: &Path, keep: usize) -> Result<()> {
    let mut runs = load_runs(image_root)?;
    runs.sort_by_key(|run| Reverse(run_sort_key(run)));
    for run in runs.into_iter().skip(keep) {
        let path = image_root.join(&run.run_id);
        fs::remove_dir_all(&path)
            .with_context(|| format!("removing expired run directory '{}'", path.display()))?;
    }
    Ok(())
}

fn run_sort_key(run: &RunManifest) -> String {
    run.finished_at_utc
        .clone()
        .unwrap_or_else(|| run.created_at_utc.clone())
}
