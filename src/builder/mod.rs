//! The image build procedure.
//!
//! A single linear sequence: instantiate a working container, mount its
//! root filesystem, copy the artifacts in, configure image metadata,
//! commit, release. The first failing step aborts the build; the working
//! container is unmounted and removed on every exit path unless the
//! recipe's `keep_on_failure` escape hatch is set.

use anyhow::{anyhow, bail, Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::{dest_in_mount, ContainerEngine};
use crate::recipe::{Artifact, ImageRecipe};
use crate::report::{self, ArtifactRecord, RunManifest, STATUS_FAILED, STATUS_SUCCESS};

const PULL_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Run manifests kept per image before pruning.
const RUN_HISTORY_KEEP: usize = 10;

const BUILD_LOCK_FILENAME: &str = "build.lock";

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub run_id: String,
    pub image_name: String,
    pub image_id: String,
    pub container_id: String,
    pub artifacts: Vec<ArtifactRecord>,
    pub elapsed: Duration,
}

/// Build the image described by `recipe` using `engine`.
///
/// Writes a run manifest under the recipe's state directory for both
/// successful and failed runs, then surfaces the first error encountered.
pub fn build_image(engine: &dyn ContainerEngine, recipe: &ImageRecipe) -> Result<BuildSummary> {
    recipe.validate().context("validating build recipe")?;

    let image_root = report::image_state_dir(&recipe.build.state_dir, &recipe.image_name);
    let _lock = acquire_build_lock(&image_root)?;

    let started = Instant::now();
    let deadline = Deadline::new(recipe.build.timeout_secs);
    let run_id = report::new_run_id()?;
    let created_at_utc = report::utc_timestamp()?;

    let (container_id, outcome) = run_build(engine, recipe, &deadline);

    let manifest = RunManifest {
        run_id: run_id.clone(),
        status: match &outcome {
            Ok(_) => STATUS_SUCCESS.to_string(),
            Err(_) => STATUS_FAILED.to_string(),
        },
        image_name: recipe.image_name.clone(),
        base_image: recipe.base_image.clone(),
        container_id: container_id.clone(),
        image_id: outcome.as_ref().ok().map(|(image_id, _)| image_id.clone()),
        error: outcome.as_ref().err().map(|err| format!("{err:#}")),
        created_at_utc,
        finished_at_utc: report::utc_timestamp().ok(),
        artifacts: outcome
            .as_ref()
            .ok()
            .map(|(_, artifacts)| artifacts.clone())
            .unwrap_or_default(),
    };
    if let Err(report_err) = report::write_manifest(&image_root, &manifest) {
        eprintln!("[build:report] writing run manifest failed: {report_err:#}");
    }

    let (image_id, artifacts) = outcome?;

    if let Err(prune_err) = report::prune_old_runs(&image_root, RUN_HISTORY_KEEP) {
        eprintln!("[build:report] pruning old runs failed: {prune_err:#}");
    }

    let elapsed = started.elapsed();
    println!(
        "[build:done] image '{}' committed as {} in {:.1?}",
        recipe.image_name, image_id, elapsed
    );

    Ok(BuildSummary {
        run_id,
        image_name: recipe.image_name.clone(),
        image_id,
        container_id: container_id.unwrap_or_default(),
        artifacts,
        elapsed,
    })
}

/// Everything between acquiring the lock and writing the manifest.
/// Returns the container handle (when one was created) alongside the
/// outcome so failed runs stay diagnosable.
fn run_build(
    engine: &dyn ContainerEngine,
    recipe: &ImageRecipe,
    deadline: &Deadline,
) -> (Option<String>, Result<(String, Vec<ArtifactRecord>)>) {
    // Missing inputs fail before any container state exists.
    for artifact in &recipe.artifacts {
        if !artifact.source.is_file() {
            return (
                None,
                Err(anyhow!(
                    "missing source artifact '{}'",
                    artifact.source.display()
                )),
            );
        }
    }

    if let Err(err) = deadline.check("from") {
        return (None, Err(err));
    }
    println!(
        "[build:from] creating working container from '{}'",
        recipe.base_image
    );
    let mut container =
        match WorkingContainer::create(engine, &recipe.base_image, recipe.build.pull_retries) {
            Ok(container) => container,
            Err(err) => return (None, Err(err)),
        };
    let container_id = container.id.clone();
    println!("[build:from] working container '{container_id}'");

    let outcome = match run_steps(engine, recipe, &mut container, deadline) {
        Ok(committed) => match container.release() {
            Ok(()) => Ok(committed),
            Err(err) => Err(err),
        },
        Err(err) => {
            if recipe.build.keep_on_failure {
                let (id, mount_point) = container.keep();
                match mount_point {
                    Some(mount) => eprintln!(
                        "[build:keep] working container '{}' left mounted at '{}' for diagnosis",
                        id,
                        mount.display()
                    ),
                    None => eprintln!(
                        "[build:keep] working container '{id}' left in place for diagnosis"
                    ),
                }
            } else {
                drop(container);
            }
            Err(err)
        }
    };

    (Some(container_id), outcome)
}

fn run_steps(
    engine: &dyn ContainerEngine,
    recipe: &ImageRecipe,
    container: &mut WorkingContainer<'_>,
    deadline: &Deadline,
) -> Result<(String, Vec<ArtifactRecord>)> {
    deadline.check("mount")?;
    let mount = container.mount()?;
    println!("[build:mount] rootfs mounted at '{}'", mount.display());

    let mut artifacts = Vec::with_capacity(recipe.artifacts.len());
    for artifact in &recipe.artifacts {
        deadline.check("copy")?;
        let record = stage_artifact(engine, &mount, artifact)?;
        println!(
            "[build:copy] '{}' -> '{}' ({} bytes, sha256:{})",
            record.source,
            record.dest,
            record.size_bytes,
            &record.sha256[..12]
        );
        artifacts.push(record);
    }

    deadline.check("config")?;
    engine
        .set_entrypoint(&container.id, &recipe.entrypoint)
        .with_context(|| format!("configuring entrypoint '{}'", recipe.entrypoint))?;
    engine
        .set_user(&container.id, &recipe.user)
        .with_context(|| format!("configuring user '{}'", recipe.user))?;
    println!(
        "[build:config] entrypoint '{}', user '{}'",
        recipe.entrypoint, recipe.user
    );

    // Commit must precede unmount or the staged filesystem is lost.
    deadline.check("commit")?;
    let image_id = engine
        .commit(&container.id, &recipe.image_name, recipe.format)
        .with_context(|| format!("committing image '{}'", recipe.image_name))?;
    println!(
        "[build:commit] committed '{}' as {}",
        recipe.image_name, image_id
    );

    Ok((image_id, artifacts))
}

/// Copy one artifact into the mount and verify the copy is byte-identical.
fn stage_artifact(
    engine: &dyn ContainerEngine,
    mount: &Path,
    artifact: &Artifact,
) -> Result<ArtifactRecord> {
    let (source_sha, size_bytes) = sha256_file(&artifact.source)?;
    engine
        .copy_into(mount, &artifact.source, &artifact.dest)
        .with_context(|| {
            format!(
                "copying '{}' to '{}'",
                artifact.source.display(),
                artifact.dest
            )
        })?;

    let copied = dest_in_mount(mount, &artifact.dest)?;
    let (copied_sha, _) = sha256_file(&copied)?;
    if copied_sha != source_sha {
        bail!(
            "copy verification failed for '{}': source sha256 {} but copy has {}",
            artifact.dest,
            source_sha,
            copied_sha
        );
    }

    Ok(ArtifactRecord {
        source: artifact.source.display().to_string(),
        dest: artifact.dest.clone(),
        sha256: source_sha,
        size_bytes,
    })
}

/// Scoped working container: created once, released on every exit path.
struct WorkingContainer<'a> {
    engine: &'a dyn ContainerEngine,
    id: String,
    mount_point: Option<PathBuf>,
    released: bool,
}

impl<'a> WorkingContainer<'a> {
    /// Instantiate from the base image, retrying the configured number of
    /// times. Pull failures are the one transient failure mode here.
    fn create(engine: &'a dyn ContainerEngine, base_image: &str, retries: u32) -> Result<Self> {
        let mut attempt = 0u32;
        let id = loop {
            attempt += 1;
            match engine.instantiate(base_image) {
                Ok(id) => break id,
                Err(err) if attempt <= retries => {
                    eprintln!(
                        "[build:from] attempt {attempt} failed: {err:#}; retrying"
                    );
                    thread::sleep(PULL_RETRY_BACKOFF * attempt);
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "creating working container from '{base_image}' (attempt {attempt})"
                    )))
                }
            }
        };
        Ok(Self {
            engine,
            id,
            mount_point: None,
            released: false,
        })
    }

    fn mount(&mut self) -> Result<PathBuf> {
        let path = self
            .engine
            .mount(&self.id)
            .with_context(|| format!("mounting working container '{}'", self.id))?;
        self.mount_point = Some(path.clone());
        Ok(path)
    }

    /// Success-path release: unmount then remove, surfacing the first
    /// error.
    fn release(mut self) -> Result<()> {
        self.released = true;
        let mut first_err: Option<anyhow::Error> = None;
        if self.mount_point.take().is_some() {
            if let Err(err) = self.engine.unmount(&self.id) {
                first_err =
                    Some(err.context(format!("unmounting working container '{}'", self.id)));
            }
        }
        if let Err(err) = self.engine.remove(&self.id) {
            match first_err {
                None => {
                    first_err =
                        Some(err.context(format!("removing working container '{}'", self.id)));
                }
                Some(_) => eprintln!(
                    "[build:cleanup] removing working container '{}' also failed: {err:#}",
                    self.id
                ),
            }
        }
        match first_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Failure-path escape hatch: leave the container (and its mount) in
    /// place for diagnosis.
    fn keep(mut self) -> (String, Option<PathBuf>) {
        self.released = true;
        (self.id.clone(), self.mount_point.take())
    }
}

impl Drop for WorkingContainer<'_> {
    /// Failure-path cleanup. Errors are logged rather than propagated so
    /// the build error that got us here stays visible.
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.mount_point.take().is_some() {
            if let Err(err) = self.engine.unmount(&self.id) {
                eprintln!(
                    "[build:cleanup] unmounting working container '{}' failed: {err:#}",
                    self.id
                );
            }
        }
        if let Err(err) = self.engine.remove(&self.id) {
            eprintln!(
                "[build:cleanup] removing working container '{}' failed: {err:#}",
                self.id
            );
        }
    }
}

/// Overall wall-clock budget, checked between steps. A running step is
/// never interrupted.
struct Deadline {
    end: Option<Instant>,
}

impl Deadline {
    fn new(timeout_secs: Option<u64>) -> Self {
        Self {
            end: timeout_secs.map(|secs| Instant::now() + Duration::from_secs(secs)),
        }
    }

    fn check(&self, step: &str) -> Result<()> {
        if let Some(end) = self.end {
            if Instant::now() >= end {
                bail!("build deadline exceeded before step '{step}'");
            }
        }
        Ok(())
    }
}

struct BuildLock {
    _file: File,
}

/// One build at a time per image state directory.
fn acquire_build_lock(image_root: &Path) -> Result<BuildLock> {
    fs::create_dir_all(image_root)
        .with_context(|| format!("creating state directory '{}'", image_root.display()))?;
    let lock_path = image_root.join(BUILD_LOCK_FILENAME);

    // Never unlink the lock file: a second process could recreate it at the
    // same path and take a separate exclusive lock.
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("creating lock file '{}'", lock_path.display()))?;

    if lock_file.try_lock_exclusive().is_err() {
        bail!(
            "another build is already running (lock held): {}",
            lock_path.display()
        );
    }

    Ok(BuildLock { _file: lock_file })
}

fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path)
        .with_context(|| format!("opening '{}' for hashing", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size_bytes = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size_bytes += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size_bytes))
}
