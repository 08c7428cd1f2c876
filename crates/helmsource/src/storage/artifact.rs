//! Filesystem-backed, content-addressed artifact store.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<kind>/<namespace>/<name>/index-<revision>.yaml
//! <root>/.tmp/<kind>_<namespace>_<name>_<uuid>.tmp
//! ```
//!
//! Files only become visible through a rename of a fully written and synced
//! temp file, so readers never see partial content.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};

use super::{Result, StorageError};
use crate::source::resource::{Artifact, Interval, NamespacedName};

/// Directory under the root holding in-flight writes.
pub const TEMP_DIR: &str = ".tmp";

/// Hex SHA-256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn file_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Outcome of a garbage collection run. Failures never abort the run.
#[derive(Debug, Default)]
pub struct GcSummary {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

impl GcSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Removes a temp file on drop unless it was moved into place.
struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove temp file {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Artifact store rooted at a local directory and served over HTTP at `hostname`.
#[derive(Debug, Clone)]
pub struct ArtifactStorage {
    base_path: PathBuf,
    hostname: String,
    timeout: Duration,
}

impl ArtifactStorage {
    /// Opens the store, creating the root directory if needed.
    pub fn new<P: AsRef<Path>>(
        base_path: P,
        hostname: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        ensure_directory(&base_path)?;
        Ok(Self {
            base_path,
            hostname: hostname.into(),
            timeout,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Upper bound for a single publish or GC run.
    pub fn io_timeout(&self) -> Duration {
        self.timeout
    }

    fn expired(&self, started: Instant) -> bool {
        started.elapsed() >= self.timeout
    }

    fn check_deadline(&self, started: Instant, operation: &'static str) -> Result<()> {
        if self.expired(started) {
            return Err(StorageError::DeadlineExceeded {
                operation,
                timeout: Interval(self.timeout),
            });
        }
        Ok(())
    }

    /// Directory of a resource, relative to the root.
    pub fn resource_dir(&self, kind: &str, key: &NamespacedName) -> Result<String> {
        let kind = kind.to_lowercase();
        for segment in [kind.as_str(), key.namespace.as_str(), key.name.as_str()] {
            validate_segment(segment)?;
        }
        Ok(format!("{}/{}/{}", kind, key.namespace, key.name))
    }

    /// Relative path of the index artifact for a revision.
    pub fn compute_path(&self, kind: &str, key: &NamespacedName, revision: &str) -> Result<String> {
        validate_segment(revision)?;
        Ok(format!(
            "{}/index-{}.yaml",
            self.resource_dir(kind, key)?,
            revision
        ))
    }

    /// Describes the artifact for a revision. Nothing is written.
    pub fn artifact_for(
        &self,
        kind: &str,
        key: &NamespacedName,
        revision: &str,
    ) -> Result<Artifact> {
        let path = self.compute_path(kind, key, revision)?;
        Ok(Artifact {
            url: self.artifact_url(&path),
            path,
            revision: revision.to_string(),
            checksum: revision.to_string(),
            last_update_time: Utc::now(),
        })
    }

    /// Public download address of a stored path.
    pub fn artifact_url(&self, path: &str) -> String {
        format!("http://{}/{}", self.hostname, path.trim_start_matches('/'))
    }

    /// Absolute location of an artifact.
    pub fn local_path(&self, artifact: &Artifact) -> PathBuf {
        self.base_path.join(&artifact.path)
    }

    /// Writes `payload` as `artifact`.
    ///
    /// The payload is written to a temp file, synced, then renamed into place.
    /// On failure the temp file is removed and the visible state is unchanged.
    /// Publishing content already in place does not rewrite the file.
    ///
    /// Past the store's I/O timeout the write is abandoned before the rename,
    /// so a publish reported as failed never becomes visible later.
    pub fn publish(&self, artifact: &Artifact, payload: &[u8]) -> Result<Artifact> {
        let started = Instant::now();
        let actual = checksum(payload);
        if actual != artifact.revision {
            return Err(StorageError::ChecksumMismatch {
                path: artifact.path.clone(),
                expected: artifact.revision.clone(),
                actual,
            });
        }

        let mut published = artifact.clone();
        published.checksum = actual;
        published.url = self.artifact_url(&artifact.path);

        if self.exists(&published) {
            log::debug!("Artifact {} already present", artifact.path);
            return Ok(published);
        }

        self.check_deadline(started, "publish")?;

        let dest = self.local_path(artifact);
        if let Some(parent) = dest.parent() {
            ensure_directory(parent)?;
        }
        let tmp_dir = self.base_path.join(TEMP_DIR);
        ensure_directory(&tmp_dir)?;

        let mut tmp = TempFile {
            path: tmp_dir.join(format!(
                "{}_{}.tmp",
                temp_prefix(&artifact.path),
                uuid::Uuid::new_v4()
            )),
            persisted: false,
        };
        write_synced(&tmp.path, payload)?;
        self.check_deadline(started, "publish")?;

        fs::rename(&tmp.path, &dest).map_err(|e| StorageError::MoveFile {
            from: tmp.path.clone(),
            to: dest.clone(),
            source: e,
        })?;
        tmp.persisted = true;

        if let Some(parent) = dest.parent() {
            fsync_dir(parent).ok();
        }

        published.last_update_time = Utc::now();
        log::debug!("Published artifact {}", artifact.path);
        Ok(published)
    }

    /// Returns true when the artifact's file is present and matches its revision.
    pub fn exists(&self, artifact: &Artifact) -> bool {
        let path = self.local_path(artifact);
        match file_checksum(&path) {
            Ok(actual) if actual == artifact.revision => true,
            Ok(actual) => {
                log::warn!(
                    "Artifact {} does not match its revision (found {})",
                    artifact.path,
                    actual
                );
                false
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                log::warn!("Failed to read artifact {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Removes every file of the resource except `keep` (a path relative to the root).
    ///
    /// Best effort: each failure is recorded and the run continues. An emptied
    /// resource directory is removed, as are the resource's stale temp files.
    /// Once the I/O timeout passes nothing more is removed and the run is
    /// reported as incomplete.
    pub fn garbage_collect(
        &self,
        kind: &str,
        key: &NamespacedName,
        keep: Option<&str>,
    ) -> Result<GcSummary> {
        let relative = self.resource_dir(kind, key)?;
        let dir = self.base_path.join(&relative);
        let keep = keep.map(|k| self.base_path.join(k));
        let started = Instant::now();
        let mut summary = GcSummary::default();

        match fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) => {
                            summary.failures.push((dir.clone(), e.to_string()));
                            continue;
                        }
                    };
                    let path = entry.path();
                    if keep.as_deref() == Some(path.as_path()) {
                        continue;
                    }
                    if self.expired(started) {
                        summary.failures.push((path, self.deadline_message()));
                        break;
                    }
                    let removed = if entry.file_type().is_ok_and(|t| t.is_dir()) {
                        fs::remove_dir_all(&path)
                    } else {
                        fs::remove_file(&path)
                    };
                    match removed {
                        Ok(()) => summary.removed.push(path),
                        Err(e) => summary.failures.push((path, e.to_string())),
                    }
                }

                remove_if_empty(&dir, &mut summary);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => summary.failures.push((dir.clone(), e.to_string())),
        }

        if self.expired(started) {
            if summary.is_clean() {
                summary.failures.push((dir, self.deadline_message()));
            }
        } else {
            self.remove_stale_temp_files(&relative, &mut summary);
        }

        for (path, reason) in &summary.failures {
            log::warn!("Garbage collection failed for {}: {}", path.display(), reason);
        }
        Ok(summary)
    }

    /// Removes every artifact of the resource.
    pub fn remove_all(&self, kind: &str, key: &NamespacedName) -> Result<GcSummary> {
        self.garbage_collect(kind, key, None)
    }

    fn deadline_message(&self) -> String {
        format!("deadline of {} exceeded", Interval(self.timeout))
    }

    fn remove_stale_temp_files(&self, relative_dir: &str, summary: &mut GcSummary) {
        let prefix = format!("{}_", temp_prefix(relative_dir));
        let Ok(entries) = fs::read_dir(self.base_path.join(TEMP_DIR)) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&prefix) {
                continue;
            }
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => summary.removed.push(path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => summary.failures.push((path, e.to_string())),
            }
        }
    }
}

/// Temp file prefix for a resource directory or a file inside it.
fn temp_prefix(relative: &str) -> String {
    let segments: Vec<&str> = relative.split('/').take(3).collect();
    segments.join("_")
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '_'])
    {
        return Err(StorageError::InvalidPath(segment.to_string()));
    }
    Ok(())
}

fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
        path: path.to_path_buf(),
        source: e,
    })
}

fn write_synced(path: &Path, payload: &[u8]) -> Result<()> {
    let map_err = |e| StorageError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(map_err)?;
    file.write_all(payload).map_err(map_err)?;
    file.sync_all().map_err(map_err)
}

fn remove_if_empty(dir: &Path, summary: &mut GcSummary) {
    let is_empty = fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if !is_empty {
        return;
    }
    match fs::remove_dir(dir) {
        Ok(()) => summary.removed.push(dir.to_path_buf()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => summary.failures.push((dir.to_path_buf(), e.to_string())),
    }
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
