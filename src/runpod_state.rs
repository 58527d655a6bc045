//! Local persistence: the `key=value` settings file and the pod snapshot.
//!
//! Unique responsibility: durable, self-consistent state on disk.
//! - `EnvFileStore`: the settings file (`.env` format). Every update re-reads
//!   the file, rewrites only the touched lines and replaces it atomically, so
//!   hand edits and unrelated keys survive.
//! - `PodSnapshotStore`: `pod_info.json`, the last known pod detail.
//!
//! Non-goals:
//! - Deciding what to persist (see `runpod_cache` and `runpod_orchestrator`).
//! - Locking. One invocation per pod at a time is the caller's responsibility.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::runpod_error::{PodError, Result};
use crate::runpod_types::{PodDetail, PodId, PodStatus};

/// Snapshot file format version.
const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Flat key/value persistence with merge and explicit removal.
pub trait SettingsStore: Send + Sync {
    /// Read every key currently in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file exists but cannot be read or parsed.
    fn load(&self) -> Result<BTreeMap<String, String>>;

    /// Set the given keys, leaving every other key untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be rewritten.
    fn merge(&self, updates: &[(&str, String)]) -> Result<()>;

    /// Delete the given keys, leaving every other key untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be rewritten.
    fn remove(&self, keys: &[&str]) -> Result<()>;

    /// Single non-empty value.
    ///
    /// # Errors
    ///
    /// Same as `load`.
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .load()?
            .remove(key)
            .filter(|v| !v.trim().is_empty()))
    }
}

/// `SettingsStore` over a `.env`-style file.
#[derive(Debug, Clone)]
pub struct EnvFileStore {
    path: PathBuf,
}

impl EnvFileStore {
    /// Create a store for `path`. The file need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to the settings file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_raw(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(PodError::io(&self.path, e)),
        }
    }

    fn rewrite(&self, set: &[(&str, String)], drop: &[&str]) -> Result<()> {
        let current = self.read_raw()?;
        let next = rewrite_lines(&current, set, drop);
        if next == current {
            return Ok(());
        }
        write_atomic(&self.path, next.as_bytes()).map_err(|e| PodError::io(&self.path, e))
    }
}

impl SettingsStore for EnvFileStore {
    fn load(&self) -> Result<BTreeMap<String, String>> {
        let iter = match dotenvy::from_path_iter(&self.path) {
            Ok(iter) => iter,
            Err(dotenvy::Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(e) => {
                return Err(PodError::Settings {
                    path: self.path.clone(),
                    message: e.to_string(),
                });
            }
        };

        let mut map = BTreeMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| PodError::Settings {
                path: self.path.clone(),
                message: e.to_string(),
            })?;
            map.insert(key, value);
        }
        Ok(map)
    }

    fn merge(&self, updates: &[(&str, String)]) -> Result<()> {
        self.rewrite(updates, &[])
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        self.rewrite(&[], keys)
    }
}

/// Apply sets and removals to `.env` text, keeping untouched lines verbatim.
fn rewrite_lines(current: &str, set: &[(&str, String)], drop: &[&str]) -> String {
    let mut written: BTreeSet<&str> = BTreeSet::new();
    let mut out = String::with_capacity(current.len() + 64);

    for line in current.lines() {
        let key = line_key(line);
        if let Some(key) = key {
            if drop.contains(&key) {
                continue;
            }
            if let Some((k, v)) = set.iter().find(|(k, _)| *k == key) {
                if written.insert(k) {
                    out.push_str(&format_entry(k, v));
                    out.push('\n');
                }
                continue;
            }
        }
        out.push_str(line);
        out.push('\n');
    }

    for (k, v) in set {
        if written.insert(k) {
            out.push_str(&format_entry(k, v));
            out.push('\n');
        }
    }
    out
}

/// Key of an assignment line, `None` for comments and blanks.
fn line_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, _) = trimmed.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then_some(key)
}

fn format_entry(key: &str, value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '\\' | '$'));
    if needs_quotes {
        let escaped = value
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('$', "\\$")
            .replace('\n', "\\n");
        format!("{key}=\"{escaped}\"")
    } else {
        format!("{key}={value}")
    }
}

/// Last known pod detail, persisted as `pod_info.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSnapshot {
    /// Format version for snapshot serialization.
    pub format_version: u32,
    /// Pod ID.
    pub pod_id: PodId,
    /// Status at observation time.
    pub status: PodStatus,
    /// Parsed detail columns.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Timestamp (ms since epoch) when this snapshot was observed.
    pub observed_at_ms: u64,
}

impl PodSnapshot {
    /// Snapshot of `detail` observed at `now_ms`.
    #[must_use]
    pub fn from_detail(detail: &PodDetail, now_ms: u64) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            pod_id: detail.id.clone(),
            status: detail.status,
            fields: detail.fields.clone(),
            observed_at_ms: now_ms,
        }
    }
}

/// File-based JSON snapshot store with safe atomic writes.
#[derive(Debug, Clone)]
pub struct PodSnapshotStore {
    path: PathBuf,
}

impl PodSnapshotStore {
    /// Create a new snapshot store.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<backup_dir>/pod_info.json`.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("pod_info.json"))
    }

    /// Get the path to the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or has the wrong version.
    pub fn load(&self) -> Result<Option<PodSnapshot>> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PodError::io(&self.path, e)),
        };
        let snapshot: PodSnapshot = serde_json::from_slice(&bytes)?;
        validate(&snapshot, &self.path)?;
        Ok(Some(snapshot))
    }

    /// Save the snapshot atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if validation, serialization or the write fails.
    pub fn save(&self, snapshot: &PodSnapshot) -> Result<()> {
        validate(snapshot, &self.path)?;
        let json = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&self.path, &json).map_err(|e| PodError::io(&self.path, e))
    }

    /// Delete the snapshot. Missing file is fine.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PodError::io(&self.path, e)),
        }
    }
}

fn validate(snapshot: &PodSnapshot, path: &Path) -> Result<()> {
    if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(PodError::Settings {
            path: path.to_path_buf(),
            message: "unsupported snapshot format version".to_string(),
        });
    }
    if snapshot.pod_id.is_empty() {
        return Err(PodError::Settings {
            path: path.to_path_buf(),
            message: "pod_id is empty".to_string(),
        });
    }
    Ok(())
}

/// Write `bytes` to `path` through a temp file in the same directory.
///
/// # Errors
///
/// Returns an error if the directory, temp file or rename fails.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = path.to_path_buf();
    let tmp_name = format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("runpod_state")
    );
    tmp.set_file_name(tmp_name);

    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    // Rename over an existing file fails on Windows.
    if cfg!(windows) && path.exists() {
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path)
}

/// Utility: current timestamp in milliseconds since UNIX epoch.
#[must_use]
pub fn now_unix_ms() -> u64 {
    let Ok(dur) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) else {
        return 0;
    };
    u64::try_from(dur.as_millis()).unwrap_or(u64::MAX)
}
