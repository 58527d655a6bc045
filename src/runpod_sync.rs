//! File sync engine: backup and restore of the credential manifest.
//!
//! Unique responsibility: move the manifest files between the pod and the
//! local backup directory, then restart the workload after a restore.
//!
//! Preconditions are checked before any transfer, in this order:
//! 1. the endpoint supports file copy (direct TCP)
//! 2. the endpoint passed a probe during this run
//! 3. (restore) every local file exists, all missing names reported together
//! 4. the pod is RUNNING, fetched fresh from the control plane
//!
//! Restarting services is best-effort. Once files are placed, a lost
//! connection or failing restart step never turns the restore into a failure.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::runpod_config::ManagerConfig;
use crate::runpod_ctl::ControlPlane;
use crate::runpod_error::{PodError, Result};
use crate::runpod_resolver::{ConnectionResolver, ResolvePolicy};
use crate::runpod_ssh::RemoteShell;
use crate::runpod_state::write_atomic;
use crate::runpod_types::{ConnectionEndpoint, PodId, PodStatus};

/// Local file name of the generated restart script.
pub const RESTART_SCRIPT_NAME: &str = "restart_gensyn.sh";
/// Where the restart script is placed on the pod.
pub const REMOTE_RESTART_SCRIPT: &str = "/tmp/restart_gensyn.sh";

/// One remote file and its name in the backup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Absolute path on the pod.
    pub remote_path: String,
    /// File name inside the local backup directory.
    pub local_name: String,
}

impl ManifestEntry {
    /// Create an entry.
    #[must_use]
    pub fn new(remote_path: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
            local_name: local_name.into(),
        }
    }

    fn remote_dir(&self) -> Option<&str> {
        let (dir, _) = self.remote_path.rsplit_once('/')?;
        (!dir.is_empty()).then_some(dir)
    }
}

/// Ordered list of files to back up and restore. Order is the restore order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupManifest {
    entries: Vec<ManifestEntry>,
}

impl Default for BackupManifest {
    fn default() -> Self {
        Self::new(vec![
            ManifestEntry::new("/root/rl-swarm/swarm.pem", "swarm.pem"),
            ManifestEntry::new(
                "/root/rl-swarm/modal-login/temp-data/userApiKey.json",
                "userApiKey.json",
            ),
            ManifestEntry::new(
                "/root/rl-swarm/modal-login/temp-data/userData.json",
                "userData.json",
            ),
        ])
    }
}

impl BackupManifest {
    /// Manifest with the given entries.
    #[must_use]
    pub const fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// Entries in restore order.
    #[must_use]
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Distinct parent directories of the remote paths, first-seen order.
    #[must_use]
    pub fn remote_dirs(&self) -> Vec<&str> {
        let mut dirs: Vec<&str> = Vec::new();
        for dir in self.entries.iter().filter_map(ManifestEntry::remote_dir) {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }
}

/// Remote restart script parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartScript {
    /// Container stopped when docker is present.
    pub container: String,
    /// `pkill -f` patterns; "no process" counts as success.
    pub process_patterns: Vec<String>,
    /// Shared-memory scratch directory emptied before relaunch.
    pub scratch_dir: String,
    /// Startup script relaunched in the background when present.
    pub startup_script: String,
}

impl Default for RestartScript {
    fn default() -> Self {
        Self {
            container: "gensyn-node".to_string(),
            process_patterns: vec!["hivemind".to_string(), "swarm".to_string()],
            scratch_dir: "/dev/shm".to_string(),
            startup_script: "/root/rl-swarm/run_swarm.sh".to_string(),
        }
    }
}

impl RestartScript {
    /// Render the bash script. Every step tolerates failure.
    #[must_use]
    pub fn render(&self) -> String {
        let mut s = String::from("#!/bin/bash\n# Restart the node after a credential restore.\n\n");

        s.push_str("if command -v docker >/dev/null 2>&1; then\n");
        s.push_str(&format!(
            "    docker stop {} >/dev/null 2>&1 || true\nfi\n\n",
            shell_quote(&self.container)
        ));

        for pattern in &self.process_patterns {
            s.push_str(&format!("pkill -f {} >/dev/null 2>&1 || true\n", shell_quote(pattern)));
        }

        let scratch = self.scratch_dir.trim_end_matches('/');
        if !scratch.is_empty() {
            s.push_str(&format!("\nrm -rf {}/* 2>/dev/null || true\n", shell_quote(scratch)));
        }

        let script = shell_quote(&self.startup_script);
        let (dir, name) = self
            .startup_script
            .rsplit_once('/')
            .map_or((".", self.startup_script.as_str()), |(d, n)| {
                (if d.is_empty() { "/" } else { d }, n)
            });
        s.push_str(&format!(
            "\nif [ -f {script} ]; then\n    cd {} && nohup bash {} > /tmp/run_swarm.log 2>&1 < /dev/null &\nfi\n\nexit 0\n",
            shell_quote(dir),
            shell_quote(name)
        ));
        s
    }
}

/// Result of a restore that placed every file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Files placed and the restart script was attempted.
    Restored {
        /// Whether the restart script ran to a zero exit.
        restart_script_ok: bool,
    },
    /// Files placed, services not restarted.
    PartialSuccess {
        /// Why the restart was skipped.
        reason: String,
    },
}

/// What to sync and where.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Local backup directory.
    pub backup_dir: PathBuf,
    /// Files to move.
    pub manifest: BackupManifest,
    /// Script run after a restore.
    pub script: RestartScript,
    /// Per-copy and per-command timeout.
    pub transfer_timeout: Duration,
    /// Delay used by the single re-resolution during restore.
    pub resync_interval: Duration,
}

impl SyncOptions {
    /// Default manifest and script, timings from `config`.
    #[must_use]
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            backup_dir: config.backup_dir.clone(),
            manifest: BackupManifest::default(),
            script: RestartScript::default(),
            transfer_timeout: config.timing.transfer_timeout,
            resync_interval: config.timing.sync_resolve_interval,
        }
    }
}

/// Backup/restore over a resolved endpoint.
pub struct FileSyncEngine {
    control: Arc<dyn ControlPlane>,
    shell: Arc<dyn RemoteShell>,
    resolver: Arc<ConnectionResolver>,
    backup_dir: PathBuf,
    manifest: BackupManifest,
    script: RestartScript,
    transfer_timeout: Duration,
    resync_interval: Duration,
}

impl FileSyncEngine {
    /// Create an engine.
    #[must_use]
    pub fn new(
        control: Arc<dyn ControlPlane>,
        shell: Arc<dyn RemoteShell>,
        resolver: Arc<ConnectionResolver>,
        options: SyncOptions,
    ) -> Self {
        Self {
            control,
            shell,
            resolver,
            backup_dir: options.backup_dir,
            manifest: options.manifest,
            script: options.script,
            transfer_timeout: options.transfer_timeout,
            resync_interval: options.resync_interval,
        }
    }

    /// Local backup directory.
    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// The manifest in use.
    #[must_use]
    pub const fn manifest(&self) -> &BackupManifest {
        &self.manifest
    }

    /// Local path of one manifest entry.
    #[must_use]
    pub fn local_path(&self, entry: &ManifestEntry) -> PathBuf {
        self.backup_dir.join(&entry.local_name)
    }

    /// Local names that are not on disk, in manifest order.
    #[must_use]
    pub fn missing_local_files(&self) -> Vec<String> {
        self.manifest
            .entries()
            .iter()
            .filter(|e| !self.local_path(e).is_file())
            .map(|e| e.local_name.clone())
            .collect()
    }

    /// Whether any backed up file exists locally.
    #[must_use]
    pub fn has_local_backup(&self) -> bool {
        self.manifest.entries().iter().any(|e| self.local_path(e).is_file())
    }

    /// Copy every manifest file from the pod into the backup directory.
    ///
    /// Stops at the first failed copy; files already copied stay on disk.
    ///
    /// # Errors
    ///
    /// Precondition errors, or `Transfer` for the first failing file.
    pub async fn backup(&self, pod_id: &PodId, endpoint: &ConnectionEndpoint) -> Result<Vec<PathBuf>> {
        check_endpoint(endpoint)?;
        self.check_running(pod_id).await?;

        fs::create_dir_all(&self.backup_dir).map_err(|e| PodError::io(&self.backup_dir, e))?;

        let mut copied = Vec::with_capacity(self.manifest.entries().len());
        for entry in self.manifest.entries() {
            let local = self.local_path(entry);
            if let Err(e) = self
                .shell
                .download(endpoint, &entry.remote_path, &local, self.transfer_timeout)
                .await
            {
                warn!(
                    pod_id = %pod_id,
                    file = %entry.remote_path,
                    copied = copied.len(),
                    error = %e,
                    "backup aborted"
                );
                return Err(e);
            }
            info!(pod_id = %pod_id, file = %entry.local_name, "backed up");
            copied.push(local);
        }
        Ok(copied)
    }

    /// Place every local backup file on the pod, then restart services.
    ///
    /// # Errors
    ///
    /// Precondition errors, a failed directory setup after one re-resolution,
    /// or `Transfer` for the first failing file. Service restart problems are
    /// reported through `RestoreOutcome`, never as errors.
    pub async fn restore(&self, pod_id: &PodId, endpoint: &ConnectionEndpoint) -> Result<RestoreOutcome> {
        check_endpoint(endpoint)?;
        let missing = self.missing_local_files();
        if !missing.is_empty() {
            return Err(PodError::MissingBackupFiles(missing));
        }
        self.check_running(pod_id).await?;

        let mut endpoint = endpoint.clone();
        if let Err(first) = self.make_remote_dirs(&endpoint).await {
            warn!(pod_id = %pod_id, error = %first, "remote mkdir failed; re-resolving once");
            let policy = ResolvePolicy::new(1, self.resync_interval).bypass_cache();
            let fresh = self.resolver.resolve(pod_id, policy).await?;
            check_endpoint(&fresh.endpoint)?;
            endpoint = fresh.endpoint;
            self.make_remote_dirs(&endpoint).await?;
        }

        for entry in self.manifest.entries() {
            self.shell
                .upload(&endpoint, &self.local_path(entry), &entry.remote_path, self.transfer_timeout)
                .await?;
            info!(pod_id = %pod_id, file = %entry.remote_path, "restored");
        }

        let Some(live) = self.resolver.validate(&endpoint).await else {
            warn!(pod_id = %pod_id, "connection lost after restore; services not restarted");
            return Ok(RestoreOutcome::PartialSuccess {
                reason: "files restored, services not restarted: connection check failed after transfer"
                    .to_string(),
            });
        };

        let restart_script_ok = self.run_restart_script(pod_id, &live).await;
        Ok(RestoreOutcome::Restored { restart_script_ok })
    }

    async fn check_running(&self, pod_id: &PodId) -> Result<()> {
        let detail = self.control.pod_status(pod_id).await?;
        match detail.status {
            PodStatus::Running => Ok(()),
            PodStatus::NotFound => Err(PodError::NotFound(pod_id.clone())),
            status => Err(PodError::NotRunning {
                pod_id: pod_id.clone(),
                status,
            }),
        }
    }

    async fn make_remote_dirs(&self, endpoint: &ConnectionEndpoint) -> Result<()> {
        let dirs = self.manifest.remote_dirs();
        if dirs.is_empty() {
            return Ok(());
        }
        let quoted: Vec<String> = dirs.iter().map(|d| shell_quote(d)).collect();
        let command = format!("mkdir -p {}", quoted.join(" "));
        let out = self
            .shell
            .exec(endpoint, &command, self.transfer_timeout)
            .await
            .map_err(|e| PodError::Transfer {
                file: dirs.join(" "),
                message: e.to_string(),
            })?;
        if !out.success() {
            return Err(PodError::Transfer {
                file: dirs.join(" "),
                message: out.failure_message(),
            });
        }
        Ok(())
    }

    /// Write, upload and run the restart script. Each step only warns.
    async fn run_restart_script(&self, pod_id: &PodId, endpoint: &ConnectionEndpoint) -> bool {
        let local = self.backup_dir.join(RESTART_SCRIPT_NAME);
        if let Err(e) = write_script(&local, &self.script.render()) {
            warn!(path = %local.display(), error = %e, "could not write restart script");
            return false;
        }

        if let Err(e) = self
            .shell
            .upload(endpoint, &local, REMOTE_RESTART_SCRIPT, self.transfer_timeout)
            .await
        {
            warn!(pod_id = %pod_id, error = %e, "could not upload restart script");
            return false;
        }

        let chmod = format!("chmod +x {REMOTE_RESTART_SCRIPT}");
        match self.shell.exec(endpoint, &chmod, self.transfer_timeout).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(pod_id = %pod_id, error = %out.failure_message(), "chmod failed"),
            Err(e) => warn!(pod_id = %pod_id, error = %e, "chmod failed"),
        }

        let run = format!("bash {REMOTE_RESTART_SCRIPT}");
        match self.shell.exec(endpoint, &run, self.transfer_timeout).await {
            Ok(out) if out.success() => {
                info!(pod_id = %pod_id, "restart script executed");
                debug!(output = %out.stdout.trim(), "restart script output");
                true
            }
            Ok(out) => {
                warn!(pod_id = %pod_id, error = %out.failure_message(), "restart script failed");
                false
            }
            Err(e) => {
                warn!(pod_id = %pod_id, error = %e, "restart script failed");
                false
            }
        }
    }
}

fn check_endpoint(endpoint: &ConnectionEndpoint) -> Result<()> {
    if !endpoint.transport.supports_file_copy() {
        return Err(PodError::Capability {
            host: endpoint.host.clone(),
        });
    }
    if !endpoint.is_validated() {
        return Err(PodError::Unvalidated(format!(
            "{}:{}",
            endpoint.destination(),
            endpoint.port
        )));
    }
    Ok(())
}

fn write_script(path: &Path, body: &str) -> std::io::Result<()> {
    write_atomic(path, body.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_manifest_dirs_are_deduplicated() {
        let m = BackupManifest::default();
        assert_eq!(m.entries().len(), 3);
        assert_eq!(
            m.remote_dirs(),
            vec!["/root/rl-swarm", "/root/rl-swarm/modal-login/temp-data"]
        );
    }

    #[test]
    fn script_covers_every_step() {
        let s = RestartScript::default().render();
        assert!(s.starts_with("#!/bin/bash"));
        assert!(s.contains("docker stop gensyn-node"));
        assert!(s.contains("pkill -f hivemind >/dev/null 2>&1 || true"));
        assert!(s.contains("pkill -f swarm >/dev/null 2>&1 || true"));
        assert!(s.contains("rm -rf /dev/shm/*"));
        assert!(s.contains("cd /root/rl-swarm && nohup bash run_swarm.sh"));
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("/root/rl-swarm"), "/root/rl-swarm");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
