//! `RunPod` orchestrator.
//!
//! Pod lifecycle over the control plane CLI, composing the readiness waiter,
//! the connection resolver and the file sync engine.
//!
//! This module provides:
//! - `create()`: create with a GPU fallback chain, then wait until RUNNING
//! - `start()`: start, wait, resolve a fresh endpoint and auto-restore backups
//! - `stop()`: back up first; a failed backup needs explicit confirmation
//! - `terminate()`: remove the pod and forget everything cached about it
//! - `backup()`, `restore()`, `connect()`, `clean()`, `current_pod_id()`
//!
//! A pod the control plane no longer knows triggers cache cleanup and a
//! `PodError::NotFound`, never a retry.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::runpod_cache::EndpointCache;
use crate::runpod_config::ManagerConfig;
use crate::runpod_ctl::{ControlPlane, CreatePodRequest, RunpodCtl};
use crate::runpod_error::{PodError, Result};
use crate::runpod_exec::{CommandRunner, ProcessRunner};
use crate::runpod_resolver::{ConnectionResolver, Resolution, ResolvePolicy, web_interface_url};
use crate::runpod_ssh::{RemoteShell, SshShell, ensure_ssh_key};
use crate::runpod_state::{EnvFileStore, PodSnapshot, PodSnapshotStore, SettingsStore, now_unix_ms};
use crate::runpod_sync::{FileSyncEngine, RestoreOutcome, SyncOptions};
use crate::runpod_types::{PodDetail, PodId, PodStatus, TransportKind};
use crate::runpod_waiter::ReadinessWaiter;

/// Human-in-the-loop gate for risky actions.
pub trait Confirmation: Send + Sync {
    /// Ask `prompt`; `true` means proceed.
    fn confirm(&self, prompt: &str) -> bool;
}

/// Answers yes to everything (`stop --yes`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirmation for AssumeYes {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// External collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Plain command runner (ssh-keygen).
    pub runner: Arc<dyn CommandRunner>,
    /// Control plane.
    pub control: Arc<dyn ControlPlane>,
    /// Remote shell and file copy.
    pub shell: Arc<dyn RemoteShell>,
    /// Settings file.
    pub settings: Arc<dyn SettingsStore>,
    /// Confirmation port.
    pub confirm: Arc<dyn Confirmation>,
}

impl Collaborators {
    /// Real subprocess-backed collaborators for `cfg`.
    #[must_use]
    pub fn system(cfg: &ManagerConfig, confirm: Arc<dyn Confirmation>) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
        Self {
            control: Arc::new(RunpodCtl::new(
                runner.clone(),
                cfg.runpodctl_bin.clone(),
                cfg.timing.cli_timeout,
            )),
            shell: Arc::new(SshShell::new(runner.clone(), cfg.timing.ssh_connect_timeout_secs)),
            settings: Arc::new(EnvFileStore::new(cfg.settings_path.clone())),
            runner,
            confirm,
        }
    }
}

/// Options for `create`. `None` falls back to the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Pod name.
    pub name: Option<String>,
    /// Requested GPU type, tried first.
    pub gpu_type: Option<String>,
    /// Volume and container disk size in GB.
    pub disk_gb: Option<u32>,
    /// Secure cloud instead of community cloud.
    pub secure_cloud: bool,
}

/// Result of `create`.
#[derive(Debug, Clone)]
pub struct CreateReport {
    /// New pod identity.
    pub pod_id: PodId,
    /// GPU type that was accepted.
    pub gpu_type: String,
    /// Detail observed when the pod became ready.
    pub detail: PodDetail,
}

/// What happened to the backup during `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartRestore {
    /// The pod was already running; nothing was restored.
    Skipped {
        /// Local backup files exist and can be pushed with `restore`.
        backup_available: bool,
    },
    /// No local backup files to restore.
    NoBackup,
    /// No working SSH endpoint; restore not attempted.
    ConnectionUnavailable(String),
    /// Restore ran.
    Restored(RestoreOutcome),
    /// Restore was attempted and failed.
    Failed(String),
}

/// Result of `start`.
#[derive(Debug, Clone)]
pub struct StartReport {
    /// Pod identity.
    pub pod_id: PodId,
    /// The pod was running before `start`.
    pub already_running: bool,
    /// Fresh endpoint, when one was resolved.
    pub connection: Option<Resolution>,
    /// Auto-restore result.
    pub restore: StartRestore,
}

/// What happened to the backup during `stop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopBackup {
    /// The pod was not running, so there was nothing to back up.
    Skipped(PodStatus),
    /// Backup written.
    Saved(Vec<PathBuf>),
    /// Backup failed and the operator chose to stop anyway.
    FailedConfirmed(String),
}

/// Result of `restore`.
#[derive(Debug, Clone)]
pub enum RestoreReport {
    /// The pod was not running, so it was started (which restores).
    ViaStart(StartReport),
    /// Restored onto the running pod.
    Direct(RestoreOutcome),
}

/// Connection details for `connect`.
#[derive(Debug, Clone)]
pub struct ConnectReport {
    /// Pod identity.
    pub pod_id: PodId,
    /// Status at the time of the call.
    pub status: PodStatus,
    /// Resolved endpoint.
    pub resolution: Resolution,
    /// Web interface address.
    pub web_url: String,
    /// `scp` template, only for direct TCP.
    pub scp_template: Option<String>,
}

/// `RunPod` orchestrator for lifecycle management of a single pod.
pub struct RunpodOrchestrator {
    cfg: ManagerConfig,
    runner: Arc<dyn CommandRunner>,
    control: Arc<dyn ControlPlane>,
    cache: EndpointCache,
    snapshots: PodSnapshotStore,
    resolver: Arc<ConnectionResolver>,
    waiter: ReadinessWaiter,
    sync: FileSyncEngine,
    confirm: Arc<dyn Confirmation>,
}

impl RunpodOrchestrator {
    /// Wire the components over the given collaborators.
    #[must_use]
    pub fn new(cfg: ManagerConfig, deps: Collaborators) -> Self {
        Self::with_sync_options(SyncOptions::from_config(&cfg), cfg, deps)
    }

    /// Same as `new` with a custom manifest, restart script or backup dir.
    #[must_use]
    pub fn with_sync_options(options: SyncOptions, cfg: ManagerConfig, deps: Collaborators) -> Self {
        let cache = EndpointCache::new(deps.settings, cfg.tunnel_host.clone(), cfg.ssh_key_path.clone());
        let resolver = Arc::new(ConnectionResolver::new(
            deps.control.clone(),
            deps.shell.clone(),
            cache.clone(),
            &cfg,
        ));
        let snapshots = PodSnapshotStore::in_dir(&options.backup_dir);
        let waiter = ReadinessWaiter::new(deps.control.clone(), cfg.timing.poll_interval);
        let sync = FileSyncEngine::new(deps.control.clone(), deps.shell, resolver.clone(), options);

        Self {
            cfg,
            runner: deps.runner,
            control: deps.control,
            cache,
            snapshots,
            resolver,
            waiter,
            sync,
            confirm: deps.confirm,
        }
    }

    /// Get a reference to the current configuration.
    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.cfg
    }

    /// The file sync engine.
    #[must_use]
    pub const fn sync(&self) -> &FileSyncEngine {
        &self.sync
    }

    /// The managed pod: settings, then snapshot, then the first listed pod
    /// (which is adopted).
    ///
    /// # Errors
    ///
    /// `MissingPodId` when nothing is saved or listed.
    pub async fn current_pod_id(&self) -> Result<PodId> {
        if let Some(id) = self.cache.saved_pod_id()? {
            return Ok(id);
        }

        match self.snapshots.load() {
            Ok(Some(snapshot)) => return Ok(snapshot.pod_id),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "ignoring unreadable pod snapshot"),
        }

        match self.control.list_pod_ids().await {
            Ok(ids) => {
                if let Some(id) = ids.into_iter().next() {
                    info!(pod_id = %id, "adopting first listed pod");
                    self.cache.remember_pod(&id)?;
                    return Ok(id);
                }
            }
            Err(e) => warn!(error = %e, "could not list pods"),
        }

        Err(PodError::MissingPodId)
    }

    /// Save `pod_id` as the managed pod unless one is already saved.
    /// Returns whether it was adopted.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file cannot be read or written.
    pub fn adopt(&self, pod_id: &PodId) -> Result<bool> {
        if self.cache.saved_pod_id()?.is_some() {
            return Ok(false);
        }
        self.cache.remember_pod(pod_id)?;
        Ok(true)
    }

    /// Pod IDs from the control plane CLI.
    ///
    /// # Errors
    ///
    /// Returns an error if the CLI call fails.
    pub async fn list_pod_ids(&self) -> Result<Vec<PodId>> {
        self.control.list_pod_ids().await
    }

    /// Fresh status of `pod_id`.
    ///
    /// # Errors
    ///
    /// `NotFound` (after cleanup) or a transient control plane error.
    pub async fn status(&self, pod_id: &PodId) -> Result<PodDetail> {
        let detail = self.control.pod_status(pod_id).await?;
        if detail.status.invalidates_cache() {
            return Err(self.forget(pod_id));
        }
        Ok(detail)
    }

    /// Create a pod, trying the requested GPU type then each fallback, and
    /// wait until it is RUNNING.
    ///
    /// # Errors
    ///
    /// `CreateFailed` when every GPU type is rejected, or a readiness error.
    pub async fn create(&self, opts: CreateOptions) -> Result<CreateReport> {
        let defaults = &self.cfg.pod;
        let public_key = match ensure_ssh_key(
            self.runner.as_ref(),
            &self.cfg.ssh_key_path,
            self.cfg.timing.cli_timeout,
        )
        .await
        {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "SSH key provisioning failed; creating without PUBLIC_KEY");
                None
            }
        };

        let disk_gb = opts.disk_gb.unwrap_or(defaults.disk_gb);
        let request = CreatePodRequest {
            name: opts.name.unwrap_or_else(|| defaults.name.clone()),
            gpu_type: String::new(),
            template_id: defaults.template_id.clone(),
            image: defaults.image.clone(),
            volume_gb: disk_gb,
            container_disk_gb: disk_gb,
            secure_cloud: opts.secure_cloud,
            public_key,
        };

        let requested = opts.gpu_type.unwrap_or_else(|| defaults.gpu_type.clone());
        let chain = self.cfg.gpu_chain(&requested);
        let mut tried = Vec::with_capacity(chain.len());
        let mut created: Option<(PodId, String)> = None;

        for gpu in chain {
            match self.control.create_pod(&request.with_gpu(&gpu)).await {
                Ok(pod_id) if !pod_id.is_empty() => {
                    info!(pod_id = %pod_id, gpu = %gpu, "pod created");
                    created = Some((pod_id, gpu));
                    break;
                }
                Ok(_) => warn!(gpu = %gpu, "create returned an empty pod id"),
                Err(e) => warn!(gpu = %gpu, error = %e, "GPU type unavailable"),
            }
            tried.push(gpu);
        }

        let Some((pod_id, gpu_type)) = created else {
            return Err(PodError::CreateFailed { tried });
        };

        self.cache.remember_pod(&pod_id)?;
        let detail = self.wait_ready(&pod_id, self.cfg.timing.create_ready_timeout).await?;
        self.save_snapshot(&detail);

        Ok(CreateReport {
            pod_id,
            gpu_type,
            detail,
        })
    }

    /// Start the pod, wait for readiness, resolve a fresh endpoint and
    /// restore local backups onto it.
    ///
    /// # Errors
    ///
    /// `NotFound`, a failed start command or a readiness error. Resolution
    /// and restore problems are reported in `StartReport::restore`.
    pub async fn start(&self, pod_id: &PodId) -> Result<StartReport> {
        let current = self.status(pod_id).await?;
        if current.status == PodStatus::Running {
            let backup_available = self.sync.has_local_backup();
            info!(pod_id = %pod_id, backup_available, "pod already running; not restoring");
            self.save_snapshot(&current);
            return Ok(StartReport {
                pod_id: pod_id.clone(),
                already_running: true,
                connection: None,
                restore: StartRestore::Skipped { backup_available },
            });
        }

        self.control.start_pod(pod_id).await?;
        let detail = self.wait_ready(pod_id, self.cfg.timing.start_ready_timeout).await?;
        self.save_snapshot(&detail);

        let policy = ResolvePolicy::new(
            self.cfg.timing.start_resolve_attempts,
            self.cfg.timing.start_resolve_interval,
        )
        .bypass_cache();

        let resolution = match self.resolver.resolve(pod_id, policy).await {
            Ok(r) => r,
            Err(e @ PodError::Resolution { .. }) => {
                warn!(pod_id = %pod_id, error = %e, "pod running but SSH unavailable");
                return Ok(StartReport {
                    pod_id: pod_id.clone(),
                    already_running: false,
                    connection: None,
                    restore: StartRestore::ConnectionUnavailable(e.to_string()),
                });
            }
            Err(e) => return Err(e),
        };

        let restore = if self.sync.has_local_backup() {
            match self.sync.restore(pod_id, &resolution.endpoint).await {
                Ok(outcome) => StartRestore::Restored(outcome),
                Err(e) => {
                    warn!(pod_id = %pod_id, error = %e, "auto-restore failed");
                    StartRestore::Failed(e.to_string())
                }
            }
        } else {
            info!(pod_id = %pod_id, "no local backup to restore");
            StartRestore::NoBackup
        };

        Ok(StartReport {
            pod_id: pod_id.clone(),
            already_running: false,
            connection: Some(resolution),
            restore,
        })
    }

    /// Stop the pod, backing up first when it is running.
    ///
    /// # Errors
    ///
    /// `Cancelled` when the backup failed and the operator declined; no stop
    /// command is sent in that case.
    pub async fn stop(&self, pod_id: &PodId) -> Result<StopBackup> {
        let current = self.status(pod_id).await?;

        let backup = if current.status == PodStatus::Running {
            match self.backup_running(pod_id).await {
                Ok(paths) => StopBackup::Saved(paths),
                Err(e) => {
                    warn!(pod_id = %pod_id, error = %e, "backup before stop failed");
                    let prompt = format!("Backup failed ({e}). Stop the pod anyway? [y/N]");
                    if !self.confirm.confirm(&prompt) {
                        info!(pod_id = %pod_id, "stop cancelled");
                        return Err(PodError::Cancelled);
                    }
                    StopBackup::FailedConfirmed(e.to_string())
                }
            }
        } else {
            StopBackup::Skipped(current.status)
        };

        self.control.stop_pod(pod_id).await?;
        Ok(backup)
    }

    /// Terminate the pod. Cached state is dropped whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the control plane error if removal failed.
    pub async fn terminate(&self, pod_id: &PodId) -> Result<()> {
        let removed = self.control.remove_pod(pod_id).await;
        if let Err(e) = self.cache.invalidate(pod_id) {
            warn!(pod_id = %pod_id, error = %e, "could not invalidate endpoint cache");
        }
        if let Err(e) = self.snapshots.remove() {
            warn!(error = %e, "could not remove pod snapshot");
        }
        removed
    }

    /// Back up the manifest from the running pod.
    ///
    /// # Errors
    ///
    /// `NotRunning`, `NotFound`, a resolution failure or a transfer error.
    pub async fn backup(&self, pod_id: &PodId) -> Result<Vec<PathBuf>> {
        let current = self.status(pod_id).await?;
        if current.status != PodStatus::Running {
            return Err(PodError::NotRunning {
                pod_id: pod_id.clone(),
                status: current.status,
            });
        }
        self.backup_running(pod_id).await
    }

    /// Restore local backups. A pod that is not running is started first,
    /// which restores on its own.
    ///
    /// # Errors
    ///
    /// `MissingBackupFiles` before anything else, then as `start`/`FileSyncEngine::restore`.
    pub async fn restore(&self, pod_id: &PodId) -> Result<RestoreReport> {
        let missing = self.sync.missing_local_files();
        if !missing.is_empty() {
            return Err(PodError::MissingBackupFiles(missing));
        }

        let current = self.status(pod_id).await?;
        if current.status != PodStatus::Running {
            info!(pod_id = %pod_id, status = %current.status, "pod not running; starting it first");
            return self.start(pod_id).await.map(RestoreReport::ViaStart);
        }

        let resolution = self.resolver.resolve(pod_id, self.sync_policy()).await?;
        self.sync
            .restore(pod_id, &resolution.endpoint)
            .await
            .map(RestoreReport::Direct)
    }

    /// Resolve connection details for an interactive session.
    ///
    /// # Errors
    ///
    /// `NotRunning` unless `force`, `NotFound`, or a resolution failure.
    pub async fn connect(&self, pod_id: &PodId, force: bool) -> Result<ConnectReport> {
        let current = self.status(pod_id).await?;
        if current.status != PodStatus::Running && !force {
            return Err(PodError::NotRunning {
                pod_id: pod_id.clone(),
                status: current.status,
            });
        }

        let resolution = self.resolver.resolve(pod_id, self.sync_policy()).await?;
        let text = self
            .control
            .pod_connection_text(pod_id)
            .await
            .unwrap_or_default();

        let ep = &resolution.endpoint;
        let scp_template = (ep.transport == TransportKind::Direct).then(|| {
            format!(
                "scp -P {} -i {} <local_file> {}:<remote_path>",
                ep.port,
                ep.key_path,
                ep.destination()
            )
        });

        Ok(ConnectReport {
            pod_id: pod_id.clone(),
            status: current.status,
            web_url: web_interface_url(&text, pod_id),
            scp_template,
            resolution,
        })
    }

    /// Forget the saved pod identity, connection and snapshot.
    /// `SSH_KEY_PATH` and other settings are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file or snapshot cannot be updated.
    pub fn clean(&self) -> Result<()> {
        self.cache.clear()?;
        self.snapshots.remove()?;
        info!("local pod state cleaned");
        Ok(())
    }

    async fn backup_running(&self, pod_id: &PodId) -> Result<Vec<PathBuf>> {
        let resolution = self.resolver.resolve(pod_id, self.sync_policy()).await?;
        self.sync.backup(pod_id, &resolution.endpoint).await
    }

    async fn wait_ready(&self, pod_id: &PodId, timeout: std::time::Duration) -> Result<PodDetail> {
        match self.waiter.wait_ready(pod_id, timeout).await {
            Err(PodError::NotFound(_)) => Err(self.forget(pod_id)),
            Err(e @ PodError::TerminalFailure { status: PodStatus::Terminated, .. }) => {
                self.clear_pod_state(pod_id);
                Err(e)
            }
            other => other,
        }
    }

    const fn sync_policy(&self) -> ResolvePolicy {
        ResolvePolicy::new(
            self.cfg.timing.sync_resolve_attempts,
            self.cfg.timing.sync_resolve_interval,
        )
    }

    fn save_snapshot(&self, detail: &PodDetail) {
        if let Err(e) = self.snapshots.save(&PodSnapshot::from_detail(detail, now_unix_ms())) {
            warn!(error = %e, "could not save pod snapshot");
        }
    }

    /// Drop cached state for a pod that no longer exists.
    fn forget(&self, pod_id: &PodId) -> PodError {
        warn!(pod_id = %pod_id, "pod no longer exists; clearing cached state");
        self.clear_pod_state(pod_id);
        PodError::NotFound(pod_id.clone())
    }

    /// Invalidate the endpoint cache and the snapshot for `pod_id`. Best-effort.
    fn clear_pod_state(&self, pod_id: &PodId) {
        if let Err(e) = self.cache.invalidate(pod_id) {
            warn!(error = %e, "could not invalidate endpoint cache");
        }
        match self.snapshots.load() {
            Ok(Some(s)) if s.pod_id != *pod_id => {}
            _ => {
                if let Err(e) = self.snapshots.remove() {
                    warn!(error = %e, "could not remove pod snapshot");
                }
            }
        }
    }
}
