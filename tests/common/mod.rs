//! In-memory collaborators for end-to-end scenarios.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use runpod_node_manager::runpod_config::Timing;
use runpod_node_manager::{
    Collaborators, CommandOutput, CommandRunner, Confirmation, ConnectionEndpoint, ControlPlane,
    CreatePodRequest, ManagerConfig, PodDetail, PodError, PodId, PodStatus, RemoteShell, Result,
    RunpodOrchestrator, SettingsStore, TransportKind,
};

pub const POD: &str = "k3x9q2m1z8w7ab";
pub const DIRECT_HOST: &str = "203.0.113.7";
pub const DIRECT_PORT: u16 = 40022;

pub fn pod() -> PodId {
    PodId::new(POD)
}

/// Detail text with both a direct mapping and a legacy tunnel user.
pub fn detail_both() -> String {
    format!(
        "ID {POD}\nPORTS {POD}-64410c1f@ssh.runpod.io, {DIRECT_HOST}:{DIRECT_PORT}->22 (pub,tcp)\n"
    )
}

/// Detail text with only the legacy tunnel user.
pub fn detail_tunnel_only() -> String {
    format!("ID {POD}\nSSH {POD}-64410c1f@ssh.runpod.io\n")
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ============================================================================
// Control plane
// ============================================================================

#[derive(Default)]
pub struct FakeControlPlane {
    /// Status sequence; the last one repeats.
    statuses: Mutex<VecDeque<PodStatus>>,
    /// Transient failures returned before the status sequence.
    pub status_errors: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub detail_text: Mutex<String>,
    pub detail_calls: AtomicUsize,
    pub unavailable_gpus: Mutex<HashSet<String>>,
    pub created_id: Mutex<String>,
    pub listed: Mutex<Vec<PodId>>,
    pub fail_remove: Mutex<bool>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeControlPlane {
    pub fn with_statuses(statuses: &[PodStatus]) -> Self {
        let fake = Self::default();
        fake.set_statuses(statuses);
        *lock(&fake.created_id) = POD.to_string();
        fake
    }

    pub fn set_statuses(&self, statuses: &[PodStatus]) {
        *lock(&self.statuses) = statuses.iter().copied().collect();
    }

    pub fn set_detail(&self, text: impl Into<String>) {
        *lock(&self.detail_text) = text.into();
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }

    fn cli_error(what: &str) -> PodError {
        PodError::ControlPlane {
            command: format!("runpodctl {what}"),
            message: "scripted failure".into(),
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn pod_status(&self, pod_id: &PodId) -> Result<PodDetail> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .status_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Self::cli_error("get pod"));
        }
        let mut statuses = lock(&self.statuses);
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().copied()
        }
        .unwrap_or(PodStatus::Unknown);
        Ok(PodDetail {
            id: pod_id.clone(),
            status,
            fields: BTreeMap::new(),
        })
    }

    async fn pod_connection_text(&self, _pod_id: &PodId) -> Result<String> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.detail_text).clone())
    }

    async fn create_pod(&self, request: &CreatePodRequest) -> Result<PodId> {
        self.record(format!("create:{}", request.gpu_type));
        if lock(&self.unavailable_gpus).contains(&request.gpu_type) {
            return Err(Self::cli_error("create pod"));
        }
        Ok(PodId::new(lock(&self.created_id).clone()))
    }

    async fn start_pod(&self, pod_id: &PodId) -> Result<()> {
        self.record(format!("start:{pod_id}"));
        Ok(())
    }

    async fn stop_pod(&self, pod_id: &PodId) -> Result<()> {
        self.record(format!("stop:{pod_id}"));
        Ok(())
    }

    async fn remove_pod(&self, pod_id: &PodId) -> Result<()> {
        self.record(format!("remove:{pod_id}"));
        if *lock(&self.fail_remove) {
            return Err(Self::cli_error("remove pod"));
        }
        Ok(())
    }

    async fn list_pod_ids(&self) -> Result<Vec<PodId>> {
        Ok(lock(&self.listed).clone())
    }
}

// ============================================================================
// Remote shell
// ============================================================================

#[derive(Default)]
pub struct FakeShell {
    /// (host, port) pairs that answer the canary.
    live: Mutex<HashSet<(String, u16)>>,
    /// Scripted canary answers consumed before `live` is consulted.
    pub canary_script: Mutex<VecDeque<bool>>,
    pub canary_calls: AtomicUsize,
    /// Number of `mkdir` commands that fail before succeeding.
    pub mkdir_failures: AtomicUsize,
    /// Remote paths whose download fails.
    pub failing_downloads: Mutex<HashSet<String>>,
    pub commands: Mutex<Vec<String>>,
    pub downloads: Mutex<Vec<String>>,
    pub uploads: Mutex<Vec<String>>,
}

impl FakeShell {
    pub fn set_live(&self, host: &str, port: u16) {
        lock(&self.live).insert((host.to_string(), port));
    }

    pub fn script_canary(&self, answers: &[bool]) {
        lock(&self.canary_script).extend(answers.iter().copied());
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    pub fn downloads(&self) -> Vec<String> {
        lock(&self.downloads).clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        lock(&self.uploads).clone()
    }

    pub fn remote_activity(&self) -> usize {
        self.commands().len() + self.downloads().len() + self.uploads().len()
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn refused() -> CommandOutput {
    CommandOutput {
        code: Some(255),
        stdout: String::new(),
        stderr: "Connection refused".to_string(),
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn exec(
        &self,
        endpoint: &ConnectionEndpoint,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        lock(&self.commands).push(command.to_string());

        if command == "echo SSH_OK" {
            self.canary_calls.fetch_add(1, Ordering::SeqCst);
            let scripted = lock(&self.canary_script).pop_front();
            let alive = scripted.unwrap_or_else(|| {
                lock(&self.live).contains(&(endpoint.host.clone(), endpoint.port))
            });
            return Ok(if alive { ok("SSH_OK\n") } else { refused() });
        }

        if command.starts_with("mkdir -p")
            && self
                .mkdir_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Ok(refused());
        }

        Ok(ok(""))
    }

    async fn download(
        &self,
        endpoint: &ConnectionEndpoint,
        remote: &str,
        local: &Path,
        _timeout: Duration,
    ) -> Result<()> {
        if endpoint.transport != TransportKind::Direct {
            return Err(PodError::Capability {
                host: endpoint.host.clone(),
            });
        }
        lock(&self.downloads).push(remote.to_string());
        if lock(&self.failing_downloads).contains(remote) {
            return Err(PodError::Transfer {
                file: remote.to_string(),
                message: "No such file or directory".into(),
            });
        }
        std::fs::write(local, format!("from {remote}")).map_err(|e| PodError::io(local, e))
    }

    async fn upload(
        &self,
        endpoint: &ConnectionEndpoint,
        _local: &Path,
        remote: &str,
        _timeout: Duration,
    ) -> Result<()> {
        if endpoint.transport != TransportKind::Direct {
            return Err(PodError::Capability {
                host: endpoint.host.clone(),
            });
        }
        lock(&self.uploads).push(remote.to_string());
        Ok(())
    }
}

// ============================================================================
// Settings, confirmation, runner
// ============================================================================

#[derive(Default)]
pub struct MemorySettings {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        lock(&self.map).clone()
    }

    pub fn set(&self, key: &str, value: &str) {
        lock(&self.map).insert(key.to_string(), value.to_string());
    }
}

impl SettingsStore for MemorySettings {
    fn load(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.snapshot())
    }

    fn merge(&self, updates: &[(&str, String)]) -> Result<()> {
        let mut map = lock(&self.map);
        for (k, v) in updates {
            map.insert((*k).to_string(), v.clone());
        }
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<()> {
        let mut map = lock(&self.map);
        for k in keys {
            map.remove(*k);
        }
        Ok(())
    }
}

pub struct ScriptedConfirm {
    answer: bool,
    pub asked: AtomicUsize,
}

impl ScriptedConfirm {
    pub const fn answering(answer: bool) -> Self {
        Self {
            answer,
            asked: AtomicUsize::new(0),
        }
    }
}

impl Confirmation for ScriptedConfirm {
    fn confirm(&self, _prompt: &str) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

/// Runner that succeeds without doing anything.
pub struct NoopRunner;

#[async_trait]
impl CommandRunner for NoopRunner {
    async fn run(&self, _program: &str, _args: &[String], _timeout: Duration) -> Result<CommandOutput> {
        Ok(ok(""))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub fn test_config(dir: &Path) -> ManagerConfig {
    let key = dir.join("id_ed25519");
    let _ = std::fs::write(&key, "private");
    let _ = std::fs::write(dir.join("id_ed25519.pub"), "ssh-ed25519 AAAA test@host\n");

    let mut cfg = ManagerConfig::with_api_key("test-key");
    cfg.backup_dir = dir.join("backup");
    cfg.settings_path = dir.join(".env");
    cfg.ssh_key_path = key.display().to_string();
    cfg.timing = Timing {
        cli_timeout: Duration::from_secs(5),
        ssh_connect_timeout_secs: 5,
        probe_timeout: Duration::from_secs(10),
        transfer_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_secs(15),
        create_ready_timeout: Duration::from_secs(600),
        start_ready_timeout: Duration::from_secs(300),
        start_resolve_attempts: 2,
        start_resolve_interval: Duration::from_secs(30),
        sync_resolve_attempts: 2,
        sync_resolve_interval: Duration::from_secs(15),
    };
    cfg
}

pub struct Harness {
    pub dir: TempDir,
    pub control: Arc<FakeControlPlane>,
    pub shell: Arc<FakeShell>,
    pub settings: Arc<MemorySettings>,
    pub confirm: Arc<ScriptedConfirm>,
    pub manager: RunpodOrchestrator,
}

impl Harness {
    pub fn new(control: FakeControlPlane, confirm_answer: bool) -> Self {
        Self::with_config(control, confirm_answer, |_| {})
    }

    pub fn with_config(
        control: FakeControlPlane,
        confirm_answer: bool,
        tweak: impl FnOnce(&mut ManagerConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let mut cfg = test_config(dir.path());
        tweak(&mut cfg);

        let control = Arc::new(control);
        let shell = Arc::new(FakeShell::default());
        let settings = Arc::new(MemorySettings::default());
        let confirm = Arc::new(ScriptedConfirm::answering(confirm_answer));

        let deps = Collaborators {
            runner: Arc::new(NoopRunner),
            control: control.clone(),
            shell: shell.clone(),
            settings: settings.clone(),
            confirm: confirm.clone(),
        };
        let manager = RunpodOrchestrator::new(cfg, deps);

        Self {
            dir,
            control,
            shell,
            settings,
            confirm,
            manager,
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.path().join("backup")
    }

    /// Put the given manifest files in the local backup directory.
    pub fn seed_backup(&self, names: &[&str]) {
        let dir = self.backup_dir();
        std::fs::create_dir_all(&dir).unwrap_or_else(|e| panic!("mkdir: {e}"));
        for name in names {
            std::fs::write(dir.join(name), "secret").unwrap_or_else(|e| panic!("write: {e}"));
        }
    }

    /// Direct endpoint reachable and advertised in the detail text.
    pub fn make_reachable(&self) {
        self.control.set_detail(detail_both());
        self.shell.set_live(DIRECT_HOST, DIRECT_PORT);
    }
}

pub const ALL_FILES: [&str; 3] = ["swarm.pem", "userApiKey.json", "userData.json"];

pub fn validated_direct() -> ConnectionEndpoint {
    ConnectionEndpoint {
        transport: TransportKind::Direct,
        host: DIRECT_HOST.into(),
        port: DIRECT_PORT,
        username: "root".into(),
        key_path: "/keys/id".into(),
        validated_at_ms: Some(1),
    }
}
