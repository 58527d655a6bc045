//! Process-wide configuration.
//!
//! Loaded once at startup from environment variables (and `.env`), then passed
//! around immutably. Nothing in the crate reads the environment after this.

use std::{env, path::PathBuf, time::Duration};

use crate::runpod_error::{PodError, Result};

/// Configuration for the pod manager.
///
/// All fields can be configured via environment variables.
/// See `from_env()` for the mapping.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// `RunPod` API key for authentication.
    /// Env: `RUNPOD_API_KEY` (required)
    pub api_key: String,

    /// GraphQL API URL for `RunPod`.
    /// Env: `RUNPOD_GRAPHQL_URL` (default: "<https://api.runpod.io/graphql>")
    pub graphql_url: String,

    /// Key/value settings file holding the cached pod identity and endpoint.
    /// Env: `RUNPOD_SETTINGS_PATH` (default: ".env")
    pub settings_path: PathBuf,

    /// Local directory for backed up files, the restart script and `pod_info.json`.
    /// Env: `RUNPOD_BACKUP_DIR` (default: "/root/gensyn/backup")
    pub backup_dir: PathBuf,

    /// Control plane CLI binary.
    /// Env: `RUNPODCTL_BIN` (default: "runpodctl")
    pub runpodctl_bin: String,

    /// SSH private key (tilde-expanded).
    /// Env: `SSH_KEY_PATH` (default: "~/.ssh/id_rsa")
    pub ssh_key_path: String,

    /// Relay host for tunnel connections.
    /// Env: `RUNPOD_SSH_TUNNEL_HOST` (default: "ssh.runpod.io")
    pub tunnel_host: String,

    /// Login user for direct TCP connections.
    /// Env: `RUNPOD_SSH_USER` (default: "root")
    pub superuser: String,

    /// Pod creation defaults.
    pub pod: PodDefaults,

    /// Timeouts, intervals and attempt counts.
    pub timing: Timing,

    /// Return a guessed `POD_ID-xxxxx` tunnel user when discovery is exhausted.
    /// Env: `RUNPOD_ALLOW_GUESSED_SSH_USER` (default: false)
    pub allow_guessed_username: bool,
}

/// Defaults for `create`.
#[derive(Clone, Debug)]
pub struct PodDefaults {
    /// Env: `RUNPOD_POD_NAME` (default: "gensyn-node")
    pub name: String,
    /// Env: `RUNPOD_GPU_TYPE` (default: "NVIDIA `GeForce` RTX 4090")
    pub gpu_type: String,
    /// Tried in order when the requested GPU type is unavailable.
    /// Env: `RUNPOD_GPU_FALLBACKS` (comma-separated)
    pub gpu_fallbacks: Vec<String>,
    /// Volume and container disk size in GB.
    /// Env: `RUNPOD_DISK_SIZE` (default: 30)
    pub disk_gb: u32,
    /// Env: `RUNPOD_TEMPLATE_ID` (default: "jvczrc7se1")
    pub template_id: String,
    /// Env: `RUNPOD_IMAGE` (default: "nodesforall/gensyn-node:latest")
    pub image: String,
}

/// Per-call timeouts. They are never composed into one deadline.
#[derive(Clone, Debug)]
pub struct Timing {
    /// Env: `RUNPOD_CLI_TIMEOUT_MS` (default: 60000)
    pub cli_timeout: Duration,
    /// Env: `RUNPOD_SSH_CONNECT_TIMEOUT_S` (default: 5)
    pub ssh_connect_timeout_secs: u32,
    /// Env: `RUNPOD_PROBE_TIMEOUT_MS` (default: 10000)
    pub probe_timeout: Duration,
    /// Env: `RUNPOD_TRANSFER_TIMEOUT_MS` (default: 120000)
    pub transfer_timeout: Duration,
    /// Env: `RUNPOD_POLL_INTERVAL_MS` (default: 15000)
    pub poll_interval: Duration,
    /// Env: `RUNPOD_CREATE_READY_TIMEOUT_MS` (default: 600000)
    pub create_ready_timeout: Duration,
    /// Env: `RUNPOD_START_READY_TIMEOUT_MS` (default: 300000)
    pub start_ready_timeout: Duration,
    /// Env: `RUNPOD_START_RESOLVE_ATTEMPTS` (default: 20)
    pub start_resolve_attempts: u32,
    /// Env: `RUNPOD_START_RESOLVE_INTERVAL_MS` (default: 30000)
    pub start_resolve_interval: Duration,
    /// Env: `RUNPOD_SYNC_RESOLVE_ATTEMPTS` (default: 10)
    pub sync_resolve_attempts: u32,
    /// Env: `RUNPOD_SYNC_RESOLVE_INTERVAL_MS` (default: 15000)
    pub sync_resolve_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            cli_timeout: Duration::from_secs(60),
            ssh_connect_timeout_secs: 5,
            probe_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(15),
            create_ready_timeout: Duration::from_secs(600),
            start_ready_timeout: Duration::from_secs(300),
            start_resolve_attempts: 20,
            start_resolve_interval: Duration::from_secs(30),
            sync_resolve_attempts: 10,
            sync_resolve_interval: Duration::from_secs(15),
        }
    }
}

impl Default for PodDefaults {
    fn default() -> Self {
        Self {
            name: "gensyn-node".to_string(),
            gpu_type: "NVIDIA GeForce RTX 4090".to_string(),
            gpu_fallbacks: vec![
                "NVIDIA GeForce RTX 3090".to_string(),
                "NVIDIA GeForce RTX 4080 SUPER".to_string(),
            ],
            disk_gb: 30,
            template_id: "jvczrc7se1".to_string(),
            image: "nodesforall/gensyn-node:latest".to_string(),
        }
    }
}

impl ManagerConfig {
    /// Configuration with defaults everywhere except the API key.
    #[must_use]
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            graphql_url: "https://api.runpod.io/graphql".to_string(),
            settings_path: PathBuf::from(".env"),
            backup_dir: PathBuf::from("/root/gensyn/backup"),
            runpodctl_bin: "runpodctl".to_string(),
            ssh_key_path: expand_tilde("~/.ssh/id_rsa"),
            tunnel_host: "ssh.runpod.io".to_string(),
            superuser: "root".to_string(),
            pod: PodDefaults::default(),
            timing: Timing::default(),
            allow_guessed_username: false,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// In local dev, this will also attempt to load `.env` from the current directory.
    /// If `.env` is missing, it does not fail.
    ///
    /// # Errors
    ///
    /// Returns an error if `RUNPOD_API_KEY` is missing or a numeric value is invalid.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let defaults = Self::with_api_key(String::new());
        let pod_defaults = defaults.pod;
        let timing_defaults = defaults.timing;

        let api_key = must_env("RUNPOD_API_KEY")?;

        let pod = PodDefaults {
            name: env_or("RUNPOD_POD_NAME", &pod_defaults.name),
            gpu_type: env_or("RUNPOD_GPU_TYPE", &pod_defaults.gpu_type),
            gpu_fallbacks: env::var("RUNPOD_GPU_FALLBACKS")
                .map_or(pod_defaults.gpu_fallbacks, |raw| split_csv(&raw)),
            disk_gb: parse_u32_env("RUNPOD_DISK_SIZE", pod_defaults.disk_gb)?,
            template_id: env_or("RUNPOD_TEMPLATE_ID", &pod_defaults.template_id),
            image: env_or("RUNPOD_IMAGE", &pod_defaults.image),
        };

        let timing = Timing {
            cli_timeout: parse_ms_env("RUNPOD_CLI_TIMEOUT_MS", timing_defaults.cli_timeout)?,
            ssh_connect_timeout_secs: parse_u32_env(
                "RUNPOD_SSH_CONNECT_TIMEOUT_S",
                timing_defaults.ssh_connect_timeout_secs,
            )?,
            probe_timeout: parse_ms_env("RUNPOD_PROBE_TIMEOUT_MS", timing_defaults.probe_timeout)?,
            transfer_timeout: parse_ms_env(
                "RUNPOD_TRANSFER_TIMEOUT_MS",
                timing_defaults.transfer_timeout,
            )?,
            poll_interval: parse_ms_env("RUNPOD_POLL_INTERVAL_MS", timing_defaults.poll_interval)?,
            create_ready_timeout: parse_ms_env(
                "RUNPOD_CREATE_READY_TIMEOUT_MS",
                timing_defaults.create_ready_timeout,
            )?,
            start_ready_timeout: parse_ms_env(
                "RUNPOD_START_READY_TIMEOUT_MS",
                timing_defaults.start_ready_timeout,
            )?,
            start_resolve_attempts: parse_u32_env(
                "RUNPOD_START_RESOLVE_ATTEMPTS",
                timing_defaults.start_resolve_attempts,
            )?,
            start_resolve_interval: parse_ms_env(
                "RUNPOD_START_RESOLVE_INTERVAL_MS",
                timing_defaults.start_resolve_interval,
            )?,
            sync_resolve_attempts: parse_u32_env(
                "RUNPOD_SYNC_RESOLVE_ATTEMPTS",
                timing_defaults.sync_resolve_attempts,
            )?,
            sync_resolve_interval: parse_ms_env(
                "RUNPOD_SYNC_RESOLVE_INTERVAL_MS",
                timing_defaults.sync_resolve_interval,
            )?,
        };

        Ok(Self {
            api_key,
            graphql_url: env_or("RUNPOD_GRAPHQL_URL", &defaults.graphql_url),
            settings_path: env::var_os("RUNPOD_SETTINGS_PATH")
                .map_or(defaults.settings_path, PathBuf::from),
            backup_dir: env::var_os("RUNPOD_BACKUP_DIR")
                .map_or(defaults.backup_dir, PathBuf::from),
            runpodctl_bin: env_or("RUNPODCTL_BIN", &defaults.runpodctl_bin),
            ssh_key_path: env::var("SSH_KEY_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map_or(defaults.ssh_key_path, |v| expand_tilde(v.trim())),
            tunnel_host: env_or("RUNPOD_SSH_TUNNEL_HOST", &defaults.tunnel_host),
            superuser: env_or("RUNPOD_SSH_USER", &defaults.superuser),
            pod,
            timing,
            allow_guessed_username: parse_bool_env("RUNPOD_ALLOW_GUESSED_SSH_USER", false),
        })
    }

    /// GPU types to try for `create`, requested type first.
    #[must_use]
    pub fn gpu_chain(&self, requested: &str) -> Vec<String> {
        let mut chain = vec![requested.to_string()];
        chain.extend(
            self.pod
                .gpu_fallbacks
                .iter()
                .filter(|gpu| gpu.as_str() != requested)
                .cloned(),
        );
        chain
    }
}

/// Expand a leading `~` using `HOME` (or `USERPROFILE`).
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    let Some(rest) = path.strip_prefix('~') else {
        return path.to_string();
    };
    let home = env::var("HOME").or_else(|_| env::var("USERPROFILE"));
    match home {
        Ok(home) if rest.is_empty() || rest.starts_with('/') => format!("{home}{rest}"),
        _ => path.to_string(),
    }
}

fn must_env(key: &'static str) -> Result<String> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(PodError::MissingEnv(key))
}

fn env_or(key: &'static str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_u32_env(key: &'static str, default: u32) -> Result<u32> {
    env::var(key).map_or_else(
        |_| Ok(default),
        |v| {
            v.trim().parse::<u32>().map_err(|_| PodError::InvalidEnv {
                key,
                value: v,
                reason: "expected an unsigned integer",
            })
        },
    )
}

fn parse_ms_env(key: &'static str, default: Duration) -> Result<Duration> {
    env::var(key).map_or_else(
        |_| Ok(default),
        |v| {
            v.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| PodError::InvalidEnv {
                    key,
                    value: v,
                    reason: "expected milliseconds as an unsigned integer",
                })
        },
    )
}

fn parse_bool_env(key: &'static str, default: bool) -> bool {
    env::var(key).map_or(default, |v| {
        matches!(v.to_lowercase().as_str(), "true" | "1" | "yes")
    })
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
