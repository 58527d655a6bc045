//! Control plane access through the `runpodctl` CLI.
//!
//! Unique responsibility: turn `runpodctl` invocations and their free-text
//! output into typed answers (`PodDetail`, `PodId`). Nothing here retries;
//! transient failures surface as `PodError::ControlPlane` and the caller's own
//! loop decides what to do.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::runpod_error::{PodError, Result};
use crate::runpod_exec::{CommandOutput, CommandRunner, display_command};
use crate::runpod_types::{PodDetail, PodId, PodStatus};

/// Status tokens in precedence order. The first one present wins.
const STATUS_TOKENS: &[(&str, PodStatus)] = &[
    ("OUT_OF_CREDIT", PodStatus::OutOfCredit),
    ("FAILED", PodStatus::Failed),
    ("TERMINATED", PodStatus::Terminated),
    ("EXITED", PodStatus::Exited),
    ("STOPPING", PodStatus::Stopping),
    ("STOPPED", PodStatus::Stopped),
    ("STARTING", PodStatus::Starting),
    ("PENDING", PodStatus::Pending),
    ("CREATED", PodStatus::Pending),
    ("RUNNING", PodStatus::Running),
    ("READY", PodStatus::Running),
];

/// Pod IDs assigned by the control plane are at least this long.
const MIN_POD_ID_LEN: usize = 12;

/// Parameters for `runpodctl create pod`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePodRequest {
    /// Pod name.
    pub name: String,
    /// GPU type (e.g., "NVIDIA `GeForce` RTX 4090").
    pub gpu_type: String,
    /// Template ID.
    pub template_id: String,
    /// Container image.
    pub image: String,
    /// Volume size in GB.
    pub volume_gb: u32,
    /// Container disk size in GB.
    pub container_disk_gb: u32,
    /// Secure cloud instead of community cloud.
    pub secure_cloud: bool,
    /// Public key injected as `PUBLIC_KEY` so the pod accepts our SSH key.
    pub public_key: Option<String>,
}

impl CreatePodRequest {
    /// Same request with another GPU type.
    #[must_use]
    pub fn with_gpu(&self, gpu_type: &str) -> Self {
        Self {
            gpu_type: gpu_type.to_string(),
            ..self.clone()
        }
    }

    fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "pod".into(),
            "--name".into(),
            self.name.clone(),
            "--templateId".into(),
            self.template_id.clone(),
            "--gpuType".into(),
            self.gpu_type.clone(),
            "--imageName".into(),
            self.image.clone(),
        ];
        args.push(if self.secure_cloud {
            "--secureCloud".into()
        } else {
            "--communityCloud".into()
        });
        if self.volume_gb > 0 {
            args.push("--volumeSize".into());
            args.push(self.volume_gb.to_string());
        }
        if self.container_disk_gb > 0 {
            args.push("--containerDiskSize".into());
            args.push(self.container_disk_gb.to_string());
        }
        if let Some(key) = self.public_key.as_deref().filter(|k| !k.trim().is_empty()) {
            args.push("--env".into());
            args.push(format!("PUBLIC_KEY={}", key.trim()));
        }
        args
    }
}

/// Operations the lifecycle needs from the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Current status. A missing pod is `Ok` with `PodStatus::NotFound`.
    ///
    /// # Errors
    ///
    /// Returns an error when the CLI call itself fails (transient).
    async fn pod_status(&self, pod_id: &PodId) -> Result<PodDetail>;

    /// Full detail text (`get pod <id> -a`) used for endpoint discovery.
    ///
    /// # Errors
    ///
    /// Returns an error on non-zero exit or timeout.
    async fn pod_connection_text(&self, pod_id: &PodId) -> Result<String>;

    /// Create a pod and return its new identity.
    ///
    /// # Errors
    ///
    /// Returns an error if creation is rejected or the ID cannot be read back.
    async fn create_pod(&self, request: &CreatePodRequest) -> Result<PodId>;

    /// Start (resume) a pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the CLI call fails.
    async fn start_pod(&self, pod_id: &PodId) -> Result<()>;

    /// Stop a pod, keeping its volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the CLI call fails.
    async fn stop_pod(&self, pod_id: &PodId) -> Result<()>;

    /// Terminate (remove) a pod.
    ///
    /// # Errors
    ///
    /// Returns an error if the CLI call fails.
    async fn remove_pod(&self, pod_id: &PodId) -> Result<()>;

    /// IDs of the account's pods, in listing order.
    ///
    /// # Errors
    ///
    /// Returns an error if the CLI call fails.
    async fn list_pod_ids(&self) -> Result<Vec<PodId>>;
}

/// `ControlPlane` implemented over the `runpodctl` binary.
pub struct RunpodCtl {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout: Duration,
}

impl RunpodCtl {
    /// Create a new CLI wrapper.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<(String, CommandOutput)> {
        let line = display_command(&self.binary, &args);
        let out = self.runner.run(&self.binary, &args, self.timeout).await?;
        Ok((line, out))
    }

    async fn run_checked(&self, args: Vec<String>) -> Result<String> {
        let (line, out) = self.run(args).await?;
        if !out.success() {
            return Err(PodError::ControlPlane {
                command: line,
                message: out.failure_message(),
            });
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl ControlPlane for RunpodCtl {
    async fn pod_status(&self, pod_id: &PodId) -> Result<PodDetail> {
        let (line, out) = self
            .run(vec!["get".into(), "pod".into(), pod_id.to_string()])
            .await?;

        if !out.success() {
            if is_not_found_message(&out.stderr) || is_not_found_message(&out.stdout) {
                info!(pod_id = %pod_id, "pod not found at control plane");
                return Ok(PodDetail::not_found(pod_id.clone()));
            }
            return Err(PodError::ControlPlane {
                command: line,
                message: out.failure_message(),
            });
        }

        let detail = parse_pod_detail(&out.stdout, pod_id);
        debug!(pod_id = %pod_id, status = %detail.status, "pod status");
        Ok(detail)
    }

    async fn pod_connection_text(&self, pod_id: &PodId) -> Result<String> {
        self.run_checked(vec![
            "get".into(),
            "pod".into(),
            pod_id.to_string(),
            "-a".into(),
        ])
        .await
    }

    async fn create_pod(&self, request: &CreatePodRequest) -> Result<PodId> {
        info!(gpu = %request.gpu_type, name = %request.name, "creating pod");
        let args = request.to_args();
        let line = display_command(&self.binary, &args);
        let stdout = self.run_checked(args).await?;
        parse_created_pod_id(&stdout).ok_or_else(|| PodError::ControlPlane {
            command: line,
            message: format!("pod created but no id found in output: {}", stdout.trim()),
        })
    }

    async fn start_pod(&self, pod_id: &PodId) -> Result<()> {
        info!(pod_id = %pod_id, "starting pod");
        self.run_checked(vec!["start".into(), "pod".into(), pod_id.to_string()])
            .await
            .map(drop)
    }

    async fn stop_pod(&self, pod_id: &PodId) -> Result<()> {
        info!(pod_id = %pod_id, "stopping pod");
        self.run_checked(vec!["stop".into(), "pod".into(), pod_id.to_string()])
            .await
            .map(drop)
    }

    async fn remove_pod(&self, pod_id: &PodId) -> Result<()> {
        info!(pod_id = %pod_id, "removing pod");
        self.run_checked(vec!["remove".into(), "pod".into(), pod_id.to_string()])
            .await
            .map(drop)
    }

    async fn list_pod_ids(&self) -> Result<Vec<PodId>> {
        let stdout = self.run_checked(vec!["get".into(), "pod".into()]).await?;
        let ids = parse_pod_rows(&stdout);
        if ids.is_empty() {
            warn!("no pods in runpodctl listing");
        }
        Ok(ids)
    }
}

/// Parse `runpodctl get pod <id>` output.
///
/// Output that does not mention the pod at all means the pod is gone.
#[must_use]
pub fn parse_pod_detail(output: &str, pod_id: &PodId) -> PodDetail {
    if pod_id.is_empty() || !output.contains(pod_id.as_str()) {
        return PodDetail::not_found(pod_id.clone());
    }

    let mut detail = PodDetail {
        id: pod_id.clone(),
        status: parse_status(output),
        fields: std::collections::BTreeMap::new(),
    };

    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    if let (Some(header), Some(values)) = (lines.next(), lines.next()) {
        let headers: Vec<&str> = header.split_whitespace().collect();
        let cells: Vec<&str> = values.split_whitespace().collect();
        if headers.len() == cells.len() {
            for (h, v) in headers.iter().zip(cells) {
                detail.fields.insert(h.to_lowercase(), v.to_string());
            }
        }
    }

    detail
}

/// First recognised status token in free text, `Unknown` otherwise.
#[must_use]
pub fn parse_status(output: &str) -> PodStatus {
    let tokens: Vec<String> = output
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_ascii_uppercase)
        .collect();

    STATUS_TOKENS
        .iter()
        .find(|(token, _)| tokens.iter().any(|t| t == token))
        .map_or(PodStatus::Unknown, |(_, status)| *status)
}

/// Whether CLI error text says the pod does not exist.
#[must_use]
pub fn is_not_found_message(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("not found") || lower.contains("does not exist")
}

/// Extract the ID from `pod "<ID>" created for $X.XX / hr`.
#[must_use]
pub fn parse_created_pod_id(output: &str) -> Option<PodId> {
    let re = Regex::new(r#"pod "([^"]+)" created"#).ok()?;
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| PodId::new(m.as_str()))
}

/// Pod IDs from a `runpodctl get pod` table (header row skipped).
#[must_use]
pub fn parse_pod_rows(output: &str) -> Vec<PodId> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .filter(|id| id.len() >= MIN_POD_ID_LEN && !id.starts_with('-'))
        .map(PodId::new)
        .collect()
}
