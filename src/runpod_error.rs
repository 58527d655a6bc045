//! Error taxonomy for pod management.
//!
//! Every variant knows which command the operator should run next
//! (`PodError::remediation`). Partial restores are not errors; see
//! `runpod_sync::RestoreOutcome`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::runpod_types::{PodId, PodStatus};

/// Binary name used in remediation hints.
pub const BIN_NAME: &str = "runpod_node_manager";

/// Crate result type.
pub type Result<T> = std::result::Result<T, PodError>;

/// Errors raised by pod management operations.
#[derive(Debug, Error)]
pub enum PodError {
    /// Missing required environment variable.
    #[error("missing required env var: {0}")]
    MissingEnv(&'static str),

    /// Invalid environment variable value.
    #[error("invalid env var {key}={value:?}: {reason}")]
    InvalidEnv {
        /// The environment variable key.
        key: &'static str,
        /// The offending value.
        value: String,
        /// The reason for invalidity.
        reason: &'static str,
    },

    /// No pod identity is saved or discoverable.
    #[error("no pod id found")]
    MissingPodId,

    /// A control plane CLI call failed. Retried by callers, never by the primitive.
    #[error("control plane command `{command}` failed: {message}")]
    ControlPlane {
        /// Command line that failed.
        command: String,
        /// stderr or parse failure.
        message: String,
    },

    /// A subprocess could not be spawned.
    #[error("failed to run `{program}`: {source}")]
    CommandSpawn {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A subprocess exceeded its timeout and was killed.
    #[error("`{program}` timed out after {timeout:?}")]
    CommandTimeout {
        /// Program name.
        program: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The pod identity no longer exists.
    #[error("pod {0} no longer exists")]
    NotFound(PodId),

    /// No discovery strategy produced a validated SSH endpoint.
    #[error("could not resolve a working SSH endpoint for pod {pod_id} after {attempts} attempt(s)")]
    Resolution {
        /// Pod ID.
        pod_id: PodId,
        /// Attempts made.
        attempts: u32,
    },

    /// File copy requested over a transport that cannot do it.
    #[error(
        "file transfer is not supported over the SSH tunnel ({host}); a direct TCP endpoint (IP:PORT->22) is required"
    )]
    Capability {
        /// Tunnel host.
        host: String,
    },

    /// The pod is not in the status the operation needs.
    #[error("pod {pod_id} is not running (status: {status})")]
    NotRunning {
        /// Pod ID.
        pod_id: PodId,
        /// Observed status.
        status: PodStatus,
    },

    /// Local backup files needed for restore are absent.
    #[error("missing backup files: {}", .0.join(", "))]
    MissingBackupFiles(Vec<String>),

    /// An endpoint was used for transfer without a probe in this run.
    #[error("SSH endpoint {0} has not been validated by a live probe")]
    Unvalidated(String),

    /// A single file copy failed.
    #[error("transfer of {file} failed: {message}")]
    Transfer {
        /// Remote or local path being copied.
        file: String,
        /// Failure detail.
        message: String,
    },

    /// Readiness wait ran out of time.
    #[error("timed out after {timeout:?} waiting for pod {pod_id} to be ready")]
    ReadyTimeout {
        /// Pod ID.
        pod_id: PodId,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The pod reached a status it cannot recover from within one wait.
    #[error("pod {pod_id} failed to start: {status}")]
    TerminalFailure {
        /// Pod ID.
        pod_id: PodId,
        /// Terminal status observed.
        status: PodStatus,
    },

    /// Every GPU tier in the fallback chain was rejected.
    #[error("pod creation failed for every GPU type: {}", .tried.join(", "))]
    CreateFailed {
        /// GPU types tried, in order.
        tried: Vec<String>,
    },

    /// The operator declined the confirmation gate.
    #[error("operation cancelled by user")]
    Cancelled,

    /// Local I/O failure.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings file could not be parsed.
    #[error("settings file {path} is invalid: {message}")]
    Settings {
        /// Settings path.
        path: PathBuf,
        /// Parse failure.
        message: String,
    },

    /// HTTP client error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// API error response.
    #[error("runpod api error: status={status}, body={body}")]
    Api {
        /// HTTP status code.
        status: reqwest::StatusCode,
        /// Response body.
        body: String,
    },

    /// GraphQL error from server.
    #[error("graphql error: {0}")]
    GraphQl(String),
}

impl PodError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the caller's own retry loop may try again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ControlPlane { .. } | Self::CommandTimeout { .. } | Self::Http(_)
        )
    }

    /// Next command for the operator.
    #[must_use]
    pub fn remediation(&self) -> String {
        match self {
            Self::MissingEnv(key) => format!("set {key} in your environment or .env file"),
            Self::InvalidEnv { key, .. } => format!("fix the value of {key} in your .env file"),
            Self::MissingPodId => format!(
                "create a pod with `{BIN_NAME} create` or adopt one with `{BIN_NAME} list`"
            ),
            Self::NotFound(_) => format!("create a new pod with `{BIN_NAME} create`"),
            Self::Resolution { .. } | Self::Unvalidated(_) => format!(
                "run `{BIN_NAME} connect` to refresh the connection, then retry; check the pod's TCP port mapping in the RunPod console"
            ),
            Self::Capability { .. } => format!(
                "expose port 22 as a public TCP port on the pod, then run `{BIN_NAME} connect`"
            ),
            Self::NotRunning { .. } => format!("start the pod with `{BIN_NAME} start`"),
            Self::MissingBackupFiles(_) => {
                format!("run `{BIN_NAME} backup` on a working pod first")
            }
            Self::Transfer { .. } => format!("check connectivity with `{BIN_NAME} connect`, then retry"),
            Self::ReadyTimeout { .. } | Self::TerminalFailure { .. } => {
                format!("inspect the pod with `{BIN_NAME} list` or the RunPod console")
            }
            Self::CreateFailed { .. } => format!(
                "no GPU capacity right now; retry `{BIN_NAME} create` later or pass --gpu with another type"
            ),
            Self::ControlPlane { .. } | Self::CommandSpawn { .. } | Self::CommandTimeout { .. } => {
                "check that runpodctl is installed and configured (`runpodctl config --apiKey <key>`)".to_string()
            }
            Self::Cancelled => format!(
                "run `{BIN_NAME} backup` to retry the backup, or `{BIN_NAME} stop --yes` to stop without it"
            ),
            Self::Io { path, .. } => format!(
                "check permissions on {}, or run `{BIN_NAME} clean` to reset local pod state",
                path.display()
            ),
            Self::Settings { path, .. } => format!(
                "fix or remove the malformed entries in {}, or run `{BIN_NAME} clean`",
                path.display()
            ),
            Self::Json(_) => format!("run `{BIN_NAME} clean` to drop the unreadable pod snapshot"),
            Self::Http(_) | Self::Api { .. } | Self::GraphQl(_) => format!(
                "check RUNPOD_API_KEY and your network, then retry `{BIN_NAME} list`"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_lists_every_name() {
        let err = PodError::MissingBackupFiles(vec!["a.pem".into(), "b.json".into()]);
        assert_eq!(err.to_string(), "missing backup files: a.pem, b.json");
    }

    #[test]
    fn not_found_points_to_create() {
        let err = PodError::NotFound(PodId::new("abc"));
        assert!(err.remediation().contains("create"));
        assert!(!err.is_transient());
    }

    #[test]
    fn control_plane_is_transient() {
        let err = PodError::ControlPlane {
            command: "runpodctl get pod x".into(),
            message: "boom".into(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn every_variant_names_a_next_step() {
        let pod = PodId::new("k3x9q2m1z8w7ab");
        let http = reqwest::Client::new()
            .get("not a url")
            .build()
            .err()
            .unwrap_or_else(|| panic!("invalid url should fail to build"));
        let json = serde_json::from_str::<serde_json::Value>("{")
            .err()
            .unwrap_or_else(|| panic!("truncated json should fail"));

        let all = vec![
            PodError::MissingEnv("RUNPOD_API_KEY"),
            PodError::InvalidEnv {
                key: "RUNPOD_DISK_SIZE",
                value: "big".into(),
                reason: "not a number",
            },
            PodError::MissingPodId,
            PodError::ControlPlane {
                command: "runpodctl get pod".into(),
                message: "boom".into(),
            },
            PodError::CommandSpawn {
                program: "runpodctl".into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            },
            PodError::CommandTimeout {
                program: "ssh".into(),
                timeout: Duration::from_secs(5),
            },
            PodError::NotFound(pod.clone()),
            PodError::Resolution {
                pod_id: pod.clone(),
                attempts: 3,
            },
            PodError::Capability {
                host: "ssh.runpod.io".into(),
            },
            PodError::NotRunning {
                pod_id: pod.clone(),
                status: PodStatus::Stopped,
            },
            PodError::MissingBackupFiles(vec!["swarm.pem".into()]),
            PodError::Unvalidated("root@203.0.113.7:40022".into()),
            PodError::Transfer {
                file: "swarm.pem".into(),
                message: "lost connection".into(),
            },
            PodError::ReadyTimeout {
                pod_id: pod.clone(),
                timeout: Duration::from_secs(300),
            },
            PodError::TerminalFailure {
                pod_id: pod,
                status: PodStatus::Failed,
            },
            PodError::CreateFailed {
                tried: vec!["NVIDIA A40".into()],
            },
            PodError::Cancelled,
            PodError::io("/root/gensyn/backup", std::io::Error::from(std::io::ErrorKind::PermissionDenied)),
            PodError::Json(json),
            PodError::Settings {
                path: PathBuf::from(".env"),
                message: "bad line".into(),
            },
            PodError::Http(http),
            PodError::Api {
                status: reqwest::StatusCode::UNAUTHORIZED,
                body: "unauthorized".into(),
            },
            PodError::GraphQl("x".into()),
        ];

        for err in &all {
            assert!(!err.remediation().trim().is_empty(), "no next step for: {err}");
        }
    }

    #[test]
    fn declined_confirmation_suggests_backup_or_yes() {
        let hint = PodError::Cancelled.remediation();
        assert!(hint.contains("backup"));
        assert!(hint.contains("--yes"));
        assert!(PodError::GraphQl("x".into()).remediation().contains("RUNPOD_API_KEY"));
    }

    #[test]
    fn io_hint_names_the_path() {
        let err = PodError::io("/root/gensyn/backup", std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(err.remediation().contains("/root/gensyn/backup"));
    }
}
