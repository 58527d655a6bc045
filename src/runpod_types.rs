//! Core pod and connection types.
//!
//! Everything the control plane or SSH side hands back is parsed into these
//! types at the boundary; raw CLI text never travels deeper than
//! `runpod_ctl` / `runpod_resolver`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Newtype for `PodId` (avoids confusion with arbitrary strings).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodId(String);

impl PodId {
    /// Create a new `PodId` from a string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the string representation of the `PodId`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty after trimming.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PodId").field(&self.0).finish()
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Pod status as reported by the control plane.
///
/// `Unknown` is the safe default when no recognised token shows up.
/// `NotFound` means the identity no longer exists, which is different from `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PodStatus {
    /// Created, waiting for a machine.
    Pending,
    /// Container is booting.
    Starting,
    /// Pod is running.
    Running,
    /// Stop in progress.
    Stopping,
    /// Pod is stopped.
    Stopped,
    /// Pod has exited (stopped, storage kept).
    Exited,
    /// Pod has been terminated.
    Terminated,
    /// Pod failed.
    Failed,
    /// Account ran out of credit.
    OutOfCredit,
    /// Status could not be determined.
    Unknown,
    /// Pod does not exist at the control plane.
    NotFound,
}

impl PodStatus {
    /// Statuses that end a readiness wait without further polling.
    #[must_use]
    pub const fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            Self::Exited | Self::Terminated | Self::Failed | Self::OutOfCredit
        )
    }

    /// Statuses after which any cached connection state is meaningless.
    #[must_use]
    pub const fn invalidates_cache(self) -> bool {
        matches!(self, Self::NotFound | Self::Terminated)
    }

    /// Upper-case label, as printed by the control plane.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Exited => "EXITED",
            Self::Terminated => "TERMINATED",
            Self::Failed => "FAILED",
            Self::OutOfCredit => "OUT_OF_CREDIT",
            Self::Unknown => "UNKNOWN",
            Self::NotFound => "NOT_FOUND",
        }
    }
}

impl fmt::Display for PodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Typed view of one `get pod` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodDetail {
    /// Pod ID.
    pub id: PodId,
    /// Parsed status.
    pub status: PodStatus,
    /// Column values keyed by lower-cased header, when the table parsed cleanly.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl PodDetail {
    /// Detail for a pod the control plane does not know about.
    #[must_use]
    pub fn not_found(id: PodId) -> Self {
        Self {
            id,
            status: PodStatus::NotFound,
            fields: BTreeMap::new(),
        }
    }

    /// Pod name column, if present.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.fields.get("name").map(String::as_str)
    }
}

/// How the SSH endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Public IP:port forwarded to the pod's port 22. Supports file copy.
    Direct,
    /// Relay host with an encoded username. Shell only, no file copy.
    Tunnel,
}

impl TransportKind {
    /// Whether scp works over this transport.
    #[must_use]
    pub const fn supports_file_copy(self) -> bool {
        matches!(self, Self::Direct)
    }

    /// Settings-file representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Tunnel => "tunnel",
        }
    }

    /// Parse the settings-file representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "direct" | "direct_tcp" | "tcp" => Some(Self::Direct),
            "tunnel" => Some(Self::Tunnel),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A complete SSH endpoint. All fields come from one discovery source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEndpoint {
    /// Transport kind.
    pub transport: TransportKind,
    /// Host name or IP.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Private key file.
    pub key_path: String,
    /// When a canary probe last succeeded in this process (ms since epoch).
    /// `None` for endpoints read back from disk and not yet probed.
    pub validated_at_ms: Option<u64>,
}

impl ConnectionEndpoint {
    /// Same host, port, user, key and transport (ignores validation time).
    #[must_use]
    pub fn same_target(&self, other: &Self) -> bool {
        self.transport == other.transport
            && self.host == other.host
            && self.port == other.port
            && self.username == other.username
            && self.key_path == other.key_path
    }

    /// Whether a canary probe succeeded for this value.
    #[must_use]
    pub const fn is_validated(&self) -> bool {
        self.validated_at_ms.is_some()
    }

    /// `user@host`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    /// Copy-pasteable interactive ssh command.
    #[must_use]
    pub fn ssh_command(&self) -> String {
        format!(
            "ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null {} -p {} -i {}",
            self.destination(),
            self.port,
            self.key_path
        )
    }
}

/// Which discovery strategy produced an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    /// `HOST:PORT->22` in the pod detail text.
    DirectTcp,
    /// `POD_ID-HEX@TUNNELHOST` in the pod detail text.
    LegacyTunnel,
    /// Last known good record from the settings file.
    Cache,
    /// Synthesised `POD_ID-xxxxx` placeholder; never probed.
    Guessed,
}

impl DiscoverySource {
    /// Low-confidence sources are returned without a probe.
    #[must_use]
    pub const fn is_low_confidence(self) -> bool {
        matches!(self, Self::Guessed)
    }
}
