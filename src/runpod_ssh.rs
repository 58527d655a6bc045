//! Remote shell and file copy over OpenSSH.
//!
//! `RemoteShell` is the seam the resolver and the sync engine talk to.
//! `SshShell` shells out to `ssh`/`scp` through a `CommandRunner`; file copy
//! refuses tunnel endpoints before spawning anything.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::runpod_error::{PodError, Result};
use crate::runpod_exec::{CommandOutput, CommandRunner};
use crate::runpod_types::ConnectionEndpoint;

/// Command sent by the canary probe.
pub const CANARY_COMMAND: &str = "echo SSH_OK";
/// Token the canary output must contain.
pub const CANARY_TOKEN: &str = "SSH_OK";

/// Single-command remote execution and file copy.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run one command on the endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if ssh cannot be spawned or exceeds `timeout`.
    async fn exec(
        &self,
        endpoint: &ConnectionEndpoint,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Copy `remote` on the pod to `local`.
    ///
    /// # Errors
    ///
    /// `Capability` for tunnel endpoints, `Transfer` when the copy fails.
    async fn download(
        &self,
        endpoint: &ConnectionEndpoint,
        remote: &str,
        local: &Path,
        timeout: Duration,
    ) -> Result<()>;

    /// Copy `local` to `remote` on the pod.
    ///
    /// # Errors
    ///
    /// `Capability` for tunnel endpoints, `Transfer` when the copy fails.
    async fn upload(
        &self,
        endpoint: &ConnectionEndpoint,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<()>;
}

/// `RemoteShell` backed by the OpenSSH client binaries.
pub struct SshShell {
    runner: Arc<dyn CommandRunner>,
    connect_timeout_secs: u32,
}

impl SshShell {
    /// Create a shell with the given `ConnectTimeout` (seconds).
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>, connect_timeout_secs: u32) -> Self {
        Self {
            runner,
            connect_timeout_secs,
        }
    }

    fn common_opts(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ]
    }

    fn scp_args(&self, endpoint: &ConnectionEndpoint, from: String, to: String) -> Vec<String> {
        let mut args = self.common_opts();
        args.extend([
            "-P".into(),
            endpoint.port.to_string(),
            "-i".into(),
            endpoint.key_path.clone(),
            from,
            to,
        ]);
        args
    }

    async fn copy(&self, endpoint: &ConnectionEndpoint, args: Vec<String>, file: &str, timeout: Duration) -> Result<()> {
        if !endpoint.transport.supports_file_copy() {
            return Err(PodError::Capability {
                host: endpoint.host.clone(),
            });
        }
        let out = self
            .runner
            .run("scp", &args, timeout)
            .await
            .map_err(|e| PodError::Transfer {
                file: file.to_string(),
                message: e.to_string(),
            })?;
        if !out.success() {
            return Err(PodError::Transfer {
                file: file.to_string(),
                message: out.failure_message(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(
        &self,
        endpoint: &ConnectionEndpoint,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut args = self.common_opts();
        args.extend([
            "-p".into(),
            endpoint.port.to_string(),
            "-i".into(),
            endpoint.key_path.clone(),
            endpoint.destination(),
            command.to_string(),
        ]);
        self.runner.run("ssh", &args, timeout).await
    }

    async fn download(
        &self,
        endpoint: &ConnectionEndpoint,
        remote: &str,
        local: &Path,
        timeout: Duration,
    ) -> Result<()> {
        debug!(remote, local = %local.display(), "downloading");
        let args = self.scp_args(
            endpoint,
            format!("{}:{remote}", endpoint.destination()),
            local.display().to_string(),
        );
        self.copy(endpoint, args, remote, timeout).await
    }

    async fn upload(
        &self,
        endpoint: &ConnectionEndpoint,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<()> {
        debug!(local = %local.display(), remote, "uploading");
        let args = self.scp_args(
            endpoint,
            local.display().to_string(),
            format!("{}:{remote}", endpoint.destination()),
        );
        self.copy(endpoint, args, remote, timeout).await
    }
}

/// Run the canary command and require its token in stdout.
///
/// Any failure (spawn error, timeout, refusal, missing token) is `false`.
pub async fn canary_probe(
    shell: &dyn RemoteShell,
    endpoint: &ConnectionEndpoint,
    timeout: Duration,
) -> bool {
    match shell.exec(endpoint, CANARY_COMMAND, timeout).await {
        Ok(out) if out.success() && out.stdout.contains(CANARY_TOKEN) => true,
        Ok(out) => {
            debug!(
                target_host = %endpoint.host,
                port = endpoint.port,
                reason = %out.failure_message(),
                "canary probe rejected"
            );
            false
        }
        Err(e) => {
            debug!(target_host = %endpoint.host, port = endpoint.port, error = %e, "canary probe failed");
            false
        }
    }
}

/// Make sure the key pair at `key_path` exists and return the public key.
///
/// Generates ed25519 when the path mentions it, RSA 4096 otherwise, with an
/// empty passphrase. Returns `None` when the public half cannot be read, so
/// creation can still proceed with the template's own keys.
///
/// # Errors
///
/// Returns an error if `ssh-keygen` cannot be run or the key directory cannot be created.
pub async fn ensure_ssh_key(
    runner: &dyn CommandRunner,
    key_path: &str,
    timeout: Duration,
) -> Result<Option<String>> {
    let private = Path::new(key_path);
    if !private.exists() {
        if let Some(parent) = private.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| PodError::io(parent, e))?;
        }
        info!(key_path, "generating SSH key pair");
        let args = keygen_args(key_path);
        let out = runner.run("ssh-keygen", &args, timeout).await?;
        if !out.success() {
            warn!(key_path, error = %out.failure_message(), "ssh-keygen failed");
        }
    }

    let public = format!("{key_path}.pub");
    match std::fs::read_to_string(&public) {
        Ok(text) => Ok(Some(text.trim().to_string())),
        Err(e) => {
            warn!(path = %public, error = %e, "public key unavailable");
            Ok(None)
        }
    }
}

fn keygen_args(key_path: &str) -> Vec<String> {
    let mut args: Vec<String> = if key_path.contains("ed25519") {
        vec!["-t".into(), "ed25519".into()]
    } else {
        vec!["-t".into(), "rsa".into(), "-b".into(), "4096".into()]
    };
    args.extend([
        "-f".into(),
        key_path.to_string(),
        "-N".into(),
        String::new(),
        "-q".into(),
    ]);
    args
}
