//! RunPod Node Manager - lifecycle management for a single `RunPod` GPU pod.
//!
//! A library (and CLI) that keeps one rented pod and its node credentials alive:
//! - **Lifecycle**: create with GPU fallback, start, stop, terminate via `runpodctl`
//! - **Readiness**: poll until RUNNING or a terminal failure
//! - **Connection discovery**: find the pod's current SSH endpoint and validate it
//! - **Backup / restore**: move the credential files between the pod and local disk,
//!   then restart the node
//!
//! ## Quick Start
//!
//! All configuration is loaded from environment variables. Create a `.env` file:
//!
//! ```text
//! RUNPOD_API_KEY=your_api_key_here
//! SSH_KEY_PATH=~/.ssh/id_ed25519
//! RUNPOD_BACKUP_DIR=/root/gensyn/backup
//! ```
//!
//! Then drive the orchestrator:
//!
//! ```ignore
//! use std::sync::Arc;
//! use runpod_node_manager::{AssumeYes, Collaborators, ManagerConfig, RunpodOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = ManagerConfig::from_env()?;
//!     let deps = Collaborators::system(&cfg, Arc::new(AssumeYes));
//!     let manager = RunpodOrchestrator::new(cfg, deps);
//!
//!     let pod_id = manager.current_pod_id().await?;
//!     let report = manager.start(&pod_id).await?;
//!     println!("restore: {:?}", report.restore);
//!     Ok(())
//! }
//! ```

// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Hygiene (warnings)
#![warn(missing_docs)]                // All public items should be documented
#![warn(dead_code)]                   // Unused code
#![warn(unused_imports)]              // Unused imports
#![warn(unused_variables)]            // Unused variables

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Modules
// ============================================================================

/// Core pod and connection types.
pub mod runpod_types;

/// Error taxonomy and remediation hints.
pub mod runpod_error;

/// Process-wide configuration loaded once from the environment.
pub mod runpod_config;

/// Subprocess execution with captured output and timeouts.
pub mod runpod_exec;

/// Control plane access over the `runpodctl` CLI.
///
/// Use this module to create, start, stop, remove and inspect pods.
pub mod runpod_ctl;

/// Remote shell, file copy and SSH key provisioning.
pub mod runpod_ssh;

/// Settings file and pod snapshot persistence.
pub mod runpod_state;

/// Last known good SSH endpoint per pod.
pub mod runpod_cache;

/// SSH endpoint discovery and validation.
pub mod runpod_resolver;

/// Readiness polling.
pub mod runpod_waiter;

/// Backup and restore of the credential manifest.
pub mod runpod_sync;

/// GraphQL client used for listing pods.
pub mod runpod_client;

/// High-level pod lifecycle.
///
/// Use this module for create/start/stop/terminate with automatic backup and restore.
pub mod runpod_orchestrator;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use runpod_cache::{CachedEndpointRecord, EndpointCache};
pub use runpod_client::{PodListing, RunpodClient, RunpodClientConfig};
pub use runpod_config::ManagerConfig;
pub use runpod_ctl::{ControlPlane, CreatePodRequest, RunpodCtl};
pub use runpod_error::{PodError, Result};
pub use runpod_exec::{CommandOutput, CommandRunner, ProcessRunner};
pub use runpod_orchestrator::{
    AssumeYes, Collaborators, Confirmation, CreateOptions, RunpodOrchestrator, StartRestore,
    StopBackup,
};
pub use runpod_resolver::{CacheMode, ConnectionResolver, Resolution, ResolvePolicy};
pub use runpod_ssh::{RemoteShell, SshShell};
pub use runpod_state::{EnvFileStore, PodSnapshotStore, SettingsStore};
pub use runpod_sync::{BackupManifest, FileSyncEngine, ManifestEntry, RestartScript, RestoreOutcome};
pub use runpod_types::{ConnectionEndpoint, DiscoverySource, PodDetail, PodId, PodStatus, TransportKind};
pub use runpod_waiter::ReadinessWaiter;
