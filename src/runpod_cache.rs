//! Endpoint cache.
//!
//! The last validated SSH endpoint, keyed by pod identity, lives in the
//! settings file next to user-level keys. Pod-level keys come and go; the
//! key-file path is user-level and is never removed here.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::runpod_config::expand_tilde;
use crate::runpod_error::Result;
use crate::runpod_state::SettingsStore;
use crate::runpod_types::{ConnectionEndpoint, PodId, TransportKind};

/// Cached pod identity.
pub const KEY_POD_ID: &str = "POD_ID";
/// Cached login user.
pub const KEY_SSH_USERNAME: &str = "SSH_USERNAME";
/// Cached host.
pub const KEY_SSH_HOST: &str = "SSH_HOST";
/// Cached port.
pub const KEY_SSH_PORT: &str = "SSH_PORT";
/// Cached transport kind (`direct` | `tunnel`).
pub const KEY_SSH_TRANSPORT: &str = "SSH_TRANSPORT";
/// User-level private key path.
pub const KEY_SSH_KEY_PATH: &str = "SSH_KEY_PATH";

const CONNECTION_KEYS: [&str; 4] = [KEY_SSH_USERNAME, KEY_SSH_HOST, KEY_SSH_PORT, KEY_SSH_TRANSPORT];

/// A previously validated endpoint and the pod it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEndpointRecord {
    /// Owning pod.
    pub pod_id: PodId,
    /// Endpoint as stored. `validated_at_ms` is always `None` on read.
    pub endpoint: ConnectionEndpoint,
}

/// Endpoint cache over a `SettingsStore`.
#[derive(Clone)]
pub struct EndpointCache {
    store: Arc<dyn SettingsStore>,
    tunnel_host: String,
    default_key_path: String,
}

impl EndpointCache {
    /// Create a cache. `tunnel_host` is used to infer the transport of
    /// records written without `SSH_TRANSPORT`.
    #[must_use]
    pub fn new(
        store: Arc<dyn SettingsStore>,
        tunnel_host: impl Into<String>,
        default_key_path: impl Into<String>,
    ) -> Self {
        Self {
            store,
            tunnel_host: tunnel_host.into(),
            default_key_path: default_key_path.into(),
        }
    }

    /// Cached record for `pod_id`, if the stored identity matches and the
    /// stored fields form a complete endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file cannot be read.
    pub fn get(&self, pod_id: &PodId) -> Result<Option<CachedEndpointRecord>> {
        let map = self.store.load()?;
        let value = |k: &str| map.get(k).map(|v| v.trim()).filter(|v| !v.is_empty());

        if value(KEY_POD_ID) != Some(pod_id.as_str()) {
            return Ok(None);
        }
        let (Some(host), Some(username), Some(port_raw)) =
            (value(KEY_SSH_HOST), value(KEY_SSH_USERNAME), value(KEY_SSH_PORT))
        else {
            return Ok(None);
        };
        let Ok(port) = port_raw.parse::<u16>() else {
            warn!(port = port_raw, "ignoring cached endpoint with invalid port");
            return Ok(None);
        };

        let transport = value(KEY_SSH_TRANSPORT)
            .and_then(TransportKind::parse)
            .unwrap_or_else(|| self.infer_transport(host));

        Ok(Some(CachedEndpointRecord {
            pod_id: pod_id.clone(),
            endpoint: ConnectionEndpoint {
                transport,
                host: host.to_string(),
                port,
                username: username.to_string(),
                key_path: value(KEY_SSH_KEY_PATH).map_or_else(|| self.default_key_path.clone(), expand_tilde),
                validated_at_ms: None,
            },
        }))
    }

    /// Persist `endpoint` as the record for `pod_id` (one atomic rewrite).
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file cannot be rewritten.
    pub fn put(&self, pod_id: &PodId, endpoint: &ConnectionEndpoint) -> Result<()> {
        let mut updates = vec![
            (KEY_POD_ID, pod_id.to_string()),
            (KEY_SSH_USERNAME, endpoint.username.clone()),
            (KEY_SSH_HOST, endpoint.host.clone()),
            (KEY_SSH_PORT, endpoint.port.to_string()),
            (KEY_SSH_TRANSPORT, endpoint.transport.as_str().to_string()),
        ];
        if self.store.get(KEY_SSH_KEY_PATH)?.is_none() {
            updates.push((KEY_SSH_KEY_PATH, endpoint.key_path.clone()));
        }
        self.store.merge(&updates)?;
        debug!(pod_id = %pod_id, host = %endpoint.host, port = endpoint.port, "endpoint cached");
        Ok(())
    }

    /// Drop the cached identity and connection for `pod_id`.
    ///
    /// A record that belongs to another pod is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file cannot be rewritten.
    pub fn invalidate(&self, pod_id: &PodId) -> Result<()> {
        match self.saved_pod_id()? {
            Some(saved) if saved != *pod_id => {
                debug!(pod_id = %pod_id, saved = %saved, "cache holds another pod; not invalidating");
                Ok(())
            }
            _ => {
                info!(pod_id = %pod_id, "invalidating cached endpoint");
                self.clear()
            }
        }
    }

    /// Remove every pod-level key regardless of owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file cannot be rewritten.
    pub fn clear(&self) -> Result<()> {
        let mut keys = vec![KEY_POD_ID];
        keys.extend(CONNECTION_KEYS);
        self.store.remove(&keys)
    }

    /// Record `pod_id` as the managed pod. Switching identities drops the
    /// previous pod's connection keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file cannot be read or rewritten.
    pub fn remember_pod(&self, pod_id: &PodId) -> Result<()> {
        let previous = self.saved_pod_id()?;
        if previous.as_ref() == Some(pod_id) {
            return Ok(());
        }
        if previous.is_some() {
            self.store.remove(&CONNECTION_KEYS)?;
        }
        self.store.merge(&[(KEY_POD_ID, pod_id.to_string())])
    }

    /// Identity currently saved, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings file cannot be read.
    pub fn saved_pod_id(&self) -> Result<Option<PodId>> {
        Ok(self.store.get(KEY_POD_ID)?.map(|v| PodId::new(v.trim())))
    }

    fn infer_transport(&self, host: &str) -> TransportKind {
        if host.eq_ignore_ascii_case(&self.tunnel_host) {
            TransportKind::Tunnel
        } else {
            TransportKind::Direct
        }
    }
}
