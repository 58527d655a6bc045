//! SSH endpoint discovery.
//!
//! The pod's address changes across restarts and no single channel reports it
//! reliably. Each attempt gathers candidates in a fixed priority order:
//!
//! 1. `HOST:PORT->22` in the pod detail text (direct TCP, supports file copy)
//! 2. `POD_ID-HEX@TUNNELHOST` in the same text (tunnel, shell only)
//! 3. the cached record for this pod
//!
//! and returns the first one that passes a live canary probe. A guessed
//! tunnel user is only ever returned when explicitly enabled, and never probed.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::runpod_cache::EndpointCache;
use crate::runpod_config::ManagerConfig;
use crate::runpod_ctl::ControlPlane;
use crate::runpod_error::{PodError, Result};
use crate::runpod_ssh::{RemoteShell, canary_probe};
use crate::runpod_state::now_unix_ms;
use crate::runpod_types::{ConnectionEndpoint, DiscoverySource, PodId, TransportKind};

/// Port the tunnel relay listens on.
const TUNNEL_PORT: u16 = 22;

/// Whether the cached record may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Probe the cached endpoint first; keep it as the lowest-priority candidate.
    Prefer,
    /// Ignore the cache entirely. Used right after a (re)start.
    Bypass,
}

/// Attempt budget for one `resolve` call.
#[derive(Debug, Clone, Copy)]
pub struct ResolvePolicy {
    /// Attempts before giving up (at least one is always made).
    pub max_attempts: u32,
    /// Delay between attempts.
    pub retry_interval: Duration,
    /// Cache usage.
    pub cache: CacheMode,
}

impl ResolvePolicy {
    /// Policy with the given budget, preferring the cache.
    #[must_use]
    pub const fn new(max_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            max_attempts,
            retry_interval,
            cache: CacheMode::Prefer,
        }
    }

    /// Same budget, cache ignored.
    #[must_use]
    pub const fn bypass_cache(self) -> Self {
        Self {
            cache: CacheMode::Bypass,
            ..self
        }
    }
}

/// A resolved endpoint and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The endpoint. Validated unless `source` is `Guessed`.
    pub endpoint: ConnectionEndpoint,
    /// Discovery strategy that produced it.
    pub source: DiscoverySource,
}

/// Connection resolver.
pub struct ConnectionResolver {
    control: Arc<dyn ControlPlane>,
    shell: Arc<dyn RemoteShell>,
    cache: EndpointCache,
    superuser: String,
    tunnel_host: String,
    key_path: String,
    probe_timeout: Duration,
    allow_guessed_username: bool,
}

impl ConnectionResolver {
    /// Build a resolver from its collaborators and the process configuration.
    #[must_use]
    pub fn new(
        control: Arc<dyn ControlPlane>,
        shell: Arc<dyn RemoteShell>,
        cache: EndpointCache,
        config: &ManagerConfig,
    ) -> Self {
        Self {
            control,
            shell,
            cache,
            superuser: config.superuser.clone(),
            tunnel_host: config.tunnel_host.clone(),
            key_path: config.ssh_key_path.clone(),
            probe_timeout: config.timing.probe_timeout,
            allow_guessed_username: config.allow_guessed_username,
        }
    }

    /// Find a working endpoint for `pod_id` and cache it.
    ///
    /// # Errors
    ///
    /// `PodError::Resolution` when no candidate validates within the budget,
    /// or a settings error if the cache cannot be read or written.
    pub async fn resolve(&self, pod_id: &PodId, policy: ResolvePolicy) -> Result<Resolution> {
        let attempts = policy.max_attempts.max(1);
        let mut cheap_path_probe: Option<ConnectionEndpoint> = None;

        if policy.cache == CacheMode::Prefer
            && let Some(record) = self.cache.get(pod_id)?
        {
            if let Some(endpoint) = self.validate(&record.endpoint).await {
                debug!(pod_id = %pod_id, host = %endpoint.host, "cached endpoint still valid");
                return Ok(Resolution {
                    endpoint,
                    source: DiscoverySource::Cache,
                });
            }
            debug!(pod_id = %pod_id, "cached endpoint failed its probe");
            cheap_path_probe = Some(record.endpoint);
        }

        for attempt in 1..=attempts {
            let mut probed: Vec<ConnectionEndpoint> = Vec::new();
            if attempt == 1 {
                probed.extend(cheap_path_probe.take());
            }

            for (source, candidate) in self.candidates(pod_id, policy.cache).await? {
                if probed.iter().any(|p| p.same_target(&candidate)) {
                    continue;
                }
                debug!(
                    pod_id = %pod_id,
                    attempt,
                    source = ?source,
                    target_host = %candidate.host,
                    port = candidate.port,
                    "probing candidate"
                );
                if let Some(endpoint) = self.validate(&candidate).await {
                    self.cache.put(pod_id, &endpoint)?;
                    info!(
                        pod_id = %pod_id,
                        transport = %endpoint.transport,
                        target_host = %endpoint.host,
                        port = endpoint.port,
                        "SSH endpoint resolved"
                    );
                    return Ok(Resolution { endpoint, source });
                }
                probed.push(candidate);
            }

            if attempt < attempts {
                debug!(pod_id = %pod_id, attempt, "no candidate validated; retrying");
                tokio::time::sleep(policy.retry_interval).await;
            }
        }

        if self.allow_guessed_username {
            let endpoint = self.guessed(pod_id);
            warn!(
                pod_id = %pod_id,
                username = %endpoint.username,
                "discovery exhausted; returning guessed tunnel user (unvalidated)"
            );
            return Ok(Resolution {
                endpoint,
                source: DiscoverySource::Guessed,
            });
        }

        warn!(pod_id = %pod_id, attempts, "SSH endpoint resolution failed");
        Err(PodError::Resolution {
            pod_id: pod_id.clone(),
            attempts,
        })
    }

    /// Canary-probe `endpoint`; on success return a copy stamped as validated now.
    pub async fn validate(&self, endpoint: &ConnectionEndpoint) -> Option<ConnectionEndpoint> {
        if !canary_probe(self.shell.as_ref(), endpoint, self.probe_timeout).await {
            return None;
        }
        Some(ConnectionEndpoint {
            validated_at_ms: Some(now_unix_ms()),
            ..endpoint.clone()
        })
    }

    /// Detail text for `pod_id`, `None` when the control plane has nothing this time.
    async fn detail_text(&self, pod_id: &PodId) -> Result<Option<String>> {
        match self.control.pod_connection_text(pod_id).await {
            Ok(text) if !text.trim().is_empty() => Ok(Some(text)),
            Ok(_) => Ok(None),
            Err(e) if e.is_transient() => {
                debug!(pod_id = %pod_id, error = %e, "no pod detail this attempt");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn candidates(
        &self,
        pod_id: &PodId,
        mode: CacheMode,
    ) -> Result<Vec<(DiscoverySource, ConnectionEndpoint)>> {
        let mut out = Vec::with_capacity(3);
        if let Some(text) = self.detail_text(pod_id).await? {
            if let Some(ep) = parse_direct_tcp(&text, &self.superuser, &self.key_path) {
                out.push((DiscoverySource::DirectTcp, ep));
            }
            if let Some(ep) = parse_legacy_tunnel(&text, pod_id, &self.key_path) {
                out.push((DiscoverySource::LegacyTunnel, ep));
            }
        }
        if mode == CacheMode::Prefer
            && let Some(record) = self.cache.get(pod_id)?
        {
            out.push((DiscoverySource::Cache, record.endpoint));
        }
        Ok(out)
    }

    fn guessed(&self, pod_id: &PodId) -> ConnectionEndpoint {
        ConnectionEndpoint {
            transport: TransportKind::Tunnel,
            host: self.tunnel_host.clone(),
            port: TUNNEL_PORT,
            username: format!("{pod_id}-xxxxx"),
            key_path: self.key_path.clone(),
            validated_at_ms: None,
        }
    }
}

/// First `IPv4:PORT->22` mapping in `text`.
#[must_use]
pub fn parse_direct_tcp(text: &str, superuser: &str, key_path: &str) -> Option<ConnectionEndpoint> {
    let (host, port) = find_port_mapping(text, 22)?;
    Some(ConnectionEndpoint {
        transport: TransportKind::Direct,
        host,
        port,
        username: superuser.to_string(),
        key_path: key_path.to_string(),
        validated_at_ms: None,
    })
}

/// First `POD_ID-HEX@HOST` in `text`; the username is the whole `POD_ID-HEX`.
#[must_use]
pub fn parse_legacy_tunnel(text: &str, pod_id: &PodId, key_path: &str) -> Option<ConnectionEndpoint> {
    if pod_id.is_empty() {
        return None;
    }
    let pattern = format!(
        r"\b({}-[0-9a-fA-F]+)@([A-Za-z0-9](?:[A-Za-z0-9.-]*[A-Za-z0-9])?)",
        regex::escape(pod_id.as_str())
    );
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(text)?;
    Some(ConnectionEndpoint {
        transport: TransportKind::Tunnel,
        host: caps.get(2)?.as_str().to_string(),
        port: TUNNEL_PORT,
        username: caps.get(1)?.as_str().to_string(),
        key_path: key_path.to_string(),
        validated_at_ms: None,
    })
}

/// Web UI address: `IP:PORT->3000` when mapped, else the HTTP proxy URL.
#[must_use]
pub fn web_interface_url(text: &str, pod_id: &PodId) -> String {
    find_port_mapping(text, 3000).map_or_else(
        || format!("https://{pod_id}-3000.proxy.runpod.net"),
        |(host, port)| format!("http://{host}:{port}"),
    )
}

fn find_port_mapping(text: &str, private_port: u16) -> Option<(String, u16)> {
    let pattern = format!(r"\b(\d{{1,3}}(?:\.\d{{1,3}}){{3}}):(\d{{1,5}})\s*->\s*{private_port}\b");
    let re = Regex::new(&pattern).ok()?;
    re.captures_iter(text).find_map(|caps| {
        let host = caps.get(1)?.as_str();
        let port = caps.get(2)?.as_str().parse::<u16>().ok()?;
        host.parse::<std::net::Ipv4Addr>().ok()?;
        (port != 0).then(|| (host.to_string(), port))
    })
}
