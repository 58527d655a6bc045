//! `RunPod` GraphQL client.
//!
//! Unique responsibility: list the account's pods through the GraphQL API for
//! the `list` command. Lifecycle operations go through `runpodctl`.
//!
//! API endpoint:
//! - POST <https://api.runpod.io/graphql>
//! - Header: Authorization: Bearer <token>

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::runpod_config::ManagerConfig;
use crate::runpod_ctl::parse_status;
use crate::runpod_error::{PodError, Result};
use crate::runpod_types::{PodId, PodStatus};

/// Configuration for the `RunPod` GraphQL client.
#[derive(Clone, Debug)]
pub struct RunpodClientConfig {
    /// `RunPod` API key for authentication.
    pub api_key: String,
    /// GraphQL API URL for `RunPod`.
    pub graphql_url: String,
    /// HTTP request timeout.
    pub timeout: Duration,
    /// Maximum number of retry attempts.
    pub retry_max: u32,
    /// Backoff before the first retry; doubles up to 10s.
    pub retry_backoff: Duration,
}

impl RunpodClientConfig {
    /// Client settings for the process configuration.
    #[must_use]
    pub fn from_manager(cfg: &ManagerConfig) -> Self {
        Self {
            api_key: cfg.api_key.clone(),
            graphql_url: cfg.graphql_url.clone(),
            timeout: Duration::from_secs(30),
            retry_max: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// One pod as listed by the API.
#[derive(Debug, Clone, PartialEq)]
pub struct PodListing {
    /// Pod ID.
    pub id: PodId,
    /// Pod name.
    pub name: String,
    /// Desired status.
    pub status: PodStatus,
    /// GPU display name, when the pod has a machine.
    pub gpu: Option<String>,
    /// Hourly cost in USD.
    pub cost_per_hr: Option<f64>,
}

/// GraphQL client for `RunPod` API.
pub struct RunpodClient {
    cfg: RunpodClientConfig,
    http: reqwest::Client,
}

impl RunpodClient {
    /// Create a new `RunPod` GraphQL client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(cfg: RunpodClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { cfg, http })
    }

    /// List all pods for the current user.
    ///
    /// Uses the `myself` query.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn list_pods(&self) -> Result<Vec<PodListing>> {
        let query = r"
            query myself {
                myself {
                    pods {
                        id
                        name
                        desiredStatus
                        costPerHr
                        machine {
                            gpuDisplayName
                        }
                    }
                }
            }
        ";

        let resp: GraphQLResponse<MyselfData> = self.execute(query, serde_json::json!({})).await?;
        Ok(listings(resp))
    }

    /// Execute a GraphQL query with retry logic.
    async fn execute<T: for<'de> Deserialize<'de>>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<GraphQLResponse<T>> {
        let mut attempt: u32 = 0;
        let mut backoff = self.cfg.retry_backoff;

        loop {
            attempt = attempt.saturating_add(1);

            let body = serde_json::json!({
                "query": query,
                "variables": variables
            });

            let send_res = self
                .http
                .post(&self.cfg.graphql_url)
                .bearer_auth(&self.cfg.api_key)
                .json(&body)
                .send()
                .await;

            match send_res {
                Ok(resp) => {
                    let status = resp.status();

                    if !status.is_success() {
                        let body_text = resp.text().await.unwrap_or_default();

                        if attempt <= self.cfg.retry_max && is_retryable_status(status) {
                            debug!(%status, attempt, "retrying graphql request");
                            tokio::time::sleep(backoff).await;
                            backoff = next_backoff(backoff);
                            continue;
                        }

                        return Err(PodError::Api {
                            status,
                            body: body_text,
                        });
                    }

                    let text = resp.text().await?;
                    let gql_resp: GraphQLResponse<T> = serde_json::from_str(&text)?;
                    graphql_errors(&gql_resp)?;
                    return Ok(gql_resp);
                }
                Err(e) => {
                    if attempt <= self.cfg.retry_max && is_retryable_reqwest(&e) {
                        debug!(error = %e, attempt, "retrying graphql request");
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }

                    return Err(PodError::Http(e));
                }
            }
        }
    }
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct GraphQLResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQLError>>,
}

#[derive(Debug, Deserialize)]
struct GraphQLError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct MyselfData {
    myself: Option<MyselfInfo>,
}

#[derive(Debug, Deserialize)]
struct MyselfInfo {
    #[serde(default)]
    pods: Vec<PodSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSummary {
    id: String,
    name: Option<String>,
    desired_status: Option<String>,
    cost_per_hr: Option<f64>,
    machine: Option<MachineInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MachineInfo {
    gpu_display_name: Option<String>,
}

fn graphql_errors<T>(resp: &GraphQLResponse<T>) -> Result<()> {
    if let Some(errors) = &resp.errors
        && !errors.is_empty()
    {
        let msg = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(PodError::GraphQl(msg));
    }
    Ok(())
}

fn listings(resp: GraphQLResponse<MyselfData>) -> Vec<PodListing> {
    resp.data
        .and_then(|d| d.myself)
        .map(|m| m.pods)
        .unwrap_or_default()
        .into_iter()
        .map(|p| PodListing {
            id: PodId::new(p.id),
            name: p.name.unwrap_or_default(),
            status: p
                .desired_status
                .as_deref()
                .map_or(PodStatus::Unknown, parse_status),
            gpu: p.machine.and_then(|m| m.gpu_display_name),
            cost_per_hr: p.cost_per_hr,
        })
        .collect()
}

// ============================================================================
// Helper functions
// ============================================================================

#[inline]
const fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    matches!(
        status.as_u16(),
        408 | 409 | 425 | 429 | 500 | 502 | 503 | 504
    )
}

#[inline]
fn is_retryable_reqwest(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

#[inline]
fn next_backoff(current: Duration) -> Duration {
    let next = current.saturating_mul(2);
    next.min(Duration::from_secs(10))
}
