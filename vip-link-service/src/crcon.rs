//! HTTP client for the game-server admin API.
//!
//! Only the two calls the reconciliation path needs: reading a player's
//! current VIP expiration out of their profile and writing a new one back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};

/// HTTP request timeout for upstream calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Display name written upstream when the profile carries none.
pub const MISSING_PLAYER_NAME: &str = "No player name";

/// A player's current entitlement state on the configured server.
#[derive(Debug, Clone)]
pub struct VipState {
    pub expiration: Option<DateTime<Utc>>,
    pub display_name: Option<String>,
}

/// The upstream entitlement surface consumed by reconciliation. Kept as a
/// trait so handlers are testable without a live game server.
#[async_trait]
pub trait VipApi: Send + Sync {
    /// Fetch the player's current VIP state. `Ok(None)` means the server
    /// has no profile for this player at all; a profile without a VIP
    /// entry for the configured server comes back with no expiration.
    async fn fetch_vip_state(&self, player_id: &str) -> ServiceResult<Option<VipState>>;

    /// Write the player's entitlement expiration. Idempotent upstream.
    async fn grant_vip(
        &self,
        player_id: &str,
        description: &str,
        expiration: DateTime<Utc>,
    ) -> ServiceResult<()>;
}

pub struct CrconClient {
    base_url: String,
    api_key: String,
    server_number: i64,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    result: Option<T>,
    #[serde(default)]
    failed: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlayerProfile {
    #[serde(default)]
    names: Vec<PlayerName>,
    #[serde(default)]
    vips: Vec<VipEntry>,
}

#[derive(Debug, Deserialize)]
struct PlayerName {
    name: String,
}

#[derive(Debug, Deserialize)]
struct VipEntry {
    server_number: i64,
    expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct AddVipRequest<'a> {
    player_id: &'a str,
    description: &'a str,
    expiration: String,
}

impl CrconClient {
    pub fn new(base_url: &str, api_key: &str, server_number: i64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            server_number,
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bearer: {}", self.api_key)
    }

    /// Send a request, retrying once on transport failure or a non-2xx
    /// status. Exhausted retries surface as `UpstreamUnavailable`.
    async fn send_with_retry(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> ServiceResult<reqwest::Response> {
        let retry = request.try_clone();

        let first_failure = match request.send().await {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => format!("status {}", resp.status()),
            Err(e) => e.to_string(),
        };

        let Some(retry) = retry else {
            return Err(ServiceError::UpstreamUnavailable(format!(
                "{}: {}",
                what, first_failure
            )));
        };

        log::warn!("[Crcon] {} failed ({}), retrying once", what, first_failure);
        match retry.send().await {
            Ok(resp) if resp.status().is_success() => Ok(resp),
            Ok(resp) => Err(ServiceError::UpstreamUnavailable(format!(
                "{} failed with status {}",
                what,
                resp.status()
            ))),
            Err(e) => Err(ServiceError::UpstreamUnavailable(format!("{}: {}", what, e))),
        }
    }
}

#[async_trait]
impl VipApi for CrconClient {
    async fn fetch_vip_state(&self, player_id: &str) -> ServiceResult<Option<VipState>> {
        let url = format!("{}/api/get_player_profile", self.base_url);
        let request = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .query(&[("player_id", player_id)]);

        let response = self.send_with_retry(request, "get_player_profile").await?;
        let body: ApiResponse<PlayerProfile> = response.json().await.map_err(|e| {
            ServiceError::UpstreamUnavailable(format!("invalid profile response: {}", e))
        })?;

        if body.failed {
            return Err(ServiceError::UpstreamUnavailable(
                body.error
                    .unwrap_or_else(|| "get_player_profile failed".to_string()),
            ));
        }

        let Some(profile) = body.result else {
            return Ok(None);
        };

        let expiration = profile
            .vips
            .iter()
            .find(|v| v.server_number == self.server_number)
            .and_then(|v| v.expiration);
        let display_name = profile.names.first().map(|n| n.name.clone());

        Ok(Some(VipState {
            expiration,
            display_name,
        }))
    }

    async fn grant_vip(
        &self,
        player_id: &str,
        description: &str,
        expiration: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let url = format!("{}/api/add_vip", self.base_url);
        log::info!(
            "[Crcon] Setting VIP expiration for player_id={} description={:?} expiration={}",
            player_id,
            description,
            expiration.to_rfc3339()
        );

        let request = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&AddVipRequest {
                player_id,
                description,
                expiration: expiration.to_rfc3339(),
            });

        let response = self.send_with_retry(request, "add_vip").await?;
        let body: ApiResponse<serde_json::Value> = response.json().await.map_err(|e| {
            ServiceError::UpstreamUnavailable(format!("invalid add_vip response: {}", e))
        })?;

        if body.failed {
            return Err(ServiceError::UpstreamUnavailable(
                body.error.unwrap_or_else(|| "add_vip failed".to_string()),
            ));
        }

        Ok(())
    }
}
