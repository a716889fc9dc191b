//! Wire format and HTTP client for talking to a remote peer's lock server.
//! Bearer-token authenticated per `distribute.token`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{LockGrant, LockMode, PeerLockClient};

#[derive(Debug, Serialize, Deserialize)]
pub struct LockRequest {
    pub resource: String,
    pub mode: LockMode,
    pub owner: String,
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnlockRequest {
    pub lease_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub lease_id: String,
    pub ttl_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub refreshed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForceUnlockRequest {
    pub resource: String,
}

/// `PeerLockClient` over HTTP, for every peer other than this node itself.
pub struct RemotePeer {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl RemotePeer {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builds with static config"),
        }
    }
}

#[async_trait]
impl PeerLockClient for RemotePeer {
    async fn lock(&self, resource: &str, mode: LockMode, owner: &str, ttl: Duration) -> anyhow::Result<LockGrant> {
        let resp = self
            .http
            .post(format!("{}/lock/v1/lock", self.base_url))
            .bearer_auth(&self.token)
            .json(&LockRequest {
                resource: resource.to_string(),
                mode,
                owner: owner.to_string(),
                ttl_ms: ttl.as_millis() as u64,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<LockGrant>().await?)
    }

    async fn unlock(&self, lease_id: &str) -> anyhow::Result<()> {
        self.http
            .post(format!("{}/lock/v1/unlock", self.base_url))
            .bearer_auth(&self.token)
            .json(&UnlockRequest {
                lease_id: lease_id.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn refresh(&self, lease_id: &str, ttl: Duration) -> anyhow::Result<bool> {
        let resp = self
            .http
            .post(format!("{}/lock/v1/refresh", self.base_url))
            .bearer_auth(&self.token)
            .json(&RefreshRequest {
                lease_id: lease_id.to_string(),
                ttl_ms: ttl.as_millis() as u64,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<RefreshResponse>().await?.refreshed)
    }
}
