// src/coordinator.rs
//
// Slot negotiation with the remote metadata API. For each chunk attempt the
// coordinator is asked for a short-lived upload slot (destination URL plus
// required headers); after every chunk is acknowledged it issues the single
// close call that seals the remote object.
//
// The trait seam exists so the worker pool is testable with a fake
// coordinator and no network.

use crate::error::{Result, UploadError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Inputs to the per-chunk slot request. `size`, `md5` and `compressed`
/// describe the bytes that will actually travel the wire, not the raw
/// chunk: an incompressible chunk under a compressing job declares
/// `compressed: false`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SlotRequest {
    pub index: u32,
    pub size: u64,
    pub md5: String,
    pub compressed: bool,
}

/// Short-lived destination for one chunk attempt. Never reused across
/// attempts; a stale slot is discarded and re-requested.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadSlot {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Expiry as Unix epoch milliseconds, when the service reports one
    #[serde(default)]
    pub expires: Option<i64>,
}

impl UploadSlot {
    pub fn is_expired(&self) -> bool {
        self.expires
            .is_some_and(|t| chrono::Utc::now().timestamp_millis() >= t)
    }
}

#[async_trait]
pub trait UploadCoordinator: Send + Sync {
    /// Negotiate a destination for one chunk attempt. Idempotent from the
    /// engine's perspective: re-requesting for the same index before it is
    /// acknowledged is safe.
    async fn request_slot(&self, request: &SlotRequest) -> Result<UploadSlot>;

    /// Seal the remote object. Called exactly once, strictly after every
    /// chunk is acknowledged.
    async fn acknowledge_completion(&self) -> Result<()>;
}

/// Coordinator speaking the JSON metadata API:
/// `POST {base}/{object_id}/upload` and `POST {base}/{object_id}/close`.
pub struct HttpCoordinator {
    client: reqwest::Client,
    api_base: String,
    object_id: String,
    auth_token: Option<String>,
}

impl HttpCoordinator {
    pub fn new(api_base: impl Into<String>, object_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .use_rustls_tls()
            .build()
            .map_err(|e| UploadError::transport_from("building API client", e))?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            object_id: object_id.into(),
            auth_token: None,
        })
    }

    /// Token acquisition/refresh is the caller's concern; the engine only
    /// attaches what it is given.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    fn endpoint(&self, op: &str) -> String {
        format!("{}/{}/{}", self.api_base, self.object_id, op)
    }

    async fn post_json(&self, op: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let mut req = self.client.post(self.endpoint(op)).json(body);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        req.send()
            .await
            .map_err(|e| UploadError::transport_from(format!("{} API call failed", op), e))
    }
}

#[async_trait]
impl UploadCoordinator for HttpCoordinator {
    async fn request_slot(&self, request: &SlotRequest) -> Result<UploadSlot> {
        let body = serde_json::to_value(request)
            .map_err(|e| UploadError::configuration(format!("encoding slot request: {}", e)))?;
        let resp = self.post_json("upload", &body).await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(UploadError::transport(format!(
                "slot request for chunk {} returned {}",
                request.index, status
            )));
        }
        if !status.is_success() {
            // 4xx: the service considers this chunk identity invalid
            let message = resp.text().await.unwrap_or_else(|_| status.to_string());
            return Err(UploadError::RemoteRejectedChunk {
                index: request.index,
                message,
            });
        }
        resp.json::<UploadSlot>()
            .await
            .map_err(|e| UploadError::transport_from("decoding slot response", e))
    }

    async fn acknowledge_completion(&self) -> Result<()> {
        let resp = self.post_json("close", &serde_json::json!({})).await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(UploadError::transport(format!(
                "close returned {}",
                status
            )));
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_else(|_| status.to_string());
            return Err(UploadError::CloseRejected { message });
        }
        tracing::info!(object_id = %self.object_id, "remote object closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_request_wire_shape() {
        let req = SlotRequest {
            index: 2,
            size: 1024,
            md5: "d41d8cd98f00b204e9800998ecf8427e".into(),
            compressed: true,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["index"], 2);
        assert_eq!(v["size"], 1024);
        assert_eq!(v["md5"], "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(v["compressed"], true);
    }

    #[test]
    fn slot_response_parses_with_optional_fields() {
        let slot: UploadSlot = serde_json::from_str(r#"{"url":"https://u.example/p"}"#).unwrap();
        assert!(slot.headers.is_empty());
        assert!(slot.expires.is_none());
        assert!(!slot.is_expired());
    }

    #[test]
    fn past_expiry_is_expired() {
        let slot = UploadSlot {
            url: "https://u.example/p".into(),
            headers: HashMap::new(),
            expires: Some(chrono::Utc::now().timestamp_millis() - 1_000),
        };
        assert!(slot.is_expired());

        let fresh = UploadSlot {
            expires: Some(chrono::Utc::now().timestamp_millis() + 60_000),
            ..slot
        };
        assert!(!fresh.is_expired());
    }
}
