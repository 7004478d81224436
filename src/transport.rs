// src/transport.rs
//
// HTTP PUT of prepared chunk payloads to their slot destinations, with
// per-address client pinning driven by the host resolver. One pooled
// client is kept per resolved address so consecutive attempts rotate
// across edge nodes instead of re-resolving through a single one.

use crate::constants::{LENGTH_ECHO_HEADER, SLOT_EXPIRED_STATUS};
use crate::coordinator::UploadSlot;
use crate::error::{Result, UploadError};
use crate::resolver::HostResolver;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// Client-level ceiling; the worker pool applies its own per-PUT timeout
    pub request_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub tcp_keepalive: Duration,
    /// HTTP status the service uses for an expired slot
    pub slot_expired_status: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(600),
            pool_idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Duration::from_secs(60),
            slot_expired_status: SLOT_EXPIRED_STATUS,
        }
    }
}

/// The seam the worker pool uploads through; faked in tests
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// PUT the exact payload bytes to the slot destination with the slot's
    /// headers attached. Success means the service acknowledged the full
    /// declared length.
    async fn put_chunk(&self, index: u32, slot: &UploadSlot, payload: Bytes) -> Result<()>;
}

pub struct RotatingTransport {
    cfg: TransportConfig,
    resolver: Option<Arc<HostResolver>>,
    default_client: reqwest::Client,
    pinned: RwLock<HashMap<SocketAddr, reqwest::Client>>,
}

impl RotatingTransport {
    pub fn new(cfg: TransportConfig) -> Result<Self> {
        let default_client = build_client(&cfg, None)?;
        Ok(Self {
            cfg,
            resolver: None,
            default_client,
            pinned: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Client for this connection attempt: pinned to the resolver's next
    /// address when one is usable, otherwise the default-resolution client.
    async fn client_for_attempt(&self) -> (reqwest::Client, Option<SocketAddr>) {
        if let Some(resolver) = &self.resolver {
            if let Some(addr) = resolver.next_addr().await {
                if let Some(client) = self.pinned.read().unwrap().get(&addr) {
                    return (client.clone(), Some(addr));
                }
                match build_client(&self.cfg, Some((resolver.host(), addr))) {
                    Ok(client) => {
                        self.pinned.write().unwrap().insert(addr, client.clone());
                        return (client, Some(addr));
                    }
                    Err(err) => {
                        tracing::warn!(%addr, error = %err, "could not build pinned client, using default resolution");
                    }
                }
            }
        }
        (self.default_client.clone(), None)
    }
}

fn build_client(cfg: &TransportConfig, pin: Option<(&str, SocketAddr)>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.request_timeout)
        .pool_idle_timeout(cfg.pool_idle_timeout)
        .tcp_keepalive(cfg.tcp_keepalive)
        .tcp_nodelay(true)
        .use_rustls_tls();
    if let Some((host, addr)) = pin {
        builder = builder.resolve(host, addr);
    }
    builder
        .build()
        .map_err(|e| UploadError::transport_from("building transport client", e))
}

/// Slot headers forwarded to the PUT. `content-length` is dropped; the
/// transport sets the real payload length.
fn build_headers(index: u32, slot_headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(slot_headers.len());
    for (name, value) in slot_headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            UploadError::RemoteRejectedChunk {
                index,
                message: format!("slot carried invalid header name {:?}: {}", name, e),
            }
        })?;
        let value =
            HeaderValue::from_str(value).map_err(|e| UploadError::RemoteRejectedChunk {
                index,
                message: format!("slot carried invalid header value for {}: {}", name, e),
            })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Compare the service's stored-length echo, when present, against the
/// declared payload length. A missing header is accepted; a mismatch or an
/// unparseable value means the body was truncated somewhere and the attempt
/// must be retried.
fn verify_length_echo(index: u32, headers: &HeaderMap, declared_len: u64) -> Result<()> {
    let Some(echoed) = headers.get(LENGTH_ECHO_HEADER) else {
        return Ok(());
    };
    let received: u64 = echoed
        .to_str()
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    if received != declared_len {
        return Err(UploadError::transport(format!(
            "chunk {}: service stored {} bytes, declared {}",
            index, received, declared_len
        )));
    }
    Ok(())
}

fn check_status(index: u32, status: StatusCode, slot_expired_status: u16) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if status.as_u16() == slot_expired_status {
        return Err(UploadError::SlotExpired { index });
    }
    if status.is_server_error() {
        return Err(UploadError::transport(format!(
            "chunk {} PUT returned {}",
            index, status
        )));
    }
    // Remaining 4xx: configuration/auth problem, not worth retrying blindly
    Err(UploadError::RemoteRejectedChunk {
        index,
        message: format!("PUT returned {}", status),
    })
}

#[async_trait]
impl ChunkTransport for RotatingTransport {
    async fn put_chunk(&self, index: u32, slot: &UploadSlot, payload: Bytes) -> Result<()> {
        let declared_len = payload.len() as u64;
        let headers = build_headers(index, &slot.headers)?;
        let (client, addr) = self.client_for_attempt().await;

        let resp = match client
            .put(&slot.url)
            .headers(headers)
            .body(payload)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                if err.is_connect() {
                    if let (Some(resolver), Some(addr)) = (&self.resolver, addr) {
                        resolver.mark_unusable(addr);
                    }
                }
                return Err(UploadError::transport_from(
                    format!("chunk {} PUT failed", index),
                    err,
                ));
            }
        };

        check_status(index, resp.status(), self.cfg.slot_expired_status)?;
        verify_length_echo(index, resp.headers(), declared_len)?;
        tracing::debug!(chunk = index, bytes = declared_len, "chunk acknowledged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_header_is_dropped() {
        let mut slot_headers = HashMap::new();
        slot_headers.insert("Content-Length".to_string(), "999".to_string());
        slot_headers.insert("x-auth".to_string(), "token".to_string());
        let headers = build_headers(0, &slot_headers).unwrap();
        assert!(headers.get("content-length").is_none());
        assert_eq!(headers.get("x-auth").unwrap(), "token");
    }

    #[test]
    fn invalid_header_name_is_fatal_for_the_chunk() {
        let mut slot_headers = HashMap::new();
        slot_headers.insert("bad header\n".to_string(), "v".to_string());
        assert!(matches!(
            build_headers(4, &slot_headers),
            Err(UploadError::RemoteRejectedChunk { index: 4, .. })
        ));
    }

    #[test]
    fn matching_length_echo_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(LENGTH_ECHO_HEADER, HeaderValue::from_static("1024"));
        assert!(verify_length_echo(0, &headers, 1024).is_ok());
        // No echo header: the 2xx stands on its own
        assert!(verify_length_echo(0, &HeaderMap::new(), 1024).is_ok());
    }

    #[test]
    fn length_echo_mismatch_is_retryable() {
        let mut headers = HeaderMap::new();
        headers.insert(LENGTH_ECHO_HEADER, HeaderValue::from_static("512"));
        assert!(matches!(
            verify_length_echo(2, &headers, 1024),
            Err(UploadError::TransientTransport { .. })
        ));
    }

    #[test]
    fn malformed_length_echo_is_retryable() {
        let mut headers = HeaderMap::new();
        headers.insert(LENGTH_ECHO_HEADER, HeaderValue::from_static("not-a-number"));
        assert!(matches!(
            verify_length_echo(2, &headers, 1024),
            Err(UploadError::TransientTransport { .. })
        ));
    }

    #[test]
    fn status_classification() {
        assert!(check_status(0, StatusCode::OK, 403).is_ok());
        assert!(matches!(
            check_status(1, StatusCode::FORBIDDEN, 403),
            Err(UploadError::SlotExpired { index: 1 })
        ));
        assert!(matches!(
            check_status(2, StatusCode::SERVICE_UNAVAILABLE, 403),
            Err(UploadError::TransientTransport { .. })
        ));
        assert!(matches!(
            check_status(3, StatusCode::NOT_FOUND, 403),
            Err(UploadError::RemoteRejectedChunk { index: 3, .. })
        ));
    }
}
