//! Wire protocol client for federation/identity peers.
//!
//! Peers speak JSON over HTTPS:
//! - `GET /_matrix/identity/v2/hash_details` advertises the peer's digest
//!   algorithms and current pepper, plus any still-valid alternate peppers.
//! - `POST /_matrix/identity/v2/lookups` receives the full digest list
//!   computed under one of the peer's peppers.
//!
//! Either endpoint may answer with a structured `{errcode, error}` body
//! instead; callers treat that as a peer-level failure.
//!
//! [`PeerLookupClient`] is the seam the sync job drives; [`HttpPeerClient`]
//! is the production implementation and [`MockPeerClient`] the scripted test
//! double.

mod mock;

pub use mock::MockPeerClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default timeout for a single peer request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Peer errors. All variants carry the peer so cycles can log which remote
/// misbehaved without consulting surrounding context.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("http client error: {0}")]
    Client(String),

    #[error("transport error for {peer}: {reason}")]
    Transport { peer: String, reason: String },

    #[error("malformed response from {peer}: {reason}")]
    Malformed { peer: String, reason: String },

    #[error("peer {peer} answered {errcode}: {message}")]
    Remote {
        peer: String,
        errcode: String,
        message: String,
    },

    #[error("peer {peer} is unusable: {reason}")]
    Unusable { peer: String, reason: String },
}

/// A remote peer's network address (`hostname` or `hostname:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress(pub String);

impl PeerAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `hash_details` response body. Error answers only populate
/// `errcode`/`error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashDetails {
    #[serde(default)]
    pub algorithms: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_pepper: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_lookup_peppers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `lookups` push body: the full digest list computed under one peer pepper,
/// keyed by the local host identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LookupsPush {
    pub algorithm: String,
    pub pepper: String,
    pub mappings: HashMap<String, Vec<String>>,
}

/// `lookups` acknowledgement. An empty object on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outbound peer operations used by the federation sync job.
#[async_trait]
pub trait PeerLookupClient: Send + Sync {
    async fn hash_details(&self, peer: &PeerAddress) -> Result<HashDetails, PeerError>;

    async fn push_lookups(
        &self,
        peer: &PeerAddress,
        push: &LookupsPush,
    ) -> Result<PushAck, PeerError>;
}

/// reqwest-backed client.
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    http: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new() -> Result<Self, PeerError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PeerError::Client(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl PeerLookupClient for HttpPeerClient {
    async fn hash_details(&self, peer: &PeerAddress) -> Result<HashDetails, PeerError> {
        let url = format!("https://{peer}/_matrix/identity/v2/hash_details");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PeerError::Transport {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;
        response
            .json::<HashDetails>()
            .await
            .map_err(|e| PeerError::Malformed {
                peer: peer.to_string(),
                reason: e.to_string(),
            })
    }

    async fn push_lookups(
        &self,
        peer: &PeerAddress,
        push: &LookupsPush,
    ) -> Result<PushAck, PeerError> {
        let url = format!("https://{peer}/_matrix/identity/v2/lookups");
        let response = self
            .http
            .post(&url)
            .json(push)
            .send()
            .await
            .map_err(|e| PeerError::Transport {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;
        response
            .json::<PushAck>()
            .await
            .map_err(|e| PeerError::Malformed {
                peer: peer.to_string(),
                reason: e.to_string(),
            })
    }
}
