//! Multi-peer hash republication.
//!
//! For each configured remote peer, one cycle negotiates that peer's digest
//! algorithm and pepper list from `hash_details`, recomputes the local
//! export set under each pepper, and pushes the result to `lookups`. A peer
//! offering alternate peppers receives one push per pepper, so it can roll
//! its own pepper without losing lookups mid-rotation.
//!
//! Peer failures are isolated: metadata and push calls are issued without
//! sequencing and their outcomes collected independently, so one slow or
//! broken peer never delays or cancels another. Nothing is retried within a
//! cycle; the next scheduled run starts fresh.
//!
//! Two peer-list configurations ("federation servers" and "federated
//! identity services") share this one implementation; each list gets its own
//! job instance distinguished only by a label in the logs.

use super::JobError;
use crate::directory::{HomeserverView, UserDirectory};
use crate::filter::ActiveUserFilter;
use crate::hasher::{field_digest, HashAlgorithm, HashEngine};
use crate::peers::{HashDetails, LookupsPush, PeerAddress, PeerError, PeerLookupClient};
use crate::store::FieldKind;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// What one federation cycle accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FederationOutcome {
    pub peers_total: usize,
    /// Peers whose metadata validated this cycle.
    pub peers_synced: usize,
    /// Pushes acknowledged without a structured error.
    pub pushes_sent: usize,
    /// Pushes that failed in transport, computation, or acknowledgement.
    pub pushes_failed: usize,
}

/// One peer's negotiated parameters for the current cycle. Never cached
/// across cycles.
#[derive(Debug, Clone)]
struct PeerDescriptor {
    address: PeerAddress,
    algorithm: HashAlgorithm,
    /// Primary pepper first, then any advertised alternates.
    peppers: Vec<String>,
}

/// Derive the host identifier sent to peers from the configured base URL:
/// the host, plus the port when one is explicitly present.
pub fn lookup_host(base: &url::Url) -> Option<String> {
    let host = base.host_str()?;
    Some(match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Republishes the local catalog to one configured peer list.
pub struct FederationSyncJob<H> {
    label: String,
    client: Arc<dyn PeerLookupClient>,
    engine: Arc<H>,
    directory: Arc<dyn UserDirectory>,
    view: Option<Arc<dyn HomeserverView>>,
    peers: Vec<PeerAddress>,
    /// Local host identifier used as the `mappings` key.
    host: String,
}

impl<H> FederationSyncJob<H>
where
    H: HashEngine,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        label: impl Into<String>,
        client: Arc<dyn PeerLookupClient>,
        engine: Arc<H>,
        directory: Arc<dyn UserDirectory>,
        view: Option<Arc<dyn HomeserverView>>,
        peers: Vec<PeerAddress>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            client,
            engine,
            directory,
            view,
            peers,
            host: host.into(),
        }
    }

    /// One synchronization cycle over this job's peer list.
    pub async fn run_cycle(&self) -> Result<FederationOutcome, JobError> {
        let mut outcome = FederationOutcome {
            peers_total: self.peers.len(),
            ..FederationOutcome::default()
        };
        if self.peers.is_empty() {
            return Ok(outcome);
        }

        let export = self.build_export_set().await?;

        let fetches = join_all(self.peers.iter().map(|peer| async move {
            (peer, self.client.hash_details(peer).await)
        }))
        .await;

        let mut descriptors = Vec::new();
        for (peer, result) in fetches {
            match result.and_then(|details| Self::validate_details(peer, details)) {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(err) => {
                    warn!(
                        list = %self.label,
                        peer = %peer,
                        error = %err,
                        "peer excluded from this cycle"
                    );
                }
            }
        }
        outcome.peers_synced = descriptors.len();

        let mut pushes = Vec::new();
        for descriptor in &descriptors {
            for pepper in &descriptor.peppers {
                let descriptor = descriptor.clone();
                let export = &export;
                pushes.push(async move {
                    let result = self.push_one(&descriptor, pepper, export).await;
                    (descriptor.address, result)
                });
            }
        }

        for (peer, result) in join_all(pushes).await {
            match result {
                Ok(()) => outcome.pushes_sent += 1,
                Err(err) => {
                    outcome.pushes_failed += 1;
                    warn!(
                        list = %self.label,
                        peer = %peer,
                        error = %err,
                        "push failed, other peers unaffected"
                    );
                }
            }
        }

        info!(
            list = %self.label,
            peers_total = outcome.peers_total,
            peers_synced = outcome.peers_synced,
            pushes_sent = outcome.pushes_sent,
            pushes_failed = outcome.pushes_failed,
            "federation sync cycle complete"
        );
        Ok(outcome)
    }

    /// Active users' non-empty 3PID fields, the only data ever pushed.
    async fn build_export_set(&self) -> Result<Vec<(FieldKind, String)>, JobError> {
        let users = self.directory.list_users().await?;
        let filter = ActiveUserFilter::from_view(self.view.as_deref()).await?;

        let mut export = Vec::new();
        for annotated in filter.annotate(users) {
            if !annotated.active {
                continue;
            }
            if let Some(email) = annotated.user.email {
                if !email.is_empty() {
                    export.push((FieldKind::Email, email));
                }
            }
            if let Some(phone) = annotated.user.phone {
                if !phone.is_empty() {
                    export.push((FieldKind::Phone, phone));
                }
            }
        }
        Ok(export)
    }

    /// Validate a metadata response and negotiate this cycle's parameters.
    fn validate_details(
        peer: &PeerAddress,
        details: HashDetails,
    ) -> Result<PeerDescriptor, PeerError> {
        if let Some(errcode) = details.errcode {
            return Err(PeerError::Remote {
                peer: peer.to_string(),
                errcode,
                message: details.error.unwrap_or_default(),
            });
        }
        let Some(first) = details.algorithms.first() else {
            return Err(PeerError::Unusable {
                peer: peer.to_string(),
                reason: "empty algorithm list".into(),
            });
        };
        let algorithm = HashAlgorithm::parse(first).ok_or_else(|| PeerError::Unusable {
            peer: peer.to_string(),
            reason: format!("unsupported algorithm: {first}"),
        })?;
        let Some(primary) = details.lookup_pepper else {
            return Err(PeerError::Unusable {
                peer: peer.to_string(),
                reason: "no lookup pepper".into(),
            });
        };

        let mut peppers = vec![primary];
        peppers.extend(details.alt_lookup_peppers);
        Ok(PeerDescriptor {
            address: peer.clone(),
            algorithm,
            peppers,
        })
    }

    /// Compute the export set under one (peer, pepper) pair and push it.
    async fn push_one(
        &self,
        descriptor: &PeerDescriptor,
        pepper: &str,
        export: &[(FieldKind, String)],
    ) -> Result<(), PeerError> {
        let mut digests = Vec::with_capacity(export.len());
        for (kind, value) in export {
            let digest = field_digest(
                self.engine.as_ref(),
                descriptor.algorithm,
                *kind,
                value,
                pepper,
            )
            .map_err(|e| PeerError::Unusable {
                peer: descriptor.address.to_string(),
                reason: e.to_string(),
            })?;
            digests.push(digest);
        }

        let push = LookupsPush {
            algorithm: descriptor.algorithm.as_str().to_string(),
            pepper: pepper.to_string(),
            mappings: HashMap::from([(self.host.clone(), digests)]),
        };

        let ack = self.client.push_lookups(&descriptor.address, &push).await?;
        if let Some(errcode) = ack.errcode {
            return Err(PeerError::Remote {
                peer: descriptor.address.to_string(),
                errcode,
                message: ack.error.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
