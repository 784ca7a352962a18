//! Mock peer client for tests.

use super::{HashDetails, LookupsPush, PeerAddress, PeerError, PeerLookupClient, PushAck};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MockState {
    details: HashMap<PeerAddress, HashDetails>,
    failing_details: Vec<PeerAddress>,
    failing_pushes: Vec<PeerAddress>,
    ack_errors: HashMap<PeerAddress, PushAck>,
    pushes: Vec<(PeerAddress, LookupsPush)>,
}

/// Scripted peer client. Records every push for assertions.
#[derive(Clone, Default)]
pub struct MockPeerClient {
    state: Arc<Mutex<MockState>>,
}

impl MockPeerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a peer's `hash_details` answer.
    pub fn set_details(&self, peer: PeerAddress, details: HashDetails) {
        self.state
            .lock()
            .expect("mock lock")
            .details
            .insert(peer, details);
    }

    /// Make a peer's metadata fetch fail at the transport level.
    pub fn fail_details_for(&self, peer: PeerAddress) {
        self.state
            .lock()
            .expect("mock lock")
            .failing_details
            .push(peer);
    }

    /// Make a peer's pushes fail at the transport level.
    pub fn fail_pushes_for(&self, peer: PeerAddress) {
        self.state
            .lock()
            .expect("mock lock")
            .failing_pushes
            .push(peer);
    }

    /// Script a structured error acknowledgement for a peer's pushes.
    pub fn set_ack_error(&self, peer: PeerAddress, errcode: &str, message: &str) {
        self.state.lock().expect("mock lock").ack_errors.insert(
            peer,
            PushAck {
                errcode: Some(errcode.to_string()),
                error: Some(message.to_string()),
            },
        );
    }

    /// Every push received, in arrival order.
    pub fn pushes(&self) -> Vec<(PeerAddress, LookupsPush)> {
        self.state.lock().expect("mock lock").pushes.clone()
    }

    /// Pushes received by one peer.
    pub fn pushes_for(&self, peer: &PeerAddress) -> Vec<LookupsPush> {
        self.state
            .lock()
            .expect("mock lock")
            .pushes
            .iter()
            .filter(|(p, _)| p == peer)
            .map(|(_, push)| push.clone())
            .collect()
    }
}

#[async_trait]
impl PeerLookupClient for MockPeerClient {
    async fn hash_details(&self, peer: &PeerAddress) -> Result<HashDetails, PeerError> {
        let state = self.state.lock().expect("mock lock");
        if state.failing_details.contains(peer) {
            return Err(PeerError::Transport {
                peer: peer.to_string(),
                reason: "injected transport failure".into(),
            });
        }
        state
            .details
            .get(peer)
            .cloned()
            .ok_or_else(|| PeerError::Transport {
                peer: peer.to_string(),
                reason: "no scripted response".into(),
            })
    }

    async fn push_lookups(
        &self,
        peer: &PeerAddress,
        push: &LookupsPush,
    ) -> Result<PushAck, PeerError> {
        let mut state = self.state.lock().expect("mock lock");
        if state.failing_pushes.contains(peer) {
            return Err(PeerError::Transport {
                peer: peer.to_string(),
                reason: "injected transport failure".into(),
            });
        }
        state.pushes.push((peer.clone(), push.clone()));
        Ok(state.ack_errors.get(peer).cloned().unwrap_or_default())
    }
}
