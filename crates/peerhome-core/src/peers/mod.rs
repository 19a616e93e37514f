//! Peer discovery sources
//!
//! A [`PeerSource`] answers two questions for the mesh:
//! - "give me up to N peers to dial" ([`PeerSource::get_peers`])
//! - "who is behind this endpoint?" ([`PeerSource::get_peer_for_endpoint`])
//!
//! Sources compose. A peer group's source is usually a
//! [`JoinedPeerSource`] over a few [`MappedCollectionSource`]s, plus the
//! invite sources when a handshake is in flight.

mod invite;
mod joined;
mod mapped;

use async_trait::async_trait;
use rand::seq::SliceRandom;

use crate::types::PeerInfo;

pub use invite::{InviteReceiverSource, InviteSenderSource};
pub use joined::JoinedPeerSource;
pub use mapped::MappedCollectionSource;

/// Strategy for finding peers of a group
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Up to `count` peers. A universe smaller than `count` is returned
    /// whole; a larger one is sampled uniformly.
    async fn get_peers(&self, count: usize) -> Vec<PeerInfo>;

    /// Resolve an endpoint to a peer, or `None` if it is not one of ours.
    async fn get_peer_for_endpoint(&self, endpoint: &str) -> Option<PeerInfo>;
}

/// Shuffle the full candidate list and keep the first `count`.
pub(crate) fn sample(mut peers: Vec<PeerInfo>, count: usize) -> Vec<PeerInfo> {
    peers.shuffle(&mut rand::rng());
    peers.truncate(count);
    peers
}

/// A source with a fixed peer list, keyed by endpoint. Test fixture.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct StaticPeerSource {
    peers: Vec<PeerInfo>,
}

#[cfg(test)]
impl StaticPeerSource {
    pub(crate) fn new(peers: Vec<PeerInfo>) -> Self {
        Self { peers }
    }
}

#[cfg(test)]
#[async_trait]
impl PeerSource for StaticPeerSource {
    async fn get_peers(&self, count: usize) -> Vec<PeerInfo> {
        sample(self.peers.clone(), count)
    }

    async fn get_peer_for_endpoint(&self, endpoint: &str) -> Option<PeerInfo> {
        self.peers.iter().find(|p| p.endpoint == endpoint).cloned()
    }
}
