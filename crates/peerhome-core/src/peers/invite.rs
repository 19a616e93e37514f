//! Peer sources for a pending invite

use async_trait::async_trait;

use super::{sample, PeerSource};
use crate::invite::InviteToken;
use crate::types::PeerInfo;

/// The inviter's devices, as listed in the token.
///
/// Used by the respondent (and its other devices) to reach the inviter.
/// Only device endpoints named in the token resolve.
#[derive(Debug, Clone)]
pub struct InviteSenderSource {
    token: InviteToken,
}

impl InviteSenderSource {
    pub fn new(token: InviteToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl PeerSource for InviteSenderSource {
    async fn get_peers(&self, count: usize) -> Vec<PeerInfo> {
        sample(self.token.sender_peers(), count)
    }

    async fn get_peer_for_endpoint(&self, endpoint: &str) -> Option<PeerInfo> {
        self.token.parse_sender_endpoint(endpoint)
    }
}

/// Fallback that recognizes the not-yet-known respondent.
///
/// Never offers peers to dial: the respondent's address is unknown until
/// it connects. Resolves encrypted receiver endpoints and `invite-reply`
/// endpoints that authenticate under the token secret; everything else,
/// forged or malformed, is simply not recognized.
#[derive(Debug, Clone)]
pub struct InviteReceiverSource {
    token: InviteToken,
}

impl InviteReceiverSource {
    pub fn new(token: InviteToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl PeerSource for InviteReceiverSource {
    async fn get_peers(&self, _count: usize) -> Vec<PeerInfo> {
        Vec::new()
    }

    async fn get_peer_for_endpoint(&self, endpoint: &str) -> Option<PeerInfo> {
        self.token.parse_receiver_endpoint(endpoint)
    }
}
