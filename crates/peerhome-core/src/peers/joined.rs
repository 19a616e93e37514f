use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::PeerSource;
use crate::types::PeerInfo;

/// Merges several sources into one.
///
/// `get_peers` takes one candidate from each child in turn until `count`
/// distinct endpoints are collected or every child is exhausted.
/// `get_peer_for_endpoint` asks children in declared order and returns the
/// first answer, so earlier children take precedence.
#[derive(Clone)]
pub struct JoinedPeerSource {
    sources: Vec<Arc<dyn PeerSource>>,
}

impl JoinedPeerSource {
    pub fn new(sources: Vec<Arc<dyn PeerSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl PeerSource for JoinedPeerSource {
    async fn get_peers(&self, count: usize) -> Vec<PeerInfo> {
        let mut candidates = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            candidates.push(source.get_peers(count).await.into_iter());
        }

        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        while peers.len() < count {
            let mut progressed = false;
            for iter in candidates.iter_mut() {
                if peers.len() >= count {
                    break;
                }
                if let Some(peer) = iter.next() {
                    progressed = true;
                    if seen.insert(peer.endpoint.clone()) {
                        peers.push(peer);
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        peers
    }

    async fn get_peer_for_endpoint(&self, endpoint: &str) -> Option<PeerInfo> {
        for source in &self.sources {
            if let Some(peer) = source.get_peer_for_endpoint(endpoint).await {
                return Some(peer);
            }
        }
        None
    }
}
