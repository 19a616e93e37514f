use std::sync::Arc;

use async_trait::async_trait;

use super::{sample, PeerSource};
use crate::replica::{Element, ReplicatedSet};
use crate::types::{ObjectHash, PeerInfo};

type ToPeer<T> = Arc<dyn Fn(&T) -> PeerInfo + Send + Sync>;
type KeyForEndpoint = Arc<dyn Fn(&str) -> Option<ObjectHash> + Send + Sync>;

/// Peers derived from the members of one or more replicated sets.
///
/// `to_peer` turns an element into a dialable peer; `key_for_endpoint`
/// inverts it, mapping an endpoint back to the element's hash.
pub struct MappedCollectionSource<T: Element> {
    collections: Vec<ReplicatedSet<T>>,
    to_peer: ToPeer<T>,
    key_for_endpoint: KeyForEndpoint,
}

impl<T: Element> MappedCollectionSource<T> {
    pub fn new(
        collections: Vec<ReplicatedSet<T>>,
        to_peer: impl Fn(&T) -> PeerInfo + Send + Sync + 'static,
        key_for_endpoint: impl Fn(&str) -> Option<ObjectHash> + Send + Sync + 'static,
    ) -> Self {
        Self {
            collections,
            to_peer: Arc::new(to_peer),
            key_for_endpoint: Arc::new(key_for_endpoint),
        }
    }

    /// Members of every collection, interleaved so a small `count` still
    /// draws from later collections.
    fn interleaved(&self) -> Vec<T> {
        let snapshots: Vec<Vec<T>> = self.collections.iter().map(|c| c.values()).collect();
        let longest = snapshots.iter().map(Vec::len).max().unwrap_or(0);

        let mut out = Vec::with_capacity(snapshots.iter().map(Vec::len).sum());
        for i in 0..longest {
            for snapshot in &snapshots {
                if let Some(element) = snapshot.get(i) {
                    out.push(element.clone());
                }
            }
        }
        out
    }
}

#[async_trait]
impl<T: Element> PeerSource for MappedCollectionSource<T> {
    async fn get_peers(&self, count: usize) -> Vec<PeerInfo> {
        let peers = self.interleaved().iter().map(|e| (self.to_peer)(e)).collect();
        sample(peers, count)
    }

    async fn get_peer_for_endpoint(&self, endpoint: &str) -> Option<PeerInfo> {
        let key = (self.key_for_endpoint)(endpoint)?;
        self.collections
            .iter()
            .find_map(|c| c.get(&key))
            .map(|element| (self.to_peer)(&element))
    }
}
