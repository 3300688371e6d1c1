use crate::graph::store::{GraphStore, NftRecord, WalletState};
use crate::types::*;
use std::collections::{BTreeMap, BTreeSet};

/// Read-only, snapshot-consistent façade over one tenant graph.
///
/// A view is materialized under the store's read lock and reflects exactly
/// one mutation generation. Algorithms consume only this type, so direct and
/// collection-derived edges are indistinguishable except through `EdgeKind`.
/// All maps are ordered, which gives every consumer a stable iteration order.
#[derive(Clone, Debug)]
pub struct GraphView {
    generation: Generation,
    wallets: BTreeMap<WalletId, WalletState>,
    nfts: BTreeMap<NftId, NftRecord>,
    owner: BTreeMap<NftId, WalletId>,
    wanters: BTreeMap<NftId, BTreeSet<WalletId>>,
    /// from -> to -> tradable NFTs, sorted by NFT id
    adjacency: BTreeMap<WalletId, BTreeMap<WalletId, Vec<EdgeInfo>>>,
    collections: usize,
    collection_support: bool,
}

impl GraphView {
    /// Materialize a snapshot of the store at its current generation.
    pub fn capture(store: &GraphStore) -> Self {
        store.with_state(|state| {
            let mut adjacency: BTreeMap<WalletId, BTreeMap<WalletId, Vec<EdgeInfo>>> =
                BTreeMap::new();

            for (owner, wallet_state) in &state.wallets {
                for nft in &wallet_state.owned {
                    let Some(wanters) = state.wanters_index.get(nft) else {
                        continue;
                    };
                    let weight = state
                        .nfts
                        .get(nft)
                        .map_or(NftMetadata::DEFAULT_VALUE, |r| r.metadata.value());
                    for wanter in wanters {
                        if wanter == owner {
                            // Never true while invariants hold; skip rather
                            // than surface a self-edge to the algorithms.
                            continue;
                        }
                        let kind = want_kind(state.wallets.get(wanter), state, wanter, nft);
                        adjacency
                            .entry(owner.clone())
                            .or_default()
                            .entry(wanter.clone())
                            .or_default()
                            .push(EdgeInfo {
                                nft: nft.clone(),
                                kind,
                                weight,
                            });
                    }
                }
            }

            Self {
                generation: state.generation,
                wallets: state.wallets.clone(),
                nfts: state.nfts.clone(),
                owner: state.owner_index.clone(),
                wanters: state.wanters_index.clone(),
                adjacency,
                collections: state.collection_members.len(),
                collection_support: !state.collection_subscribers.is_empty(),
            }
        })
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Wallets present in the snapshot, in id order
    pub fn nodes(&self) -> impl Iterator<Item = &WalletId> {
        self.wallets.keys()
    }

    pub fn wallet(&self, wallet: &str) -> Option<&WalletState> {
        self.wallets.get(wallet)
    }

    /// Outgoing trade potential of a wallet
    pub fn edges_from(&self, wallet: &str) -> Option<&BTreeMap<WalletId, Vec<EdgeInfo>>> {
        self.adjacency.get(wallet)
    }

    /// NFTs tradable from `from` to `to`, sorted by NFT id
    pub fn edges_between(&self, from: &str, to: &str) -> &[EdgeInfo] {
        self.adjacency
            .get(from)
            .and_then(|targets| targets.get(to))
            .map(|edges| edges.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        !self.edges_between(from, to).is_empty()
    }

    pub fn owner(&self, nft: &str) -> Option<&WalletId> {
        self.owner.get(nft)
    }

    pub fn wanters(&self, nft: &str) -> Option<&BTreeSet<WalletId>> {
        self.wanters.get(nft)
    }

    pub fn all_nfts(&self) -> impl Iterator<Item = &NftId> {
        self.nfts.keys()
    }

    pub fn nft_record(&self, nft: &str) -> Option<&NftRecord> {
        self.nfts.get(nft)
    }

    pub fn value_of(&self, nft: &str) -> f64 {
        self.nfts
            .get(nft)
            .map_or(NftMetadata::DEFAULT_VALUE, |r| r.metadata.value())
    }

    pub fn has_collection_support(&self) -> bool {
        self.collection_support
    }

    pub fn stats(&self) -> GraphStats {
        let mut edges = 0;
        let mut direct = 0;
        let mut derived = 0;
        for targets in self.adjacency.values() {
            edges += targets.len();
            for infos in targets.values() {
                for info in infos {
                    if info.kind.is_collection_derived() {
                        derived += 1;
                    } else {
                        direct += 1;
                    }
                }
            }
        }
        GraphStats {
            nodes: self.wallets.len(),
            edges,
            direct_edges: direct,
            collection_derived_edges: derived,
            nfts: self.nfts.len(),
            collections: self.collections,
        }
    }
}

fn want_kind(
    wallet_state: Option<&WalletState>,
    state: &crate::graph::store::GraphState,
    wanter: &str,
    nft: &str,
) -> EdgeKind {
    let direct = wallet_state.is_some_and(|w| w.wanted.contains(nft));
    if direct {
        return EdgeKind::Direct;
    }
    // Derived want: attribute it to the first collection justifying it.
    let source = state
        .expansion_index
        .get(wanter)
        .and_then(|per_collection| {
            per_collection
                .iter()
                .find(|(_, members)| members.contains(nft))
                .map(|(collection, _)| collection.clone())
        })
        .unwrap_or_default();
    EdgeKind::CollectionDerived {
        source_collection: source,
    }
}
