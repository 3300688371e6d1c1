use crate::config::TenantSettings;
use crate::graph::store::GraphState;
use crate::types::{CollectionId, NftId};
use blake2::{Blake2b512, Digest};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// Observability record for one collection-want expansion
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpansionReport {
    pub collection: CollectionId,
    /// Collection size before any cap was applied
    pub original_size: usize,
    /// Derived wants actually materialized
    pub expanded_size: usize,
    /// True when the per-collection cap forced sampling
    pub sampled: bool,
    pub elapsed_ms: u64,
    pub derived: Vec<NftId>,
}

impl ExpansionReport {
    pub fn empty(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            ..Self::default()
        }
    }
}

/// Materialize derived wants for one subscriber over the collection's current
/// members.
///
/// Members the wallet owns, and members it already wants, are skipped. Past
/// `max_collection_size` the candidate list is reservoir-sampled with an RNG
/// seeded from (wallet, collection), so re-running the same event sequence
/// derives the same wants.
pub(crate) fn expand_for_subscriber(
    state: &mut GraphState,
    wallet: &str,
    collection: &str,
    settings: &TenantSettings,
) -> ExpansionReport {
    let started = Instant::now();

    let members: Vec<NftId> = state
        .collection_members
        .get(collection)
        .map(|m| m.iter().cloned().collect())
        .unwrap_or_default();
    let original_size = members.len();

    let mut candidates: Vec<NftId> = members
        .into_iter()
        .filter(|nft| {
            let owned_by_wallet = state.owner_index.get(nft).is_some_and(|o| o == wallet);
            let already_wanted = state.wallets.get(wallet).is_some_and(|w| w.wants(nft));
            !owned_by_wallet && !already_wanted
        })
        .collect();

    let mut sampled = false;
    if candidates.len() > settings.max_collection_size {
        candidates = reservoir_sample(
            candidates,
            settings.max_collection_size,
            stable_seed(wallet, collection),
        );
        sampled = true;
    }

    // The security cap on total wants also bounds the expansion.
    let want_count = state.wallets.get(wallet).map_or(0, |w| w.want_count());
    let budget = settings.max_wants_per_wallet.saturating_sub(want_count);
    if candidates.len() > budget {
        candidates.truncate(budget);
        sampled = true;
    }

    for nft in &candidates {
        let ws = state.wallets.entry(wallet.to_string()).or_default();
        ws.derived_wants.insert(nft.clone());
        state
            .wanters_index
            .entry(nft.clone())
            .or_default()
            .insert(wallet.to_string());
        state
            .expansion_index
            .entry(wallet.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
            .insert(nft.clone());
    }

    let report = ExpansionReport {
        collection: collection.to_string(),
        original_size,
        expanded_size: candidates.len(),
        sampled,
        elapsed_ms: started.elapsed().as_millis() as u64,
        derived: candidates,
    };
    debug!(
        wallet,
        collection,
        original = report.original_size,
        expanded = report.expanded_size,
        sampled = report.sampled,
        "collection want expanded"
    );
    report
}

/// Algorithm R over a sorted candidate list. The seed is stable per
/// (wallet, collection), which keeps discovery deterministic across runs.
fn reservoir_sample(candidates: Vec<NftId>, k: usize, seed: u64) -> Vec<NftId> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut reservoir: Vec<NftId> = Vec::with_capacity(k);
    for (i, nft) in candidates.into_iter().enumerate() {
        if i < k {
            reservoir.push(nft);
        } else {
            let j = rng.gen_range(0..=i);
            if j < k {
                reservoir[j] = nft;
            }
        }
    }
    reservoir.sort();
    reservoir
}

fn stable_seed(wallet: &str, collection: &str) -> u64 {
    let mut hasher = Blake2b512::new();
    hasher.update(b"TRADELOOP_EXPANSION");
    hasher.update(b"|");
    hasher.update(wallet.as_bytes());
    hasher.update(b"|");
    hasher.update(collection.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 64 bytes"))
}
