use crate::graph::store::GraphStore;
use crate::types::*;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::debug;

/// One cached trade loop with its lifecycle state
#[derive(Clone, Debug)]
pub struct LoopEntry {
    pub cycle: TradeCycle,
    pub state: LoopState,
    pub discovered_at: Instant,
    pub expires_at: Instant,
}

const SHARD_COUNT: usize = 16;

/// Per-tenant store of currently-valid trade loops.
///
/// Entries are sharded on a canonical-id prefix; the inverted indices
/// (wallet, NFT, collection) answer "which loops does this mutation touch"
/// without scanning. Mutations mark matching entries stale; a revalidation
/// pass against the live store either restores them or drops them. TTL
/// sweeps are driven by an explicit tick and are idempotent.
pub struct ActiveLoopCache {
    shards: Vec<Mutex<BTreeMap<CanonicalId, LoopEntry>>>,
    by_wallet: RwLock<BTreeMap<WalletId, BTreeSet<CanonicalId>>>,
    by_nft: RwLock<BTreeMap<NftId, BTreeSet<CanonicalId>>>,
    by_collection: RwLock<BTreeMap<CollectionId, BTreeSet<CanonicalId>>>,
}

impl Default for ActiveLoopCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveLoopCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(BTreeMap::new())).collect(),
            by_wallet: RwLock::new(BTreeMap::new()),
            by_nft: RwLock::new(BTreeMap::new()),
            by_collection: RwLock::new(BTreeMap::new()),
        }
    }

    fn shard(&self, id: &str) -> &Mutex<BTreeMap<CanonicalId, LoopEntry>> {
        let prefix = id.as_bytes().first().copied().unwrap_or(0) as usize;
        &self.shards[prefix % SHARD_COUNT]
    }

    /// Insert a freshly discovered loop. Returns false when a loop with the
    /// same canonical id is already active (the later find is dropped).
    pub fn insert(&self, cycle: TradeCycle, ttl: Duration) -> bool {
        let id = cycle.canonical_id.clone();
        {
            let mut shard = self.shard(&id).lock();
            if shard.get(&id).is_some_and(|e| e.state == LoopState::Valid) {
                return false;
            }
            let now = Instant::now();
            shard.insert(
                id.clone(),
                LoopEntry {
                    cycle: cycle.clone(),
                    state: LoopState::Valid,
                    discovered_at: now,
                    expires_at: now + ttl,
                },
            );
        }

        let mut by_wallet = self.by_wallet.write();
        let mut by_nft = self.by_nft.write();
        let mut by_collection = self.by_collection.write();
        for step in &cycle.steps {
            by_wallet.entry(step.from.clone()).or_default().insert(id.clone());
            by_nft.entry(step.nft.clone()).or_default().insert(id.clone());
            if let Some(collection) = step.kind.source_collection() {
                by_collection.entry(collection.clone()).or_default().insert(id.clone());
            }
        }
        true
    }

    /// Fetch one loop; anything but `Valid` is filtered out.
    pub fn get(&self, id: &str) -> Option<TradeCycle> {
        let shard = self.shard(id).lock();
        shard
            .get(id)
            .filter(|e| e.state == LoopState::Valid)
            .map(|e| e.cycle.clone())
    }

    /// Fetch including lifecycle detail, for the loop-detail query surface.
    pub fn get_entry(&self, id: &str) -> Option<LoopEntry> {
        self.shard(id).lock().get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().values().filter(|e| e.state == LoopState::Valid).count())
            .sum()
    }

    /// Mark every loop matching the mutation batch stale. Returns the ids
    /// touched; the caller follows up with `revalidate`.
    pub fn mark_stale_matching(&self, records: &[MutationRecord]) -> Vec<CanonicalId> {
        let mut touched: BTreeSet<CanonicalId> = BTreeSet::new();
        {
            let by_wallet = self.by_wallet.read();
            let by_nft = self.by_nft.read();
            for record in records {
                for wallet in record.affected_wallets() {
                    if let Some(ids) = by_wallet.get(&wallet) {
                        touched.extend(ids.iter().cloned());
                    }
                }
                for nft in record.touched_nfts() {
                    if let Some(ids) = by_nft.get(nft) {
                        touched.extend(ids.iter().cloned());
                    }
                }
                if let MutationRecord::CollectionExpanded { collection, .. }
                | MutationRecord::CollectionShrunk { collection, .. } = record
                {
                    if let Some(ids) = self.by_collection.read().get(collection) {
                        touched.extend(ids.iter().cloned());
                    }
                }
            }
        }

        let mut stale = Vec::new();
        for id in touched {
            let mut shard = self.shard(&id).lock();
            if let Some(entry) = shard.get_mut(&id) {
                if entry.state == LoopState::Valid {
                    entry.state = LoopState::Stale;
                    stale.push(id.clone());
                }
            }
        }
        stale
    }

    /// Re-check every stale loop against the live store: each step must still
    /// move an owned NFT to a wallet that wants it. Restored loops return to
    /// `Valid`; broken ones are removed and reported.
    pub fn revalidate(&self, store: &GraphStore) -> Vec<(CanonicalId, InvalidationReason)> {
        let stale_ids: Vec<CanonicalId> = self
            .shards
            .iter()
            .flat_map(|s| {
                s.lock()
                    .iter()
                    .filter(|(_, e)| e.state == LoopState::Stale)
                    .map(|(id, _)| id.clone())
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut invalidated = Vec::new();
        for id in stale_ids {
            let entry = match self.shard(&id).lock().get(&id) {
                Some(e) => e.clone(),
                None => continue,
            };
            let reason = store.with_state(|state| {
                for step in &entry.cycle.steps {
                    if state.owner_index.get(&step.nft) != Some(&step.from) {
                        return Some(InvalidationReason::OwnershipChanged(step.nft.clone()));
                    }
                    let wants = state.wallets.get(&step.to).is_some_and(|w| w.wants(&step.nft));
                    if !wants {
                        return Some(InvalidationReason::WantRetracted {
                            wallet: step.to.clone(),
                            nft: step.nft.clone(),
                        });
                    }
                }
                None
            });
            match reason {
                None => {
                    if let Some(entry) = self.shard(&id).lock().get_mut(&id) {
                        entry.state = LoopState::Valid;
                    }
                }
                Some(reason) => {
                    self.remove(&id);
                    debug!(%id, ?reason, "active loop invalidated");
                    invalidated.push((id, reason));
                }
            }
        }
        invalidated
    }

    /// Remove entries past their TTL. Idempotent; safe on any tick cadence.
    pub fn sweep_expired(&self, now: Instant) -> Vec<CanonicalId> {
        let expired: Vec<CanonicalId> = self
            .shards
            .iter()
            .flat_map(|s| {
                s.lock()
                    .iter()
                    .filter(|(_, e)| e.expires_at <= now)
                    .map(|(id, _)| id.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired
    }

    fn remove(&self, id: &str) {
        let entry = self.shard(id).lock().remove(id);
        let Some(entry) = entry else { return };

        let mut by_wallet = self.by_wallet.write();
        let mut by_nft = self.by_nft.write();
        let mut by_collection = self.by_collection.write();
        for step in &entry.cycle.steps {
            if let Some(ids) = by_wallet.get_mut(&step.from) {
                ids.remove(id);
                if ids.is_empty() {
                    by_wallet.remove(&step.from);
                }
            }
            if let Some(ids) = by_nft.get_mut(&step.nft) {
                ids.remove(id);
                if ids.is_empty() {
                    by_nft.remove(&step.nft);
                }
            }
            if let Some(collection) = step.kind.source_collection() {
                if let Some(ids) = by_collection.get_mut(collection) {
                    ids.remove(id);
                    if ids.is_empty() {
                        by_collection.remove(collection);
                    }
                }
            }
        }
    }

    /// Valid loops matching an optional filter, ordered by canonical id.
    /// `cursor` is the offset into that ordering from a previous page.
    pub fn active_loops(
        &self,
        filter: &LoopFilter,
        limit: usize,
        cursor: usize,
    ) -> (Vec<TradeCycle>, Option<usize>) {
        let allowed: Option<BTreeSet<CanonicalId>> = match filter {
            LoopFilter::All => None,
            LoopFilter::ByWallet(wallet) => {
                Some(self.by_wallet.read().get(wallet).cloned().unwrap_or_default())
            }
            LoopFilter::ByNft(nft) => {
                Some(self.by_nft.read().get(nft).cloned().unwrap_or_default())
            }
            LoopFilter::ByCollection(collection) => Some(
                self.by_collection
                    .read()
                    .get(collection)
                    .cloned()
                    .unwrap_or_default(),
            ),
        };

        let mut matching: Vec<TradeCycle> = Vec::new();
        for shard in &self.shards {
            for (id, entry) in shard.lock().iter() {
                if entry.state != LoopState::Valid {
                    continue;
                }
                if allowed.as_ref().is_some_and(|ids| !ids.contains(id)) {
                    continue;
                }
                matching.push(entry.cycle.clone());
            }
        }
        matching.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));

        let limit = limit.max(1);
        let page: Vec<TradeCycle> = matching.iter().skip(cursor).take(limit).cloned().collect();
        let next = cursor + page.len();
        let next_cursor = (next < matching.len()).then_some(next);
        (page, next_cursor)
    }
}

/// Query filter for the active loop surface
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopFilter {
    All,
    ByWallet(WalletId),
    ByNft(NftId),
    ByCollection(CollectionId),
}
