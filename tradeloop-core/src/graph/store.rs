use crate::config::TenantSettings;
use crate::graph::expansion::{self, ExpansionReport};
use crate::types::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Per-wallet slice of the live graph
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletState {
    /// NFTs this wallet currently owns
    pub owned: BTreeSet<NftId>,

    /// NFTs this wallet asked for explicitly
    pub wanted: BTreeSet<NftId>,

    /// NFTs this wallet wants via a collection subscription
    pub derived_wants: BTreeSet<NftId>,

    /// Collections this wallet subscribed to
    pub wanted_collections: BTreeSet<CollectionId>,
}

impl WalletState {
    pub fn wants(&self, nft: &str) -> bool {
        self.wanted.contains(nft) || self.derived_wants.contains(nft)
    }

    pub fn want_count(&self) -> usize {
        self.wanted.len() + self.derived_wants.len()
    }

    /// Wallets are garbage-collected once they hold no state at all
    pub fn is_empty(&self) -> bool {
        self.owned.is_empty()
            && self.wanted.is_empty()
            && self.derived_wants.is_empty()
            && self.wanted_collections.is_empty()
    }
}

/// An NFT known to the graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NftRecord {
    pub metadata: NftMetadata,
    /// Generation at which the NFT entered the graph
    pub added_at: Generation,
}

/// The authoritative, serializable graph of one tenant.
///
/// `wallets` and the two indices are mutually derivable; every write
/// transaction restores that within the same critical section.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    pub wallets: BTreeMap<WalletId, WalletState>,
    pub nfts: BTreeMap<NftId, NftRecord>,
    pub owner_index: BTreeMap<NftId, WalletId>,
    pub wanters_index: BTreeMap<NftId, BTreeSet<WalletId>>,
    pub collection_members: BTreeMap<CollectionId, BTreeSet<NftId>>,
    pub collection_subscribers: BTreeMap<CollectionId, BTreeSet<WalletId>>,
    /// (wallet, collection) -> NFTs whose derived wants that subscription justifies
    pub expansion_index: BTreeMap<WalletId, BTreeMap<CollectionId, BTreeSet<NftId>>>,
    pub generation: Generation,
}

impl GraphState {
    fn wallet_mut(&mut self, wallet: &str) -> &mut WalletState {
        self.wallets.entry(wallet.to_string()).or_default()
    }

    fn drop_wallet_if_empty(&mut self, wallet: &str) {
        if self.wallets.get(wallet).is_some_and(|w| w.is_empty()) {
            self.wallets.remove(wallet);
        }
    }

    fn wanters_of(&self, nft: &str) -> Vec<WalletId> {
        self.wanters_index
            .get(nft)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove one wallet's want (direct and derived) for an NFT, fixing the
    /// wanters index. Returns true when anything was removed.
    fn clear_want(&mut self, wallet: &str, nft: &str) -> bool {
        let Some(state) = self.wallets.get_mut(wallet) else {
            return false;
        };
        let had_direct = state.wanted.remove(nft);
        let had_derived = state.derived_wants.remove(nft);
        if !(had_direct || had_derived) {
            return false;
        }
        if had_derived {
            if let Some(per_collection) = self.expansion_index.get_mut(wallet) {
                for members in per_collection.values_mut() {
                    members.remove(nft);
                }
                per_collection.retain(|_, members| !members.is_empty());
                if per_collection.is_empty() {
                    self.expansion_index.remove(wallet);
                }
            }
        }
        if let Some(wanters) = self.wanters_index.get_mut(nft) {
            wanters.remove(wallet);
            if wanters.is_empty() {
                self.wanters_index.remove(nft);
            }
        }
        true
    }

    /// Drop a derived want if no remaining subscription justifies it.
    /// Direct wants always persist.
    fn retire_derived_want(&mut self, wallet: &str, nft: &str) -> bool {
        let still_justified = self
            .expansion_index
            .get(wallet)
            .is_some_and(|per_collection| per_collection.values().any(|m| m.contains(nft)));
        if still_justified {
            return false;
        }
        let Some(state) = self.wallets.get_mut(wallet) else {
            return false;
        };
        if !state.derived_wants.remove(nft) {
            return false;
        }
        if !state.wanted.contains(nft) {
            if let Some(wanters) = self.wanters_index.get_mut(nft) {
                wanters.remove(wallet);
                if wanters.is_empty() {
                    self.wanters_index.remove(nft);
                }
            }
        }
        true
    }
}

/// Single-writer graph store for one tenant.
///
/// All mutating operations are write transactions: validation happens before
/// any structural change, so a failed operation never leaves a partial write.
/// Each successful write bumps the generation; readers take snapshots tagged
/// with the generation they observed.
pub struct GraphStore {
    state: RwLock<GraphState>,
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
        }
    }

    pub fn from_state(state: GraphState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn generation(&self) -> Generation {
        self.state.read().generation
    }

    /// Clone the full state, e.g. for a persistence snapshot
    pub fn export_state(&self) -> GraphState {
        self.state.read().clone()
    }

    /// Run a closure against a read-locked state. Kept narrow so no caller
    /// holds the lock across slow work.
    pub fn with_state<R>(&self, f: impl FnOnce(&GraphState) -> R) -> R {
        f(&self.state.read())
    }

    /// Upsert an NFT into a wallet's inventory.
    ///
    /// Returns `None` when the NFT was already owned by this wallet (metadata
    /// is refreshed, no structural change). Fails with `DuplicateOwnership`
    /// when another wallet owns it.
    pub fn put_nft(
        &self,
        owner: &str,
        nft: &str,
        metadata: NftMetadata,
        settings: &TenantSettings,
    ) -> EngineResult<Option<MutationRecord>> {
        let mut state = self.state.write();

        if let Some(current) = state.owner_index.get(nft) {
            if current != owner {
                return Err(EngineError::DuplicateOwnership {
                    nft: nft.to_string(),
                    owner: current.clone(),
                });
            }
            // Idempotent re-submission; only the metadata may change.
            if let Some(record) = state.nfts.get_mut(nft) {
                record.metadata = metadata;
            }
            return Ok(None);
        }

        let owned_count = state.wallets.get(owner).map_or(0, |w| w.owned.len());
        if owned_count >= settings.max_nfts_per_wallet {
            return Err(EngineError::QuotaExceeded(format!(
                "wallet {owner} reached max_nfts_per_wallet ({})",
                settings.max_nfts_per_wallet
            )));
        }

        state.generation += 1;
        let generation = state.generation;

        state.wallet_mut(owner).owned.insert(nft.to_string());
        state.owner_index.insert(nft.to_string(), owner.to_string());
        state.nfts.insert(
            nft.to_string(),
            NftRecord {
                metadata: metadata.clone(),
                added_at: generation,
            },
        );
        if let Some(collection) = metadata.collection.clone() {
            state
                .collection_members
                .entry(collection.clone())
                .or_default()
                .insert(nft.to_string());
            // Bring subscribers up to date with the new member right away.
            let subscribers: Vec<WalletId> = state
                .collection_subscribers
                .get(&collection)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            for subscriber in subscribers {
                if subscriber != owner {
                    expansion::expand_for_subscriber(&mut state, &subscriber, &collection, settings);
                }
            }
        }
        // Owning an NFT satisfies any want the owner had for it.
        state.clear_want(owner, nft);

        // Wanters, including freshly-derived ones, are delta-engine roots
        // for the rediscovery.
        let wanters: Vec<WalletId> = state
            .wanters_of(nft)
            .into_iter()
            .filter(|w| w != owner)
            .collect();

        let record = MutationRecord::NftAdded {
            nft: nft.to_string(),
            owner: owner.to_string(),
            metadata,
            wanters,
        };
        debug!(generation, nft, owner, "nft added");
        Ok(Some(record))
    }

    /// Remove an NFT from the graph entirely, together with every want
    /// pointing at it.
    pub fn remove_nft(&self, nft: &str) -> EngineResult<MutationRecord> {
        let mut state = self.state.write();

        if !state.nfts.contains_key(nft) {
            return Err(EngineError::UnknownNft(nft.to_string()));
        }

        state.generation += 1;

        let owner = state.owner_index.remove(nft);
        if let Some(owner) = &owner {
            if let Some(wallet) = state.wallets.get_mut(owner) {
                wallet.owned.remove(nft);
            }
            state.drop_wallet_if_empty(owner);
        }

        let wanters = state.wanters_of(nft);
        for wanter in &wanters {
            state.clear_want(wanter, nft);
            state.drop_wallet_if_empty(wanter);
        }

        let record_meta = state.nfts.remove(nft);
        if let Some(collection) = record_meta.and_then(|r| r.metadata.collection) {
            if let Some(members) = state.collection_members.get_mut(&collection) {
                members.remove(nft);
                if members.is_empty() {
                    state.collection_members.remove(&collection);
                }
            }
        }

        debug!(generation = state.generation, nft, "nft removed");
        Ok(MutationRecord::NftRemoved {
            nft: nft.to_string(),
            owner,
            wanters,
        })
    }

    /// Atomically move ownership of an NFT. The receiver's want for it, if
    /// any, is satisfied and dropped in the same transaction.
    pub fn transfer(
        &self,
        nft: &str,
        new_owner: &str,
        settings: &TenantSettings,
    ) -> EngineResult<Option<MutationRecord>> {
        let mut state = self.state.write();

        let Some(old_owner) = state.owner_index.get(nft).cloned() else {
            return Err(EngineError::UnknownNft(nft.to_string()));
        };
        if old_owner == new_owner {
            return Ok(None);
        }

        let owned_count = state.wallets.get(new_owner).map_or(0, |w| w.owned.len());
        if owned_count >= settings.max_nfts_per_wallet {
            return Err(EngineError::QuotaExceeded(format!(
                "wallet {new_owner} reached max_nfts_per_wallet ({})",
                settings.max_nfts_per_wallet
            )));
        }

        state.generation += 1;

        // Captured before the receiver's want is cleared, so cache
        // invalidation still sees every edge the transfer breaks.
        let wanters = state.wanters_of(nft);

        if let Some(wallet) = state.wallets.get_mut(&old_owner) {
            wallet.owned.remove(nft);
        }
        state.drop_wallet_if_empty(&old_owner);
        state.wallet_mut(new_owner).owned.insert(nft.to_string());
        state
            .owner_index
            .insert(nft.to_string(), new_owner.to_string());
        state.clear_want(new_owner, nft);

        debug!(
            generation = state.generation,
            nft, %old_owner, %new_owner, "nft transferred"
        );
        Ok(Some(MutationRecord::Transferred {
            nft: nft.to_string(),
            from: old_owner,
            to: new_owner.to_string(),
            wanters,
        }))
    }

    /// Register a direct want. Wants for NFTs the graph has not seen yet are
    /// accepted; they become edges when the NFT arrives.
    pub fn add_want(
        &self,
        wallet: &str,
        nft: &str,
        settings: &TenantSettings,
    ) -> EngineResult<Option<MutationRecord>> {
        let mut state = self.state.write();

        if state.owner_index.get(nft).is_some_and(|o| o == wallet) {
            return Err(EngineError::SelfWant {
                wallet: wallet.to_string(),
                nft: nft.to_string(),
            });
        }
        if state.wallets.get(wallet).is_some_and(|w| w.wanted.contains(nft)) {
            return Ok(None);
        }
        let want_count = state.wallets.get(wallet).map_or(0, |w| w.want_count());
        if want_count >= settings.max_wants_per_wallet {
            return Err(EngineError::QuotaExceeded(format!(
                "wallet {wallet} reached max_wants_per_wallet ({})",
                settings.max_wants_per_wallet
            )));
        }

        state.generation += 1;
        state.wallet_mut(wallet).wanted.insert(nft.to_string());
        state
            .wanters_index
            .entry(nft.to_string())
            .or_default()
            .insert(wallet.to_string());

        let owner = state.owner_index.get(nft).cloned();
        debug!(generation = state.generation, wallet, nft, "want added");
        Ok(Some(MutationRecord::WantAdded {
            wallet: wallet.to_string(),
            nft: nft.to_string(),
            owner,
            collection_derived: false,
        }))
    }

    /// Retract a direct want. A collection-derived want for the same NFT
    /// survives; retire the subscription to drop it.
    pub fn remove_want(&self, wallet: &str, nft: &str) -> EngineResult<Option<MutationRecord>> {
        let mut state = self.state.write();

        let had_direct = state
            .wallets
            .get_mut(wallet)
            .map(|w| w.wanted.remove(nft))
            .unwrap_or(false);
        if !had_direct {
            return Ok(None);
        }

        state.generation += 1;
        let still_derived = state
            .wallets
            .get(wallet)
            .is_some_and(|w| w.derived_wants.contains(nft));
        if !still_derived {
            if let Some(wanters) = state.wanters_index.get_mut(nft) {
                wanters.remove(wallet);
                if wanters.is_empty() {
                    state.wanters_index.remove(nft);
                }
            }
        }
        state.drop_wallet_if_empty(wallet);

        let owner = state.owner_index.get(nft).cloned();
        debug!(generation = state.generation, wallet, nft, "want removed");
        Ok(Some(MutationRecord::WantRemoved {
            wallet: wallet.to_string(),
            nft: nft.to_string(),
            owner,
        }))
    }

    /// Subscribe a wallet to a collection and materialize derived wants for
    /// its current members. Expansion is bounded by `max_collection_size`
    /// with deterministic reservoir sampling past the cap.
    pub fn add_collection_want(
        &self,
        wallet: &str,
        collection: &str,
        settings: &TenantSettings,
    ) -> EngineResult<(Option<MutationRecord>, ExpansionReport)> {
        self.add_collection_want_inner(wallet, collection, settings, true)
    }

    /// Record the subscription without deriving wants. Used when expansion is
    /// rate limited; the next membership notification re-attempts it.
    pub fn add_collection_want_unexpanded(
        &self,
        wallet: &str,
        collection: &str,
        settings: &TenantSettings,
    ) -> EngineResult<(Option<MutationRecord>, ExpansionReport)> {
        self.add_collection_want_inner(wallet, collection, settings, false)
    }

    fn add_collection_want_inner(
        &self,
        wallet: &str,
        collection: &str,
        settings: &TenantSettings,
        expand: bool,
    ) -> EngineResult<(Option<MutationRecord>, ExpansionReport)> {
        let mut state = self.state.write();

        let already = state
            .wallets
            .get(wallet)
            .is_some_and(|w| w.wanted_collections.contains(collection));
        if already {
            return Ok((None, ExpansionReport::empty(collection)));
        }
        let want_count = state.wallets.get(wallet).map_or(0, |w| w.want_count());
        if want_count >= settings.max_wants_per_wallet {
            return Err(EngineError::QuotaExceeded(format!(
                "wallet {wallet} reached max_wants_per_wallet ({})",
                settings.max_wants_per_wallet
            )));
        }

        state.generation += 1;
        state
            .wallet_mut(wallet)
            .wanted_collections
            .insert(collection.to_string());
        state
            .collection_subscribers
            .entry(collection.to_string())
            .or_default()
            .insert(wallet.to_string());

        // The subscription is recorded even when nothing expands; future
        // membership notifications re-attempt the expansion.
        let report = if expand {
            expansion::expand_for_subscriber(&mut state, wallet, collection, settings)
        } else {
            ExpansionReport::empty(collection)
        };
        let owners = owners_of(&state, &report.derived);
        let record = MutationRecord::CollectionExpanded {
            collection: collection.to_string(),
            added: report.derived.clone(),
            subscribers: vec![wallet.to_string()],
            owners,
        };
        Ok((Some(record), report))
    }

    /// Drop a collection subscription and every derived want that has no
    /// other justification.
    pub fn remove_collection_want(
        &self,
        wallet: &str,
        collection: &str,
    ) -> EngineResult<Vec<MutationRecord>> {
        let mut state = self.state.write();

        let had = state
            .wallets
            .get_mut(wallet)
            .map(|w| w.wanted_collections.remove(collection))
            .unwrap_or(false);
        if !had {
            return Ok(Vec::new());
        }

        state.generation += 1;
        if let Some(subs) = state.collection_subscribers.get_mut(collection) {
            subs.remove(wallet);
            if subs.is_empty() {
                state.collection_subscribers.remove(collection);
            }
        }

        let formerly_derived: Vec<NftId> = state
            .expansion_index
            .get_mut(wallet)
            .and_then(|per_collection| per_collection.remove(collection))
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        if state.expansion_index.get(wallet).is_some_and(|m| m.is_empty()) {
            state.expansion_index.remove(wallet);
        }

        let mut records = Vec::new();
        for nft in formerly_derived {
            if state.retire_derived_want(wallet, &nft) {
                let owner = state.owner_index.get(&nft).cloned();
                records.push(MutationRecord::WantRemoved {
                    wallet: wallet.to_string(),
                    nft,
                    owner,
                });
            }
        }
        state.drop_wallet_if_empty(wallet);
        debug!(
            generation = state.generation,
            wallet, collection, retired = records.len(), "collection want removed"
        );
        Ok(records)
    }

    /// Replace a collection's membership, expanding new members for every
    /// subscriber and retiring derived wants justified only by removed ones.
    pub fn set_collection_members(
        &self,
        collection: &str,
        members: BTreeSet<NftId>,
        settings: &TenantSettings,
    ) -> EngineResult<Vec<MutationRecord>> {
        let mut state = self.state.write();
        state.generation += 1;

        let previous = state
            .collection_members
            .get(collection)
            .cloned()
            .unwrap_or_default();
        let added: Vec<NftId> = members.difference(&previous).cloned().collect();
        let removed: Vec<NftId> = previous.difference(&members).cloned().collect();

        if members.is_empty() {
            state.collection_members.remove(collection);
        } else {
            state
                .collection_members
                .insert(collection.to_string(), members);
        }

        let subscribers: Vec<WalletId> = state
            .collection_subscribers
            .get(collection)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let mut records = Vec::new();
        if !added.is_empty() {
            for wallet in &subscribers {
                expansion::expand_for_subscriber(&mut state, wallet, collection, settings);
            }
            let owners = owners_of(&state, &added);
            records.push(MutationRecord::CollectionExpanded {
                collection: collection.to_string(),
                added,
                subscribers: subscribers.clone(),
                owners,
            });
        }
        if !removed.is_empty() {
            for wallet in &subscribers {
                for nft in &removed {
                    if let Some(per_collection) = state.expansion_index.get_mut(wallet) {
                        if let Some(set) = per_collection.get_mut(collection) {
                            set.remove(nft);
                            if set.is_empty() {
                                per_collection.remove(collection);
                            }
                        }
                        if per_collection.is_empty() {
                            state.expansion_index.remove(wallet);
                        }
                    }
                    state.retire_derived_want(wallet, nft);
                }
            }
            records.push(MutationRecord::CollectionShrunk {
                collection: collection.to_string(),
                removed,
                subscribers,
            });
        }
        debug!(
            generation = state.generation,
            collection, records = records.len(), "collection membership updated"
        );
        Ok(records)
    }

    /// Re-apply a logged mutation record during crash recovery. The log is
    /// trusted, so records are applied without quota or ownership checks.
    pub fn apply_record(&self, record: &MutationRecord, settings: &TenantSettings) {
        match record {
            MutationRecord::NftAdded {
                nft, owner, metadata, ..
            } => {
                let _ = self.put_nft(owner, nft, metadata.clone(), settings);
            }
            MutationRecord::NftRemoved { nft, .. } => {
                let _ = self.remove_nft(nft);
            }
            MutationRecord::Transferred { nft, to, .. } => {
                let _ = self.transfer(nft, to, settings);
            }
            MutationRecord::WantAdded {
                wallet,
                nft,
                collection_derived,
                ..
            } => {
                if !collection_derived {
                    let _ = self.add_want(wallet, nft, settings);
                }
            }
            MutationRecord::WantRemoved { wallet, nft, .. } => {
                let _ = self.remove_want(wallet, nft);
            }
            MutationRecord::CollectionExpanded {
                collection,
                subscribers,
                ..
            } => {
                for wallet in subscribers {
                    let _ = self.add_collection_want(wallet, collection, settings);
                }
            }
            MutationRecord::CollectionShrunk { collection, removed, .. } => {
                let mut state = self.state.write();
                let current = state
                    .collection_members
                    .get(collection)
                    .cloned()
                    .unwrap_or_default();
                drop(state);
                let next: BTreeSet<NftId> = current
                    .into_iter()
                    .filter(|n| !removed.contains(n))
                    .collect();
                let _ = self.set_collection_members(collection, next, settings);
            }
        }
    }

    /// Cross-check the wanters index against the wallets' want sets and the
    /// owner index against the owned sets. Any mismatch is the fatal class of
    /// error: the caller quarantines the tenant.
    pub fn verify_integrity(&self) -> EngineResult<()> {
        let state = self.state.read();

        let mut derived_wanters: BTreeMap<NftId, BTreeSet<WalletId>> = BTreeMap::new();
        for (wallet, ws) in &state.wallets {
            for nft in ws.wanted.iter().chain(ws.derived_wants.iter()) {
                derived_wanters
                    .entry(nft.clone())
                    .or_default()
                    .insert(wallet.clone());
            }
            for nft in &ws.owned {
                if state.owner_index.get(nft) != Some(wallet) {
                    return Err(EngineError::InvariantViolation(format!(
                        "owner index disagrees with wallet {wallet} for nft {nft}"
                    )));
                }
                if ws.wants(nft) {
                    return Err(EngineError::InvariantViolation(format!(
                        "wallet {wallet} wants its own nft {nft}"
                    )));
                }
            }
        }
        if derived_wanters != state.wanters_index {
            return Err(EngineError::InvariantViolation(
                "wanters index is not derivable from wallet want sets".into(),
            ));
        }
        for (nft, owner) in &state.owner_index {
            let owned = state
                .wallets
                .get(owner)
                .is_some_and(|w| w.owned.contains(nft));
            if !owned {
                return Err(EngineError::InvariantViolation(format!(
                    "owner index entry {nft} -> {owner} has no backing wallet state"
                )));
            }
        }
        Ok(())
    }
}

fn owners_of(state: &GraphState, nfts: &[NftId]) -> Vec<WalletId> {
    let mut owners: BTreeSet<WalletId> = BTreeSet::new();
    for nft in nfts {
        if let Some(owner) = state.owner_index.get(nft) {
            owners.insert(owner.clone());
        }
    }
    owners.into_iter().collect()
}
