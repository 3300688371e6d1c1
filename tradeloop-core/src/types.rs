use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tenant identifier (isolation boundary)
pub type TenantId = String;

/// Wallet identifier, opaque within a tenant
pub type WalletId = String;

/// NFT identifier, opaque within a tenant
pub type NftId = String;

/// Collection identifier
pub type CollectionId = String;

/// Monotonic mutation generation of a tenant graph
pub type Generation = u64;

/// Canonical cycle identifier (hex-encoded Blake2b digest)
pub type CanonicalId = String;

/// Discovery run identifier
pub type RunId = u64;

/// Notification sequence number
pub type SequenceNo = u64;

/// Descriptive metadata attached to an NFT
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NftMetadata {
    pub name: String,
    pub symbol: String,
    pub collection: Option<CollectionId>,
    pub estimated_value: Option<f64>,
}

impl NftMetadata {
    /// Trade value used by the scorer when no estimate is available
    pub const DEFAULT_VALUE: f64 = 1.0;

    pub fn value(&self) -> f64 {
        self.estimated_value.unwrap_or(Self::DEFAULT_VALUE)
    }
}

/// Provenance of a derived trade edge
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    /// The wanter asked for this exact NFT
    Direct,
    /// The want was materialized from a collection subscription
    CollectionDerived { source_collection: CollectionId },
}

impl EdgeKind {
    pub fn is_collection_derived(&self) -> bool {
        matches!(self, EdgeKind::CollectionDerived { .. })
    }

    pub fn source_collection(&self) -> Option<&CollectionId> {
        match self {
            EdgeKind::Direct => None,
            EdgeKind::CollectionDerived { source_collection } => Some(source_collection),
        }
    }
}

/// One tradable NFT on a wallet-to-wallet edge
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeInfo {
    pub nft: NftId,
    pub kind: EdgeKind,
    pub weight: f64,
}

/// One hop of a trade cycle: `from` sends `nft` to `to`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleStep {
    pub from: WalletId,
    pub to: WalletId,
    pub nft: NftId,
    pub kind: EdgeKind,
}

/// A closed trade loop in canonical (rotation-normalized) form
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeCycle {
    pub canonical_id: CanonicalId,
    pub steps: Vec<CycleStep>,
    pub participants: usize,
    pub efficiency: f64,
    pub fairness: f64,
    pub quality: f64,
    pub score: f64,
    /// Graph generation of the snapshot the cycle was discovered against
    pub generation: Generation,
}

impl TradeCycle {
    /// Wallets in canonical traversal order
    pub fn wallets(&self) -> Vec<&WalletId> {
        self.steps.iter().map(|s| &s.from).collect()
    }

    /// NFTs moved, one per step, in canonical traversal order
    pub fn nfts(&self) -> Vec<&NftId> {
        self.steps.iter().map(|s| &s.nft).collect()
    }

    pub fn touches_wallet(&self, wallet: &str) -> bool {
        self.steps.iter().any(|s| s.from == wallet)
    }

    pub fn touches_nft(&self, nft: &str) -> bool {
        self.steps.iter().any(|s| s.nft == nft)
    }
}

/// Typed description of a graph change, consumed by the delta engine
/// and the persistence log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationRecord {
    NftAdded {
        nft: NftId,
        owner: WalletId,
        metadata: NftMetadata,
        /// Wallets that already wanted the NFT when it arrived
        wanters: Vec<WalletId>,
    },
    NftRemoved {
        nft: NftId,
        owner: Option<WalletId>,
        wanters: Vec<WalletId>,
    },
    Transferred {
        nft: NftId,
        from: WalletId,
        to: WalletId,
        wanters: Vec<WalletId>,
    },
    WantAdded {
        wallet: WalletId,
        nft: NftId,
        owner: Option<WalletId>,
        collection_derived: bool,
    },
    WantRemoved {
        wallet: WalletId,
        nft: NftId,
        owner: Option<WalletId>,
    },
    CollectionExpanded {
        collection: CollectionId,
        added: Vec<NftId>,
        subscribers: Vec<WalletId>,
        /// Current owners of the added members
        owners: Vec<WalletId>,
    },
    CollectionShrunk {
        collection: CollectionId,
        removed: Vec<NftId>,
        subscribers: Vec<WalletId>,
    },
}

impl MutationRecord {
    /// Wallets whose edges may have changed because of this mutation.
    /// This is the affected root set the delta engine reroots discovery at.
    pub fn affected_wallets(&self) -> BTreeSet<WalletId> {
        let mut roots = BTreeSet::new();
        match self {
            MutationRecord::NftAdded { owner, wanters, .. } => {
                roots.insert(owner.clone());
                roots.extend(wanters.iter().cloned());
            }
            MutationRecord::NftRemoved { owner, wanters, .. } => {
                if let Some(owner) = owner {
                    roots.insert(owner.clone());
                }
                roots.extend(wanters.iter().cloned());
            }
            MutationRecord::Transferred {
                from, to, wanters, ..
            } => {
                roots.insert(from.clone());
                roots.insert(to.clone());
                roots.extend(wanters.iter().cloned());
            }
            MutationRecord::WantAdded { wallet, owner, .. }
            | MutationRecord::WantRemoved { wallet, owner, .. } => {
                roots.insert(wallet.clone());
                if let Some(owner) = owner {
                    roots.insert(owner.clone());
                }
            }
            MutationRecord::CollectionExpanded {
                subscribers, owners, ..
            } => {
                roots.extend(subscribers.iter().cloned());
                roots.extend(owners.iter().cloned());
            }
            MutationRecord::CollectionShrunk { subscribers, .. } => {
                roots.extend(subscribers.iter().cloned());
            }
        }
        roots
    }

    /// NFTs referenced by this mutation, used for cache invalidation
    pub fn touched_nfts(&self) -> Vec<&NftId> {
        match self {
            MutationRecord::NftAdded { nft, .. }
            | MutationRecord::NftRemoved { nft, .. }
            | MutationRecord::Transferred { nft, .. }
            | MutationRecord::WantAdded { nft, .. }
            | MutationRecord::WantRemoved { nft, .. } => vec![nft],
            MutationRecord::CollectionExpanded { added, .. } => added.iter().collect(),
            MutationRecord::CollectionShrunk { removed, .. } => removed.iter().collect(),
        }
    }
}

/// How a completed enumeration phase was bounded
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partiality {
    Complete,
    Timeout,
    Cap,
    Sampling,
}

impl Partiality {
    pub fn is_partial(&self) -> bool {
        !matches!(self, Partiality::Complete)
    }

    /// Merge two phase outcomes, keeping the more degraded one
    pub fn combine(self, other: Partiality) -> Partiality {
        if self == Partiality::Complete {
            other
        } else {
            self
        }
    }
}

/// Terminal state of a discovery run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    PartialTimeout,
    PartialCap,
    Cancelled,
    Failed,
}

/// Lifecycle of an active loop cache entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Valid,
    Stale,
    Invalidated,
    Expired,
}

/// Why an active loop stopped being offered
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationReason {
    OwnershipChanged(NftId),
    WantRetracted { wallet: WalletId, nft: NftId },
    NftRemoved(NftId),
    Expired,
    RevalidationFailed,
}

/// Per-tenant ordered notification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LoopEvent {
    LoopDiscovered {
        canonical_id: CanonicalId,
        cycle: TradeCycle,
    },
    LoopInvalidated {
        canonical_id: CanonicalId,
        reason: InvalidationReason,
    },
}

/// A notification with its position in the tenant stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: SequenceNo,
    pub event: LoopEvent,
}

/// Synchronous response to an accepted mutation event
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventOutcome {
    pub accepted: bool,
    pub discovered_loops_delta: i64,
    pub run_id: Option<RunId>,
}

/// Aggregate counters surfaced by `get_stats`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub direct_edges: usize,
    pub collection_derived_edges: usize,
    pub nfts: usize,
    pub collections: usize,
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error taxonomy for the engine.
///
/// Input errors are reported and never retried. Capacity errors carry retry
/// hints. Transient operational errors leave the engine serving from memory.
/// Partial results are not errors and travel inside result payloads.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("unknown tenant: {0}")]
    UnknownTenant(TenantId),

    #[error("unknown NFT: {0}")]
    UnknownNft(NftId),

    #[error("NFT {nft} already owned by wallet {owner}")]
    DuplicateOwnership { nft: NftId, owner: WalletId },

    #[error("wallet {wallet} cannot want its own NFT {nft}")]
    SelfWant { wallet: WalletId, nft: NftId },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("ingestion queue full")]
    Busy,

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("collection resolution unavailable")]
    Unavailable,

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("persistence degraded: {0}")]
    PersistenceDegraded(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("tenant {0} is quarantined")]
    Quarantined(TenantId),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl EngineError {
    /// Input errors never mutate state and must not be retried
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            EngineError::UnknownTenant(_)
                | EngineError::UnknownNft(_)
                | EngineError::DuplicateOwnership { .. }
                | EngineError::SelfWant { .. }
                | EngineError::InvalidArgument(_)
        )
    }

    /// Capacity errors are retryable after backoff
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            EngineError::Busy | EngineError::RateLimited { .. } | EngineError::QuotaExceeded(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affected_wallets_transfer() {
        let record = MutationRecord::Transferred {
            nft: "n1".into(),
            from: "alice".into(),
            to: "bob".into(),
            wanters: vec!["carol".into()],
        };

        let roots = record.affected_wallets();
        assert!(roots.contains("alice"));
        assert!(roots.contains("bob"));
        assert!(roots.contains("carol"));
        assert_eq!(roots.len(), 3);
    }

    #[test]
    fn test_partiality_combine() {
        assert_eq!(
            Partiality::Complete.combine(Partiality::Timeout),
            Partiality::Timeout
        );
        assert_eq!(
            Partiality::Cap.combine(Partiality::Complete),
            Partiality::Cap
        );
        assert!(!Partiality::Complete.is_partial());
        assert!(Partiality::Sampling.is_partial());
    }

    #[test]
    fn test_error_classes() {
        let err = EngineError::SelfWant {
            wallet: "a".into(),
            nft: "n".into(),
        };
        assert!(err.is_input_error());
        assert!(!err.is_capacity_error());
        assert!(EngineError::Busy.is_capacity_error());
    }
}
