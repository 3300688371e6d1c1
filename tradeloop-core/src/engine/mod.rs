pub mod cache;
pub mod delta;
pub mod registry;
pub mod scheduler;

pub use cache::{ActiveLoopCache, LoopEntry, LoopFilter};
pub use registry::TenantRegistry;
pub use scheduler::TenantScheduler;

use crate::algo::{self, ScoreCache};
use crate::config::TenantSettings;
use crate::graph::store::GraphStore;
use crate::graph::view::GraphView;
use crate::persist::PersistenceBridge;
use crate::types::*;
use delta::PendingDiscovery;
use parking_lot::{Mutex, RwLock};
use scheduler::DiscoveryAdmission;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Records appended to the mutation log before a compaction snapshot
const COMPACT_AFTER_RECORDS: usize = 5_000;

/// Notifications retained for polling before the oldest are dropped
const OUTBOX_DEPTH: usize = 10_000;

/// Target of a want retraction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WantTarget {
    Nft(NftId),
    Collection(CollectionId),
}

/// Usage counters for one tenant
#[derive(Default)]
pub struct TenantUsage {
    events_processed: AtomicU64,
    discoveries_run: AtomicU64,
    loops_found: AtomicU64,
    loops_invalidated: AtomicU64,
    expansions_run: AtomicU64,
    derived_wants: AtomicU64,
}

/// Serializable view of the usage counters
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub events_processed: u64,
    pub discoveries_run: u64,
    pub loops_found: u64,
    pub loops_invalidated: u64,
    pub expansions_run: u64,
    pub derived_wants: u64,
    pub persistence_degraded: bool,
    pub quarantined: bool,
}

/// Aggregate counters for the stats query surface
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub graph: GraphStats,
    pub active_loops: usize,
    pub discoveries_in_flight: usize,
    pub pending_discoveries: usize,
    pub last_run_partial: bool,
}

/// Lifecycle detail for one cached loop
#[derive(Clone, Debug)]
pub struct LoopDetail {
    pub cycle: TradeCycle,
    pub state: LoopState,
    pub age: Duration,
    pub expires_in: Duration,
}

/// Per-tenant engine: the composition root owning the graph store, the
/// active loop cache, the scheduler and the persistence bridge.
///
/// The component graph is built once at tenant init; there are no ambient
/// singletons and no timers. Sweeps run from the explicit [`tick`].
/// Events are applied inline: mutate under the store's write lock, invalidate
/// and revalidate cached loops, then run a rooted discovery against a fresh
/// snapshot, debounced to at most one run per root-set fingerprint.
///
/// [`tick`]: TradeEngine::tick
pub struct TradeEngine {
    tenant: TenantId,
    store: GraphStore,
    cache: ActiveLoopCache,
    scheduler: TenantScheduler,
    settings: RwLock<Arc<TenantSettings>>,
    score_cache: ScoreCache,
    usage: TenantUsage,
    outbox: Mutex<VecDeque<SequencedEvent>>,
    next_seq: AtomicU64,
    next_run_id: AtomicU64,
    cancel: AtomicBool,
    quarantined: AtomicBool,
    last_run_partial: AtomicBool,
    persistence: Option<Mutex<PersistenceBridge>>,
    persistence_degraded: AtomicBool,
}

impl std::fmt::Debug for TradeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeEngine")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl TradeEngine {
    pub fn new(tenant: &str, settings: TenantSettings) -> EngineResult<Self> {
        settings.validate()?;
        Ok(Self::build(tenant, settings, GraphStore::new(), None))
    }

    /// Open a tenant with durability: replay snapshot plus log tail into the
    /// store before any new work is admitted.
    pub fn open_persistent(
        tenant: &str,
        settings: TenantSettings,
        dir: &Path,
    ) -> EngineResult<Self> {
        settings.validate()?;
        let (snapshot, records) = PersistenceBridge::load(dir)?;
        let store = snapshot.map(GraphStore::from_state).unwrap_or_default();
        for record in &records {
            store.apply_record(record, &settings);
        }
        let bridge = PersistenceBridge::open(dir, COMPACT_AFTER_RECORDS)?;
        info!(tenant, replayed = records.len(), "tenant state recovered");
        Ok(Self::build(tenant, settings, store, Some(bridge)))
    }

    fn build(
        tenant: &str,
        settings: TenantSettings,
        store: GraphStore,
        bridge: Option<PersistenceBridge>,
    ) -> Self {
        let scheduler = TenantScheduler::new(
            settings.ingestion_queue_depth,
            settings.max_discoveries_in_flight,
            settings.expansion_burst,
            settings.expansion_per_second,
            settings.breaker_failure_threshold,
            Duration::from_millis(settings.breaker_cooldown_ms),
        );
        let score_cache = ScoreCache::new(Duration::from_millis(settings.score_cache_ttl_ms));
        Self {
            tenant: tenant.to_string(),
            store,
            cache: ActiveLoopCache::new(),
            scheduler,
            settings: RwLock::new(Arc::new(settings)),
            score_cache,
            usage: TenantUsage::default(),
            outbox: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            next_run_id: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
            quarantined: AtomicBool::new(false),
            last_run_partial: AtomicBool::new(false),
            persistence: bridge.map(Mutex::new),
            persistence_degraded: AtomicBool::new(false),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn settings(&self) -> Arc<TenantSettings> {
        self.settings.read().clone()
    }

    /// Swap the settings atomically. Runs already in flight finish under the
    /// settings they started with.
    pub fn update_settings(&self, settings: TenantSettings) -> EngineResult<()> {
        settings.validate()?;
        *self.settings.write() = Arc::new(settings);
        Ok(())
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::Relaxed)
    }

    /// Refuse new writes, keep serving reads. Entered on detecting an
    /// invariant violation; leaving quarantine is an operator decision.
    pub fn quarantine(&self) {
        self.quarantined.store(true, Ordering::Relaxed);
        warn!(tenant = %self.tenant, "tenant quarantined, writes refused");
    }

    /// Cooperative stop for in-flight discoveries, e.g. before teardown.
    pub fn cancel_discoveries(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn ensure_writable(&self) -> EngineResult<()> {
        if self.is_quarantined() {
            return Err(EngineError::Quarantined(self.tenant.clone()));
        }
        self.scheduler.admit_event()
    }

    // ---- event surface ----

    /// Idempotent inventory upsert for one wallet.
    pub fn submit_inventory(
        &self,
        wallet: &str,
        nfts: Vec<(NftId, NftMetadata)>,
    ) -> EngineResult<EventOutcome> {
        self.ensure_writable()?;
        self.usage.events_processed.fetch_add(1, Ordering::Relaxed);
        let settings = self.settings();

        let mut records = Vec::new();
        for (nft, metadata) in nfts {
            match self.store.put_nft(wallet, &nft, metadata, &settings) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => return self.abort_batch(records, e),
            }
        }
        self.ingest(records)
    }

    /// Idempotent wants upsert: explicit NFTs plus collection subscriptions.
    pub fn submit_wants(
        &self,
        wallet: &str,
        wanted_nfts: Vec<NftId>,
        wanted_collections: Vec<CollectionId>,
    ) -> EngineResult<EventOutcome> {
        self.ensure_writable()?;
        self.usage.events_processed.fetch_add(1, Ordering::Relaxed);
        let settings = self.settings();

        let mut records = Vec::new();
        for nft in wanted_nfts {
            match self.store.add_want(wallet, &nft, &settings) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => return self.abort_batch(records, e),
            }
        }
        for collection in wanted_collections {
            // Expansion is the rate-limited, externally-dependent step; when
            // the bucket is empty the subscription is still recorded and the
            // next membership notification re-derives the wants.
            let expand = match self.scheduler.acquire_expansion_token(Instant::now()) {
                Ok(()) => true,
                Err(EngineError::RateLimited { retry_after_ms }) => {
                    warn!(
                        tenant = %self.tenant,
                        wallet,
                        collection = %collection,
                        retry_after_ms,
                        "collection expansion rate limited, want recorded unexpanded"
                    );
                    false
                }
                Err(e) => return self.abort_batch(records, e),
            };
            let result = if expand {
                self.store.add_collection_want(wallet, &collection, &settings)
            } else {
                self.store
                    .add_collection_want_unexpanded(wallet, &collection, &settings)
            };
            match result {
                Ok((record, report)) => {
                    if expand {
                        self.usage.expansions_run.fetch_add(1, Ordering::Relaxed);
                        self.usage
                            .derived_wants
                            .fetch_add(report.expanded_size as u64, Ordering::Relaxed);
                    }
                    records.extend(record);
                }
                Err(e) => return self.abort_batch(records, e),
            }
        }
        self.ingest(records)
    }

    /// Retract a want for an NFT or a whole collection subscription.
    pub fn remove_want(&self, wallet: &str, target: WantTarget) -> EngineResult<EventOutcome> {
        self.ensure_writable()?;
        self.usage.events_processed.fetch_add(1, Ordering::Relaxed);

        let records = match target {
            WantTarget::Nft(nft) => self
                .store
                .remove_want(wallet, &nft)?
                .into_iter()
                .collect(),
            WantTarget::Collection(collection) => {
                self.store.remove_collection_want(wallet, &collection)?
            }
        };
        self.ingest(records)
    }

    /// Apply an ownership transfer observed externally.
    pub fn notify_transfer(&self, nft: &str, new_owner: &str) -> EngineResult<EventOutcome> {
        self.ensure_writable()?;
        self.usage.events_processed.fetch_add(1, Ordering::Relaxed);
        let settings = self.settings();

        let records = self
            .store
            .transfer(nft, new_owner, &settings)?
            .into_iter()
            .collect();
        self.ingest(records)
    }

    /// Apply a collection membership diff from the external resolver. Guarded
    /// by the resolution circuit breaker: while it is open, callers get
    /// `Unavailable` immediately.
    pub fn notify_collection_membership(
        &self,
        collection: &str,
        added: Vec<NftId>,
        removed: Vec<NftId>,
    ) -> EngineResult<EventOutcome> {
        self.ensure_writable()?;
        self.scheduler.check_resolution(Instant::now())?;
        self.usage.events_processed.fetch_add(1, Ordering::Relaxed);
        let settings = self.settings();

        let mut members = self
            .store
            .with_state(|s| s.collection_members.get(collection).cloned())
            .unwrap_or_default();
        for nft in added {
            members.insert(nft);
        }
        for nft in &removed {
            members.remove(nft);
        }

        let records = self
            .store
            .set_collection_members(collection, members, &settings)?;
        self.scheduler.record_resolution_success();
        self.ingest(records)
    }

    /// Report that the external collection resolver failed; feeds the
    /// circuit breaker.
    pub fn report_resolution_failure(&self) {
        self.scheduler.record_resolution_failure(Instant::now());
    }

    /// Remove an NFT from the graph (burn or delisting).
    pub fn remove_nft(&self, nft: &str) -> EngineResult<EventOutcome> {
        self.ensure_writable()?;
        self.usage.events_processed.fetch_add(1, Ordering::Relaxed);
        let record = self.store.remove_nft(nft)?;
        self.ingest(vec![record])
    }

    /// A batch died mid-way on an input error. The already-applied prefix is
    /// still ingested (cache invalidation and rediscovery) before the error
    /// surfaces, so state and caches stay consistent.
    fn abort_batch(
        &self,
        applied: Vec<MutationRecord>,
        error: EngineError,
    ) -> EngineResult<EventOutcome> {
        if !applied.is_empty() {
            let _ = self.ingest(applied);
        }
        Err(error)
    }

    // ---- mutation tail: persist, invalidate, rediscover ----

    fn ingest(&self, records: Vec<MutationRecord>) -> EngineResult<EventOutcome> {
        if records.is_empty() {
            return Ok(EventOutcome {
                accepted: true,
                discovered_loops_delta: 0,
                run_id: None,
            });
        }

        self.persist_append(&records);

        self.cache.mark_stale_matching(&records);
        for (id, reason) in self.cache.revalidate(&self.store) {
            self.usage.loops_invalidated.fetch_add(1, Ordering::Relaxed);
            self.emit(LoopEvent::LoopInvalidated {
                canonical_id: id,
                reason,
            });
        }

        let roots = delta::affected_roots(&records);
        let task = PendingDiscovery {
            fingerprint: delta::fingerprint(&roots),
            roots,
        };
        let (delta_count, run_id) = match self.scheduler.begin_discovery(task.clone()) {
            DiscoveryAdmission::Started => {
                let result = self.run_discovery(task);
                self.drain_pending();
                result
            }
            DiscoveryAdmission::AlreadyRunning | DiscoveryAdmission::AtCapacity => (0, None),
        };

        Ok(EventOutcome {
            accepted: true,
            discovered_loops_delta: delta_count,
            run_id,
        })
    }

    fn run_discovery(&self, task: PendingDiscovery) -> (i64, Option<RunId>) {
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.usage.discoveries_run.fetch_add(1, Ordering::Relaxed);
        let settings = self.settings();

        let view = GraphView::capture(&self.store);
        let outcome = algo::discover(
            &view,
            Some(&task.roots),
            &settings,
            &self.cancel,
            &self.score_cache,
        );
        self.last_run_partial
            .store(outcome.partiality.is_partial(), Ordering::Relaxed);

        let ttl = Duration::from_millis(settings.loop_ttl_ms);
        let mut added = 0i64;
        for cycle in outcome.cycles {
            // The run saw one snapshot generation; anything that moved since
            // is re-checked before the loop is surfaced.
            if !cycle_still_valid(&self.store, &cycle) {
                continue;
            }
            if self.cache.insert(cycle.clone(), ttl) {
                self.usage.loops_found.fetch_add(1, Ordering::Relaxed);
                self.emit(LoopEvent::LoopDiscovered {
                    canonical_id: cycle.canonical_id.clone(),
                    cycle,
                });
                added += 1;
            }
        }

        self.scheduler.finish_discovery(&task.fingerprint);
        (added, Some(run_id))
    }

    fn drain_pending(&self) {
        while let Some(task) = self.scheduler.next_pending() {
            self.run_discovery(task);
        }
    }

    fn persist_append(&self, records: &[MutationRecord]) {
        let Some(bridge) = &self.persistence else { return };
        let mut bridge = bridge.lock();
        if let Err(e) = bridge.append_batch(records) {
            // Durability degrades, ingestion never blocks on it.
            self.persistence_degraded.store(true, Ordering::Relaxed);
            warn!(tenant = %self.tenant, error = %e, "mutation log append failed");
        }
    }

    fn emit(&self, event: LoopEvent) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut outbox = self.outbox.lock();
        if outbox.len() >= OUTBOX_DEPTH {
            outbox.pop_front();
        }
        outbox.push_back(SequencedEvent { seq, event });
    }

    // ---- query surface ----

    /// Notifications after `since`, oldest first.
    pub fn poll_events(&self, since: SequenceNo, limit: usize) -> Vec<SequencedEvent> {
        self.outbox
            .lock()
            .iter()
            .filter(|e| e.seq > since)
            .take(limit.max(1))
            .cloned()
            .collect()
    }

    pub fn get_active_loops(
        &self,
        filter: &LoopFilter,
        limit: usize,
        cursor: usize,
    ) -> (Vec<TradeCycle>, Option<usize>, bool) {
        let (loops, next) = self.cache.active_loops(filter, limit, cursor);
        (loops, next, self.last_run_partial.load(Ordering::Relaxed))
    }

    pub fn get_loop_detail(&self, canonical_id: &str) -> Option<LoopDetail> {
        let entry = self.cache.get_entry(canonical_id)?;
        let now = Instant::now();
        Some(LoopDetail {
            cycle: entry.cycle,
            state: entry.state,
            age: now.saturating_duration_since(entry.discovered_at),
            expires_in: entry.expires_at.saturating_duration_since(now),
        })
    }

    pub fn stats(&self) -> StatsReport {
        let view = GraphView::capture(&self.store);
        StatsReport {
            graph: view.stats(),
            active_loops: self.cache.active_count(),
            discoveries_in_flight: self.scheduler.discoveries_in_flight(),
            pending_discoveries: self.scheduler.pending_len(),
            last_run_partial: self.last_run_partial.load(Ordering::Relaxed),
        }
    }

    pub fn usage(&self) -> UsageReport {
        UsageReport {
            events_processed: self.usage.events_processed.load(Ordering::Relaxed),
            discoveries_run: self.usage.discoveries_run.load(Ordering::Relaxed),
            loops_found: self.usage.loops_found.load(Ordering::Relaxed),
            loops_invalidated: self.usage.loops_invalidated.load(Ordering::Relaxed),
            expansions_run: self.usage.expansions_run.load(Ordering::Relaxed),
            derived_wants: self.usage.derived_wants.load(Ordering::Relaxed),
            persistence_degraded: self.persistence_degraded.load(Ordering::Relaxed),
            quarantined: self.is_quarantined(),
        }
    }

    /// Periodic maintenance: TTL sweeps, score-cache sweep, log compaction
    /// and parked rediscoveries. Driven by the boundary's ticker; safe to
    /// call at any cadence.
    pub fn tick(&self, now: Instant) {
        for id in self.cache.sweep_expired(now) {
            self.usage.loops_invalidated.fetch_add(1, Ordering::Relaxed);
            self.emit(LoopEvent::LoopInvalidated {
                canonical_id: id,
                reason: InvalidationReason::Expired,
            });
        }
        self.score_cache.sweep();
        self.drain_pending();

        if let Some(bridge) = &self.persistence {
            let mut bridge = bridge.lock();
            if bridge.should_compact() {
                let state = self.store.export_state();
                if let Err(e) = bridge.write_snapshot(&state) {
                    self.persistence_degraded.store(true, Ordering::Relaxed);
                    warn!(tenant = %self.tenant, error = %e, "snapshot compaction failed");
                }
            }
        }
    }

    /// Clone of the authoritative graph state, for operator tooling and
    /// offline inspection.
    pub fn export_graph(&self) -> crate::graph::store::GraphState {
        self.store.export_state()
    }

    /// Integrity audit; a violation quarantines the tenant.
    pub fn audit(&self) -> EngineResult<()> {
        match self.store.verify_integrity() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.quarantine();
                Err(e)
            }
        }
    }
}

/// Invariant check at surfacing time: every step still moves an owned NFT to
/// a wallet that wants it.
fn cycle_still_valid(store: &GraphStore, cycle: &TradeCycle) -> bool {
    store.with_state(|state| {
        cycle.steps.iter().all(|step| {
            state.owner_index.get(&step.nft) == Some(&step.from)
                && state
                    .wallets
                    .get(&step.to)
                    .is_some_and(|w| w.wants(&step.nft))
        })
    })
}
