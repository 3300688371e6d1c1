pub mod canonical;
pub mod community;
pub mod cycles;
pub mod scc;
pub mod score;

pub use canonical::{canonical_id, canonicalize_steps, BloomFilter, CycleDeduper};
pub use score::{ScoreBreakdown, ScoreCache};

use crate::config::TenantSettings;
use crate::graph::view::GraphView;
use crate::types::*;
use cycles::{CycleSearch, SearchHalt, SearchLimits};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Dense-index projection of a graph view, shared by every algorithm phase.
///
/// Wallets are numbered in id order, so index comparisons agree with
/// lexicographic wallet comparisons and the enumeration order is stable.
pub struct IndexedGraph {
    pub wallets: Vec<WalletId>,
    /// Successor lists, each ascending
    pub succ: Vec<Vec<usize>>,
    index: BTreeMap<WalletId, usize>,
}

impl IndexedGraph {
    pub fn from_view(view: &GraphView) -> Self {
        let wallets: Vec<WalletId> = view.nodes().cloned().collect();
        let index: BTreeMap<WalletId, usize> = wallets
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i))
            .collect();
        let succ = wallets
            .iter()
            .map(|wallet| {
                view.edges_from(wallet)
                    .map(|targets| targets.keys().filter_map(|t| index.get(t).copied()).collect())
                    .unwrap_or_default()
            })
            .collect();
        Self {
            wallets,
            succ,
            index,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(wallets: Vec<WalletId>, succ: Vec<Vec<usize>>) -> Self {
        let index = wallets
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i))
            .collect();
        Self {
            wallets,
            succ,
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    pub fn index_of(&self, wallet: &str) -> Option<usize> {
        self.index.get(wallet).copied()
    }
}

/// Counters describing one discovery run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryStats {
    pub wallets: usize,
    pub sccs: usize,
    pub partitioned_sccs: usize,
    pub communities: usize,
    pub raw_cycles: usize,
    pub duplicates: u64,
    pub rejected: usize,
    pub below_threshold: usize,
    pub elapsed_ms: u64,
}

/// Everything a discovery run produced
#[derive(Clone, Debug)]
pub struct DiscoveryOutcome {
    pub cycles: Vec<TradeCycle>,
    pub status: RunStatus,
    pub partiality: Partiality,
    pub stats: DiscoveryStats,
}

impl DiscoveryOutcome {
    fn empty(status: RunStatus, stats: DiscoveryStats) -> Self {
        Self {
            cycles: Vec::new(),
            status,
            partiality: Partiality::Complete,
            stats,
        }
    }
}

/// The consolidated discovery path: SCC decomposition, community splitting of
/// oversized components, elementary-cycle enumeration, canonical
/// deduplication, then scoring. One call, one snapshot, deterministic output.
///
/// With `roots` given, only SCCs containing a root are searched, which is how
/// an event-driven rediscovery stays proportional to graph locality.
pub fn discover(
    view: &GraphView,
    roots: Option<&BTreeSet<WalletId>>,
    settings: &TenantSettings,
    cancel: &AtomicBool,
    score_cache: &ScoreCache,
) -> DiscoveryOutcome {
    let started = Instant::now();
    let run_deadline = started + Duration::from_millis(settings.per_run_timeout_ms);

    let graph = IndexedGraph::from_view(view);
    let mut stats = DiscoveryStats {
        wallets: graph.len(),
        ..DiscoveryStats::default()
    };
    if graph.is_empty() {
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        return DiscoveryOutcome::empty(RunStatus::Completed, stats);
    }

    let root_indices: Option<BTreeSet<usize>> = roots.map(|set| {
        set.iter()
            .filter_map(|wallet| graph.index_of(wallet))
            .collect()
    });
    if let Some(indices) = &root_indices {
        if indices.is_empty() {
            stats.elapsed_ms = started.elapsed().as_millis() as u64;
            return DiscoveryOutcome::empty(RunStatus::Completed, stats);
        }
    }

    let scc_budget = Duration::from_millis(settings.scc_phase_budget_ms)
        .min(run_deadline.saturating_duration_since(Instant::now()));
    let partition = scc::strongly_connected_components(
        &graph,
        settings.scc_batch_size,
        scc_budget,
        root_indices.as_ref(),
    );
    stats.sccs = partition.components.len();
    let mut partiality = partition.partiality;

    let run_budget = AtomicUsize::new(settings.max_loops_per_request);
    let outcomes = run_components(
        &graph,
        &partition.components,
        settings,
        run_deadline,
        &run_budget,
        cancel,
    );

    let mut cancelled = false;
    let mut rings: Vec<Vec<usize>> = Vec::new();
    for outcome in outcomes {
        stats.partitioned_sccs += outcome.partitioned as usize;
        stats.communities += outcome.communities;
        for search in outcome.searches {
            match search.halt {
                SearchHalt::Exhausted => {}
                SearchHalt::Timeout => partiality = partiality.combine(Partiality::Timeout),
                SearchHalt::Cap => partiality = partiality.combine(Partiality::Cap),
                SearchHalt::Cancelled => cancelled = true,
            }
            rings.extend(search.cycles);
        }
    }
    stats.raw_cycles = rings.len();

    // Dedup, then score, preserving enumeration order.
    let deduper = CycleDeduper::new(settings.max_loops_per_request, settings.enable_bloom);
    let mut cycles = Vec::new();
    for ring in rings {
        let Some(steps) = assign_step_nfts(view, &graph, &ring) else {
            stats.rejected += 1;
            continue;
        };
        let steps = if settings.enable_canonical {
            canonicalize_steps(steps)
        } else {
            steps
        };
        let id = canonical_id(&steps);
        if !deduper.insert(&id) {
            continue;
        }

        let score = score_cache.get(&id, view.generation()).unwrap_or_else(|| {
            let computed = score::score_cycle(view, &steps, settings);
            score_cache.insert(&id, view.generation(), computed);
            computed
        });
        if score.efficiency < settings.min_efficiency || score.composite < settings.min_score {
            stats.below_threshold += 1;
            continue;
        }

        cycles.push(TradeCycle {
            canonical_id: id,
            participants: steps.len(),
            steps,
            efficiency: score.efficiency,
            fairness: score.fairness,
            quality: score.quality,
            score: score.composite,
            generation: view.generation(),
        });
    }
    stats.duplicates = deduper.duplicates();
    stats.elapsed_ms = started.elapsed().as_millis() as u64;

    let status = if cancelled {
        RunStatus::Cancelled
    } else if partiality == Partiality::Timeout {
        RunStatus::PartialTimeout
    } else if partiality == Partiality::Cap {
        RunStatus::PartialCap
    } else {
        RunStatus::Completed
    };
    info!(
        wallets = stats.wallets,
        sccs = stats.sccs,
        cycles = cycles.len(),
        elapsed_ms = stats.elapsed_ms,
        ?status,
        "discovery run finished"
    );
    DiscoveryOutcome {
        cycles,
        status,
        partiality,
        stats,
    }
}

struct ComponentOutcome {
    searches: Vec<CycleSearch>,
    partitioned: bool,
    communities: usize,
}

fn run_components(
    graph: &IndexedGraph,
    components: &[Vec<usize>],
    settings: &TenantSettings,
    run_deadline: Instant,
    run_budget: &AtomicUsize,
    cancel: &AtomicBool,
) -> Vec<ComponentOutcome> {
    let process =
        |scc: &Vec<usize>| process_component(graph, scc, settings, run_deadline, run_budget, cancel);

    #[cfg(feature = "parallel")]
    {
        if settings.enable_parallel && components.len() > 1 {
            use rayon::prelude::*;
            let workers = settings.parallel_scc_workers.min(components.len());
            if let Ok(pool) = rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                return pool.install(|| components.par_iter().map(process).collect());
            }
        }
    }

    components.iter().map(process).collect()
}

/// Enumerate one SCC, splitting it into communities first when it is above
/// the partitioning thresholds. Disjoint communities are independent
/// subproblems; a bounded bridge pass recovers cycles crossing them.
fn process_component(
    graph: &IndexedGraph,
    scc: &[usize],
    settings: &TenantSettings,
    run_deadline: Instant,
    run_budget: &AtomicUsize,
    cancel: &AtomicBool,
) -> ComponentOutcome {
    let scc_deadline =
        (Instant::now() + Duration::from_millis(settings.per_scc_timeout_ms)).min(run_deadline);
    let limits = SearchLimits {
        max_depth: settings.max_depth,
        deadline: scc_deadline,
        scc_cap: settings.max_cycles_per_scc,
    };

    let oversized = scc.len() > settings.community_size_threshold
        || graph.len() > settings.community_wallet_trigger;
    if !(settings.enable_louvain && oversized) {
        let search = cycles::enumerate_elementary_cycles(graph, scc, limits, run_budget, cancel);
        return ComponentOutcome {
            searches: vec![search],
            partitioned: false,
            communities: 0,
        };
    }

    let partition = community::partition(graph, scc, settings.community_resolution);
    if partition.communities.len() <= 1 {
        let search = cycles::enumerate_elementary_cycles(graph, scc, limits, run_budget, cancel);
        return ComponentOutcome {
            searches: vec![search],
            partitioned: true,
            communities: partition.communities.len(),
        };
    }

    let communities = partition.communities.len();
    let mut searches = Vec::new();
    for members in &partition.communities {
        if members.len() < 2 {
            continue;
        }
        searches.push(cycles::enumerate_elementary_cycles(
            graph, members, limits, run_budget, cancel,
        ));
    }

    if !partition.cross_edges.is_empty() {
        // Second pass over the whole SCC, tightly capped; only rings that
        // actually span communities are kept, the rest were already found.
        let bridge_limits = SearchLimits {
            scc_cap: settings.max_bridge_cycles.min(settings.max_cycles_per_scc),
            ..limits
        };
        let mut bridge =
            cycles::enumerate_elementary_cycles(graph, scc, bridge_limits, run_budget, cancel);
        bridge.cycles.retain(|ring| {
            let first = partition.community_of(ring[0]);
            ring.iter().any(|&v| partition.community_of(v) != first)
        });
        debug!(
            scc_size = scc.len(),
            bridge_cycles = bridge.cycles.len(),
            "cross-community bridge pass finished"
        );
        searches.push(bridge);
    }

    ComponentOutcome {
        searches,
        partitioned: true,
        communities,
    }
}

/// Turn a vertex ring into trade steps, assigning each step the
/// lexicographically smallest NFT not already used elsewhere in the cycle.
/// Rings with an exhausted step (possible after a race with a mutation) or
/// with unavoidable NFT reuse are rejected.
fn assign_step_nfts(view: &GraphView, graph: &IndexedGraph, ring: &[usize]) -> Option<Vec<CycleStep>> {
    let mut used: BTreeSet<&str> = BTreeSet::new();
    let mut steps = Vec::with_capacity(ring.len());
    for (i, &v) in ring.iter().enumerate() {
        let from = &graph.wallets[v];
        let to = &graph.wallets[ring[(i + 1) % ring.len()]];
        let edge = view
            .edges_between(from, to)
            .iter()
            .find(|e| !used.contains(e.nft.as_str()))?;
        used.insert(edge.nft.as_str());
        steps.push(CycleStep {
            from: from.clone(),
            to: to.clone(),
            nft: edge.nft.clone(),
            kind: edge.kind.clone(),
        });
    }
    Some(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::store::GraphStore;

    fn direct_swap_store() -> GraphStore {
        let settings = TenantSettings::default();
        let store = GraphStore::new();
        store
            .put_nft("alice", "n1", NftMetadata::default(), &settings)
            .unwrap();
        store
            .put_nft("bob", "n2", NftMetadata::default(), &settings)
            .unwrap();
        store.add_want("alice", "n2", &settings).unwrap();
        store.add_want("bob", "n1", &settings).unwrap();
        store
    }

    fn run_discover(store: &GraphStore, roots: Option<&BTreeSet<WalletId>>) -> DiscoveryOutcome {
        let view = GraphView::capture(store);
        let settings = TenantSettings::default();
        let cancel = AtomicBool::new(false);
        let cache = ScoreCache::new(Duration::from_secs(600));
        discover(&view, roots, &settings, &cancel, &cache)
    }

    #[test]
    fn test_direct_swap_discovered() {
        let store = direct_swap_store();
        let outcome = run_discover(&store, None);
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.cycles.len(), 1);

        let cycle = &outcome.cycles[0];
        assert_eq!(cycle.participants, 2);
        assert!((cycle.efficiency - 1.0).abs() < 1e-9);
        assert_eq!(cycle.steps[0].from, "alice");
        assert_eq!(cycle.steps[0].nft, "n1");
        assert_eq!(cycle.steps[1].nft, "n2");
    }

    #[test]
    fn test_three_cycle_single_canonical_form() {
        let settings = TenantSettings::default();
        let store = GraphStore::new();
        store.put_nft("a", "n1", NftMetadata::default(), &settings).unwrap();
        store.put_nft("b", "n2", NftMetadata::default(), &settings).unwrap();
        store.put_nft("c", "n3", NftMetadata::default(), &settings).unwrap();
        store.add_want("a", "n2", &settings).unwrap();
        store.add_want("b", "n3", &settings).unwrap();
        store.add_want("c", "n1", &settings).unwrap();

        let outcome = run_discover(&store, None);
        assert_eq!(outcome.cycles.len(), 1);
        assert_eq!(outcome.cycles[0].participants, 3);
    }

    #[test]
    fn test_rooted_discovery_skips_unrelated_sccs() {
        let settings = TenantSettings::default();
        let store = direct_swap_store();
        store.put_nft("carol", "m1", NftMetadata::default(), &settings).unwrap();
        store.put_nft("dave", "m2", NftMetadata::default(), &settings).unwrap();
        store.add_want("carol", "m2", &settings).unwrap();
        store.add_want("dave", "m1", &settings).unwrap();

        let roots = BTreeSet::from(["carol".to_string()]);
        let outcome = run_discover(&store, Some(&roots));
        assert_eq!(outcome.cycles.len(), 1);
        assert!(outcome.cycles[0].touches_wallet("carol"));
    }

    #[test]
    fn test_roots_absent_from_graph_yield_nothing() {
        let store = direct_swap_store();
        let roots = BTreeSet::from(["nobody".to_string()]);
        let outcome = run_discover(&store, Some(&roots));
        assert!(outcome.cycles.is_empty());
        assert_eq!(outcome.status, RunStatus::Completed);
    }

    #[test]
    fn test_duplicate_nft_across_steps_rejected() {
        // alice and bob both want carol's only NFT; no ring can use it twice.
        let settings = TenantSettings::default();
        let store = GraphStore::new();
        store.put_nft("carol", "x", NftMetadata::default(), &settings).unwrap();
        store.add_want("alice", "x", &settings).unwrap();
        store.add_want("bob", "x", &settings).unwrap();

        let outcome = run_discover(&store, None);
        assert!(outcome.cycles.is_empty());
    }

    #[test]
    fn test_determinism_across_runs() {
        let store = direct_swap_store();
        let a = run_discover(&store, None);
        let b = run_discover(&store, None);
        let ids_a: Vec<_> = a.cycles.iter().map(|c| c.canonical_id.clone()).collect();
        let ids_b: Vec<_> = b.cycles.iter().map(|c| c.canonical_id.clone()).collect();
        assert_eq!(ids_a, ids_b);
    }
}
