use super::IndexedGraph;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::debug;

/// Why an enumeration stopped before exhausting the search space
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchHalt {
    Exhausted,
    Timeout,
    Cap,
    Cancelled,
}

/// Elementary cycles found within one SCC (or community sub-SCC)
#[derive(Clone, Debug)]
pub struct CycleSearch {
    /// Vertex rings; each starts at its smallest member, which makes the
    /// enumeration order (and therefore canonicalization) stable
    pub cycles: Vec<Vec<usize>>,
    pub halt: SearchHalt,
}

/// Bounds applied to a single SCC search
#[derive(Clone, Copy, Debug)]
pub struct SearchLimits {
    pub max_depth: usize,
    pub deadline: Instant,
    pub scc_cap: usize,
}

/// Enumerate every elementary directed cycle of length `2..=max_depth` whose
/// vertices all lie in `allowed`.
///
/// This is Johnson's scheme: vertices are tried as cycle roots in ascending
/// order, the search is restricted to vertices not smaller than the root, and
/// a blocked set plus blocked map prevent re-exploring vertices that cannot
/// currently reach back to the root. Because the depth bound can cut off
/// exploration for reasons that are not structural, a vertex abandoned at the
/// bound is unblocked immediately instead of being parked in the blocked map.
///
/// The search suspends cooperatively: the cancel flag, the deadline and both
/// cycle caps are observed at every emission and between roots.
pub fn enumerate_elementary_cycles(
    graph: &IndexedGraph,
    allowed: &[usize],
    limits: SearchLimits,
    run_budget: &AtomicUsize,
    cancel: &AtomicBool,
) -> CycleSearch {
    let n = graph.len();
    let mut member = vec![false; n];
    for &v in allowed {
        member[v] = true;
    }

    let mut search = Search {
        graph,
        member,
        start: 0,
        limits,
        run_budget,
        cancel,
        blocked: vec![false; n],
        block_map: vec![BTreeSet::new(); n],
        path: Vec::with_capacity(limits.max_depth),
        cycles: Vec::new(),
        halt: None,
    };

    for &start in allowed {
        if cancel.load(Ordering::Relaxed) {
            search.halt = Some(SearchHalt::Cancelled);
            break;
        }
        if Instant::now() > limits.deadline {
            search.halt = Some(SearchHalt::Timeout);
            break;
        }

        // Fresh blocking state per root; the root restriction (`v >= start`)
        // already guarantees each cycle is seen from its smallest vertex only.
        search.start = start;
        for v in allowed {
            search.blocked[*v] = false;
            search.block_map[*v].clear();
        }
        search.circuit(start);
        if search.halt.is_some() {
            break;
        }
    }

    let halt = search.halt.unwrap_or(SearchHalt::Exhausted);
    debug!(
        scc_size = allowed.len(),
        cycles = search.cycles.len(),
        ?halt,
        "scc enumeration finished"
    );
    CycleSearch {
        cycles: search.cycles,
        halt,
    }
}

struct Search<'a> {
    graph: &'a IndexedGraph,
    member: Vec<bool>,
    start: usize,
    limits: SearchLimits,
    run_budget: &'a AtomicUsize,
    cancel: &'a AtomicBool,
    blocked: Vec<bool>,
    block_map: Vec<BTreeSet<usize>>,
    path: Vec<usize>,
    cycles: Vec<Vec<usize>>,
    halt: Option<SearchHalt>,
}

impl Search<'_> {
    /// Returns true when some cycle was closed in this subtree.
    fn circuit(&mut self, v: usize) -> bool {
        self.path.push(v);
        self.blocked[v] = true;

        let mut found = false;
        let mut cut_by_depth = false;

        for i in 0..self.graph.succ[v].len() {
            if self.halt.is_some() {
                break;
            }
            let w = self.graph.succ[v][i];
            if !self.member[w] || w < self.start {
                continue;
            }
            if w == self.start {
                if self.path.len() >= 2 {
                    self.emit();
                    found = true;
                }
            } else if self.path.len() < self.limits.max_depth {
                if !self.blocked[w] && self.circuit(w) {
                    found = true;
                }
            } else {
                cut_by_depth = true;
            }
        }

        self.path.pop();
        if found || cut_by_depth {
            self.unblock(v);
        } else {
            for i in 0..self.graph.succ[v].len() {
                let w = self.graph.succ[v][i];
                if self.member[w] && w >= self.start {
                    self.block_map[w].insert(v);
                }
            }
        }
        found
    }

    fn emit(&mut self) {
        if self.cancel.load(Ordering::Relaxed) {
            self.halt = Some(SearchHalt::Cancelled);
            return;
        }
        if Instant::now() > self.limits.deadline {
            self.halt = Some(SearchHalt::Timeout);
            return;
        }
        let admitted = self
            .run_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
            .is_ok();
        if !admitted {
            self.halt = Some(SearchHalt::Cap);
            return;
        }

        self.cycles.push(self.path.clone());
        if self.cycles.len() >= self.limits.scc_cap {
            self.halt = Some(SearchHalt::Cap);
        }
    }

    fn unblock(&mut self, v: usize) {
        let mut pending = vec![v];
        while let Some(u) = pending.pop() {
            if !self.blocked[u] && u != v {
                continue;
            }
            self.blocked[u] = false;
            let dependents = std::mem::take(&mut self.block_map[u]);
            for d in dependents {
                if self.blocked[d] {
                    pending.push(d);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn graph_of(n: usize, edges: &[(usize, usize)]) -> IndexedGraph {
        let wallets = (0..n).map(|i| format!("w{i}")).collect();
        let mut succ = vec![Vec::new(); n];
        for &(a, b) in edges {
            succ[a].push(b);
        }
        for list in &mut succ {
            list.sort_unstable();
        }
        IndexedGraph::from_parts(wallets, succ)
    }

    fn enumerate(graph: &IndexedGraph, allowed: &[usize], max_depth: usize) -> CycleSearch {
        let limits = SearchLimits {
            max_depth,
            deadline: Instant::now() + Duration::from_secs(30),
            scc_cap: 1_000,
        };
        let budget = AtomicUsize::new(10_000);
        let cancel = AtomicBool::new(false);
        enumerate_elementary_cycles(graph, allowed, limits, &budget, &cancel)
    }

    #[test]
    fn test_two_cycle() {
        let graph = graph_of(2, &[(0, 1), (1, 0)]);
        let search = enumerate(&graph, &[0, 1], 10);
        assert_eq!(search.cycles, vec![vec![0, 1]]);
        assert_eq!(search.halt, SearchHalt::Exhausted);
    }

    #[test]
    fn test_three_cycle_found_once() {
        let graph = graph_of(3, &[(0, 1), (1, 2), (2, 0)]);
        let search = enumerate(&graph, &[0, 1, 2], 10);
        assert_eq!(search.cycles, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_complete_digraph_k3() {
        // K3 with all 6 arcs: three 2-cycles and two 3-cycles
        let graph = graph_of(3, &[(0, 1), (1, 0), (1, 2), (2, 1), (0, 2), (2, 0)]);
        let search = enumerate(&graph, &[0, 1, 2], 10);
        let expected: Vec<Vec<usize>> = vec![
            vec![0, 1],
            vec![0, 1, 2],
            vec![0, 2],
            vec![0, 2, 1],
            vec![1, 2],
        ];
        let mut got = search.cycles.clone();
        got.sort();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_depth_bound() {
        let graph = graph_of(3, &[(0, 1), (1, 2), (2, 0), (1, 0)]);
        let search = enumerate(&graph, &[0, 1, 2], 2);
        assert_eq!(search.cycles, vec![vec![0, 1]]);
    }

    #[test]
    fn test_depth_bound_does_not_mask_shorter_cycles() {
        // A long detour through 2..4 is cut off at depth 3; the direct
        // 0 -> 1 -> 4 -> 0 triangle must still be found even though vertex 4
        // was first reached at the bound.
        let graph = graph_of(
            5,
            &[(0, 1), (1, 2), (2, 3), (3, 4), (4, 0), (1, 4)],
        );
        let search = enumerate(&graph, &[0, 1, 2, 3, 4], 3);
        assert_eq!(search.cycles, vec![vec![0, 1, 4]]);
    }

    #[test]
    fn test_six_cycle() {
        let graph = graph_of(
            6,
            &[(0, 1), (1, 2), (2, 3), (3, 4), (4, 5), (5, 0)],
        );
        let search = enumerate(&graph, &[0, 1, 2, 3, 4, 5], 10);
        assert_eq!(search.cycles, vec![vec![0, 1, 2, 3, 4, 5]]);
    }

    #[test]
    fn test_scc_cap_halts() {
        let graph = graph_of(3, &[(0, 1), (1, 0), (1, 2), (2, 1), (0, 2), (2, 0)]);
        let limits = SearchLimits {
            max_depth: 10,
            deadline: Instant::now() + Duration::from_secs(30),
            scc_cap: 2,
        };
        let budget = AtomicUsize::new(10_000);
        let cancel = AtomicBool::new(false);
        let search = enumerate_elementary_cycles(&graph, &[0, 1, 2], limits, &budget, &cancel);
        assert_eq!(search.cycles.len(), 2);
        assert_eq!(search.halt, SearchHalt::Cap);
    }

    #[test]
    fn test_run_budget_halts() {
        let graph = graph_of(3, &[(0, 1), (1, 0), (1, 2), (2, 1), (0, 2), (2, 0)]);
        let limits = SearchLimits {
            max_depth: 10,
            deadline: Instant::now() + Duration::from_secs(30),
            scc_cap: 1_000,
        };
        let budget = AtomicUsize::new(1);
        let cancel = AtomicBool::new(false);
        let search = enumerate_elementary_cycles(&graph, &[0, 1, 2], limits, &budget, &cancel);
        assert_eq!(search.cycles.len(), 1);
        assert_eq!(search.halt, SearchHalt::Cap);
    }

    #[test]
    fn test_cancellation_stops_search() {
        let graph = graph_of(2, &[(0, 1), (1, 0)]);
        let limits = SearchLimits {
            max_depth: 10,
            deadline: Instant::now() + Duration::from_secs(30),
            scc_cap: 1_000,
        };
        let budget = AtomicUsize::new(10_000);
        let cancel = AtomicBool::new(true);
        let search = enumerate_elementary_cycles(&graph, &[0, 1], limits, &budget, &cancel);
        assert!(search.cycles.is_empty());
        assert_eq!(search.halt, SearchHalt::Cancelled);
    }
}
