use super::IndexedGraph;
use crate::types::Partiality;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::warn;

/// Result of the SCC decomposition phase
#[derive(Clone, Debug)]
pub struct SccPartition {
    /// Non-trivial components, each sorted by vertex, ordered by smallest member
    pub components: Vec<Vec<usize>>,
    pub partiality: Partiality,
}

/// Tarjan's algorithm, expressed iteratively so component size is bounded by
/// heap, not the call stack.
///
/// Vertices are visited in batches; the wall-clock budget is checked at batch
/// boundaries and the partition is returned as partial when it runs out.
/// Trivial (single-vertex) components are discarded: self-trades are
/// impossible while the store invariants hold. When `roots` is given, only
/// components containing at least one root are kept.
pub fn strongly_connected_components(
    graph: &IndexedGraph,
    batch_size: usize,
    budget: Duration,
    roots: Option<&BTreeSet<usize>>,
) -> SccPartition {
    let n = graph.len();
    let started = Instant::now();
    let mut partiality = Partiality::Complete;

    const UNVISITED: usize = usize::MAX;
    let mut index = vec![UNVISITED; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut components: Vec<Vec<usize>> = Vec::new();

    let batch_size = batch_size.max(1);
    'batches: for batch in (0..n).collect::<Vec<_>>().chunks(batch_size) {
        if started.elapsed() > budget {
            warn!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "scc decomposition budget exhausted, returning partial partition"
            );
            partiality = Partiality::Timeout;
            break 'batches;
        }
        for &root in batch {
            if index[root] != UNVISITED {
                continue;
            }

            // (vertex, position in its successor list)
            let mut call: Vec<(usize, usize)> = Vec::new();
            index[root] = next_index;
            lowlink[root] = next_index;
            next_index += 1;
            stack.push(root);
            on_stack[root] = true;
            call.push((root, 0));

            while let Some(&mut (v, ref mut succ_pos)) = call.last_mut() {
                if *succ_pos < graph.succ[v].len() {
                    let w = graph.succ[v][*succ_pos];
                    *succ_pos += 1;
                    if index[w] == UNVISITED {
                        index[w] = next_index;
                        lowlink[w] = next_index;
                        next_index += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        call.push((w, 0));
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                } else {
                    call.pop();
                    if let Some(&mut (parent, _)) = call.last_mut() {
                        lowlink[parent] = lowlink[parent].min(lowlink[v]);
                    }
                    if lowlink[v] == index[v] {
                        let mut component = Vec::new();
                        loop {
                            let w = stack.pop().expect("tarjan stack underflow");
                            on_stack[w] = false;
                            component.push(w);
                            if w == v {
                                break;
                            }
                        }
                        if component.len() >= 2 {
                            component.sort_unstable();
                            components.push(component);
                        }
                    }
                }
            }
        }
    }

    if let Some(roots) = roots {
        components.retain(|c| c.iter().any(|v| roots.contains(v)));
    }
    components.sort_by_key(|c| c[0]);

    SccPartition {
        components,
        partiality,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::IndexedGraph;

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

    fn run(graph: &IndexedGraph) -> SccPartition {
        strongly_connected_components(graph, 3_000, Duration::from_secs(45), None)
    }

    #[test]
    fn test_two_cycle() {
        let graph = graph_of(2, &[(0, 1), (1, 0)]);
        let partition = run(&graph);
        assert_eq!(partition.components, vec![vec![0, 1]]);
        assert_eq!(partition.partiality, Partiality::Complete);
    }

    #[test]
    fn test_trivial_components_discarded() {
        // 0 -> 1 -> 2 with no return path
        let graph = graph_of(3, &[(0, 1), (1, 2)]);
        let partition = run(&graph);
        assert!(partition.components.is_empty());
    }

    #[test]
    fn test_two_separate_components() {
        let graph = graph_of(5, &[(0, 1), (1, 0), (2, 3), (3, 4), (4, 2), (1, 2)]);
        let partition = run(&graph);
        assert_eq!(partition.components, vec![vec![0, 1], vec![2, 3, 4]]);
    }

    #[test]
    fn test_rooted_filter() {
        let graph = graph_of(5, &[(0, 1), (1, 0), (2, 3), (3, 4), (4, 2)]);
        let roots = BTreeSet::from([3]);
        let partition =
            strongly_connected_components(&graph, 3_000, Duration::from_secs(45), Some(&roots));
        assert_eq!(partition.components, vec![vec![2, 3, 4]]);
    }

    #[test]
    fn test_nested_cycles_single_component() {
        let graph = graph_of(4, &[(0, 1), (1, 2), (2, 0), (1, 3), (3, 1)]);
        let partition = run(&graph);
        assert_eq!(partition.components, vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn test_zero_budget_is_partial() {
        let graph = graph_of(2, &[(0, 1), (1, 0)]);
        let partition =
            strongly_connected_components(&graph, 1, Duration::from_millis(0), None);
        assert_eq!(partition.partiality, Partiality::Timeout);
    }
}
