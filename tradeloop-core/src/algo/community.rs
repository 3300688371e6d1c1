use super::IndexedGraph;
use std::collections::BTreeMap;
use tracing::debug;

/// Flat modularity partition of one oversized SCC
#[derive(Clone, Debug)]
pub struct CommunityPartition {
    /// Communities of global vertex ids, each sorted, ordered by smallest member
    pub communities: Vec<Vec<usize>>,
    /// Directed SCC edges whose endpoints fall in different communities
    pub cross_edges: Vec<(usize, usize)>,
}

impl CommunityPartition {
    /// Community index of a vertex, if it belongs to the partition
    pub fn community_of(&self, vertex: usize) -> Option<usize> {
        self.communities
            .iter()
            .position(|c| c.binary_search(&vertex).is_ok())
    }
}

/// Single-level greedy modularity optimization (Louvain first phase) over the
/// undirected projection of the SCC.
///
/// Node order is fixed (ascending vertex id) and ties break toward the lower
/// community id, so the partition is deterministic. The enumerator treats each
/// community as an independent subproblem; cycles crossing communities are
/// recovered by a bounded second pass over `cross_edges`.
pub fn partition(graph: &IndexedGraph, scc: &[usize], resolution: f64) -> CommunityPartition {
    let local: BTreeMap<usize, usize> = scc.iter().enumerate().map(|(i, &v)| (v, i)).collect();
    let n = scc.len();

    // Undirected weights: each directed edge contributes 1.0.
    let mut weights: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); n];
    let mut total_weight: f64 = 0.0;
    for (i, &v) in scc.iter().enumerate() {
        for &w in &graph.succ[v] {
            if let Some(&j) = local.get(&w) {
                *weights[i].entry(j).or_insert(0.0) += 1.0;
                *weights[j].entry(i).or_insert(0.0) += 1.0;
                total_weight += 1.0;
            }
        }
    }
    let two_m = (2.0 * total_weight).max(1.0);

    let degree: Vec<f64> = (0..n).map(|i| weights[i].values().sum()).collect();
    let mut community: Vec<usize> = (0..n).collect();
    let mut community_degree: Vec<f64> = degree.clone();

    const MAX_PASSES: usize = 10;
    for _ in 0..MAX_PASSES {
        let mut moved = false;
        for i in 0..n {
            let current = community[i];
            community_degree[current] -= degree[i];

            // Weight from i into each neighboring community
            let mut link: BTreeMap<usize, f64> = BTreeMap::new();
            for (&j, &w) in &weights[i] {
                if j != i {
                    *link.entry(community[j]).or_insert(0.0) += w;
                }
            }

            let gain = |c: usize, w_ic: f64| w_ic - resolution * degree[i] * community_degree[c] / two_m;
            let mut best = current;
            let mut best_gain = gain(current, link.get(&current).copied().unwrap_or(0.0));
            for (&c, &w_ic) in &link {
                let g = gain(c, w_ic);
                if g > best_gain + 1e-12 || (g > best_gain - 1e-12 && c < best) {
                    best = c;
                    best_gain = g;
                }
            }

            community_degree[best] += degree[i];
            if best != current {
                community[i] = best;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }

    // Renumber to dense ids and materialize sorted member lists.
    let mut grouped: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &c) in community.iter().enumerate() {
        grouped.entry(c).or_default().push(scc[i]);
    }
    let mut communities: Vec<Vec<usize>> = grouped.into_values().collect();
    for c in &mut communities {
        c.sort_unstable();
    }
    communities.sort_by_key(|c| c[0]);

    let assignment: BTreeMap<usize, usize> = communities
        .iter()
        .enumerate()
        .flat_map(|(ci, members)| members.iter().map(move |&v| (v, ci)))
        .collect();
    let mut cross_edges = Vec::new();
    for &v in scc {
        for &w in &graph.succ[v] {
            if local.contains_key(&w) && assignment.get(&v) != assignment.get(&w) {
                cross_edges.push((v, w));
            }
        }
    }

    debug!(
        scc_size = scc.len(),
        communities = communities.len(),
        cross_edges = cross_edges.len(),
        "scc partitioned into communities"
    );
    CommunityPartition {
        communities,
        cross_edges,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_two_dense_clusters_split() {
        // Two 3-cliques joined by a single pair of bridge edges
        let edges = [
            (0, 1), (1, 0), (1, 2), (2, 1), (0, 2), (2, 0),
            (3, 4), (4, 3), (4, 5), (5, 4), (3, 5), (5, 3),
            (2, 3), (3, 2),
        ];
        let graph = graph_of(6, &edges);
        let scc: Vec<usize> = (0..6).collect();
        let partition = partition_for_test(&graph, &scc);

        assert_eq!(partition.communities.len(), 2);
        assert_eq!(partition.communities[0], vec![0, 1, 2]);
        assert_eq!(partition.communities[1], vec![3, 4, 5]);
        assert_eq!(partition.cross_edges, vec![(2, 3), (3, 2)]);
    }

    fn partition_for_test(graph: &IndexedGraph, scc: &[usize]) -> CommunityPartition {
        partition(graph, scc, 1.2)
    }

    #[test]
    fn test_partition_is_deterministic() {
        let edges = [
            (0, 1), (1, 2), (2, 0), (3, 4), (4, 5), (5, 3), (2, 3), (5, 0),
        ];
        let graph = graph_of(6, &edges);
        let scc: Vec<usize> = (0..6).collect();
        let a = partition_for_test(&graph, &scc);
        let b = partition_for_test(&graph, &scc);
        assert_eq!(a.communities, b.communities);
        assert_eq!(a.cross_edges, b.cross_edges);
    }

    #[test]
    fn test_community_of() {
        let graph = graph_of(4, &[(0, 1), (1, 0), (2, 3), (3, 2)]);
        let scc: Vec<usize> = vec![0, 1];
        let partition = partition_for_test(&graph, &scc);
        assert!(partition.community_of(0).is_some());
        assert_eq!(partition.community_of(2), None);
    }
}
