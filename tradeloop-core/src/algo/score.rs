use crate::config::{QualityWeights, TenantSettings};
use crate::graph::view::GraphView;
use crate::types::{CanonicalId, CycleStep, Generation};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Component scores of one cycle, all within [0, 1]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreBreakdown {
    pub efficiency: f64,
    pub fairness: f64,
    pub quality: f64,
    pub composite: f64,
}

const EFFICIENCY_WEIGHT: f64 = 0.40;
const FAIRNESS_WEIGHT: f64 = 0.30;
const QUALITY_WEIGHT: f64 = 0.30;

/// Score a cycle against the snapshot it was discovered on.
///
/// Efficiency is the ratio of value actually received to the best any single
/// participant does; fairness is the inverse of the worst per-participant
/// give/receive imbalance; quality folds the sixteen configurable sub-metrics.
pub fn score_cycle(view: &GraphView, steps: &[CycleStep], settings: &TenantSettings) -> ScoreBreakdown {
    let len = steps.len() as f64;
    let values: Vec<f64> = steps.iter().map(|s| view.value_of(&s.nft)).collect();
    let total: f64 = values.iter().sum();

    // Each participant gives the value of its outgoing step and receives the
    // value of the step pointing at it.
    let given = &values;
    let received: Vec<f64> = (0..steps.len())
        .map(|i| values[(i + steps.len() - 1) % steps.len()])
        .collect();

    let max_received = received.iter().cloned().fold(f64::MIN, f64::max);
    let efficiency = if max_received <= 0.0 {
        0.0
    } else {
        (total / (len * max_received)).clamp(0.0, 1.0)
    };

    let worst_imbalance = given
        .iter()
        .zip(&received)
        .map(|(g, r)| {
            let denom = g.max(*r);
            if denom <= 0.0 {
                0.0
            } else {
                (g - r).abs() / denom
            }
        })
        .fold(0.0, f64::max);
    let fairness = 1.0 / (1.0 + worst_imbalance);

    let quality = quality_score(view, steps, &values, &settings.quality_weights);

    let composite = EFFICIENCY_WEIGHT * efficiency + FAIRNESS_WEIGHT * fairness + QUALITY_WEIGHT * quality;
    ScoreBreakdown {
        efficiency,
        fairness,
        quality,
        composite,
    }
}

fn quality_score(
    view: &GraphView,
    steps: &[CycleStep],
    values: &[f64],
    weights: &QualityWeights,
) -> f64 {
    let len = steps.len() as f64;
    let total: f64 = values.iter().sum();
    let mean = total / len;

    let collections: BTreeSet<&str> = steps
        .iter()
        .map(|s| {
            view.nft_record(&s.nft)
                .and_then(|r| r.metadata.collection.as_deref())
                .unwrap_or(s.nft.as_str())
        })
        .collect();
    let symbols: BTreeSet<&str> = steps
        .iter()
        .filter_map(|s| view.nft_record(&s.nft).map(|r| r.metadata.symbol.as_str()))
        .collect();

    let min_value = values.iter().cloned().fold(f64::MAX, f64::min);
    let max_value = values.iter().cloned().fold(f64::MIN, f64::max);

    let complete = steps
        .iter()
        .filter(|s| {
            view.nft_record(&s.nft).is_some_and(|r| {
                !r.metadata.name.is_empty()
                    && !r.metadata.symbol.is_empty()
                    && r.metadata.estimated_value.is_some()
            })
        })
        .count() as f64;

    let generation = view.generation().max(1) as f64;
    let freshness: f64 = steps
        .iter()
        .map(|s| {
            view.nft_record(&s.nft)
                .map_or(0.0, |r| r.added_at as f64 / generation)
        })
        .sum::<f64>()
        / len;

    let demand: f64 = steps
        .iter()
        .map(|s| {
            let wanters = view.wanters(&s.nft).map_or(0, |w| w.len()) as f64;
            (wanters / 3.0).min(1.0)
        })
        .sum::<f64>()
        / len;

    let scarcity: f64 = steps
        .iter()
        .map(|s| {
            let inventory = view.wallet(&s.from).map_or(1, |w| w.owned.len().max(1)) as f64;
            1.0 / inventory
        })
        .sum::<f64>()
        / len;

    let multiplicity: f64 = steps
        .iter()
        .map(|s| {
            let alternatives = view.edges_between(&s.from, &s.to).len() as f64;
            (alternatives / 3.0).min(1.0)
        })
        .sum::<f64>()
        / len;

    let specificity: f64 = steps
        .iter()
        .map(|s| {
            let wants = view.wallet(&s.to).map_or(1, |w| w.want_count().max(1)) as f64;
            (3.0 / wants).min(1.0)
        })
        .sum::<f64>()
        / len;

    let direct = steps.iter().filter(|s| !s.kind.is_collection_derived()).count() as f64;

    let metrics = [
        (weights.cycle_compactness, (2.0 / len).min(1.0)),
        (weights.collection_diversity, collections.len() as f64 / len),
        (weights.direct_want_ratio, direct / len),
        (weights.value_density, mean / (mean + 1.0)),
        (
            weights.value_uniformity,
            if max_value <= 0.0 { 0.0 } else { min_value / max_value },
        ),
        (weights.metadata_completeness, complete / len),
        (weights.symbol_diversity, symbols.len() as f64 / len),
        (weights.demand_pressure, demand),
        (weights.supply_scarcity, scarcity),
        (weights.edge_multiplicity, multiplicity),
        (weights.inventory_freshness, freshness),
        (weights.want_specificity, specificity),
        (weights.participation_breadth, (len / 10.0).min(1.0)),
        (weights.value_magnitude, total / (total + 10.0)),
        // Reputation and external demand stay neutral until wired to a
        // reputation provider and market feed.
        (weights.owner_reputation, 1.0),
        (weights.external_demand, 1.0),
    ];

    let weight_total: f64 = metrics.iter().map(|(w, _)| w).sum();
    if weight_total <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = metrics.iter().map(|(w, m)| w * m.clamp(0.0, 1.0)).sum();
    weighted / weight_total
}

/// Score memoization keyed on canonical id and snapshot generation
pub struct ScoreCache {
    entries: Mutex<HashMap<(CanonicalId, Generation), (ScoreBreakdown, Instant)>>,
    ttl: Duration,
}

impl ScoreCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, id: &str, generation: Generation) -> Option<ScoreBreakdown> {
        let entries = self.entries.lock();
        entries
            .get(&(id.to_string(), generation))
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(score, _)| *score)
    }

    pub fn insert(&self, id: &str, generation: Generation, score: ScoreBreakdown) {
        self.entries
            .lock()
            .insert((id.to_string(), generation), (score, Instant::now()));
    }

    /// Drop expired entries; safe to call from any ticker, repeatedly.
    pub fn sweep(&self) {
        self.entries
            .lock()
            .retain(|_, (_, at)| at.elapsed() < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::store::GraphStore;
    use crate::types::NftMetadata;

    fn swap_view(value_a: f64, value_b: f64) -> (GraphView, Vec<CycleStep>) {
        let settings = TenantSettings::default();
        let store = GraphStore::new();
        let meta = |v: f64| NftMetadata {
            name: "art".to_string(),
            symbol: "ART".to_string(),
            collection: None,
            estimated_value: Some(v),
        };
        store.put_nft("alice", "n1", meta(value_a), &settings).unwrap();
        store.put_nft("bob", "n2", meta(value_b), &settings).unwrap();
        store.add_want("alice", "n2", &settings).unwrap();
        store.add_want("bob", "n1", &settings).unwrap();
        let view = GraphView::capture(&store);
        let steps = vec![
            CycleStep {
                from: "alice".to_string(),
                to: "bob".to_string(),
                nft: "n1".to_string(),
                kind: crate::types::EdgeKind::Direct,
            },
            CycleStep {
                from: "bob".to_string(),
                to: "alice".to_string(),
                nft: "n2".to_string(),
                kind: crate::types::EdgeKind::Direct,
            },
        ];
        (view, steps)
    }

    #[test]
    fn test_balanced_swap_scores_perfectly_on_efficiency_and_fairness() {
        let (view, steps) = swap_view(5.0, 5.0);
        let score = score_cycle(&view, &steps, &TenantSettings::default());
        assert!((score.efficiency - 1.0).abs() < 1e-9);
        assert!((score.fairness - 1.0).abs() < 1e-9);
        assert!(score.composite >= 0.5);
    }

    #[test]
    fn test_imbalanced_swap_scores_lower() {
        let (view, steps) = swap_view(1.0, 10.0);
        let balanced = score_cycle(&swap_view(5.0, 5.0).0, &steps, &TenantSettings::default());
        let skewed = score_cycle(&view, &steps, &TenantSettings::default());
        assert!(skewed.fairness < balanced.fairness);
        assert!(skewed.efficiency < balanced.efficiency);
    }

    #[test]
    fn test_score_is_deterministic() {
        let (view, steps) = swap_view(2.0, 3.0);
        let a = score_cycle(&view, &steps, &TenantSettings::default());
        let b = score_cycle(&view, &steps, &TenantSettings::default());
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_respects_generation() {
        let cache = ScoreCache::new(Duration::from_secs(600));
        let score = ScoreBreakdown {
            efficiency: 1.0,
            fairness: 1.0,
            quality: 0.5,
            composite: 0.85,
        };
        cache.insert("id", 3, score);
        assert_eq!(cache.get("id", 3), Some(score));
        assert_eq!(cache.get("id", 4), None);
    }

    #[test]
    fn test_cache_sweep_drops_expired() {
        let cache = ScoreCache::new(Duration::from_millis(0));
        cache.insert(
            "id",
            1,
            ScoreBreakdown {
                efficiency: 0.0,
                fairness: 0.0,
                quality: 0.0,
                composite: 0.0,
            },
        );
        cache.sweep();
        assert!(cache.is_empty());
    }
}
