use crate::types::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

/// Per-tenant runtime configuration.
///
/// Every knob has a production default; `validate` rejects combinations the
/// engine cannot honor. Settings updates swap the whole record atomically and
/// in-flight discoveries finish under the record they started with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    /// Maximum participants in a discovered cycle
    pub max_depth: usize,

    /// Cycles below this efficiency are dropped before scoring
    pub min_efficiency: f64,

    /// Composite score cutoff for surfacing a cycle
    pub min_score: f64,

    /// Global cycle cap per discovery run
    pub max_loops_per_request: usize,

    /// Cycle cap per strongly connected component
    pub max_cycles_per_scc: usize,

    /// Wall-clock budget per SCC inside the enumerator
    pub per_scc_timeout_ms: u64,

    /// Wall-clock budget for a whole discovery run
    pub per_run_timeout_ms: u64,

    /// Wall-clock budget for the SCC decomposition phase
    pub scc_phase_budget_ms: u64,

    /// Vertices handled per SCC batch
    pub scc_batch_size: usize,

    /// Collection expansion cap; larger collections are reservoir-sampled
    pub max_collection_size: usize,

    /// An SCC larger than this is split by the community partitioner
    pub community_size_threshold: usize,

    /// Graphs with more wallets than this also go through the partitioner
    pub community_wallet_trigger: usize,

    /// Modularity resolution for the community partitioner
    pub community_resolution: f64,

    /// Cycle cap for the cross-community bridge pass
    pub max_bridge_cycles: usize,

    /// Security cap on owned NFTs per wallet
    pub max_nfts_per_wallet: usize,

    /// Security cap on wants per wallet
    pub max_wants_per_wallet: usize,

    /// Ingestion queue depth before callers observe `Busy`
    pub ingestion_queue_depth: usize,

    /// Concurrent discoveries admitted per tenant
    pub max_discoveries_in_flight: usize,

    /// Enumerator workers running disjoint SCCs concurrently
    pub parallel_scc_workers: usize,

    /// Token-bucket capacity for collection expansion calls
    pub expansion_burst: u32,

    /// Token-bucket refill per second for collection expansion calls
    pub expansion_per_second: u32,

    /// Consecutive expansion failures before the circuit breaker opens
    pub breaker_failure_threshold: u32,

    /// Circuit breaker cooldown
    pub breaker_cooldown_ms: u64,

    /// Active loop time-to-live
    pub loop_ttl_ms: u64,

    /// Score cache time-to-live
    pub score_cache_ttl_ms: u64,

    /// Feature flags
    pub enable_canonical: bool,
    pub enable_louvain: bool,
    pub enable_bloom: bool,
    pub enable_parallel: bool,

    /// Weights for the sixteen quality sub-metrics
    pub quality_weights: QualityWeights,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            max_depth: 10,
            min_efficiency: 0.0,
            min_score: 0.5,
            max_loops_per_request: 500,
            max_cycles_per_scc: 1_000,
            per_scc_timeout_ms: 30_000,
            per_run_timeout_ms: 60_000,
            scc_phase_budget_ms: 45_000,
            scc_batch_size: 3_000,
            max_collection_size: 250,
            community_size_threshold: 200,
            community_wallet_trigger: 7,
            community_resolution: 1.2,
            max_bridge_cycles: 200,
            max_nfts_per_wallet: 10_000,
            max_wants_per_wallet: 10_000,
            ingestion_queue_depth: 10_000,
            max_discoveries_in_flight: 4,
            parallel_scc_workers: 6,
            expansion_burst: 20,
            expansion_per_second: 10,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 30_000,
            loop_ttl_ms: 30 * 60 * 1_000,
            score_cache_ttl_ms: 10 * 60 * 1_000,
            enable_canonical: true,
            enable_louvain: true,
            enable_bloom: true,
            enable_parallel: true,
            quality_weights: QualityWeights::default(),
        }
    }
}

impl TenantSettings {
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_depth < 2 {
            return Err(EngineError::InvalidArgument(
                "max_depth must be at least 2".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_score) {
            return Err(EngineError::InvalidArgument(
                "min_score must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_efficiency) {
            return Err(EngineError::InvalidArgument(
                "min_efficiency must be within [0, 1]".into(),
            ));
        }
        if self.max_loops_per_request == 0 || self.max_cycles_per_scc == 0 {
            return Err(EngineError::InvalidArgument(
                "cycle caps must be positive".into(),
            ));
        }
        if self.parallel_scc_workers == 0 {
            return Err(EngineError::InvalidArgument(
                "parallel_scc_workers must be positive".into(),
            ));
        }
        if self.max_collection_size == 0 {
            return Err(EngineError::InvalidArgument(
                "max_collection_size must be positive".into(),
            ));
        }
        if self.community_resolution <= 0.0 {
            return Err(EngineError::InvalidArgument(
                "community_resolution must be positive".into(),
            ));
        }
        self.quality_weights.validate()
    }
}

/// Relative weights of the sixteen quality sub-metrics.
///
/// The top-level split (efficiency 0.40, fairness 0.30, quality 0.30) is fixed
/// in the scorer; only these sub-weights are tunable. Defaults are normalized
/// at scoring time, so they need not sum to exactly 1.0.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityWeights {
    pub cycle_compactness: f64,
    pub collection_diversity: f64,
    pub direct_want_ratio: f64,
    pub value_density: f64,
    pub value_uniformity: f64,
    pub metadata_completeness: f64,
    pub symbol_diversity: f64,
    pub demand_pressure: f64,
    pub supply_scarcity: f64,
    pub edge_multiplicity: f64,
    pub inventory_freshness: f64,
    pub want_specificity: f64,
    pub participation_breadth: f64,
    pub value_magnitude: f64,
    pub owner_reputation: f64,
    pub external_demand: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            cycle_compactness: 0.12,
            collection_diversity: 0.08,
            direct_want_ratio: 0.10,
            value_density: 0.06,
            value_uniformity: 0.08,
            metadata_completeness: 0.04,
            symbol_diversity: 0.04,
            demand_pressure: 0.08,
            supply_scarcity: 0.06,
            edge_multiplicity: 0.06,
            inventory_freshness: 0.06,
            want_specificity: 0.06,
            participation_breadth: 0.06,
            value_magnitude: 0.06,
            owner_reputation: 0.02,
            external_demand: 0.02,
        }
    }
}

impl QualityWeights {
    pub fn validate(&self) -> EngineResult<()> {
        for (name, w) in self.entries() {
            if w < 0.0 || !w.is_finite() {
                return Err(EngineError::InvalidArgument(format!(
                    "quality weight {name} must be finite and non-negative"
                )));
            }
        }
        if self.total() <= 0.0 {
            return Err(EngineError::InvalidArgument(
                "quality weights must not all be zero".into(),
            ));
        }
        Ok(())
    }

    pub fn total(&self) -> f64 {
        self.entries().iter().map(|(_, w)| w).sum()
    }

    pub fn entries(&self) -> [(&'static str, f64); 16] {
        [
            ("cycle_compactness", self.cycle_compactness),
            ("collection_diversity", self.collection_diversity),
            ("direct_want_ratio", self.direct_want_ratio),
            ("value_density", self.value_density),
            ("value_uniformity", self.value_uniformity),
            ("metadata_completeness", self.metadata_completeness),
            ("symbol_diversity", self.symbol_diversity),
            ("demand_pressure", self.demand_pressure),
            ("supply_scarcity", self.supply_scarcity),
            ("edge_multiplicity", self.edge_multiplicity),
            ("inventory_freshness", self.inventory_freshness),
            ("want_specificity", self.want_specificity),
            ("participation_breadth", self.participation_breadth),
            ("value_magnitude", self.value_magnitude),
            ("owner_reputation", self.owner_reputation),
            ("external_demand", self.external_demand),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = TenantSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.max_depth, 10);
        assert_eq!(settings.per_scc_timeout_ms, 30_000);
        assert_eq!(settings.max_cycles_per_scc, 1_000);
    }

    #[test]
    fn test_default_quality_weights_sum_to_one() {
        let weights = QualityWeights::default();
        assert!((weights.total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_bad_depth() {
        let settings = TenantSettings {
            max_depth: 1,
            ..TenantSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_negative_weight() {
        let settings = TenantSettings {
            quality_weights: QualityWeights {
                demand_pressure: -0.5,
                ..QualityWeights::default()
            },
            ..TenantSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_roundtrip_ignores_unknown_fields() {
        let json = r#"{"max_depth": 6, "some_future_knob": true}"#;
        let settings: TenantSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.max_depth, 6);
        assert_eq!(settings.min_score, 0.5);
    }
}
