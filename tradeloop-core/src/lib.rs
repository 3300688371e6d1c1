pub mod algo;
pub mod config;
pub mod engine;
pub mod graph;
pub mod persist;
pub mod types;

pub use algo::{DiscoveryOutcome, DiscoveryStats};
pub use config::{QualityWeights, TenantSettings};
pub use engine::{
    ActiveLoopCache, LoopFilter, StatsReport, TenantRegistry, TradeEngine, UsageReport, WantTarget,
};
pub use graph::{GraphStore, GraphView};
pub use types::*;
