pub mod expansion;
pub mod store;
pub mod view;

pub use expansion::ExpansionReport;
pub use store::{GraphState, GraphStore, NftRecord, WalletState};
pub use view::GraphView;
