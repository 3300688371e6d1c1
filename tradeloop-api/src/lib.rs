pub mod api;

pub use api::{ApiError, ApiResult, TradeloopApi};
