//! HTTP binding of the transfer engine's RPC surface.

mod app;

pub use app::{build_router, AppState, CreatedTransfer, FinishRequest, ProgressRequest};
