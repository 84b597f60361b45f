//! REST signalling surface and ambient ops endpoints.

pub mod http_server;
pub mod receiver_bridge;
pub mod shared;

pub use http_server::run_http_server;
pub use receiver_bridge::SessionAvReceiver;
pub use shared::SharedState;
