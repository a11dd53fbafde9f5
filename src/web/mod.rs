//! HTTP gateway over the case workflow.

pub mod auth;
pub mod server;
pub mod types;

pub use server::{GatewayState, build_router, start_server};
