//! REST client for the kernel gateway control plane.

mod client;
mod config;
mod error;
#[cfg(feature = "test-support")]
pub mod testing;

pub use client::GatewayClient;
pub use config::{DEFAULT_RUNTIMES, DEFAULT_TIMEOUT, GatewayConfig};
pub use error::GatewayError;
pub use kgw_protocol::{ApiInfo, ExecutionState, Kernel};
