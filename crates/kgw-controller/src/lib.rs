//! Session controller in front of a kernel gateway.
//!
//! Starts and stops kernels on behalf of notebook users, proxies their
//! execution channels while recording cell outputs, and culls kernels that
//! have gone idle.

pub mod config;
pub mod correlation;
pub mod culler;
pub mod daemon;
pub mod gateway;
pub mod http;
pub mod model;
pub mod persister;
pub mod relay;
pub mod sessions;
pub mod store;

pub use config::{ControllerConfig, CullerConfig, StoreConfig};
pub use daemon::run;
