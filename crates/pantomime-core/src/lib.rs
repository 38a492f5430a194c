// Simulated SaaS app runtime without any protocol-server dependencies.

pub mod chaos;
pub mod config;
pub mod definition;
pub mod error;
pub mod executor;
pub mod instance;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod store;
pub mod test_utils;
pub mod triggers;
pub mod types;
pub mod workflow;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use registry::Registry;
