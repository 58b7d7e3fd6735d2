#![doc = "Common types shared across the flowbus workspace."]

pub mod config;
pub mod error;
pub mod metrics;
pub mod state;
pub mod types;

pub use config::*;
pub use error::*;
pub use metrics::*;
pub use state::*;
pub use types::*;
