#![doc = "Per-port polling and command scheduling for flowbus instruments."]

pub mod command;
pub mod events;
pub mod health;
pub mod manager;
pub mod scheduler;
pub mod stats;
pub mod worker;

pub use command::*;
pub use events::*;
pub use health::*;
pub use manager::*;
pub use scheduler::*;
pub use stats::*;
pub use worker::{PortBuilder, PortHandle, POLL_PARAMETERS};
