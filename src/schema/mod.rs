//! Schema module - Configuration and history types for federated simulations.

mod config;
mod history;

pub use config::*;
pub use history::*;
