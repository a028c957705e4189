//! Compute module - Participants, aggregation and round orchestration.

mod aggregate;
mod controller;
mod coordinator;
mod dataset;
mod error;
mod evaluator;
mod model;
mod participant;
mod tensor;

pub use aggregate::*;
pub use controller::*;
pub use coordinator::*;
pub use dataset::*;
pub use error::*;
pub use evaluator::*;
pub use model::*;
pub use participant::*;
pub use tensor::*;
