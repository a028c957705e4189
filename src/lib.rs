//! Federated learning round simulator.
//!
//! A central coordinator repeatedly selects a subset of simulated
//! participants, has each train the shared model on its private partition,
//! aggregates their updates into a new global model and evaluates it.
//!
//! # Architecture
//!
//! - `schema`: Configuration, history and result types (serde)
//! - `compute`: Datasets, models, participants, aggregation, coordinator
//! - `report`: Per-round observers (log, JSON lines)
//! - `simulation`: Builds a coordinator from a `FederatedConfig`
//!
//! # Example
//!
//! ```rust,no_run
//! use fedsim::{FederatedConfig, Simulation};
//!
//! let config = FederatedConfig {
//!     rounds: 10,
//!     random_seed: Some(42),
//!     ..Default::default()
//! };
//!
//! let mut simulation = Simulation::from_config(config)?;
//! let result = simulation.run()?;
//!
//! println!("Final validation accuracy: {:?}", result.final_accuracy());
//! # Ok::<(), fedsim::compute::FederatedError>(())
//! ```

pub mod compute;
pub mod report;
pub mod schema;
pub mod simulation;

// Re-export commonly used types
pub use compute::{Aggregator, Coordinator, FederatedError, Participant, abs_c};
pub use schema::{FederatedConfig, FitResult};
pub use simulation::Simulation;
