//! Error type for the federated round protocol.

use crate::schema::ConfigError;

/// Errors raised while running federated rounds.
#[derive(Debug, thiserror::Error)]
pub enum FederatedError {
    /// A caller broke an operation's preconditions.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// A participant's local training failed inside the concurrent region.
    #[error("Participant {participant} failed during local training: {reason}")]
    TaskFailure { participant: usize, reason: String },

    /// Weight shapes do not line up.
    #[error("Model state error: {0}")]
    ModelState(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FederatedError {
    pub(crate) fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation(msg.into())
    }

    pub(crate) fn model_state(msg: impl Into<String>) -> Self {
        Self::ModelState(msg.into())
    }
}
