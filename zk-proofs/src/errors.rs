//! Error kinds for proof construction, verification and round bookkeeping.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ClientId;

/// The three chained constraint systems.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Balance,
    Training,
    Aggregation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Balance => "dataset balance",
            Stage::Training => "training integrity",
            Stage::Aggregation => "secure aggregation",
        };
        f.write_str(name)
    }
}

/// Native fixed-point failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FixedPointError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("value {0} does not fit the fixed-point range")]
    Overflow(String),

    #[error("square root of {input} rejected: {root}^2 is outside the one-ulp bound")]
    SqrtOutOfBound { input: u128, root: u128 },
}

#[derive(Debug, Error)]
pub enum ZkError {
    /// The private witness violates the stage's constraints; no proof exists for it.
    #[error("{stage} witness is unsatisfiable: {reason}")]
    WitnessUnsatisfiable { stage: Stage, reason: String },

    /// A well-formed proof failed verification against its public inputs.
    #[error("{stage} proof verification failed")]
    ProofInvalid { stage: Stage },

    /// Two stages (or a stage and the round) disagree on a value they must share.
    #[error("binding mismatch: {0}")]
    BindingMismatch(String),

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("client {0} already submitted this round")]
    DuplicateSubmission(ClientId),

    #[error("client {0} has no accepted submission this round")]
    UnknownClient(ClientId),

    #[error("round mask for client {0} is already registered")]
    MaskAlreadyRegistered(ClientId),

    #[error("round is {actual}, operation requires {expected}")]
    RoundPhase { expected: &'static str, actual: &'static str },

    #[error(transparent)]
    FixedPoint(#[from] FixedPointError),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Failure inside the proof backend's compute call. Safe to retry.
    #[error("arkworks error: {0}")]
    Ark(String),
}

impl ZkError {
    /// Whether the same request may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ZkError::Ark(_))
    }
}
