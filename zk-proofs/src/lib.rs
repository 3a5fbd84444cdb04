//! ZK layer for verifiable federated learning.
//!
//! This crate contains:
//! - Fixed-point arithmetic over the BN254 scalar field, natively and as checked R1CS gadgets.
//! - Poseidon Merkle commitments to client datasets.
//! - Three chained circuits: dataset balance, training integrity, secure aggregation.
//! - A proof-backend seam with a Groth16 implementation, the client pipeline that drives the
//!   three stages, and the aggregator's round accumulator with dropout handling.

pub mod aggregator;
pub mod backend;
pub mod balance;
pub mod constants;
pub mod dataset;
pub mod errors;
pub mod fixed_point;
pub mod gadgets;
pub mod groth16;
pub mod masking;
pub mod merkle;
pub mod pipeline;
pub mod poseidon;
pub mod training;
pub mod types;

pub use errors::{Stage, ZkError};
