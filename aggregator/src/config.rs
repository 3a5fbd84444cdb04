//! Startup configuration from environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use zk_proofs::fixed_point::to_fixed;
use zk_proofs::types::{CircuitShape, RoundParams};
use zk_proofs::ZkError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}={value} is not valid: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },

    #[error("round parameters rejected: {0}")]
    Params(#[from] ZkError),
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub addr: String,
    pub api_key: String,
    pub data_dir: PathBuf,
    pub params: RoundParams,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup, falling back to development defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let addr = lookup("AGGREGATOR_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string());
        // In production, this should be a strong secret from environment.
        let api_key = lookup("API_KEY").unwrap_or_else(|| "dev-secret-key".to_string());
        let data_dir = PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| "data".to_string()));

        let shape = CircuitShape {
            dim: parse(&lookup, "MODEL_DIM", 4)?,
            tree_depth: parse(&lookup, "TREE_DEPTH", 2)?,
            dataset_size: parse(&lookup, "DATASET_SIZE", 4)?,
            batch_size: parse(&lookup, "BATCH_SIZE", 2)?,
        };
        let params = RoundParams {
            shape,
            clipping_bound: fixed(&lookup, "CLIP_TAU", 1.0)?,
            learning_rate: fixed(&lookup, "LEARNING_RATE", 0.1)?,
        };
        params.validate()?;

        Ok(Self { addr, api_key, data_dir, params })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::Invalid { key, reason: e.to_string(), value })
        }
    }
}

/// A non-negative real, stored fixed point.
fn fixed(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: f64) -> Result<u64, ConfigError> {
    let real: f64 = parse(lookup, key, default)?;
    let invalid = |reason: String| ConfigError::Invalid { key, value: real.to_string(), reason };
    let v = to_fixed(real).map_err(|e| invalid(e.to_string()))?;
    u64::try_from(v).map_err(|_| invalid("must not be negative".to_string()))
}
