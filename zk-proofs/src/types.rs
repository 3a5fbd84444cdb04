//! Types shared between the circuits, the client pipeline and the aggregator.

use ark_bn254::Fr;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use serde::{Deserialize, Serialize};

use crate::balance::BalanceStatement;
use crate::constants::{MAX_DIM, MAX_TREE_DEPTH, NORM_BITS, PRECISION};
use crate::errors::ZkError;
use crate::masking::AggregationStatement;
use crate::training::TrainingStatement;

pub type ClientId = u64;

/// JSON-friendly representation of a field element.
///
/// We expose Fr values as hex strings of the canonical compressed encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrHex {
    pub hex: String,
}

impl FrHex {
    pub fn from_fr(x: &Fr) -> Self {
        let mut bytes = Vec::new();
        x.serialize_compressed(&mut bytes)
            .expect("in-memory serialization");
        Self { hex: hex::encode(bytes) }
    }

    /// Rejects anything that is not a canonical residue.
    pub fn to_fr(&self) -> Result<Fr, String> {
        let bytes = hex::decode(&self.hex).map_err(|e| format!("invalid hex: {e}"))?;
        Fr::deserialize_compressed(&bytes[..]).map_err(|e| format!("invalid field bytes: {e}"))
    }
}

/// Serde adapter for `Vec<Fr>` as a list of [`FrHex`].
pub mod fr_vec_hex {
    use super::FrHex;
    use ark_bn254::Fr;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[Fr], s: S) -> Result<S::Ok, S::Error> {
        let hex: Vec<FrHex> = values.iter().map(FrHex::from_fr).collect();
        hex.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Fr>, D::Error> {
        Vec::<FrHex>::deserialize(d)?
            .iter()
            .map(|h| h.to_fr().map_err(serde::de::Error::custom))
            .collect()
    }
}

// Typed handles passed between stages. Each wraps one public field element.
macro_rules! field_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "FrHex", into = "FrHex")]
        pub struct $name(pub Fr);

        impl $name {
            pub fn to_hex(&self) -> String {
                FrHex::from_fr(&self.0).hex
            }
        }

        impl TryFrom<FrHex> for $name {
            type Error = String;

            fn try_from(value: FrHex) -> Result<Self, Self::Error> {
                value.to_fr().map(Self)
            }
        }

        impl From<$name> for FrHex {
            fn from(value: $name) -> Self {
                FrHex::from_fr(&value.0)
            }
        }
    };
}

field_handle!(
    /// Root of the committed dataset (R_D). Published once per round by the balance stage.
    DatasetRoot
);
field_handle!(
    /// Hash of the clipped gradient (R_G). Published by the training stage.
    GradientCommitment
);
field_handle!(
    /// Hash of a weight vector.
    ModelCommitment
);
field_handle!(
    /// Commitment to a client's mask key, bound to its client id.
    KeyCommitment
);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub c0: u64,
    pub c1: u64,
}

impl ClassCounts {
    pub fn total(&self) -> u64 {
        self.c0 + self.c1
    }
}

/// Sizes fixed by the circuits. Proving and verifying keys are only valid for one shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitShape {
    /// Model dimension, also the feature dimension of every sample.
    pub dim: usize,
    pub tree_depth: usize,
    /// Number of samples (N) in every client dataset.
    pub dataset_size: usize,
    /// Samples proven per training step.
    pub batch_size: usize,
}

impl CircuitShape {
    pub fn validate(&self) -> Result<(), ZkError> {
        if self.dim == 0 || self.dim > MAX_DIM {
            return Err(ZkError::Malformed(format!("dimension {} out of range", self.dim)));
        }
        if self.tree_depth == 0 || self.tree_depth > MAX_TREE_DEPTH {
            return Err(ZkError::Malformed(format!("tree depth {} out of range", self.tree_depth)));
        }
        if self.dataset_size == 0 || self.dataset_size > self.capacity() {
            return Err(ZkError::Malformed(format!(
                "dataset size {} does not fit a depth-{} tree",
                self.dataset_size, self.tree_depth
            )));
        }
        if self.batch_size == 0 || self.batch_size > self.dataset_size {
            return Err(ZkError::Malformed(format!("batch size {} out of range", self.batch_size)));
        }
        Ok(())
    }

    /// Leaf slots in the tree.
    pub fn capacity(&self) -> usize {
        1 << self.tree_depth
    }
}

/// Public parameters of a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundParams {
    pub shape: CircuitShape,
    /// Clipping bound tau, fixed point.
    pub clipping_bound: u64,
    /// SGD step size, fixed point.
    pub learning_rate: u64,
}

impl RoundParams {
    pub fn validate(&self) -> Result<(), ZkError> {
        self.shape.validate()?;
        if self.clipping_bound_squared() >> NORM_BITS != 0 {
            return Err(ZkError::Malformed("clipping bound exceeds the comparator width".to_string()));
        }
        if self.learning_rate == 0 || self.learning_rate > PRECISION * 1000 {
            return Err(ZkError::Malformed(format!("learning rate {} out of range", self.learning_rate)));
        }
        Ok(())
    }

    pub fn clipping_bound_squared(&self) -> u128 {
        self.clipping_bound as u128 * self.clipping_bound as u128
    }
}

/// The three stage proofs, base64 of their compressed encoding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageProofs {
    pub balance: String,
    pub training: String,
    pub aggregation: String,
}

/// Everything one client publishes for one round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundSubmission {
    pub client_id: ClientId,
    pub round: u64,
    pub dataset_root: DatasetRoot,
    pub dataset_size: u64,
    pub class_counts: ClassCounts,
    pub gradient_commitment: GradientCommitment,
    pub clipping_bound_squared: u128,
    pub learning_rate: u64,
    pub model_commitment: ModelCommitment,
    pub updated_model_commitment: ModelCommitment,
    pub key_commitment: KeyCommitment,
    #[serde(with = "fr_vec_hex")]
    pub masked_update: Vec<Fr>,
    pub proofs: StageProofs,
}

impl RoundSubmission {
    // All three statements are rebuilt from the same fields, so the root and gradient
    // commitment one stage proves against are exactly the ones the next stage uses.

    pub fn balance_statement(&self) -> BalanceStatement {
        BalanceStatement {
            dataset_root: self.dataset_root,
            dataset_size: self.dataset_size,
            class_counts: self.class_counts,
        }
    }

    pub fn training_statement(&self) -> TrainingStatement {
        TrainingStatement {
            dataset_root: self.dataset_root,
            gradient_commitment: self.gradient_commitment,
            clipping_bound_squared: self.clipping_bound_squared,
            learning_rate: self.learning_rate,
            model_commitment: self.model_commitment,
            updated_model_commitment: self.updated_model_commitment,
        }
    }

    pub fn aggregation_statement(&self) -> AggregationStatement {
        AggregationStatement {
            gradient_commitment: self.gradient_commitment,
            clipping_bound_squared: self.clipping_bound_squared,
            masked_update: self.masked_update.clone(),
            client_id: self.client_id,
            round: self.round,
            key_commitment: self.key_commitment,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> CircuitShape {
        CircuitShape { dim: 4, tree_depth: 2, dataset_size: 4, batch_size: 2 }
    }

    #[test]
    fn fr_hex_round_trips_and_rejects_non_canonical() {
        let x = -Fr::from(5u64);
        assert_eq!(FrHex::from_fr(&x).to_fr().unwrap(), x);
        assert!(FrHex { hex: "zz".to_string() }.to_fr().is_err());
        // 2^256 - 1 is far above the modulus.
        assert!(FrHex { hex: "ff".repeat(32) }.to_fr().is_err());
    }

    #[test]
    fn handles_serialize_as_hex() {
        let root = DatasetRoot(Fr::from(42u64));
        let json = serde_json::to_string(&root).unwrap();
        assert_eq!(json, format!("{{\"hex\":\"{}\"}}", root.to_hex()));
        let back: DatasetRoot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, root);
    }

    #[test]
    fn shape_validation() {
        assert!(shape().validate().is_ok());
        assert!(CircuitShape { dataset_size: 5, ..shape() }.validate().is_err());
        assert!(CircuitShape { batch_size: 0, ..shape() }.validate().is_err());
        assert!(CircuitShape { dim: MAX_DIM + 1, ..shape() }.validate().is_err());
    }

    #[test]
    fn round_params_validation() {
        let params = RoundParams { shape: shape(), clipping_bound: 1000, learning_rate: 100 };
        assert!(params.validate().is_ok());
        assert_eq!(params.clipping_bound_squared(), 1_000_000);
        assert!(RoundParams { clipping_bound: u64::MAX, ..params }.validate().is_err());
        assert!(RoundParams { learning_rate: 0, ..params }.validate().is_err());
    }
}
