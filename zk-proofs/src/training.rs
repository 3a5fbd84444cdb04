//! R1CS circuit for one training step.
//!
//! What this circuit proves:
//! 1) The batch samples are leaves of the tree under the public dataset root (same leaf hash as
//!    the balance stage).
//! 2) The gradient, carried as sign-magnitude pairs, has a squared norm (recomputed here) of at
//!    most the public `tau^2`.
//! 3) The public gradient commitment hashes exactly that gradient.
//! 4) The public model commitments hash the weights before and after `w - lr * g`.
//!
//! The circuit does not check that the gradient is the true loss gradient on the batch.

use ark_bn254::Fr;
use ark_r1cs_std::fields::fp::FpVar;
use ark_r1cs_std::prelude::*;
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};

use crate::constants::{LEARNING_RATE_BITS, MAGNITUDE_BITS, NORM_BITS};
use crate::dataset::{CommittedDataset, LeafWitness};
use crate::errors::ZkError;
use crate::fixed_point::{apply_update, decompose_gradient, fr_from_i64, SignMagnitude};
use crate::gadgets::{enforce_bit_width, enforce_leq, fixed_mul, norm_squared_var, SignMagnitudeVar};
use crate::merkle::{enforce_inclusion, MerkleProof, MerkleProofVar};
use crate::poseidon::{hash_gradient, hash_gradient_var, hash_leaf_var, hash_model, hash_model_var};
use crate::types::{CircuitShape, DatasetRoot, GradientCommitment, ModelCommitment};

/// Commitment to a decomposed gradient, over the field form of each component.
pub fn gradient_commitment(parts: &[SignMagnitude]) -> GradientCommitment {
    let values: Vec<Fr> = parts.iter().map(SignMagnitude::to_field).collect();
    GradientCommitment(hash_gradient(&values))
}

pub fn model_commitment(weights: &[i64]) -> ModelCommitment {
    let values: Vec<Fr> = weights.iter().map(|&w| fr_from_i64(w)).collect();
    ModelCommitment(hash_model(&values))
}

/// Public inputs of the training stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrainingStatement {
    /// Must equal the root the balance stage published.
    pub dataset_root: DatasetRoot,
    pub gradient_commitment: GradientCommitment,
    pub clipping_bound_squared: u128,
    pub learning_rate: u64,
    pub model_commitment: ModelCommitment,
    pub updated_model_commitment: ModelCommitment,
}

impl TrainingStatement {
    /// ORDERING MUST MATCH the circuit's `new_input` allocation order.
    pub fn public_inputs(&self) -> Vec<Fr> {
        vec![
            self.dataset_root.0,
            self.gradient_commitment.0,
            Fr::from(self.clipping_bound_squared),
            Fr::from(self.learning_rate),
            self.model_commitment.0,
            self.updated_model_commitment.0,
        ]
    }
}

#[derive(Clone, Debug)]
pub struct TrainingIntegrityCircuit {
    pub shape: CircuitShape,
    pub statement: TrainingStatement,

    /// Private batch samples with their inclusion proofs.
    pub batch: Vec<(LeafWitness, MerkleProof)>,
    /// Private clipped gradient.
    pub gradient: Vec<SignMagnitude>,
    /// Private weights before the step.
    pub weights: Vec<i64>,
}

impl TrainingIntegrityCircuit {
    /// Shape-only instance for key generation.
    pub fn blank(shape: CircuitShape) -> Self {
        let zero = Fr::from(0u64);
        let empty_proof = MerkleProof {
            siblings: vec![zero; shape.tree_depth],
            path_bits: vec![false; shape.tree_depth],
        };
        Self {
            shape,
            statement: TrainingStatement {
                dataset_root: DatasetRoot(zero),
                gradient_commitment: GradientCommitment(zero),
                clipping_bound_squared: 0,
                learning_rate: 0,
                model_commitment: ModelCommitment(zero),
                updated_model_commitment: ModelCommitment(zero),
            },
            batch: vec![(LeafWitness::blank(shape.dim), empty_proof); shape.batch_size],
            gradient: vec![SignMagnitude::default(); shape.dim],
            weights: vec![0; shape.dim],
        }
    }

    /// Instance for the step `weights - learning_rate * gradient` on the given batch.
    ///
    /// The gradient must already be clipped; an oversize gradient yields an unsatisfiable
    /// instance rather than an error here.
    pub fn new(
        shape: CircuitShape,
        dataset: &CommittedDataset,
        batch_indices: &[usize],
        gradient: &[i64],
        weights: &[i64],
        learning_rate: u64,
        clipping_bound_squared: u128,
    ) -> Result<Self, ZkError> {
        if batch_indices.len() != shape.batch_size {
            return Err(ZkError::Malformed(format!(
                "batch has {} samples, expected {}",
                batch_indices.len(),
                shape.batch_size
            )));
        }
        if gradient.len() != shape.dim || weights.len() != shape.dim {
            return Err(ZkError::Malformed(format!(
                "gradient and weights must both have dimension {}",
                shape.dim
            )));
        }

        let batch = batch_indices
            .iter()
            .map(|&i| {
                let sample = dataset
                    .samples()
                    .get(i)
                    .ok_or_else(|| ZkError::Malformed(format!("batch index {i} out of range")))?;
                Ok((LeafWitness::from(sample), dataset.proof(i)?))
            })
            .collect::<Result<Vec<_>, ZkError>>()?;

        let parts = decompose_gradient(gradient)?;
        let updated = apply_update(weights, gradient, learning_rate)?;

        Ok(Self {
            shape,
            statement: TrainingStatement {
                dataset_root: dataset.root(),
                gradient_commitment: gradient_commitment(&parts),
                clipping_bound_squared,
                learning_rate,
                model_commitment: model_commitment(weights),
                updated_model_commitment: model_commitment(&updated),
            },
            batch,
            gradient: parts,
            weights: weights.to_vec(),
        })
    }
}

impl ConstraintSynthesizer<Fr> for TrainingIntegrityCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        // --- Public inputs ---
        // IMPORTANT: ordering MUST match `TrainingStatement::public_inputs`.
        let s = &self.statement;
        let root = FpVar::new_input(cs.clone(), || Ok(s.dataset_root.0))?;
        let public_gradient_commitment = FpVar::new_input(cs.clone(), || Ok(s.gradient_commitment.0))?;
        let tau_sq = FpVar::new_input(cs.clone(), || Ok(Fr::from(s.clipping_bound_squared)))?;
        let lr = FpVar::new_input(cs.clone(), || Ok(Fr::from(s.learning_rate)))?;
        let public_model = FpVar::new_input(cs.clone(), || Ok(s.model_commitment.0))?;
        let public_updated_model = FpVar::new_input(cs.clone(), || Ok(s.updated_model_commitment.0))?;

        let shape = self.shape;
        if self.batch.len() != shape.batch_size
            || self.gradient.len() != shape.dim
            || self.weights.len() != shape.dim
            || self
                .batch
                .iter()
                .any(|(leaf, proof)| leaf.features.len() != shape.dim || proof.siblings.len() != shape.tree_depth)
        {
            return Err(SynthesisError::Unsatisfiable);
        }

        // 1) Batch membership. Path bits are private: which samples were used stays hidden.
        for (leaf, proof) in &self.batch {
            let features = leaf
                .features
                .iter()
                .map(|&f| FpVar::new_witness(cs.clone(), || Ok(f)))
                .collect::<Result<Vec<_>, _>>()?;
            let label = FpVar::new_witness(cs.clone(), || Ok(leaf.label))?;
            let leaf_hash = hash_leaf_var(cs.clone(), &features, &label)?;
            let path = MerkleProofVar::new_witness(cs.clone(), proof)?;
            enforce_inclusion(cs.clone(), &leaf_hash, &path, &root)?;
        }

        // 2) + 3) Decomposition and the bounded norm, both derived here.
        let parts = self
            .gradient
            .iter()
            .map(|&g| SignMagnitudeVar::new_witness(cs.clone(), g))
            .collect::<Result<Vec<_>, _>>()?;
        let norm_sq = norm_squared_var(&parts)?;
        enforce_bit_width(&tau_sq, NORM_BITS)?;
        enforce_leq(&norm_sq, &tau_sq, NORM_BITS)?;

        // 4) + 5) Reconstruct and commit.
        let signed: Vec<FpVar<Fr>> = parts.iter().map(SignMagnitudeVar::signed_value).collect();
        hash_gradient_var(cs.clone(), &signed)?.enforce_equal(&public_gradient_commitment)?;

        // Weight update: w_new = w_old - trunc(lr * pos / P) + trunc(lr * neg / P).
        enforce_bit_width(&lr, LEARNING_RATE_BITS)?;
        let width = MAGNITUDE_BITS.max(LEARNING_RATE_BITS);

        let old = self
            .weights
            .iter()
            .map(|&w| FpVar::new_witness(cs.clone(), || Ok(fr_from_i64(w))))
            .collect::<Result<Vec<_>, _>>()?;
        hash_model_var(cs.clone(), &old)?.enforce_equal(&public_model)?;

        let mut updated = Vec::with_capacity(old.len());
        for (w, part) in old.iter().zip(&parts) {
            let down = fixed_mul(&lr, &part.pos, width)?;
            let up = fixed_mul(&lr, &part.neg, width)?;
            updated.push(w - &down + &up);
        }
        hash_model_var(cs, &updated)?.enforce_equal(&public_updated_model)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Sample;
    use ark_relations::r1cs::ConstraintSystem;

    const TAU_SQ: u128 = 1_000_000;
    const LR: u64 = 100;

    fn shape() -> CircuitShape {
        CircuitShape { dim: 4, tree_depth: 2, dataset_size: 4, batch_size: 2 }
    }

    fn dataset() -> CommittedDataset {
        let samples = (0..4)
            .map(|i| Sample { features: vec![i * 100, -i * 50, 7, i], label: i % 2 == 0 })
            .collect();
        CommittedDataset::commit(samples, &shape()).unwrap()
    }

    fn circuit(gradient: &[i64]) -> TrainingIntegrityCircuit {
        let weights = [500i64, -250, 0, 1000];
        TrainingIntegrityCircuit::new(shape(), &dataset(), &[1, 3], gradient, &weights, LR, TAU_SQ).unwrap()
    }

    fn satisfied(circuit: TrainingIntegrityCircuit) -> bool {
        let cs = ConstraintSystem::<Fr>::new_ref();
        circuit.generate_constraints(cs.clone()).unwrap();
        cs.is_satisfied().unwrap()
    }

    #[test]
    fn honest_step_verifies() {
        assert!(satisfied(circuit(&[600, -800, 0, 0])));
        assert!(satisfied(circuit(&[-3, 17, -250, 99])));
    }

    #[test]
    fn norm_exactly_at_bound_passes() {
        assert!(satisfied(circuit(&[1000, 0, 0, 0])));
        assert!(satisfied(circuit(&[0, -1000, 0, 0])));
    }

    #[test]
    fn norm_one_over_bound_fails() {
        // 1000^2 + 1^2 = tau^2 + 1
        assert!(!satisfied(circuit(&[1000, 1, 0, 0])));
        assert!(!satisfied(circuit(&[-1000, 0, 0, -1])));
    }

    #[test]
    fn foreign_root_fails() {
        let mut c = circuit(&[600, -800, 0, 0]);
        let other = CommittedDataset::commit(
            vec![Sample { features: vec![1, 2, 3, 4], label: true }; 4],
            &shape(),
        )
        .unwrap();
        c.statement.dataset_root = other.root();
        assert!(!satisfied(c));
    }

    #[test]
    fn tampered_commitments_fail() {
        let c = circuit(&[600, -800, 0, 0]);

        let mut wrong_gradient = c.clone();
        wrong_gradient.statement.gradient_commitment =
            gradient_commitment(&decompose_gradient(&[600, -799, 0, 0]).unwrap());
        assert!(!satisfied(wrong_gradient));

        let mut wrong_update = c.clone();
        wrong_update.statement.updated_model_commitment = model_commitment(&[500, -250, 0, 1000]);
        assert!(!satisfied(wrong_update));

        // LR + 1 would truncate to the same steps here; doubling changes them.
        let weights = [500i64, -250, 0, 1000];
        let gradient = [600i64, -800, 0, 0];
        assert_ne!(
            apply_update(&weights, &gradient, LR * 2).unwrap(),
            apply_update(&weights, &gradient, LR).unwrap()
        );
        let mut wrong_lr = c;
        wrong_lr.statement.learning_rate = LR * 2;
        assert!(!satisfied(wrong_lr));
    }

    #[test]
    fn overlapping_sign_parts_fail() {
        let mut c = circuit(&[600, -800, 0, 0]);
        // Same signed value 600 written as 700 - 100 to shrink nothing but dodge exclusivity.
        c.gradient[0] = SignMagnitude { pos: 700, neg: 100 };
        assert!(!satisfied(c));
    }

    #[test]
    fn update_matches_native() {
        let gradient = [1999i64, -1999, 7, 0];
        let weights = [1000i64, -500, 0, 3];
        let c = TrainingIntegrityCircuit::new(shape(), &dataset(), &[0, 2], &gradient, &weights, 500, 20_000_000)
            .unwrap();
        assert_eq!(
            c.statement.updated_model_commitment,
            model_commitment(&apply_update(&weights, &gradient, 500).unwrap())
        );
        assert!(satisfied(c));
    }

    #[test]
    fn rejects_wrong_batch_size() {
        let err = TrainingIntegrityCircuit::new(shape(), &dataset(), &[0], &[0; 4], &[0; 4], LR, TAU_SQ);
        assert!(matches!(err, Err(ZkError::Malformed(_))));
    }
}
