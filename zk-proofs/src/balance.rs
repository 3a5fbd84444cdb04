//! R1CS circuit for the dataset-balance commitment.
//!
//! What this circuit proves (for one client dataset of N samples):
//! 1) Every label is boolean.
//! 2) The labels sum to the public `c1`, and `c0 + c1 = N`.
//! 3) Sample j is the leaf at slot j of the tree under the public root, and every slot past N
//!    holds the padding leaf. Pinning the slots stops the prover from opening one leaf N times
//!    or hiding extra samples beyond N.
//!
//! Privacy: features, labels and Merkle paths are witnesses. Only the root and counts are public.

use ark_bn254::Fr;
use ark_r1cs_std::fields::fp::FpVar;
use ark_r1cs_std::prelude::*;
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};

use crate::dataset::{CommittedDataset, LeafWitness};
use crate::errors::ZkError;
use crate::merkle::{enforce_inclusion, padding_leaf, MerkleProof, MerkleProofVar};
use crate::poseidon::hash_leaf_var;
use crate::types::{CircuitShape, ClassCounts, DatasetRoot};

/// Public inputs of the balance stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceStatement {
    pub dataset_root: DatasetRoot,
    pub dataset_size: u64,
    pub class_counts: ClassCounts,
}

impl BalanceStatement {
    /// ORDERING MUST MATCH the circuit's `new_input` allocation order.
    pub fn public_inputs(&self) -> Vec<Fr> {
        vec![
            self.dataset_root.0,
            Fr::from(self.dataset_size),
            Fr::from(self.class_counts.c0),
            Fr::from(self.class_counts.c1),
        ]
    }
}

#[derive(Clone, Debug)]
pub struct DatasetBalanceCircuit {
    pub shape: CircuitShape,
    pub statement: BalanceStatement,

    /// Private samples, slot order.
    pub samples: Vec<LeafWitness>,
    /// Private paths for slots `0..N`.
    pub proofs: Vec<MerkleProof>,
    /// Private paths for slots `N..2^depth`.
    pub padding_proofs: Vec<MerkleProof>,
}

impl DatasetBalanceCircuit {
    /// Shape-only instance for key generation.
    pub fn blank(shape: CircuitShape) -> Self {
        let empty_proof = MerkleProof {
            siblings: vec![Fr::from(0u64); shape.tree_depth],
            path_bits: vec![false; shape.tree_depth],
        };
        Self {
            shape,
            statement: BalanceStatement {
                dataset_root: DatasetRoot(Fr::from(0u64)),
                dataset_size: shape.dataset_size as u64,
                class_counts: ClassCounts::default(),
            },
            samples: vec![LeafWitness::blank(shape.dim); shape.dataset_size],
            proofs: vec![empty_proof.clone(); shape.dataset_size],
            padding_proofs: vec![empty_proof; shape.capacity() - shape.dataset_size],
        }
    }

    /// Honest instance claiming the dataset's true counts.
    pub fn from_dataset(shape: CircuitShape, dataset: &CommittedDataset) -> Result<Self, ZkError> {
        let statement = BalanceStatement {
            dataset_root: dataset.root(),
            dataset_size: dataset.len() as u64,
            class_counts: dataset.class_counts(),
        };
        Self::with_statement(shape, dataset, statement)
    }

    /// Instance for an arbitrary claimed statement (which may not be satisfiable).
    pub fn with_statement(
        shape: CircuitShape,
        dataset: &CommittedDataset,
        statement: BalanceStatement,
    ) -> Result<Self, ZkError> {
        let samples = dataset.samples().iter().map(LeafWitness::from).collect();
        let proofs = (0..dataset.len())
            .map(|i| dataset.proof(i))
            .collect::<Result<Vec<_>, _>>()?;
        let padding_proofs = (dataset.len()..shape.capacity())
            .map(|i| dataset.proof(i))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            shape,
            statement,
            samples,
            proofs,
            padding_proofs,
        })
    }
}

impl ConstraintSynthesizer<Fr> for DatasetBalanceCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        // --- Public inputs ---
        // IMPORTANT: ordering MUST match `BalanceStatement::public_inputs`.
        let root = FpVar::new_input(cs.clone(), || Ok(self.statement.dataset_root.0))?;
        let n = FpVar::new_input(cs.clone(), || Ok(Fr::from(self.statement.dataset_size)))?;
        let c0 = FpVar::new_input(cs.clone(), || Ok(Fr::from(self.statement.class_counts.c0)))?;
        let c1 = FpVar::new_input(cs.clone(), || Ok(Fr::from(self.statement.class_counts.c1)))?;

        let shape = self.shape;
        let depth = shape.tree_depth;
        if self.samples.len() != shape.dataset_size
            || self.proofs.len() != shape.dataset_size
            || self.padding_proofs.len() != shape.capacity() - shape.dataset_size
            || self.samples.iter().any(|s| s.features.len() != shape.dim)
            || self.proofs.iter().chain(&self.padding_proofs).any(|p| p.siblings.len() != depth)
        {
            return Err(SynthesisError::Unsatisfiable);
        }

        // N is part of the circuit shape; the public value must agree with it.
        n.enforce_equal(&FpVar::constant(Fr::from(shape.dataset_size as u64)))?;

        let zero = FpVar::<Fr>::zero();
        let one = FpVar::<Fr>::one();
        let mut label_sum = FpVar::<Fr>::zero();

        for (slot, (sample, proof)) in self.samples.iter().zip(&self.proofs).enumerate() {
            let features = sample
                .features
                .iter()
                .map(|&f| FpVar::new_witness(cs.clone(), || Ok(f)))
                .collect::<Result<Vec<_>, _>>()?;
            let label = FpVar::new_witness(cs.clone(), || Ok(sample.label))?;

            // label * (label - 1) == 0
            label.mul_equals(&(&label - &one), &zero)?;
            label_sum += &label;

            let leaf = hash_leaf_var(cs.clone(), &features, &label)?;
            let path = MerkleProofVar::new_at_index(cs.clone(), proof, slot)?;
            enforce_inclusion(cs.clone(), &leaf, &path, &root)?;
        }

        label_sum.enforce_equal(&c1)?;
        (&c0 + &c1).enforce_equal(&n)?;

        let padding = FpVar::constant(padding_leaf());
        for (offset, proof) in self.padding_proofs.iter().enumerate() {
            let path = MerkleProofVar::new_at_index(cs.clone(), proof, shape.dataset_size + offset)?;
            enforce_inclusion(cs.clone(), &padding, &path, &root)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Sample;
    use ark_relations::r1cs::ConstraintSystem;

    fn shape() -> CircuitShape {
        CircuitShape { dim: 2, tree_depth: 3, dataset_size: 6, batch_size: 2 }
    }

    fn dataset(labels: &[bool]) -> CommittedDataset {
        let samples = labels
            .iter()
            .enumerate()
            .map(|(i, &label)| Sample { features: vec![i as i64 * 10, -(i as i64)], label })
            .collect();
        CommittedDataset::commit(samples, &shape()).unwrap()
    }

    fn satisfied(circuit: DatasetBalanceCircuit) -> bool {
        let cs = ConstraintSystem::<Fr>::new_ref();
        circuit.generate_constraints(cs.clone()).unwrap();
        cs.is_satisfied().unwrap()
    }

    const LABELS: [bool; 6] = [true, false, true, true, false, false];

    #[test]
    fn true_counts_verify() {
        let data = dataset(&LABELS);
        let circuit = DatasetBalanceCircuit::from_dataset(shape(), &data).unwrap();
        assert_eq!(circuit.statement.class_counts, ClassCounts { c0: 3, c1: 3 });
        assert!(satisfied(circuit));
    }

    #[test]
    fn wrong_counts_fail() {
        let data = dataset(&LABELS);
        for counts in [ClassCounts { c0: 2, c1: 4 }, ClassCounts { c0: 4, c1: 2 }, ClassCounts { c0: 3, c1: 2 }] {
            let statement = BalanceStatement {
                dataset_root: data.root(),
                dataset_size: 6,
                class_counts: counts,
            };
            let circuit = DatasetBalanceCircuit::with_statement(shape(), &data, statement).unwrap();
            assert!(!satisfied(circuit), "{counts:?}");
        }
    }

    #[test]
    fn flipped_label_fails_against_original_root() {
        let original = dataset(&LABELS);
        for i in 0..LABELS.len() {
            let mut labels = LABELS;
            labels[i] = !labels[i];
            let flipped = dataset(&labels);
            let statement = BalanceStatement {
                dataset_root: original.root(),
                dataset_size: 6,
                class_counts: flipped.class_counts(),
            };
            let circuit = DatasetBalanceCircuit::with_statement(shape(), &flipped, statement).unwrap();
            assert!(!satisfied(circuit), "flip at {i}");
        }
    }

    #[test]
    fn non_boolean_label_fails() {
        let data = dataset(&LABELS);
        let mut circuit = DatasetBalanceCircuit::from_dataset(shape(), &data).unwrap();
        // A label of 2 alongside a zeroed one keeps the sum, but is not boolean.
        circuit.samples[0].label = Fr::from(2u64);
        circuit.samples[2].label = Fr::from(0u64);
        assert!(!satisfied(circuit));
    }

    #[test]
    fn reusing_one_leaf_fails() {
        let data = dataset(&LABELS);
        let mut circuit = DatasetBalanceCircuit::from_dataset(shape(), &data).unwrap();
        // Claim slot 1 is a copy of slot 0 (labelled 1) to inflate c1.
        circuit.samples[1] = circuit.samples[0].clone();
        circuit.proofs[1] = circuit.proofs[0].clone();
        circuit.statement.class_counts = ClassCounts { c0: 2, c1: 4 };
        assert!(!satisfied(circuit));
    }

    #[test]
    fn blank_circuit_has_the_same_shape() {
        let data = dataset(&LABELS);
        let cs_blank = ConstraintSystem::<Fr>::new_ref();
        DatasetBalanceCircuit::blank(shape()).generate_constraints(cs_blank.clone()).unwrap();
        let cs_real = ConstraintSystem::<Fr>::new_ref();
        DatasetBalanceCircuit::from_dataset(shape(), &data)
            .unwrap()
            .generate_constraints(cs_real.clone())
            .unwrap();
        assert_eq!(cs_blank.num_constraints(), cs_real.num_constraints());
        assert_eq!(cs_blank.num_instance_variables(), cs_real.num_instance_variables());
    }
}
