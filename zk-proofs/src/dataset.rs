//! Client datasets and their Merkle commitment.

use ark_bn254::Fr;
use serde::{Deserialize, Serialize};

use crate::errors::ZkError;
use crate::fixed_point::fr_from_i64;
use crate::merkle::{MerkleProof, MerkleTree};
use crate::poseidon::hash_leaf;
use crate::types::{CircuitShape, ClassCounts, DatasetRoot};

/// One labelled sample; features are fixed point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub features: Vec<i64>,
    pub label: bool,
}

/// Private witness form of a leaf, shared by every stage that opens the dataset root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafWitness {
    pub features: Vec<Fr>,
    pub label: Fr,
}

impl LeafWitness {
    pub fn blank(dim: usize) -> Self {
        Self {
            features: vec![Fr::from(0u64); dim],
            label: Fr::from(0u64),
        }
    }

    pub fn hash(&self) -> Fr {
        hash_leaf(&self.features, self.label)
    }
}

impl From<&Sample> for LeafWitness {
    fn from(sample: &Sample) -> Self {
        Self {
            features: sample.features.iter().map(|&f| fr_from_i64(f)).collect(),
            label: Fr::from(sample.label),
        }
    }
}

/// A dataset whose root has been computed. Immutable once built.
#[derive(Clone, Debug)]
pub struct CommittedDataset {
    samples: Vec<Sample>,
    tree: MerkleTree,
}

impl CommittedDataset {
    /// Validate `samples` against `shape` and commit to them.
    pub fn commit(samples: Vec<Sample>, shape: &CircuitShape) -> Result<Self, ZkError> {
        shape.validate()?;
        if samples.len() != shape.dataset_size {
            return Err(ZkError::Malformed(format!(
                "expected {} samples, got {}",
                shape.dataset_size,
                samples.len()
            )));
        }
        if let Some(i) = samples.iter().position(|s| s.features.len() != shape.dim) {
            return Err(ZkError::Malformed(format!(
                "sample {i} has {} features, expected {}",
                samples[i].features.len(),
                shape.dim
            )));
        }

        let leaves: Vec<Fr> = samples.iter().map(|s| LeafWitness::from(s).hash()).collect();
        let tree = MerkleTree::build(&leaves, shape.tree_depth)?;
        Ok(Self { samples, tree })
    }

    pub fn root(&self) -> DatasetRoot {
        DatasetRoot(self.tree.root())
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn class_counts(&self) -> ClassCounts {
        let c1 = self.samples.iter().filter(|s| s.label).count() as u64;
        ClassCounts {
            c0: self.samples.len() as u64 - c1,
            c1,
        }
    }

    /// Inclusion proof for any slot, padding slots included.
    pub fn proof(&self, index: usize) -> Result<MerkleProof, ZkError> {
        self.tree.proof(index)
    }

    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }
}
