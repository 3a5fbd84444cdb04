//! Fixed-depth Poseidon Merkle trees and inclusion checks, natively and in-circuit.

use ark_bn254::Fr;
use ark_r1cs_std::fields::fp::FpVar;
use ark_r1cs_std::prelude::*;
use ark_relations::r1cs::{ConstraintSystemRef, SynthesisError};

use crate::constants::MAX_TREE_DEPTH;
use crate::errors::ZkError;
use crate::poseidon::{hash_node, hash_node_var};

/// Leaf value of every unused slot.
pub fn padding_leaf() -> Fr {
    Fr::from(0u64)
}

/// Path bits of `index`, leaf level first. `true` means the node is a right child.
pub fn index_bits(index: usize, depth: usize) -> Vec<bool> {
    (0..depth).map(|level| (index >> level) & 1 == 1).collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleProof {
    pub siblings: Vec<Fr>,
    pub path_bits: Vec<bool>,
}

#[derive(Clone, Debug)]
pub struct MerkleTree {
    depth: usize,
    /// `levels[0]` are the (padded) leaves, the last level holds only the root.
    levels: Vec<Vec<Fr>>,
}

impl MerkleTree {
    /// Hash pairs bottom-up over `leaves`, padded to `2^depth`.
    pub fn build(leaves: &[Fr], depth: usize) -> Result<Self, ZkError> {
        if depth == 0 || depth > MAX_TREE_DEPTH {
            return Err(ZkError::Malformed(format!("tree depth {depth} out of range")));
        }
        let width = 1usize << depth;
        if leaves.len() > width {
            return Err(ZkError::Malformed(format!(
                "{} leaves do not fit a depth-{depth} tree",
                leaves.len()
            )));
        }

        let mut level = leaves.to_vec();
        level.resize(width, padding_leaf());

        let mut levels = Vec::with_capacity(depth + 1);
        while level.len() > 1 {
            let next = level.chunks(2).map(|pair| hash_node(pair[0], pair[1])).collect();
            levels.push(level);
            level = next;
        }
        levels.push(level);

        Ok(Self { depth, levels })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn root(&self) -> Fr {
        self.levels[self.depth][0]
    }

    pub fn leaf(&self, index: usize) -> Option<Fr> {
        self.levels[0].get(index).copied()
    }

    pub fn proof(&self, index: usize) -> Result<MerkleProof, ZkError> {
        if index >= self.levels[0].len() {
            return Err(ZkError::Malformed(format!("leaf index {index} out of range")));
        }
        let siblings = (0..self.depth)
            .map(|level| self.levels[level][(index >> level) ^ 1])
            .collect();
        Ok(MerkleProof {
            siblings,
            path_bits: index_bits(index, self.depth),
        })
    }
}

/// Recompute the root from `leaf` and its path.
pub fn compute_root(leaf: Fr, proof: &MerkleProof) -> Option<Fr> {
    if proof.siblings.len() != proof.path_bits.len() {
        return None;
    }
    let mut current = leaf;
    for (&sibling, &bit) in proof.siblings.iter().zip(&proof.path_bits) {
        // Same oblivious selection as the gadget: a + bit * (b - a).
        let b = Fr::from(bit);
        let left = current + b * (sibling - current);
        let right = sibling + b * (current - sibling);
        current = hash_node(left, right);
    }
    Some(current)
}

pub fn verify_inclusion(leaf: Fr, proof: &MerkleProof, root: Fr) -> bool {
    compute_root(leaf, proof) == Some(root)
}

/// N independent inclusion checks against one shared root.
pub fn verify_batch(leaves: &[Fr], proofs: &[MerkleProof], root: Fr) -> bool {
    leaves.len() == proofs.len()
        && leaves
            .iter()
            .zip(proofs)
            .all(|(&leaf, proof)| verify_inclusion(leaf, proof, root))
}

#[derive(Clone, Debug)]
pub struct MerkleProofVar {
    pub siblings: Vec<FpVar<Fr>>,
    pub path_bits: Vec<Boolean<Fr>>,
}

impl MerkleProofVar {
    /// Siblings and path bits both private.
    pub fn new_witness(cs: ConstraintSystemRef<Fr>, proof: &MerkleProof) -> Result<Self, SynthesisError> {
        let siblings = proof
            .siblings
            .iter()
            .map(|&s| FpVar::new_witness(cs.clone(), || Ok(s)))
            .collect::<Result<Vec<_>, _>>()?;
        let path_bits = proof
            .path_bits
            .iter()
            .map(|&b| Boolean::new_witness(cs.clone(), || Ok(b)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { siblings, path_bits })
    }

    /// Private siblings, but the path is fixed to leaf position `index`.
    pub fn new_at_index(
        cs: ConstraintSystemRef<Fr>,
        proof: &MerkleProof,
        index: usize,
    ) -> Result<Self, SynthesisError> {
        let siblings = proof
            .siblings
            .iter()
            .map(|&s| FpVar::new_witness(cs.clone(), || Ok(s)))
            .collect::<Result<Vec<_>, _>>()?;
        let path_bits = index_bits(index, siblings.len())
            .into_iter()
            .map(Boolean::constant)
            .collect();
        Ok(Self { siblings, path_bits })
    }
}

pub fn compute_root_var(
    cs: ConstraintSystemRef<Fr>,
    leaf: &FpVar<Fr>,
    proof: &MerkleProofVar,
) -> Result<FpVar<Fr>, SynthesisError> {
    if proof.siblings.len() != proof.path_bits.len() {
        return Err(SynthesisError::Unsatisfiable);
    }
    let mut current = leaf.clone();
    for (sibling, bit) in proof.siblings.iter().zip(&proof.path_bits) {
        // Oblivious order selection, no branch on the private bit.
        let b = FpVar::from(bit.clone());
        let left = &current + &b * (sibling - &current);
        let right = sibling + &b * (&current - sibling);
        current = hash_node_var(cs.clone(), left, right)?;
    }
    Ok(current)
}

pub fn enforce_inclusion(
    cs: ConstraintSystemRef<Fr>,
    leaf: &FpVar<Fr>,
    proof: &MerkleProofVar,
    root: &FpVar<Fr>,
) -> Result<(), SynthesisError> {
    compute_root_var(cs, leaf, proof)?.enforce_equal(root)
}

pub fn enforce_batch_inclusion(
    cs: ConstraintSystemRef<Fr>,
    leaves: &[FpVar<Fr>],
    proofs: &[MerkleProofVar],
    root: &FpVar<Fr>,
) -> Result<(), SynthesisError> {
    if leaves.len() != proofs.len() {
        return Err(SynthesisError::Unsatisfiable);
    }
    for (leaf, proof) in leaves.iter().zip(proofs) {
        enforce_inclusion(cs.clone(), leaf, proof, root)?;
    }
    Ok(())
}
