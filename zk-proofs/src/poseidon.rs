//! Field-native hashing shared by every stage.
//!
//! Each native function has an in-circuit twin with the same absorb order. The two MUST stay in
//! lockstep: a root or commitment computed on the host is only useful if the circuit recomputes
//! the identical value.

use ark_bn254::Fr;
use ark_crypto_primitives::sponge::constraints::CryptographicSpongeVar;
use ark_crypto_primitives::sponge::poseidon::constraints::PoseidonSpongeVar;
use ark_crypto_primitives::sponge::poseidon::PoseidonSponge;
use ark_crypto_primitives::sponge::CryptographicSponge;
use ark_r1cs_std::fields::fp::FpVar;
use ark_r1cs_std::prelude::*;
use ark_relations::r1cs::{ConstraintSystemRef, SynthesisError};

use crate::constants::{poseidon_config, TAG_CONTENT, TAG_GRADIENT, TAG_KEY, TAG_LEAF, TAG_MASK, TAG_MODEL};

pub fn hash(inputs: Vec<Fr>) -> Fr {
    let mut sponge = PoseidonSponge::<Fr>::new(poseidon_config());
    sponge.absorb(&inputs);
    sponge.squeeze_field_elements::<Fr>(1)[0]
}

pub fn hash_var(cs: ConstraintSystemRef<Fr>, inputs: Vec<FpVar<Fr>>) -> Result<FpVar<Fr>, SynthesisError> {
    let mut sponge = PoseidonSpongeVar::<Fr>::new(cs, poseidon_config());
    sponge.absorb(&inputs)?;
    let mut out = sponge.squeeze_field_elements(1)?;
    out.pop().ok_or(SynthesisError::Unsatisfiable)
}

fn tag(t: u64) -> FpVar<Fr> {
    FpVar::constant(Fr::from(t))
}

/// Leaf hash `H(tag, features.., label)`.
///
/// Every stage that references a dataset root goes through this function.
pub fn hash_leaf(features: &[Fr], label: Fr) -> Fr {
    let mut inputs = Vec::with_capacity(features.len() + 2);
    inputs.push(Fr::from(TAG_LEAF));
    inputs.extend_from_slice(features);
    inputs.push(label);
    hash(inputs)
}

pub fn hash_leaf_var(
    cs: ConstraintSystemRef<Fr>,
    features: &[FpVar<Fr>],
    label: &FpVar<Fr>,
) -> Result<FpVar<Fr>, SynthesisError> {
    let mut inputs = Vec::with_capacity(features.len() + 2);
    inputs.push(tag(TAG_LEAF));
    inputs.extend_from_slice(features);
    inputs.push(label.clone());
    hash_var(cs, inputs)
}

// Internal nodes absorb exactly two elements and no tag; leaves always absorb at least three,
// so the two can never produce the same sponge transcript.
pub fn hash_node(left: Fr, right: Fr) -> Fr {
    hash(vec![left, right])
}

pub fn hash_node_var(
    cs: ConstraintSystemRef<Fr>,
    left: FpVar<Fr>,
    right: FpVar<Fr>,
) -> Result<FpVar<Fr>, SynthesisError> {
    hash_var(cs, vec![left, right])
}

fn tagged(t: u64, values: &[Fr]) -> Fr {
    let mut inputs = Vec::with_capacity(values.len() + 1);
    inputs.push(Fr::from(t));
    inputs.extend_from_slice(values);
    hash(inputs)
}

fn tagged_var(cs: ConstraintSystemRef<Fr>, t: u64, values: &[FpVar<Fr>]) -> Result<FpVar<Fr>, SynthesisError> {
    let mut inputs = Vec::with_capacity(values.len() + 1);
    inputs.push(tag(t));
    inputs.extend_from_slice(values);
    hash_var(cs, inputs)
}

/// Gradient commitment over the field form `pos - neg` of each component.
pub fn hash_gradient(gradient: &[Fr]) -> Fr {
    tagged(TAG_GRADIENT, gradient)
}

pub fn hash_gradient_var(cs: ConstraintSystemRef<Fr>, gradient: &[FpVar<Fr>]) -> Result<FpVar<Fr>, SynthesisError> {
    tagged_var(cs, TAG_GRADIENT, gradient)
}

pub fn hash_model(weights: &[Fr]) -> Fr {
    tagged(TAG_MODEL, weights)
}

pub fn hash_model_var(cs: ConstraintSystemRef<Fr>, weights: &[FpVar<Fr>]) -> Result<FpVar<Fr>, SynthesisError> {
    tagged_var(cs, TAG_MODEL, weights)
}

/// `PRF(key, round, index)`: a pure function of its three arguments.
pub fn prf(key: Fr, round: u64, index: u64) -> Fr {
    tagged(TAG_MASK, &[key, Fr::from(round), Fr::from(index)])
}

pub fn prf_var(
    cs: ConstraintSystemRef<Fr>,
    key: &FpVar<Fr>,
    round: &FpVar<Fr>,
    index: u64,
) -> Result<FpVar<Fr>, SynthesisError> {
    tagged_var(cs, TAG_MASK, &[key.clone(), round.clone(), FpVar::constant(Fr::from(index))])
}

/// Commitment to a client's mask key, bound to its client id.
pub fn commit_key(client_id: u64, key: Fr) -> Fr {
    tagged(TAG_KEY, &[Fr::from(client_id), key])
}

pub fn commit_key_var(
    cs: ConstraintSystemRef<Fr>,
    client_id: &FpVar<Fr>,
    key: &FpVar<Fr>,
) -> Result<FpVar<Fr>, SynthesisError> {
    tagged_var(cs, TAG_KEY, &[client_id.clone(), key.clone()])
}

/// Content address for persisted public commitments.
pub fn content_id(values: &[Fr]) -> Fr {
    tagged(TAG_CONTENT, values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_relations::r1cs::ConstraintSystem;

    fn witness(cs: &ConstraintSystemRef<Fr>, v: Fr) -> FpVar<Fr> {
        FpVar::new_witness(cs.clone(), || Ok(v)).unwrap()
    }

    #[test]
    fn gadget_matches_native() {
        let cs = ConstraintSystem::<Fr>::new_ref();
        let features = [Fr::from(3u64), -Fr::from(7u64), Fr::from(11u64)];
        let label = Fr::from(1u64);

        let feature_vars: Vec<_> = features.iter().map(|&f| witness(&cs, f)).collect();
        let label_var = witness(&cs, label);
        let leaf = hash_leaf_var(cs.clone(), &feature_vars, &label_var).unwrap();
        assert_eq!(leaf.value().unwrap(), hash_leaf(&features, label));

        let node = hash_node_var(cs.clone(), feature_vars[0].clone(), feature_vars[1].clone()).unwrap();
        assert_eq!(node.value().unwrap(), hash_node(features[0], features[1]));

        let key = witness(&cs, Fr::from(99u64));
        let round = witness(&cs, Fr::from(4u64));
        let mask = prf_var(cs.clone(), &key, &round, 2).unwrap();
        assert_eq!(mask.value().unwrap(), prf(Fr::from(99u64), 4, 2));

        let id = witness(&cs, Fr::from(17u64));
        let commitment = commit_key_var(cs.clone(), &id, &key).unwrap();
        assert_eq!(commitment.value().unwrap(), commit_key(17, Fr::from(99u64)));

        assert!(cs.is_satisfied().unwrap());
    }

    #[test]
    fn domains_are_separated() {
        let values = [Fr::from(1u64), Fr::from(2u64)];
        assert_ne!(hash_gradient(&values), hash_model(&values));
        assert_ne!(hash_node(values[0], values[1]), hash(vec![Fr::from(TAG_LEAF), values[0], values[1]]));
        assert_ne!(prf(Fr::from(1u64), 0, 0), prf(Fr::from(1u64), 0, 1));
        assert_ne!(prf(Fr::from(1u64), 0, 0), prf(Fr::from(1u64), 1, 0));
    }
}
