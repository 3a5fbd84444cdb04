//! Groth16 over BN254 as the [`ProofBackend`].
//!
//! SECURITY NOTE (prototype): Groth16 requires a trusted setup that produces a proving key (PK)
//! and verifying key (VK). This prototype generates keys locally. In production, an MPC ceremony
//! (or a transparent system) should be used.

use ark_bn254::{Bn254, Fr};
use ark_groth16::{prepare_verifying_key, Groth16, Proof, ProvingKey, VerifyingKey};
use ark_relations::r1cs::ConstraintSynthesizer;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use base64::Engine;
use rand::{CryptoRng, RngCore};

use crate::backend::ProofBackend;
use crate::errors::ZkError;

#[derive(Clone, Copy, Debug, Default)]
pub struct Groth16Backend;

impl ProofBackend for Groth16Backend {
    type ProvingKey = ProvingKey<Bn254>;
    type VerifyingKey = VerifyingKey<Bn254>;
    type Proof = Proof<Bn254>;

    fn compile<C, R>(&self, circuit: C, rng: &mut R) -> Result<(Self::ProvingKey, Self::VerifyingKey), ZkError>
    where
        C: ConstraintSynthesizer<Fr>,
        R: RngCore + CryptoRng,
    {
        let pk = Groth16::<Bn254>::generate_random_parameters_with_reduction(circuit, rng)
            .map_err(|e| ZkError::Ark(format!("{e}")))?;
        let vk = pk.vk.clone();
        Ok((pk, vk))
    }

    fn prove<C, R>(&self, pk: &Self::ProvingKey, circuit: C, rng: &mut R) -> Result<Self::Proof, ZkError>
    where
        C: ConstraintSynthesizer<Fr>,
        R: RngCore + CryptoRng,
    {
        Groth16::<Bn254>::create_random_proof_with_reduction(circuit, pk, rng).map_err(|e| ZkError::Ark(format!("{e}")))
    }

    fn verify(&self, vk: &Self::VerifyingKey, public_inputs: &[Fr], proof: &Self::Proof) -> Result<bool, ZkError> {
        // A wrong input count is a tampered statement, not a backend failure.
        if public_inputs.len() + 1 != vk.gamma_abc_g1.len() {
            return Ok(false);
        }
        let pvk = prepare_verifying_key(vk);
        Groth16::<Bn254>::verify_proof(&pvk, proof, public_inputs).map_err(|e| ZkError::Ark(format!("{e}")))
    }
}

/// Compressed canonical encoding of a key or proof.
pub fn serialize<T: CanonicalSerialize>(value: &T) -> Result<Vec<u8>, ZkError> {
    let mut out = Vec::new();
    value
        .serialize_compressed(&mut out)
        .map_err(|e| ZkError::Serialization(format!("{e}")))?;
    Ok(out)
}

/// Inverse of [`serialize`]; points are checked to be on the curve and in the subgroup.
pub fn deserialize<T: CanonicalDeserialize>(bytes: &[u8]) -> Result<T, ZkError> {
    T::deserialize_compressed(bytes).map_err(|e| ZkError::Serialization(format!("{e}")))
}

pub fn to_b64<T: CanonicalSerialize>(value: &T) -> Result<String, ZkError> {
    Ok(base64::engine::general_purpose::STANDARD.encode(serialize(value)?))
}

pub fn from_b64<T: CanonicalDeserialize>(encoded: &str) -> Result<T, ZkError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ZkError::Serialization(format!("invalid base64: {e}")))?;
    deserialize(&bytes)
}
