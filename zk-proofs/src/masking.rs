//! Per-client PRF masks and the secure-aggregation circuit.
//!
//! Every client owns one secret [`MaskKey`]. Its mask for round `r` is
//! `mask[i] = PRF(key, r, i)`, so the same mask can be rebuilt later from the key alone when the
//! client drops out. Masks do not cancel across clients; the aggregator subtracts each one
//! explicitly once the round's mask is revealed. The key itself is never sent: a revealed mask
//! covers one round only.
//!
//! What the circuit proves:
//! 1) The private gradient hashes to the public gradient commitment from the training stage.
//! 2) Its squared norm (recomputed here) is at most the public `tau^2`.
//! 3) The private key matches the public key commitment for the public client id.
//! 4) `masked[i] == gradient[i] + PRF(key, round, i)` for every component.

use std::fmt;

use ark_bn254::Fr;
use ark_r1cs_std::fields::fp::FpVar;
use ark_r1cs_std::prelude::*;
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystemRef, SynthesisError};
use ark_std::UniformRand;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::NORM_BITS;
use crate::errors::ZkError;
use crate::fixed_point::{decompose_gradient, fr_to_i64, SignMagnitude};
use crate::gadgets::{enforce_bit_width, enforce_leq, norm_squared_var, SignMagnitudeVar};
use crate::poseidon::{commit_key, commit_key_var, hash_gradient_var, prf, prf_var};
use crate::training::gradient_commitment;
use crate::types::{ClientId, FrHex, GradientCommitment, KeyCommitment};

/// A client's secret mask key.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FrHex", into = "FrHex")]
pub struct MaskKey(pub Fr);

impl fmt::Debug for MaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MaskKey(<redacted>)")
    }
}

impl TryFrom<FrHex> for MaskKey {
    type Error = String;

    fn try_from(value: FrHex) -> Result<Self, Self::Error> {
        value.to_fr().map(Self)
    }
}

impl From<MaskKey> for FrHex {
    fn from(value: MaskKey) -> Self {
        FrHex::from_fr(&value.0)
    }
}

impl MaskKey {
    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        Self(Fr::rand(rng))
    }

    pub fn commitment(&self, client_id: ClientId) -> KeyCommitment {
        KeyCommitment(commit_key(client_id, self.0))
    }

    pub fn mask(&self, round: u64, dim: usize) -> Vec<Fr> {
        (0..dim as u64).map(|i| prf(self.0, round, i)).collect()
    }
}

/// `gradient[i] + PRF(key, round, i)`.
pub fn mask_update(gradient: &[SignMagnitude], key: &MaskKey, round: u64) -> Vec<Fr> {
    gradient
        .iter()
        .zip(key.mask(round, gradient.len()))
        .map(|(g, m)| g.to_field() + m)
        .collect()
}

/// Elementwise `masked - mask`.
pub fn unmask(masked: &[Fr], mask: &[Fr]) -> Result<Vec<Fr>, ZkError> {
    if masked.len() != mask.len() {
        return Err(ZkError::Malformed(format!(
            "masked vector has {} components, mask has {}",
            masked.len(),
            mask.len()
        )));
    }
    Ok(masked.iter().zip(mask).map(|(v, m)| *v - *m).collect())
}

/// Decode field values back to signed fixed point with the centered lift.
pub fn decode_update(values: &[Fr]) -> Result<Vec<i64>, ZkError> {
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            fr_to_i64(v).ok_or_else(|| ZkError::Malformed(format!("component {i} does not decode to a fixed-point value")))
        })
        .collect()
}

/// Public inputs of the aggregation stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregationStatement {
    /// Must equal the commitment the training stage published.
    pub gradient_commitment: GradientCommitment,
    pub clipping_bound_squared: u128,
    pub masked_update: Vec<Fr>,
    pub client_id: ClientId,
    pub round: u64,
    pub key_commitment: KeyCommitment,
}

impl AggregationStatement {
    /// ORDERING MUST MATCH the circuit's `new_input` allocation order.
    pub fn public_inputs(&self) -> Vec<Fr> {
        let mut v = Vec::with_capacity(self.masked_update.len() + 5);
        v.push(self.gradient_commitment.0);
        v.push(Fr::from(self.clipping_bound_squared));
        v.extend_from_slice(&self.masked_update);
        v.push(Fr::from(self.client_id));
        v.push(Fr::from(self.round));
        v.push(self.key_commitment.0);
        v
    }
}

#[derive(Clone, Debug)]
pub struct SecureAggregationCircuit {
    pub dim: usize,
    pub statement: AggregationStatement,

    /// Private gradient, same witness form as the training stage.
    pub gradient: Vec<SignMagnitude>,
    pub key: MaskKey,
}

impl SecureAggregationCircuit {
    /// Shape-only instance for key generation.
    pub fn blank(dim: usize) -> Self {
        let zero = Fr::from(0u64);
        Self {
            dim,
            statement: AggregationStatement {
                gradient_commitment: GradientCommitment(zero),
                clipping_bound_squared: 0,
                masked_update: vec![zero; dim],
                client_id: 0,
                round: 0,
                key_commitment: KeyCommitment(zero),
            },
            gradient: vec![SignMagnitude::default(); dim],
            key: MaskKey(zero),
        }
    }

    /// Honest instance masking `gradient` under `key` for `round`.
    pub fn new(
        client_id: ClientId,
        round: u64,
        gradient: &[i64],
        key: MaskKey,
        clipping_bound_squared: u128,
    ) -> Result<Self, ZkError> {
        let parts = decompose_gradient(gradient)?;
        Ok(Self {
            dim: parts.len(),
            statement: AggregationStatement {
                gradient_commitment: gradient_commitment(&parts),
                clipping_bound_squared,
                masked_update: mask_update(&parts, &key, round),
                client_id,
                round,
                key_commitment: key.commitment(client_id),
            },
            gradient: parts,
            key,
        })
    }
}

impl ConstraintSynthesizer<Fr> for SecureAggregationCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        let s = &self.statement;
        if s.masked_update.len() != self.dim || self.gradient.len() != self.dim {
            return Err(SynthesisError::Unsatisfiable);
        }

        // --- Public inputs ---
        // IMPORTANT: ordering MUST match `AggregationStatement::public_inputs`.
        let public_gradient_commitment = FpVar::new_input(cs.clone(), || Ok(s.gradient_commitment.0))?;
        let tau_sq = FpVar::new_input(cs.clone(), || Ok(Fr::from(s.clipping_bound_squared)))?;
        let masked = s
            .masked_update
            .iter()
            .map(|&m| FpVar::new_input(cs.clone(), || Ok(m)))
            .collect::<Result<Vec<_>, _>>()?;
        let client_id = FpVar::new_input(cs.clone(), || Ok(Fr::from(s.client_id)))?;
        let round = FpVar::new_input(cs.clone(), || Ok(Fr::from(s.round)))?;
        let public_key_commitment = FpVar::new_input(cs.clone(), || Ok(s.key_commitment.0))?;

        // 1) Same gradient as the training stage.
        let parts = self
            .gradient
            .iter()
            .map(|&g| SignMagnitudeVar::new_witness(cs.clone(), g))
            .collect::<Result<Vec<_>, _>>()?;
        let signed: Vec<FpVar<Fr>> = parts.iter().map(SignMagnitudeVar::signed_value).collect();
        hash_gradient_var(cs.clone(), &signed)?.enforce_equal(&public_gradient_commitment)?;

        // 2) Norm re-derived, not inherited.
        let norm_sq = norm_squared_var(&parts)?;
        enforce_bit_width(&tau_sq, NORM_BITS)?;
        enforce_leq(&norm_sq, &tau_sq, NORM_BITS)?;

        // 3) Key bound to the client id.
        let key = FpVar::new_witness(cs.clone(), || Ok(self.key.0))?;
        commit_key_var(cs.clone(), &client_id, &key)?.enforce_equal(&public_key_commitment)?;

        // 4) Masking relation.
        for (i, (g, m)) in signed.iter().zip(&masked).enumerate() {
            let mask = prf_var(cs.clone(), &key, &round, i as u64)?;
            (g + &mask).enforce_equal(m)?;
        }

        Ok(())
    }
}
