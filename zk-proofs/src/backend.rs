//! The proof-system seam.
//!
//! Circuits are written against `ConstraintSynthesizer<Fr>`; everything that touches keys or
//! pairings goes through [`ProofBackend`], so the stages never name a concrete proof system.

use ark_bn254::Fr;
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystem, SynthesisError};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use rand::{CryptoRng, RngCore};

use crate::balance::DatasetBalanceCircuit;
use crate::errors::{Stage, ZkError};
use crate::masking::SecureAggregationCircuit;
use crate::training::TrainingIntegrityCircuit;
use crate::types::CircuitShape;

pub trait ProofBackend: Send + Sync {
    type ProvingKey: Clone + Send + Sync + CanonicalSerialize + CanonicalDeserialize;
    type VerifyingKey: Clone + Send + Sync + CanonicalSerialize + CanonicalDeserialize;
    type Proof: Clone + Send + Sync + CanonicalSerialize + CanonicalDeserialize;

    /// Derive a key pair for the circuit's shape. Witness values are ignored.
    fn compile<C, R>(&self, circuit: C, rng: &mut R) -> Result<(Self::ProvingKey, Self::VerifyingKey), ZkError>
    where
        C: ConstraintSynthesizer<Fr>,
        R: RngCore + CryptoRng;

    /// Prove the circuit's public inputs from its private witness.
    fn prove<C, R>(&self, pk: &Self::ProvingKey, circuit: C, rng: &mut R) -> Result<Self::Proof, ZkError>
    where
        C: ConstraintSynthesizer<Fr>,
        R: RngCore + CryptoRng;

    fn verify(&self, vk: &Self::VerifyingKey, public_inputs: &[Fr], proof: &Self::Proof) -> Result<bool, ZkError>;
}

/// Evaluate the circuit on its witness without proving.
///
/// An unsatisfied system becomes [`ZkError::WitnessUnsatisfiable`], so no proof is ever built
/// for a witness that cannot verify.
pub fn check_satisfied<C: ConstraintSynthesizer<Fr>>(stage: Stage, circuit: C) -> Result<(), ZkError> {
    let cs = ConstraintSystem::<Fr>::new_ref();
    circuit.generate_constraints(cs.clone()).map_err(|e| match e {
        SynthesisError::Unsatisfiable => ZkError::WitnessUnsatisfiable {
            stage,
            reason: "witness does not match the circuit shape".to_string(),
        },
        other => ZkError::Ark(format!("{other}")),
    })?;

    let ok = cs.is_satisfied().map_err(|e| ZkError::Ark(format!("{e}")))?;
    if !ok {
        let reason = cs
            .which_is_unsatisfied()
            .ok()
            .flatten()
            .unwrap_or_else(|| "constraint violated".to_string());
        return Err(ZkError::WitnessUnsatisfiable { stage, reason });
    }
    Ok(())
}

/// Check the witness, then prove.
pub fn prove_checked<B, C, R>(
    backend: &B,
    stage: Stage,
    pk: &B::ProvingKey,
    circuit: C,
    rng: &mut R,
) -> Result<B::Proof, ZkError>
where
    B: ProofBackend,
    C: ConstraintSynthesizer<Fr> + Clone,
    R: RngCore + CryptoRng,
{
    check_satisfied(stage, circuit.clone())?;
    backend.prove(pk, circuit, rng)
}

/// One value per stage.
#[derive(Clone, Debug)]
pub struct StageKeys<K> {
    pub balance: K,
    pub training: K,
    pub aggregation: K,
}

impl<K> StageKeys<K> {
    pub fn get(&self, stage: Stage) -> &K {
        match stage {
            Stage::Balance => &self.balance,
            Stage::Training => &self.training,
            Stage::Aggregation => &self.aggregation,
        }
    }

    pub fn try_map<T, E>(self, mut f: impl FnMut(Stage, K) -> Result<T, E>) -> Result<StageKeys<T>, E> {
        Ok(StageKeys {
            balance: f(Stage::Balance, self.balance)?,
            training: f(Stage::Training, self.training)?,
            aggregation: f(Stage::Aggregation, self.aggregation)?,
        })
    }
}

/// Key pairs for all three stages of one circuit shape.
pub fn compile_round<B, R>(
    backend: &B,
    shape: CircuitShape,
    rng: &mut R,
) -> Result<(StageKeys<B::ProvingKey>, StageKeys<B::VerifyingKey>), ZkError>
where
    B: ProofBackend,
    R: RngCore + CryptoRng,
{
    shape.validate()?;

    let (balance_pk, balance_vk) = backend.compile(DatasetBalanceCircuit::blank(shape), rng)?;
    let (training_pk, training_vk) = backend.compile(TrainingIntegrityCircuit::blank(shape), rng)?;
    let (aggregation_pk, aggregation_vk) = backend.compile(SecureAggregationCircuit::blank(shape.dim), rng)?;

    tracing::info!(dim = shape.dim, depth = shape.tree_depth, n = shape.dataset_size, "compiled stage keys");

    Ok((
        StageKeys { balance: balance_pk, training: training_pk, aggregation: aggregation_pk },
        StageKeys { balance: balance_vk, training: training_vk, aggregation: aggregation_vk },
    ))
}
