//! Client-side proof construction: balance, then training, then aggregation.
//!
//! Each stage returns a typed handle ([`DatasetRoot`], [`GradientCommitment`]) that the next
//! stage takes by value. A stage cannot see inside another stage's circuit, so every handle is
//! checked against the witness it is about to be used with before proving.

use ark_bn254::Fr;
use rand::{CryptoRng, RngCore};

use crate::backend::{prove_checked, ProofBackend, StageKeys};
use crate::balance::DatasetBalanceCircuit;
use crate::dataset::{CommittedDataset, Sample};
use crate::errors::{Stage, ZkError};
use crate::fixed_point::{clip_gradient, decompose_gradient};
use crate::groth16::to_b64;
use crate::masking::{MaskKey, SecureAggregationCircuit};
use crate::training::{gradient_commitment, TrainingIntegrityCircuit};
use crate::types::{
    ClassCounts, ClientId, DatasetRoot, GradientCommitment, KeyCommitment, ModelCommitment, RoundParams,
    RoundSubmission, StageProofs,
};

/// Output of the balance stage.
#[derive(Clone, Debug)]
pub struct BalanceOutput<P> {
    pub dataset_root: DatasetRoot,
    pub class_counts: ClassCounts,
    pub proof: P,
}

/// Output of the training stage.
#[derive(Clone, Debug)]
pub struct TrainingOutput<P> {
    pub gradient_commitment: GradientCommitment,
    /// The clipped gradient that was proven; the aggregation stage must reuse exactly this.
    pub clipped_gradient: Vec<i64>,
    pub model_commitment: ModelCommitment,
    pub updated_model_commitment: ModelCommitment,
    pub proof: P,
}

/// Output of the aggregation stage.
#[derive(Clone, Debug)]
pub struct AggregationOutput<P> {
    pub masked_update: Vec<Fr>,
    pub key_commitment: KeyCommitment,
    pub proof: P,
}

/// Everything one client holds privately for one round.
#[derive(Clone, Debug)]
pub struct ClientInput {
    pub client_id: ClientId,
    pub round: u64,
    pub samples: Vec<Sample>,
    /// Dataset indices the local step used.
    pub batch: Vec<usize>,
    /// Locally computed gradient, before clipping.
    pub gradient: Vec<i64>,
    /// Current global weights.
    pub weights: Vec<i64>,
    pub key: MaskKey,
}

/// One client's prover for a fixed set of round parameters.
pub struct ClientProver<'a, B: ProofBackend> {
    backend: &'a B,
    params: RoundParams,
    keys: &'a StageKeys<B::ProvingKey>,
}

impl<'a, B: ProofBackend> ClientProver<'a, B> {
    pub fn new(backend: &'a B, params: RoundParams, keys: &'a StageKeys<B::ProvingKey>) -> Result<Self, ZkError> {
        params.validate()?;
        Ok(Self { backend, params, keys })
    }

    pub fn params(&self) -> &RoundParams {
        &self.params
    }

    pub fn commit_dataset(&self, samples: Vec<Sample>) -> Result<CommittedDataset, ZkError> {
        CommittedDataset::commit(samples, &self.params.shape)
    }

    pub fn prove_balance<R: RngCore + CryptoRng>(
        &self,
        dataset: &CommittedDataset,
        rng: &mut R,
    ) -> Result<BalanceOutput<B::Proof>, ZkError> {
        let circuit = DatasetBalanceCircuit::from_dataset(self.params.shape, dataset)?;
        let statement = circuit.statement.clone();
        let proof = prove_checked(self.backend, Stage::Balance, &self.keys.balance, circuit, rng)?;

        Ok(BalanceOutput {
            dataset_root: statement.dataset_root,
            class_counts: statement.class_counts,
            proof,
        })
    }

    /// Clip `gradient` to the round bound and prove one step on `batch`.
    pub fn prove_training<R: RngCore + CryptoRng>(
        &self,
        dataset_root: DatasetRoot,
        dataset: &CommittedDataset,
        batch: &[usize],
        gradient: &[i64],
        weights: &[i64],
        rng: &mut R,
    ) -> Result<TrainingOutput<B::Proof>, ZkError> {
        if dataset.root() != dataset_root {
            return Err(ZkError::BindingMismatch(
                "training dataset does not match the published dataset root".to_string(),
            ));
        }

        let clipped = clip_gradient(gradient, self.params.clipping_bound)?;
        let circuit = TrainingIntegrityCircuit::new(
            self.params.shape,
            dataset,
            batch,
            &clipped,
            weights,
            self.params.learning_rate,
            self.params.clipping_bound_squared(),
        )?;
        let statement = circuit.statement.clone();
        let proof = prove_checked(self.backend, Stage::Training, &self.keys.training, circuit, rng)?;

        Ok(TrainingOutput {
            gradient_commitment: statement.gradient_commitment,
            clipped_gradient: clipped,
            model_commitment: statement.model_commitment,
            updated_model_commitment: statement.updated_model_commitment,
            proof,
        })
    }

    pub fn prove_aggregation<R: RngCore + CryptoRng>(
        &self,
        client_id: ClientId,
        round: u64,
        commitment: GradientCommitment,
        clipped_gradient: &[i64],
        key: MaskKey,
        rng: &mut R,
    ) -> Result<AggregationOutput<B::Proof>, ZkError> {
        if gradient_commitment(&decompose_gradient(clipped_gradient)?) != commitment {
            return Err(ZkError::BindingMismatch(
                "aggregation gradient does not match the published gradient commitment".to_string(),
            ));
        }

        let circuit =
            SecureAggregationCircuit::new(client_id, round, clipped_gradient, key, self.params.clipping_bound_squared())?;
        let statement = circuit.statement.clone();
        let proof = prove_checked(self.backend, Stage::Aggregation, &self.keys.aggregation, circuit, rng)?;

        Ok(AggregationOutput {
            masked_update: statement.masked_update,
            key_commitment: statement.key_commitment,
            proof,
        })
    }

    /// All three stages, assembled into the round submission.
    pub fn run<R: RngCore + CryptoRng>(&self, input: ClientInput, rng: &mut R) -> Result<RoundSubmission, ZkError> {
        let span = tracing::info_span!("client_round", client_id = input.client_id, round = input.round);
        let _guard = span.enter();

        let dataset = self.commit_dataset(input.samples)?;

        let balance = self.prove_balance(&dataset, rng)?;
        tracing::debug!(stage = %Stage::Balance, root = %balance.dataset_root.to_hex(), "stage proved");

        let training = self.prove_training(
            balance.dataset_root,
            &dataset,
            &input.batch,
            &input.gradient,
            &input.weights,
            rng,
        )?;
        tracing::debug!(stage = %Stage::Training, "stage proved");

        let aggregation = self.prove_aggregation(
            input.client_id,
            input.round,
            training.gradient_commitment,
            &training.clipped_gradient,
            input.key,
            rng,
        )?;
        tracing::debug!(stage = %Stage::Aggregation, "stage proved");

        let proofs = StageProofs {
            balance: to_b64(&balance.proof)?,
            training: to_b64(&training.proof)?,
            aggregation: to_b64(&aggregation.proof)?,
        };

        tracing::info!("submission ready");
        Ok(RoundSubmission {
            client_id: input.client_id,
            round: input.round,
            dataset_root: balance.dataset_root,
            dataset_size: dataset.len() as u64,
            class_counts: balance.class_counts,
            gradient_commitment: training.gradient_commitment,
            clipping_bound_squared: self.params.clipping_bound_squared(),
            learning_rate: self.params.learning_rate,
            model_commitment: training.model_commitment,
            updated_model_commitment: training.updated_model_commitment,
            key_commitment: aggregation.key_commitment,
            masked_update: aggregation.masked_update,
            proofs,
        })
    }
}
