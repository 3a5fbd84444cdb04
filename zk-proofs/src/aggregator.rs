//! Round bookkeeping on the aggregator side.
//!
//! Verification ([`SubmissionVerifier`]) is read-only and may run for many submissions in
//! parallel. Everything that changes the round ([`Round`]) takes `&mut self`, so accumulation,
//! mask recovery and finalization are serialized by whoever owns the round.
//!
//! Lifecycle: `Collecting -> Unmasking -> Finalized`.

use std::collections::BTreeMap;

use ark_bn254::Fr;
use serde::{Deserialize, Serialize};

use crate::backend::{ProofBackend, StageKeys};
use crate::errors::{Stage, ZkError};
use crate::fixed_point::{apply_update, decompose_gradient};
use crate::groth16::from_b64;
use crate::masking::{decode_update, unmask};
use crate::poseidon::content_id;
use crate::training::{gradient_commitment, model_commitment};
use crate::types::{
    ClassCounts, ClientId, DatasetRoot, FrHex, GradientCommitment, KeyCommitment, ModelCommitment, RoundParams,
    RoundSubmission,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Collecting,
    Unmasking,
    Finalized,
}

impl RoundPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundPhase::Collecting => "collecting",
            RoundPhase::Unmasking => "unmasking",
            RoundPhase::Finalized => "finalized",
        }
    }
}

/// What a submission is checked against besides the fixed round parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInfo {
    pub number: u64,
    /// Commitment to the global weights every client must start from.
    pub model_commitment: ModelCommitment,
}

/// A submission whose three proofs verified against its own public values.
#[derive(Clone, Debug)]
pub struct VerifiedSubmission {
    pub client_id: ClientId,
    pub round: u64,
    pub dataset_root: DatasetRoot,
    pub class_counts: ClassCounts,
    pub gradient_commitment: GradientCommitment,
    pub key_commitment: KeyCommitment,
    pub masked_update: Vec<Fr>,
}

/// Checks submissions against the round's verifying keys.
pub struct SubmissionVerifier<B: ProofBackend> {
    backend: B,
    keys: StageKeys<B::VerifyingKey>,
    params: RoundParams,
}

impl<B: ProofBackend> SubmissionVerifier<B> {
    pub fn new(backend: B, keys: StageKeys<B::VerifyingKey>, params: RoundParams) -> Result<Self, ZkError> {
        params.validate()?;
        Ok(Self { backend, keys, params })
    }

    pub fn params(&self) -> &RoundParams {
        &self.params
    }

    pub fn verifying_keys(&self) -> &StageKeys<B::VerifyingKey> {
        &self.keys
    }

    /// Check round bindings, then all three proofs.
    ///
    /// The three statements are rebuilt from the one submission, so the dataset root the
    /// balance proof covers is the one the training proof opens, and likewise for the gradient
    /// commitment between training and aggregation.
    pub fn verify(&self, round: &RoundInfo, submission: &RoundSubmission) -> Result<VerifiedSubmission, ZkError> {
        if submission.round != round.number {
            return Err(ZkError::BindingMismatch(format!(
                "submission is for round {}, current round is {}",
                submission.round, round.number
            )));
        }
        if submission.clipping_bound_squared != self.params.clipping_bound_squared() {
            return Err(ZkError::BindingMismatch("clipping bound differs from the round's".to_string()));
        }
        if submission.learning_rate != self.params.learning_rate {
            return Err(ZkError::BindingMismatch("learning rate differs from the round's".to_string()));
        }
        if submission.model_commitment != round.model_commitment {
            return Err(ZkError::BindingMismatch("update does not start from the current global model".to_string()));
        }
        if submission.dataset_size != self.params.shape.dataset_size as u64 {
            return Err(ZkError::Malformed(format!(
                "dataset size {} differs from the circuit's {}",
                submission.dataset_size, self.params.shape.dataset_size
            )));
        }
        if submission.masked_update.len() != self.params.shape.dim {
            return Err(ZkError::Malformed(format!(
                "masked update has {} components, expected {}",
                submission.masked_update.len(),
                self.params.shape.dim
            )));
        }

        let checks = [
            (Stage::Balance, &submission.proofs.balance, submission.balance_statement().public_inputs()),
            (Stage::Training, &submission.proofs.training, submission.training_statement().public_inputs()),
            (Stage::Aggregation, &submission.proofs.aggregation, submission.aggregation_statement().public_inputs()),
        ];
        for (stage, encoded, inputs) in checks {
            let proof: B::Proof = from_b64(encoded)?;
            if !self.backend.verify(self.keys.get(stage), &inputs, &proof)? {
                tracing::warn!(client_id = submission.client_id, %stage, "proof rejected");
                return Err(ZkError::ProofInvalid { stage });
            }
        }

        Ok(VerifiedSubmission {
            client_id: submission.client_id,
            round: submission.round,
            dataset_root: submission.dataset_root,
            class_counts: submission.class_counts,
            gradient_commitment: submission.gradient_commitment,
            key_commitment: submission.key_commitment,
            masked_update: submission.masked_update.clone(),
        })
    }
}

/// How a client's round mask reached the aggregator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskSource {
    /// The client revealed its own round mask after the round was sealed.
    Revealed,
    /// Rebuilt out-of-band for a client that went silent after submitting.
    Recovered,
}

#[derive(Clone, Debug)]
struct Entry {
    submission: VerifiedSubmission,
    mask: Option<(Vec<Fr>, MaskSource)>,
}

/// One accepted client's public values, as persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicCommitment {
    pub round: u64,
    pub client_id: ClientId,
    pub dataset_root: DatasetRoot,
    pub gradient_commitment: GradientCommitment,
}

impl PublicCommitment {
    /// Content address over every field.
    pub fn content_id(&self) -> FrHex {
        FrHex::from_fr(&content_id(&[
            Fr::from(self.round),
            Fr::from(self.client_id),
            self.dataset_root.0,
            self.gradient_commitment.0,
        ]))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStatus {
    pub round: u64,
    pub phase: RoundPhase,
    pub model_commitment: ModelCommitment,
    pub accepted: Vec<ClientId>,
    pub masks_known: Vec<ClientId>,
}

/// Result of a finalized round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub round: u64,
    /// Sum of the contributors' clipped gradients, fixed point.
    pub aggregate: Vec<i64>,
    pub contributors: Vec<ClientId>,
    /// Contributors whose mask arrived through recovery.
    pub recovered: Vec<ClientId>,
    /// Accepted clients left out because no mask was available.
    pub excluded: Vec<ClientId>,
}

impl RoundOutcome {
    /// Apply the mean contributed gradient as one step on `weights`.
    pub fn advance(&self, weights: &[i64], learning_rate: u64) -> Result<Vec<i64>, ZkError> {
        if self.contributors.is_empty() {
            return Ok(weights.to_vec());
        }
        let n = self.contributors.len() as i64;
        let mean: Vec<i64> = self.aggregate.iter().map(|&v| v / n).collect();
        Ok(apply_update(weights, &mean, learning_rate)?)
    }
}

/// Whether `mask` removes exactly the mask from `verified`'s update.
///
/// The unmasked vector must hash to the gradient commitment the client proved, which pins the
/// mask to `masked - gradient` without the aggregator ever seeing the client's key.
fn check_mask(verified: &VerifiedSubmission, mask: &[Fr]) -> Result<(), ZkError> {
    let mismatch = || {
        ZkError::BindingMismatch(format!(
            "mask does not open the update client {} proved",
            verified.client_id
        ))
    };
    let plain = decode_update(&unmask(&verified.masked_update, mask)?).map_err(|_| mismatch())?;
    let parts = decompose_gradient(&plain).map_err(|_| mismatch())?;
    if gradient_commitment(&parts) != verified.gradient_commitment {
        return Err(mismatch());
    }
    Ok(())
}

/// The single-writer accumulator for one round.
#[derive(Debug)]
pub struct Round {
    info: RoundInfo,
    dim: usize,
    phase: RoundPhase,
    entries: BTreeMap<ClientId, Entry>,
    masked_sum: Vec<Fr>,
}

impl Round {
    pub fn new(info: RoundInfo, dim: usize) -> Self {
        Self {
            info,
            dim,
            phase: RoundPhase::Collecting,
            entries: BTreeMap::new(),
            masked_sum: vec![Fr::from(0u64); dim],
        }
    }

    pub fn info(&self) -> &RoundInfo {
        &self.info
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    fn require(&self, expected: RoundPhase) -> Result<(), ZkError> {
        if self.phase != expected {
            return Err(ZkError::RoundPhase {
                expected: expected.as_str(),
                actual: self.phase.as_str(),
            });
        }
        Ok(())
    }

    /// Every check [`Round::accept`] makes, without changing the round.
    ///
    /// Lets a caller persist the submission between the check and the accept.
    pub fn admit(&self, verified: &VerifiedSubmission) -> Result<(), ZkError> {
        self.require(RoundPhase::Collecting)?;
        if verified.round != self.info.number {
            return Err(ZkError::BindingMismatch(format!(
                "verified for round {}, current round is {}",
                verified.round, self.info.number
            )));
        }
        if verified.masked_update.len() != self.dim {
            return Err(ZkError::Malformed("masked update has the wrong dimension".to_string()));
        }
        if self.entries.contains_key(&verified.client_id) {
            return Err(ZkError::DuplicateSubmission(verified.client_id));
        }
        Ok(())
    }

    /// Fold a verified masked update into the running sum.
    pub fn accept(&mut self, verified: VerifiedSubmission) -> Result<(), ZkError> {
        self.admit(&verified)?;

        for (acc, v) in self.masked_sum.iter_mut().zip(&verified.masked_update) {
            *acc += v;
        }
        tracing::info!(round = self.info.number, client_id = verified.client_id, "submission accepted");
        self.entries.insert(verified.client_id, Entry { submission: verified, mask: None });
        Ok(())
    }

    /// Stop collecting; round masks may be registered from now on.
    pub fn seal(&mut self) -> Result<(), ZkError> {
        self.require(RoundPhase::Collecting)?;
        self.phase = RoundPhase::Unmasking;
        tracing::info!(round = self.info.number, accepted = self.entries.len(), "round sealed");
        Ok(())
    }

    /// A client's own mask for this round, sent after the round is sealed.
    ///
    /// Only `PRF(key, round, i)` is sent; the key itself never leaves the client, so a reveal
    /// says nothing about the client's masks in other rounds.
    pub fn reveal_mask(&mut self, client_id: ClientId, mask: Vec<Fr>) -> Result<(), ZkError> {
        self.register_mask(client_id, mask, MaskSource::Revealed)
    }

    /// A round mask rebuilt out-of-band for a client that submitted and then went silent.
    ///
    /// Callers are responsible for authenticating the recovery request.
    pub fn recover_mask(&mut self, client_id: ClientId, mask: Vec<Fr>) -> Result<(), ZkError> {
        self.register_mask(client_id, mask, MaskSource::Recovered)
    }

    fn register_mask(&mut self, client_id: ClientId, mask: Vec<Fr>, source: MaskSource) -> Result<(), ZkError> {
        self.require(RoundPhase::Unmasking)?;
        let entry = self.entries.get_mut(&client_id).ok_or(ZkError::UnknownClient(client_id))?;
        if entry.mask.is_some() {
            return Err(ZkError::MaskAlreadyRegistered(client_id));
        }
        check_mask(&entry.submission, &mask)?;
        entry.mask = Some((mask, source));
        match source {
            MaskSource::Revealed => tracing::info!(round = self.info.number, client_id, "round mask revealed"),
            MaskSource::Recovered => tracing::warn!(round = self.info.number, client_id, "round mask recovered"),
        }
        Ok(())
    }

    /// The outcome finalizing would produce, leaving the round in `Unmasking`.
    ///
    /// Remove every known mask, drop clients without one, and decode the sum.
    pub fn outcome(&self) -> Result<RoundOutcome, ZkError> {
        self.require(RoundPhase::Unmasking)?;

        let mut sum = self.masked_sum.clone();
        let mut contributors = Vec::new();
        let mut recovered = Vec::new();
        let mut excluded = Vec::new();

        for (&client_id, entry) in &self.entries {
            match &entry.mask {
                Some((mask, source)) => {
                    sum = unmask(&sum, mask)?;
                    contributors.push(client_id);
                    if *source == MaskSource::Recovered {
                        recovered.push(client_id);
                    }
                }
                None => {
                    sum = unmask(&sum, &entry.submission.masked_update)?;
                    excluded.push(client_id);
                }
            }
        }

        Ok(RoundOutcome {
            round: self.info.number,
            aggregate: decode_update(&sum)?,
            contributors,
            recovered,
            excluded,
        })
    }

    /// [`Round::outcome`], then close the round.
    pub fn finalize(&mut self) -> Result<RoundOutcome, ZkError> {
        let outcome = self.outcome()?;
        self.phase = RoundPhase::Finalized;
        tracing::info!(
            round = self.info.number,
            contributors = outcome.contributors.len(),
            excluded = outcome.excluded.len(),
            "round finalized"
        );
        Ok(outcome)
    }

    /// Fresh round on top of a finalized one.
    pub fn next(&self, model_commitment: ModelCommitment) -> Result<Round, ZkError> {
        self.require(RoundPhase::Finalized)?;
        Ok(Round::new(
            RoundInfo {
                number: self.info.number + 1,
                model_commitment,
            },
            self.dim,
        ))
    }

    pub fn status(&self) -> RoundStatus {
        RoundStatus {
            round: self.info.number,
            phase: self.phase,
            model_commitment: self.info.model_commitment,
            accepted: self.entries.keys().copied().collect(),
            masks_known: self
                .entries
                .iter()
                .filter(|(_, e)| e.mask.is_some())
                .map(|(&id, _)| id)
                .collect(),
        }
    }

    /// Public values of every accepted submission.
    pub fn commitments(&self) -> Vec<PublicCommitment> {
        self.entries
            .values()
            .map(|e| PublicCommitment {
                round: self.info.number,
                client_id: e.submission.client_id,
                dataset_root: e.submission.dataset_root,
                gradient_commitment: e.submission.gradient_commitment,
            })
            .collect()
    }
}

/// Verifier and round together, for callers that do not need to split them.
pub struct Aggregator<B: ProofBackend> {
    verifier: SubmissionVerifier<B>,
    round: Round,
}

impl<B: ProofBackend> Aggregator<B> {
    pub fn new(verifier: SubmissionVerifier<B>, info: RoundInfo) -> Self {
        let dim = verifier.params().shape.dim;
        Self { verifier, round: Round::new(info, dim) }
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn round_mut(&mut self) -> &mut Round {
        &mut self.round
    }

    pub fn verifier(&self) -> &SubmissionVerifier<B> {
        &self.verifier
    }

    /// Verify, then accept.
    pub fn submit(&mut self, submission: &RoundSubmission) -> Result<(), ZkError> {
        let verified = self.verifier.verify(self.round.info(), submission)?;
        self.round.accept(verified)
    }

    pub fn seal(&mut self) -> Result<(), ZkError> {
        self.round.seal()
    }

    pub fn reveal_mask(&mut self, client_id: ClientId, mask: Vec<Fr>) -> Result<(), ZkError> {
        self.round.reveal_mask(client_id, mask)
    }

    pub fn recover_mask(&mut self, client_id: ClientId, mask: Vec<Fr>) -> Result<(), ZkError> {
        self.round.recover_mask(client_id, mask)
    }

    pub fn finalize(&mut self) -> Result<RoundOutcome, ZkError> {
        self.round.finalize()
    }

    /// Finalized round's outcome applied to `weights`; opens the next round on the result.
    pub fn advance(&mut self, outcome: &RoundOutcome, weights: &[i64]) -> Result<Vec<i64>, ZkError> {
        let next_weights = outcome.advance(weights, self.verifier.params().learning_rate)?;
        self.round = self.round.next(model_commitment(&next_weights))?;
        Ok(next_weights)
    }
}
