use serde::{Deserialize, Serialize};
use zk_proofs::aggregator::{RoundOutcome, RoundStatus};
use ark_bn254::Fr;
use zk_proofs::types::{fr_vec_hex, ClientId, ModelCommitment, RoundParams};
use zk_proofs::Stage;

#[derive(Debug, Serialize, Deserialize)]
pub struct RoundResponse {
    #[serde(flatten)]
    pub status: RoundStatus,
    pub params: RoundParams,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ZkVkResponse {
    pub curve: String,
    pub proof_system: String,
    pub balance_vk_b64: String,
    pub training_vk_b64: String,
    pub aggregation_vk_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub accepted: bool,
    pub client_id: ClientId,
    pub round: u64,
    /// Content address of the persisted public commitments.
    pub commitment_id: String,
}

/// Used by both the client's own reveal and the authenticated recovery channel.
///
/// Carries the client's mask for this round only, never its mask key.
#[derive(Debug, Serialize, Deserialize)]
pub struct MaskRequest {
    pub client_id: ClientId,
    #[serde(with = "fr_vec_hex")]
    pub mask: Vec<Fr>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MaskResponse {
    pub client_id: ClientId,
    pub accepted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub outcome: RoundOutcome,
    pub next_round: u64,
    pub next_model_commitment: ModelCommitment,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitmentListResponse {
    pub round: u64,
    pub commitments: Vec<CommitmentItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitmentItem {
    pub content_id: String,
    pub client_id: ClientId,
    pub dataset_root_hex: String,
    pub gradient_commitment_hex: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ZkPkResponse {
    pub stage: Stage,
    pub pk_b64: String,
}
