mod common;

use ark_bn254::Fr;
use common::{aggregator, params, prove, round_mask, WEIGHTS};
use zk_proofs::fixed_point::{apply_update, clip_gradient};
use zk_proofs::training::model_commitment;
use zk_proofs::types::ClassCounts;
use zk_proofs::{Stage, ZkError};

const A: u64 = 1;
const B: u64 = 2;
const C: u64 = 3;

fn gradients() -> [(u64, Vec<i64>); 3] {
    [
        // Already inside the unit ball.
        (A, vec![300, -400, 100, 0]),
        // Norm 5.0, clipped down to 1.0.
        (B, vec![3000, 0, -4000, 0]),
        (C, vec![-1200, 900, 15, -2500]),
    ]
}

#[test]
fn three_clients_aggregate_to_the_clipped_sum() {
    let tau = params().clipping_bound;
    let mut agg = aggregator();
    let mut expected = vec![0i64; 4];

    for (id, gradient) in gradients() {
        let clipped = clip_gradient(&gradient, tau).unwrap();
        for (e, c) in expected.iter_mut().zip(&clipped) {
            *e += c;
        }

        let submission = prove(id, gradient);
        assert_eq!(submission.class_counts, ClassCounts { c0: 2, c1: 2 });
        agg.submit(&submission).unwrap();
    }

    agg.seal().unwrap();
    for id in [A, B, C] {
        agg.reveal_mask(id, round_mask(id)).unwrap();
    }
    let outcome = agg.finalize().unwrap();

    assert_eq!(outcome.aggregate, expected);
    assert_eq!(outcome.contributors, vec![A, B, C]);
    assert!(outcome.excluded.is_empty());

    let next = agg.advance(&outcome, &WEIGHTS).unwrap();
    let mean: Vec<i64> = expected.iter().map(|v| v / 3).collect();
    assert_eq!(next, apply_update(&WEIGHTS, &mean, params().learning_rate).unwrap());
    assert_eq!(agg.round().info().model_commitment, model_commitment(&next));
}

#[test]
fn tampered_public_values_fail_verification() {
    let honest = prove(A, vec![300, -400, 100, 0]);

    let mut masked = honest.clone();
    masked.masked_update[0] += Fr::from(1u64);
    let err = aggregator().submit(&masked).unwrap_err();
    assert!(matches!(err, ZkError::ProofInvalid { stage: Stage::Aggregation }));

    let mut counts = honest.clone();
    counts.class_counts = ClassCounts { c0: 1, c1: 3 };
    let err = aggregator().submit(&counts).unwrap_err();
    assert!(matches!(err, ZkError::ProofInvalid { stage: Stage::Balance }));

    // Swapping in another client's root breaks the balance proof first, and the training proof
    // could not have opened it either.
    let other = prove(B, vec![1, 2, 3, 4]);
    let mut swapped = honest.clone();
    swapped.dataset_root = other.dataset_root;
    let err = aggregator().submit(&swapped).unwrap_err();
    assert!(matches!(err, ZkError::ProofInvalid { stage: Stage::Balance }));

    let mut gradient = honest.clone();
    gradient.gradient_commitment = other.gradient_commitment;
    let err = aggregator().submit(&gradient).unwrap_err();
    assert!(matches!(err, ZkError::ProofInvalid { stage: Stage::Training }));

    let mut proofs = honest.clone();
    proofs.proofs.training = other.proofs.training.clone();
    let err = aggregator().submit(&proofs).unwrap_err();
    assert!(matches!(err, ZkError::ProofInvalid { stage: Stage::Training }));

    aggregator().submit(&honest).unwrap();
}

#[test]
fn submission_survives_json() {
    let submission = prove(C, vec![5, -5, 5, -5]);
    let json = serde_json::to_string(&submission).unwrap();
    let back: zk_proofs::types::RoundSubmission = serde_json::from_str(&json).unwrap();
    aggregator().submit(&back).unwrap();
}
