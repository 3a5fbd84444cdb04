#![allow(dead_code)]

use std::sync::OnceLock;

use ark_bn254::{Bn254, Fr};
use ark_groth16::{ProvingKey, VerifyingKey};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use zk_proofs::aggregator::{Aggregator, RoundInfo, SubmissionVerifier};
use zk_proofs::backend::{compile_round, StageKeys};
use zk_proofs::dataset::Sample;
use zk_proofs::fixed_point::to_fixed;
use zk_proofs::groth16::Groth16Backend;
use zk_proofs::masking::MaskKey;
use zk_proofs::pipeline::{ClientInput, ClientProver};
use zk_proofs::training::model_commitment;
use zk_proofs::types::{CircuitShape, ClientId, RoundParams, RoundSubmission};

pub const ROUND: u64 = 1;
pub const WEIGHTS: [i64; 4] = [250, -250, 1000, 0];

/// DIM = 4, tau = 1.0, four samples per client in a depth-2 tree.
pub fn params() -> RoundParams {
    RoundParams {
        shape: CircuitShape { dim: 4, tree_depth: 2, dataset_size: 4, batch_size: 2 },
        clipping_bound: to_fixed(1.0).unwrap() as u64,
        learning_rate: to_fixed(0.1).unwrap() as u64,
    }
}

pub struct Keys {
    pub proving: StageKeys<ProvingKey<Bn254>>,
    pub verifying: StageKeys<VerifyingKey<Bn254>>,
}

/// Key generation dominates test time; do it once per test binary.
pub fn keys() -> &'static Keys {
    static KEYS: OnceLock<Keys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = ChaCha20Rng::seed_from_u64(2024);
        let (proving, verifying) = compile_round(&Groth16Backend, params().shape, &mut rng).unwrap();
        Keys { proving, verifying }
    })
}

/// Two samples of each class, in a client-specific order.
pub fn samples(rng: &mut ChaCha20Rng) -> Vec<Sample> {
    let mut labels = [true, true, false, false];
    for i in (1..labels.len()).rev() {
        labels.swap(i, rng.gen_range(0..=i));
    }
    labels
        .iter()
        .map(|&label| Sample {
            features: (0..4).map(|_| rng.gen_range(-2000..2000)).collect(),
            label,
        })
        .collect()
}

pub fn client_key(client_id: ClientId) -> MaskKey {
    MaskKey::random(&mut ChaCha20Rng::seed_from_u64(10_000 + client_id))
}

/// What a client sends after the seal: its mask for [`ROUND`], never the key.
pub fn round_mask(client_id: ClientId) -> Vec<Fr> {
    client_key(client_id).mask(ROUND, params().shape.dim)
}

pub fn client_input(client_id: ClientId, gradient: Vec<i64>) -> ClientInput {
    let mut rng = ChaCha20Rng::seed_from_u64(client_id);
    ClientInput {
        client_id,
        round: ROUND,
        samples: samples(&mut rng),
        batch: vec![0, 2],
        gradient,
        weights: WEIGHTS.to_vec(),
        key: client_key(client_id),
    }
}

pub fn prove(client_id: ClientId, gradient: Vec<i64>) -> RoundSubmission {
    let backend = Groth16Backend;
    let prover = ClientProver::new(&backend, params(), &keys().proving).unwrap();
    let mut rng = ChaCha20Rng::seed_from_u64(client_id + 7);
    prover.run(client_input(client_id, gradient), &mut rng).unwrap()
}

pub fn aggregator() -> Aggregator<Groth16Backend> {
    let verifier = SubmissionVerifier::new(Groth16Backend, keys().verifying.clone(), params()).unwrap();
    Aggregator::new(verifier, RoundInfo { number: ROUND, model_commitment: model_commitment(&WEIGHTS) })
}
