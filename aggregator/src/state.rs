use crate::config::Settings;
use crate::db::{self, Db};
use crate::errors::ApiError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use zk_proofs::aggregator::{Round, RoundInfo, SubmissionVerifier};
use zk_proofs::backend::{compile_round, StageKeys};
use zk_proofs::groth16::{deserialize, serialize, Groth16Backend};
use zk_proofs::training::model_commitment;
use zk_proofs::types::CircuitShape;
use zk_proofs::Stage;

use ark_bn254::Bn254;
use ark_groth16::{ProvingKey, VerifyingKey};
use rand::rngs::OsRng;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub settings: Arc<Settings>,
    keys: Arc<OnceCell<ZkKeys>>,
    pub coordinator: Arc<Mutex<Coordinator>>,
}

#[derive(Clone)]
pub struct ZkKeys {
    /// Handed out to clients; the aggregator never proves.
    pub proving: Arc<StageKeys<ProvingKey<Bn254>>>,
    pub verifier: Arc<SubmissionVerifier<Groth16Backend>>,
}

impl ZkKeys {
    pub fn verifying(&self) -> &StageKeys<VerifyingKey<Bn254>> {
        self.verifier.verifying_keys()
    }
}

/// The open round and the global weights it started from.
pub struct Coordinator {
    pub round: Round,
    pub weights: Vec<i64>,
}

impl AppState {
    /// Resume after the last finalized round, or open round 1 on zero weights.
    pub async fn new(db: Db, settings: Settings) -> Result<Self, ApiError> {
        let dim = settings.params.shape.dim;
        let (number, weights) = match db::latest_round(&db).await? {
            Some((last, weights)) if weights.len() == dim => (last + 1, weights),
            Some((last, weights)) => {
                tracing::error!(round = last, stored = weights.len(), dim, "stored weights do not fit MODEL_DIM");
                return Err(ApiError::Internal);
            }
            None => (1, vec![0; dim]),
        };

        let info = RoundInfo { number, model_commitment: model_commitment(&weights) };
        tracing::info!(round = number, model = %info.model_commitment.to_hex(), "round open");

        Ok(Self {
            db,
            settings: Arc::new(settings),
            keys: Arc::new(OnceCell::new()),
            coordinator: Arc::new(Mutex::new(Coordinator { round: Round::new(info, dim), weights })),
        })
    }

    /// Ensure Groth16 keys for all three stages exist on disk and in memory.
    ///
    /// This runs the trusted setup (prototype) on first use.
    pub async fn ensure_keys(&self) -> Result<ZkKeys, ApiError> {
        let data_dir = self.settings.data_dir.clone();
        let params = self.settings.params;

        self.keys
            .get_or_try_init(|| async move {
                tokio::task::spawn_blocking(move || {
                    let dir = keys_dir(&data_dir, &params.shape);
                    std::fs::create_dir_all(&dir).map_err(|_| ApiError::Internal)?;

                    let (proving, verifying) = match load_keys(&dir)? {
                        Some(keys) => keys,
                        None => {
                            // Trusted setup randomness (prototype).
                            //
                            // IMPORTANT: In production, use MPC setup or a transparent proof system.
                            let mut rng = OsRng;
                            let (pk, vk) = compile_round(&Groth16Backend, params.shape, &mut rng)?;
                            store_keys(&dir, &pk, &vk)?;
                            tracing::info!(dir = %dir.display(), "stage keys generated");
                            (pk, vk)
                        }
                    };

                    let verifier = SubmissionVerifier::new(Groth16Backend, verifying, params)?;
                    Ok::<ZkKeys, ApiError>(ZkKeys {
                        proving: Arc::new(proving),
                        verifier: Arc::new(verifier),
                    })
                })
                .await
                .map_err(|_| ApiError::Internal)?
            })
            .await
            .cloned()
    }
}

/// Keys are only valid for one circuit shape, so the shape names the directory.
fn keys_dir(data_dir: &Path, shape: &CircuitShape) -> PathBuf {
    data_dir.join("keys").join(format!(
        "d{}_t{}_n{}_b{}",
        shape.dim, shape.tree_depth, shape.dataset_size, shape.batch_size
    ))
}

fn stage_file(dir: &Path, stage: Stage, kind: &str) -> PathBuf {
    let name = match stage {
        Stage::Balance => "balance",
        Stage::Training => "training",
        Stage::Aggregation => "aggregation",
    };
    dir.join(format!("{name}_{kind}.bin"))
}

type KeyPair = (StageKeys<ProvingKey<Bn254>>, StageKeys<VerifyingKey<Bn254>>);

fn load_keys(dir: &Path) -> Result<Option<KeyPair>, ApiError> {
    let stages = StageKeys { balance: Stage::Balance, training: Stage::Training, aggregation: Stage::Aggregation };
    let all_present = [Stage::Balance, Stage::Training, Stage::Aggregation]
        .into_iter()
        .all(|s| stage_file(dir, s, "pk").exists() && stage_file(dir, s, "vk").exists());
    if !all_present {
        return Ok(None);
    }

    let read = |path: PathBuf| std::fs::read(path).map_err(|_| ApiError::Internal);
    let pk = stages.clone().try_map(|stage, _| {
        let key: ProvingKey<Bn254> = deserialize(&read(stage_file(dir, stage, "pk"))?)?;
        Ok::<_, ApiError>(key)
    })?;
    let vk = stages.try_map(|stage, _| {
        let key: VerifyingKey<Bn254> = deserialize(&read(stage_file(dir, stage, "vk"))?)?;
        Ok::<_, ApiError>(key)
    })?;
    Ok(Some((pk, vk)))
}

fn store_keys(
    dir: &Path,
    pk: &StageKeys<ProvingKey<Bn254>>,
    vk: &StageKeys<VerifyingKey<Bn254>>,
) -> Result<(), ApiError> {
    for stage in [Stage::Balance, Stage::Training, Stage::Aggregation] {
        std::fs::write(stage_file(dir, stage, "pk"), serialize(pk.get(stage))?).map_err(|_| ApiError::Internal)?;
        std::fs::write(stage_file(dir, stage, "vk"), serialize(vk.get(stage))?).map_err(|_| ApiError::Internal)?;
    }
    Ok(())
}
