use std::str::FromStr;

use chrono::Utc;
use sqlx::{sqlite::{SqliteConnectOptions, SqlitePoolOptions}, Pool, Row, Sqlite};
use zk_proofs::aggregator::{PublicCommitment, RoundOutcome};
use zk_proofs::types::ModelCommitment;

use crate::errors::ApiError;
use crate::models::CommitmentItem;

pub type Db = Pool<Sqlite>;

pub async fn connect(db_url: &str) -> Result<Db, ApiError> {
    let options = SqliteConnectOptions::from_str(db_url)
        .map_err(|_| ApiError::Internal)?
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|_| ApiError::Internal)
}

pub async fn init_schema(db: &Db) -> Result<(), ApiError> {
    // Append-only: rows are inserted, never updated or deleted.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS commitments (
  content_id TEXT PRIMARY KEY,
  round INTEGER NOT NULL,
  client_id INTEGER NOT NULL,
  dataset_root_hex TEXT NOT NULL,
  gradient_commitment_hex TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS commitments_by_round ON commitments(round);

CREATE TABLE IF NOT EXISTS rounds (
  round INTEGER PRIMARY KEY,
  finalized_at TEXT NOT NULL,
  aggregate_json TEXT NOT NULL,
  contributors_json TEXT NOT NULL,
  recovered_json TEXT NOT NULL,
  excluded_json TEXT NOT NULL,
  next_weights_json TEXT NOT NULL,
  next_model_commitment_hex TEXT NOT NULL
);
"#,
    )
    .execute(db)
    .await
    .map_err(|_| ApiError::Internal)?;

    Ok(())
}

/// Returns whether a new row was written; identical content is stored once.
pub async fn insert_commitment(db: &Db, commitment: &PublicCommitment) -> Result<bool, ApiError> {
    let created_at = Utc::now().to_rfc3339();

    let result = sqlx::query(
        r#"INSERT OR IGNORE INTO commitments
           (content_id, round, client_id, dataset_root_hex, gradient_commitment_hex, created_at)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(commitment.content_id().hex)
    .bind(commitment.round as i64)
    .bind(commitment.client_id as i64)
    .bind(commitment.dataset_root.to_hex())
    .bind(commitment.gradient_commitment.to_hex())
    .bind(created_at)
    .execute(db)
    .await
    .map_err(|_| ApiError::Internal)?;

    Ok(result.rows_affected() == 1)
}

pub async fn list_commitments(db: &Db, round: u64) -> Result<Vec<CommitmentItem>, ApiError> {
    let rows = sqlx::query(
        r#"SELECT content_id, client_id, dataset_root_hex, gradient_commitment_hex
           FROM commitments
           WHERE round = ?
           ORDER BY client_id"#,
    )
    .bind(round as i64)
    .fetch_all(db)
    .await
    .map_err(|_| ApiError::Internal)?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let client_id: i64 = row.get(1);
        out.push(CommitmentItem {
            content_id: row.get(0),
            client_id: client_id as u64,
            dataset_root_hex: row.get(2),
            gradient_commitment_hex: row.get(3),
        });
    }
    Ok(out)
}

pub async fn insert_round(
    db: &Db,
    outcome: &RoundOutcome,
    next_weights: &[i64],
    next_model: &ModelCommitment,
) -> Result<(), ApiError> {
    let finalized_at = Utc::now().to_rfc3339();
    sqlx::query(
        r#"INSERT INTO rounds
           (round, finalized_at, aggregate_json, contributors_json, recovered_json, excluded_json,
            next_weights_json, next_model_commitment_hex)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(outcome.round as i64)
    .bind(finalized_at)
    .bind(to_json(&outcome.aggregate)?)
    .bind(to_json(&outcome.contributors)?)
    .bind(to_json(&outcome.recovered)?)
    .bind(to_json(&outcome.excluded)?)
    .bind(to_json(next_weights)?)
    .bind(next_model.to_hex())
    .execute(db)
    .await
    .map_err(|_| ApiError::Internal)?;

    Ok(())
}

/// The most recently finalized round and the weights it produced.
pub async fn latest_round(db: &Db) -> Result<Option<(u64, Vec<i64>)>, ApiError> {
    let row = sqlx::query(r#"SELECT round, next_weights_json FROM rounds ORDER BY round DESC LIMIT 1"#)
        .fetch_optional(db)
        .await
        .map_err(|_| ApiError::Internal)?;

    let Some(row) = row else { return Ok(None); };

    let round: i64 = row.get(0);
    let weights_json: String = row.get(1);
    let weights: Vec<i64> = serde_json::from_str(&weights_json).map_err(|_| ApiError::Internal)?;
    Ok(Some((round as u64, weights)))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, ApiError> {
    serde_json::to_string(value).map_err(|_| ApiError::Internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zk_proofs::types::{DatasetRoot, GradientCommitment};

    async fn memory_db() -> Db {
        // One connection: every in-memory connection is its own database.
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&db).await.unwrap();
        db
    }

    fn commitment(round: u64, client_id: u64) -> PublicCommitment {
        PublicCommitment {
            round,
            client_id,
            dataset_root: DatasetRoot(client_id.into()),
            gradient_commitment: GradientCommitment((client_id * 31).into()),
        }
    }

    #[tokio::test]
    async fn commitments_are_stored_once() {
        let db = memory_db().await;
        assert!(insert_commitment(&db, &commitment(1, 7)).await.unwrap());
        assert!(!insert_commitment(&db, &commitment(1, 7)).await.unwrap());
        assert!(insert_commitment(&db, &commitment(1, 3)).await.unwrap());
        assert!(insert_commitment(&db, &commitment(2, 7)).await.unwrap());

        let round_one = list_commitments(&db, 1).await.unwrap();
        assert_eq!(round_one.iter().map(|c| c.client_id).collect::<Vec<_>>(), vec![3, 7]);
        assert_eq!(round_one[1].content_id, commitment(1, 7).content_id().hex);
        assert_eq!(round_one[1].dataset_root_hex, commitment(1, 7).dataset_root.to_hex());
    }

    #[tokio::test]
    async fn latest_round_restores_weights() {
        let db = memory_db().await;
        assert!(latest_round(&db).await.unwrap().is_none());

        for (round, weights) in [(1u64, vec![1i64, 2]), (2, vec![-3, 4])] {
            let outcome = RoundOutcome {
                round,
                aggregate: vec![0, 0],
                contributors: vec![1],
                recovered: vec![],
                excluded: vec![2],
            };
            let next_model = zk_proofs::training::model_commitment(&weights);
            insert_round(&db, &outcome, &weights, &next_model).await.unwrap();
        }
        assert_eq!(latest_round(&db).await.unwrap(), Some((2, vec![-3, 4])));
    }
}
