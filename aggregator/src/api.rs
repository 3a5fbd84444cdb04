use crate::db;
use crate::errors::ApiError;
use crate::models::*;
use crate::state::{AppState, Coordinator};
use axum::{
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use zk_proofs::aggregator::PublicCommitment;
use zk_proofs::groth16::to_b64;
use zk_proofs::training::model_commitment;
use zk_proofs::types::RoundSubmission;
use zk_proofs::Stage;

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/api/v1/rounds/:round/seal", post(seal_round))
        .route("/api/v1/rounds/:round/recovery", post(recover_mask))
        .route("/api/v1/rounds/:round/finalize", post(finalize_round))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/round", get(get_round))
        .route("/api/v1/zk/vk", get(get_vk))
        .route("/api/v1/zk/pk/:stage", get(get_pk))
        .route("/api/v1/rounds/:round/submissions", post(submit))
        .route("/api/v1/rounds/:round/masks", post(reveal_mask))
        .route("/api/v1/rounds/:round/commitments", get(list_commitments))
        .merge(protected_routes)
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(provided_key) = headers.get("X-API-KEY") {
        if provided_key == state.settings.api_key.as_str() {
            return Ok(next.run(request).await);
        }
    }

    tracing::warn!(path = %request.uri().path(), "unauthorized access attempt");
    Err(StatusCode::UNAUTHORIZED)
}

/// Only the open round accepts writes.
fn open_round(coordinator: &Coordinator, round: u64) -> Result<(), ApiError> {
    let open = coordinator.round.info().number;
    if round != open {
        return Err(ApiError::NotFound(format!("round {round} is not open (current round is {open})")));
    }
    Ok(())
}

async fn get_round(State(state): State<AppState>) -> Json<RoundResponse> {
    let status = state.coordinator.lock().await.round.status();
    Json(RoundResponse { status, params: state.settings.params })
}

async fn get_vk(State(state): State<AppState>) -> Result<Json<ZkVkResponse>, ApiError> {
    let keys = state.ensure_keys().await?;
    let vks = keys.verifying();

    Ok(Json(ZkVkResponse {
        curve: "bn254".to_string(),
        proof_system: "groth16".to_string(),
        balance_vk_b64: to_b64(&vks.balance)?,
        training_vk_b64: to_b64(&vks.training)?,
        aggregation_vk_b64: to_b64(&vks.aggregation)?,
    }))
}

async fn get_pk(State(state): State<AppState>, Path(stage): Path<Stage>) -> Result<Json<ZkPkResponse>, ApiError> {
    let keys = state.ensure_keys().await?;
    let pk_b64 = to_b64(keys.proving.get(stage))?;
    Ok(Json(ZkPkResponse { stage, pk_b64 }))
}

async fn submit(
    State(state): State<AppState>,
    Path(round): Path<u64>,
    Json(submission): Json<RoundSubmission>,
) -> Result<Json<SubmitResponse>, ApiError> {
    if submission.round != round {
        return Err(ApiError::BadRequest(format!(
            "submission is for round {}, posted to round {round}",
            submission.round
        )));
    }

    let info = {
        let coordinator = state.coordinator.lock().await;
        open_round(&coordinator, round)?;
        *coordinator.round.info()
    };

    // Pairing checks are CPU-bound; the round lock is not held meanwhile.
    let keys = state.ensure_keys().await?;
    let verifier = keys.verifier.clone();
    let client_id = submission.client_id;
    let verified = tokio::task::spawn_blocking(move || verifier.verify(&info, &submission))
        .await
        .map_err(|_| ApiError::Internal)??;

    let commitment = PublicCommitment {
        round,
        client_id,
        dataset_root: verified.dataset_root,
        gradient_commitment: verified.gradient_commitment,
    };

    // Admission re-checks the round number, so a round that closed meanwhile rejects.
    // The round only changes once the commitment is stored.
    let mut coordinator = state.coordinator.lock().await;
    coordinator.round.admit(&verified)?;
    if !db::insert_commitment(&state.db, &commitment).await? {
        tracing::warn!(client_id, round, "commitment already persisted");
    }
    coordinator.round.accept(verified)?;

    Ok(Json(SubmitResponse {
        accepted: true,
        client_id,
        round,
        commitment_id: commitment.content_id().hex,
    }))
}

async fn reveal_mask(
    State(state): State<AppState>,
    Path(round): Path<u64>,
    Json(req): Json<MaskRequest>,
) -> Result<Json<MaskResponse>, ApiError> {
    let mut coordinator = state.coordinator.lock().await;
    open_round(&coordinator, round)?;
    coordinator.round.reveal_mask(req.client_id, req.mask)?;
    Ok(Json(MaskResponse { client_id: req.client_id, accepted: true }))
}

async fn recover_mask(
    State(state): State<AppState>,
    Path(round): Path<u64>,
    Json(req): Json<MaskRequest>,
) -> Result<Json<MaskResponse>, ApiError> {
    let mut coordinator = state.coordinator.lock().await;
    open_round(&coordinator, round)?;
    coordinator.round.recover_mask(req.client_id, req.mask)?;
    Ok(Json(MaskResponse { client_id: req.client_id, accepted: true }))
}

async fn seal_round(State(state): State<AppState>, Path(round): Path<u64>) -> Result<Json<RoundResponse>, ApiError> {
    let mut coordinator = state.coordinator.lock().await;
    open_round(&coordinator, round)?;
    coordinator.round.seal()?;
    Ok(Json(RoundResponse { status: coordinator.round.status(), params: state.settings.params }))
}

async fn finalize_round(
    State(state): State<AppState>,
    Path(round): Path<u64>,
) -> Result<Json<FinalizeResponse>, ApiError> {
    let mut coordinator = state.coordinator.lock().await;
    open_round(&coordinator, round)?;

    // Nothing changes in memory until the round row is stored, so a failed write can be retried.
    let outcome = coordinator.round.outcome()?;
    let next_weights = outcome.advance(&coordinator.weights, state.settings.params.learning_rate)?;
    let next_model = model_commitment(&next_weights);

    db::insert_round(&state.db, &outcome, &next_weights, &next_model).await?;

    coordinator.round.finalize()?;
    let next = coordinator.round.next(next_model)?;
    let next_round = next.info().number;
    coordinator.round = next;
    coordinator.weights = next_weights;

    tracing::info!(round, next_round, model = %next_model.to_hex(), "global model advanced");

    Ok(Json(FinalizeResponse { outcome, next_round, next_model_commitment: next_model }))
}

async fn list_commitments(
    State(state): State<AppState>,
    Path(round): Path<u64>,
) -> Result<Json<CommitmentListResponse>, ApiError> {
    let commitments = db::list_commitments(&state.db, round).await?;
    Ok(Json(CommitmentListResponse { round, commitments }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use ark_bn254::Fr;
    use axum::body::Body;
    use axum::http::Request;
    use sqlx::sqlite::SqlitePoolOptions;
    use tower::ServiceExt;
    use zk_proofs::masking::MaskKey;

    const ADMIN: Option<&str> = Some("dev-secret-key");

    async fn app() -> (Router, AppState) {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::init_schema(&db).await.unwrap();
        let settings = Settings::from_lookup(|_| None).unwrap();
        let state = AppState::new(db, settings).await.unwrap();
        (router(state.clone()), state)
    }

    fn post(uri: &str, api_key: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(key) = api_key {
            builder = builder.header("X-API-KEY", key);
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_and_round_are_public() {
        let (app, _) = app().await;
        assert_eq!(app.clone().oneshot(get("/health")).await.unwrap().status(), StatusCode::OK);

        let response = app.oneshot(get("/api/v1/round")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["round"], 1);
        assert_eq!(body["phase"], "collecting");
        assert_eq!(body["params"]["shape"]["dim"], 4);
    }

    #[tokio::test]
    async fn admin_routes_need_the_api_key() {
        let (app, _) = app().await;

        let response = app.clone().oneshot(post("/api/v1/rounds/1/seal", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = app.clone().oneshot(post("/api/v1/rounds/1/seal", Some("wrong"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.clone().oneshot(post("/api/v1/rounds/1/seal", ADMIN, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["phase"], "unmasking");

        let response = app.oneshot(post("/api/v1/rounds/1/seal", ADMIN, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn only_the_open_round_takes_writes() {
        let (app, _) = app().await;
        let response = app.oneshot(post("/api/v1/rounds/2/seal", ADMIN, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn masks_for_unknown_clients_are_not_found() {
        let (app, _) = app().await;
        app.clone().oneshot(post("/api/v1/rounds/1/seal", ADMIN, None)).await.unwrap();

        let body = serde_json::to_value(MaskRequest { client_id: 9, mask: MaskKey(Fr::from(5u64)).mask(1, 4) }).unwrap();
        let response = app.clone().oneshot(post("/api/v1/rounds/1/masks", None, Some(body.clone()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(json(response).await["error"].as_str().unwrap().contains('9'));

        let response = app.oneshot(post("/api/v1/rounds/1/recovery", ADMIN, Some(body))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn failed_round_write_leaves_the_round_retryable() {
        let (app, state) = app().await;
        app.clone().oneshot(post("/api/v1/rounds/1/seal", ADMIN, None)).await.unwrap();

        sqlx::query("DROP TABLE rounds").execute(&state.db).await.unwrap();
        let response = app.clone().oneshot(post("/api/v1/rounds/1/finalize", ADMIN, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = json(app.clone().oneshot(get("/api/v1/round")).await.unwrap()).await;
        assert_eq!(body["round"], 1);
        assert_eq!(body["phase"], "unmasking");

        db::init_schema(&state.db).await.unwrap();
        let response = app.oneshot(post("/api/v1/rounds/1/finalize", ADMIN, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["next_round"], 2);
        assert_eq!(db::latest_round(&state.db).await.unwrap(), Some((1, vec![0; 4])));
    }

    #[tokio::test]
    async fn finalizing_an_empty_round_opens_the_next() {
        let (app, state) = app().await;
        app.clone().oneshot(post("/api/v1/rounds/1/seal", ADMIN, None)).await.unwrap();

        let response = app.clone().oneshot(post("/api/v1/rounds/1/finalize", ADMIN, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["next_round"], 2);
        assert_eq!(body["outcome"]["contributors"], serde_json::json!([]));

        assert_eq!(db::latest_round(&state.db).await.unwrap(), Some((1, vec![0; 4])));
        let body = json(app.clone().oneshot(get("/api/v1/round")).await.unwrap()).await;
        assert_eq!(body["round"], 2);
        assert_eq!(body["phase"], "collecting");

        let body = json(app.oneshot(get("/api/v1/rounds/1/commitments")).await.unwrap()).await;
        assert_eq!(body["commitments"], serde_json::json!([]));
    }
}
