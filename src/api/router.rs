//! Route table and bearer-token middleware.
//!
//! Everything under `/api/v1` except `/api/v1/auth/register` requires a
//! valid bearer token; `/health` is public.

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;

use super::error::ApiError;
use super::handlers;
use super::types::AppContext;

pub fn api_router(ctx: AppContext) -> Router {
    let body_limit = ctx.config().max_upload_bytes * 9;

    let protected = Router::new()
        .route("/ingest", post(handlers::ingest))
        .route("/submissions", get(handlers::list_submissions))
        .route("/patients", get(handlers::list_patients))
        .route("/patients/{pid}/history", get(handlers::patient_history))
        .route("/rerun/{id}", post(handlers::rerun))
        .route("/submissions/{id}/notes", post(handlers::save_notes))
        .route("/submissions/{id}/ai_summary", post(handlers::ai_summary))
        .route("/files/{*relpath}", get(handlers::serve_file))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), require_auth))
        .with_state(ctx.clone());

    let open = Router::new()
        .route("/auth/register", post(handlers::register))
        .with_state(ctx.clone());

    let root = Router::new()
        .route("/health", get(handlers::health))
        .with_state(ctx);

    Router::new()
        .nest("/api/v1", protected.merge(open))
        .merge(root)
        .layer(DefaultBodyLimit::max(body_limit))
}

/// Extract and verify the bearer token; 403 on any failure.
async fn require_auth(
    State(ctx): State<AppContext>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(ApiError::Forbidden)?;

    let role = ctx
        .verify_token(token)
        .map_err(|e| {
            tracing::error!(error = %e, "Token verification failed");
            ApiError::Forbidden
        })?
        .ok_or(ApiError::Forbidden)?;

    request.extensions_mut().insert(role);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::api::test_support::test_context;
    use crate::config::AppConfig;
    use crate::db;
    use crate::llm::ScriptedChatClient;

    const LAB_TSV: &str = "PATIENT_NAME: Asha Rao\n\
        TEST\tVALUE\tUNIT\tRANGE\tFLAG\n\
        Hemoglobin\t13.2\tg/dL\t13.0-17.0\t\n\
        WBC Count\t8000\t/uL\t4000-11000\t\n\
        Platelet Count\t370\t/uL\t150-450\tL";

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn register_key(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/v1/auth/register")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await["key"].as_str().unwrap().to_string()
    }

    fn get_request(uri: &str, token: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn multipart_ingest(token: &str, patient_id: &str, file_count: usize) -> HttpRequest<Body> {
        let boundary = "test-boundary-7f2a";
        let mut body = String::new();
        body.push_str(&format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"patient_id\"\r\n\r\n{patient_id}\r\n"
        ));
        for i in 0..file_count {
            body.push_str(&format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"scan_{i}.png\"\r\nContent-Type: image/png\r\n\r\nfake-png-bytes-{i}\r\n"
            ));
        }
        body.push_str(&format!("--{boundary}--\r\n"));

        HttpRequest::builder()
            .method("POST")
            .uri("/api/v1/ingest")
            .header("Authorization", format!("Bearer {token}"))
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            ScriptedChatClient::replying(&[]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let app = api_router(ctx);
        let response = app.oneshot(get_request("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "online");
    }

    #[tokio::test]
    async fn protected_routes_require_bearer_token() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            ScriptedChatClient::replying(&[]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let app = api_router(ctx);

        let response = app
            .clone()
            .oneshot(get_request("/api/v1/submissions", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(get_request("/api/v1/submissions", Some("sk-bogus")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn auth_lifecycle_register_use_revoke() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            ScriptedChatClient::replying(&[]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let app = api_router(ctx.clone());

        let key = register_key(&app).await;
        assert!(key.starts_with("sk-"));

        let before = chrono::Utc::now();
        let response = app
            .clone()
            .oneshot(get_request("/api/v1/submissions", Some(&key)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Key usage is recorded promptly.
        let record = ctx
            .with_db(|conn| db::get_api_key(conn, &key))
            .unwrap()
            .unwrap();
        let used_at = record.last_used_at.unwrap();
        assert!((used_at - before).num_seconds().abs() <= 2);

        // Revocation flips the same key to 403.
        ctx.with_db(|conn| db::set_api_key_active(conn, &key, false))
            .unwrap();
        let response = app
            .oneshot(get_request("/api/v1/submissions", Some(&key)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn ingest_persists_submission_and_returns_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            ScriptedChatClient::replying(&["LAB", LAB_TSV]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let app = api_router(ctx.clone());
        let key = register_key(&app).await;

        let response = app
            .clone()
            .oneshot(multipart_ingest(&key, "PT-42", 2))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["patient_id"], "PT-42");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["db_persisted"], true);
        assert_eq!(json["fhir_bundle"]["resourceType"], "Bundle");

        let submission_id = json["submission_id"].as_str().unwrap().to_string();

        // Listed in recents with a servable image URL.
        let response = app
            .clone()
            .oneshot(get_request("/api/v1/submissions?limit=5", Some(&key)))
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed[0]["id"], submission_id.as_str());
        let image_url = listed[0]["image_url"].as_str().unwrap().to_string();
        assert!(image_url.starts_with("/api/v1/files/"));

        let response = app
            .clone()
            .oneshot(get_request(&image_url, Some(&key)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Patient directory aggregates the new record.
        let response = app
            .oneshot(get_request("/api/v1/patients", Some(&key)))
            .await
            .unwrap();
        let patients = body_json(response).await;
        assert_eq!(patients[0]["patient_id"], "PT-42");
        assert_eq!(patients[0]["file_count"], 1);
    }

    #[tokio::test]
    async fn ingest_rejects_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            ScriptedChatClient::replying(&[]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let app = api_router(ctx);
        let key = register_key(&app).await;

        // Too-short patient id.
        let response = app
            .clone()
            .oneshot(multipart_ingest(&key, "x", 1))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // No files.
        let response = app
            .clone()
            .oneshot(multipart_ingest(&key, "PT-42", 0))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Too many files.
        let response = app
            .oneshot(multipart_ingest(&key, "PT-42", 9))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn notes_lifecycle_and_unknown_id() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            ScriptedChatClient::replying(&["LAB", LAB_TSV]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let app = api_router(ctx);
        let key = register_key(&app).await;

        let response = app
            .clone()
            .oneshot(multipart_ingest(&key, "PT-42", 1))
            .await
            .unwrap();
        let submission_id = body_json(response).await["submission_id"]
            .as_str()
            .unwrap()
            .to_string();

        let notes_request = |id: &str| {
            HttpRequest::builder()
                .method("POST")
                .uri(format!("/api/v1/submissions/{id}/notes"))
                .header("Authorization", format!("Bearer {key}"))
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"notes":"consistent with anemia"}"#))
                .unwrap()
        };

        let response = app.clone().oneshot(notes_request(&submission_id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(notes_request(&uuid::Uuid::new_v4().to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rerun_busy_returns_409() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            ScriptedChatClient::replying(&["LAB", LAB_TSV, "LAB", LAB_TSV]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let app = api_router(ctx.clone());
        let key = register_key(&app).await;

        let response = app
            .clone()
            .oneshot(multipart_ingest(&key, "PT-42", 1))
            .await
            .unwrap();
        let json = body_json(response).await;
        let id: uuid::Uuid = json["submission_id"].as_str().unwrap().parse().unwrap();
        let created_before = ctx
            .with_db(|conn| db::get_submission(conn, &id))
            .unwrap()
            .unwrap()
            .created_at;

        // Simulate a concurrent rerun holding the advisory lock.
        let guard = ctx.try_lock_rerun(id).unwrap();
        let rerun_request = || {
            HttpRequest::builder()
                .method("POST")
                .uri(format!("/api/v1/rerun/{id}"))
                .header("Authorization", format!("Bearer {key}"))
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(rerun_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        drop(guard);

        // With the lock released the rerun succeeds and bumps created_at.
        let response = app.oneshot(rerun_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created_after = ctx
            .with_db(|conn| db::get_submission(conn, &id))
            .unwrap()
            .unwrap()
            .created_at;
        assert!(created_after > created_before);
    }

    #[tokio::test]
    async fn rerun_unknown_id_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            ScriptedChatClient::replying(&[]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let app = api_router(ctx);
        let key = register_key(&app).await;

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri(format!("/api/v1/rerun/{}", uuid::Uuid::new_v4()))
                    .header("Authorization", format!("Bearer {key}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ai_summary_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let summary_md = "## Findings\n- Hb normal\n\n## Correlations\n\n## Recommendations";
        let ctx = test_context(
            ScriptedChatClient::replying(&["LAB", LAB_TSV, summary_md]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let app = api_router(ctx.clone());
        let key = register_key(&app).await;

        let response = app
            .clone()
            .oneshot(multipart_ingest(&key, "PT-42", 1))
            .await
            .unwrap();
        let id = body_json(response).await["submission_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri(format!("/api/v1/submissions/{id}/ai_summary"))
                    .header("Authorization", format!("Bearer {key}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["summary"].as_str().unwrap().contains("## Findings"));

        let record = ctx
            .with_db(|conn| db::get_submission(conn, &id.parse().unwrap()))
            .unwrap()
            .unwrap();
        assert!(record.ai_summary.contains("## Findings"));
    }

    #[tokio::test]
    async fn file_serving_blocks_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            ScriptedChatClient::replying(&[]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let app = api_router(ctx);
        let key = register_key(&app).await;

        let response = app
            .oneshot(get_request(
                "/api/v1/files/%2E%2E/%2E%2E/etc/passwd",
                Some(&key),
            ))
            .await
            .unwrap();
        assert!(
            response.status() == StatusCode::NOT_FOUND
                || response.status() == StatusCode::BAD_REQUEST,
            "traversal must not be served, got {}",
            response.status()
        );
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            ScriptedChatClient::replying(&[]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let app = api_router(ctx);
        let response = app
            .oneshot(get_request("/api/v1/nope", Some("sk-x")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    /// Chat double that never answers, for deadline tests.
    struct StallingChat;

    #[async_trait::async_trait]
    impl crate::llm::ChatClient for StallingChat {
        async fn chat(
            &self,
            _messages: &[crate::llm::ChatMessage],
            _params: &crate::llm::ChatParams,
        ) -> Result<crate::llm::ChatOutcome, crate::llm::LlmError> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Err(crate::llm::LlmError::Timeout)
        }
    }

    #[tokio::test]
    async fn deadline_cancellation_persists_no_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::for_tests();
        config.request_deadline_ms = 50;
        let ctx = test_context(StallingChat, config, dir.path());
        let app = api_router(ctx);
        let key = register_key(&app).await;

        let response = app
            .clone()
            .oneshot(multipart_ingest(&key, "PT-42", 1))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        // The cancelled pipeline never reached the insert: no row exists.
        let response = app
            .oneshot(get_request("/api/v1/submissions", Some(&key)))
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn degraded_ingest_still_returns_200() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = "cannot read";
        let ctx = test_context(
            ScriptedChatClient::replying(&["LAB", garbage, garbage, garbage]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let app = api_router(ctx);
        let key = register_key(&app).await;

        let response = app
            .oneshot(multipart_ingest(&key, "PT-42", 1))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "failed");
        assert_eq!(json["fhir_bundle"]["resourceType"], "Bundle");
    }
}
