//! Stored procedure HTTP handlers.
//!
//! This module implements the procedure call endpoints:
//! - GET|POST /api/{service}/_proc/{procedure} - Internal route
//! - GET|POST /public/{service}/_proc/{procedure} - Public route, endpoint keys
//!
//! Both run behind the authorization middleware and share one execution path.
//! They differ only in how an empty result is reported.

use axum::{
    Extension, Json,
    body::Bytes,
    extract::{RawQuery, State},
};
use serde_json::Value;

use crate::{
    error::AppError,
    services::{
        authorization::AuthContext,
        host_resolver::resolve_target,
        pool_registry::ConnectionSpec,
        procedure_executor::{ProcedureCall, merge_params},
    },
    state::AppState,
};

/// Call a procedure on the internal route.
///
/// # Parameters
///
/// Query string and JSON object body are merged, body values winning:
///
/// ```text
/// POST /api/salesdemo_staging/_proc/uspGetCustomers?region=EMEA
/// x-mirabel-developer-key: mk_4f1c...e2.9a7b...c0
///
/// { "active": true }
/// ```
///
/// # Response
///
/// - **Success (200 OK)**: JSON array of rows, `[]` when the procedure returns nothing
/// - **Error (400)**: Invalid procedure/parameter name or body
/// - **Error (500)**: Target database unreachable or the call failed
pub async fn run_internal(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<Vec<Value>>, AppError> {
    let rows = execute(&state, &auth, query.as_deref(), &body).await?;
    Ok(Json(rows))
}

/// Call a procedure on the public route.
///
/// Same as [`run_internal`] except that an empty result is an error
/// (500 "No results returned").
pub async fn run_public(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<Json<Vec<Value>>, AppError> {
    let rows = execute(&state, &auth, query.as_deref(), &body).await?;
    if rows.is_empty() {
        return Err(AppError::upstream("No results returned"));
    }
    Ok(Json(rows))
}

async fn execute(
    state: &AppState,
    auth: &AuthContext,
    query: Option<&str>,
    body: &[u8],
) -> Result<Vec<Value>, AppError> {
    let params = merge_params(query, body)?;

    let target = resolve_target(state.store.as_ref(), &auth.service).await?;
    let host = state.host_resolver.effective_host(&target).await?;
    let password = state.vault.decrypt(&target.password_encrypted)?;

    let spec = ConnectionSpec {
        host: host.host().to_string(),
        port: target.port,
        username: target.username,
        password,
        database: target.database,
    };
    let call = ProcedureCall {
        procedure: auth.procedure.clone(),
        params,
    };

    tracing::debug!(
        correlation_id = %auth.correlation_id,
        strategy = auth.strategy.as_str(),
        application = ?auth.application.as_ref().map(|app| &app.name),
        service = %auth.service.name,
        procedure = %call.procedure,
        host = %spec.host,
        "Executing procedure"
    );

    state.runner.execute(&spec, &call).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::json;
    use tokio::{net::TcpListener, sync::mpsc::UnboundedReceiver};
    use tower::ServiceExt;

    use crate::{
        handlers::router,
        middleware::auth::API_KEY_HEADER,
        models::{role::Actions, usage::NewApiUsage},
        services::authorization::StrategyPolicy,
        test_support::{ChannelUsageSink, FakeRunner, MemoryStore, TARGET_PASSWORD, TestKeys, test_state},
    };

    const INTERNAL_PATH: &str = "/api/salesdemo_staging/_proc/uspGetCustomers";

    struct Harness {
        app: Router,
        store: Arc<MemoryStore>,
        runner: Arc<FakeRunner>,
        usage: UnboundedReceiver<NewApiUsage>,
        keys: TestKeys,
        /// Port of the listener answering host probes on 127.0.0.1.
        port: u16,
        _listener: TcpListener,
    }

    impl Harness {
        async fn new(actions: Actions, runner: FakeRunner) -> Self {
            let store = Arc::new(MemoryStore::default());
            let keys = TestKeys::seed(&store, "salesdemo_staging", "uspGetCustomers", actions).await;

            // Something has to answer the host probe
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            store.set_service_target(keys.service_id, "127.0.0.1", port, None);

            let runner = Arc::new(runner);
            let (sink, usage) = ChannelUsageSink::new();
            let policy = StrategyPolicy::new(vec!["salesdemo_staging".into()], vec![]);
            let app = router(test_state(store.clone(), runner.clone(), sink, policy));

            Self {
                app,
                store,
                runner,
                usage,
                keys,
                port,
                _listener: listener,
            }
        }

        async fn send(&self, method: &str, uri: &str, key: Option<&str>, body: Body) -> (StatusCode, serde_json::Value) {
            let mut request = Request::builder().method(method).uri(uri);
            if let Some(key) = key {
                request = request.header(API_KEY_HEADER, key);
            }
            let response = self
                .app
                .clone()
                .oneshot(request.body(body).unwrap())
                .await
                .unwrap();

            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (status, serde_json::from_slice(&bytes).unwrap())
        }

        async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
            let key = self.keys.full_key.clone();
            self.send("GET", uri, Some(&key), Body::empty()).await
        }
    }

    fn get_allowed() -> Actions {
        Actions {
            get: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn authorized_call_returns_rows_and_records_usage() {
        let rows = vec![json!({ "id": 1, "name": "Acme" })];
        let mut h = Harness::new(get_allowed(), FakeRunner::returning(rows.clone())).await;

        let (status, body) = h.get(&format!("{INTERNAL_PATH}?region=EMEA&limit=25")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(rows));

        let calls = h.runner.calls();
        assert_eq!(calls.len(), 1);
        let (spec, call) = &calls[0];
        assert_eq!(spec.host, "127.0.0.1");
        assert_eq!(spec.password, TARGET_PASSWORD);
        assert_eq!(spec.database, "salesdemo_staging_db");
        assert_eq!(call.procedure, "uspGetCustomers");
        assert_eq!(call.params["region"], "EMEA");
        assert_eq!(call.params["limit"], "25");

        let usage = h.usage.recv().await.unwrap();
        assert_eq!(usage.status_code, 200);
        assert_eq!(usage.endpoint, INTERNAL_PATH);
        assert_eq!(usage.component, "uspGetCustomers");
        assert_eq!(usage.application_id, Some(h.keys.application_id));
        assert_eq!(usage.service_id, Some(h.keys.service_id));
        assert_eq!(usage.role_id, Some(h.keys.role_id));
    }

    #[tokio::test]
    async fn denied_method_is_forbidden_with_details() {
        let mut h = Harness::new(Actions::default(), FakeRunner::returning(vec![])).await;

        let (status, body) = h.get(INTERNAL_PATH).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(
            body,
            json!({
                "message": "Insufficient permissions",
                "details": {
                    "procedure": "uspGetCustomers",
                    "service": "salesdemo_staging",
                    "method": "GET"
                }
            })
        );
        assert!(h.runner.calls().is_empty());
        assert_eq!(h.usage.recv().await.unwrap().status_code, 403);
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let mut h = Harness::new(get_allowed(), FakeRunner::returning(vec![])).await;

        let (status, body) = h.get("/api/doesnotexist/_proc/uspGetCustomers").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body,
            json!({
                "message": "Service not found or inactive",
                "details": { "serviceName": "doesnotexist" }
            })
        );
        assert_eq!(h.usage.recv().await.unwrap().status_code, 404);
    }

    #[tokio::test]
    async fn inactive_application_is_rejected_before_execution() {
        let mut h = Harness::new(get_allowed(), FakeRunner::returning(vec![json!({})])).await;
        h.store.set_application_active(h.keys.application_id, false);

        let (status, body) = h.get(INTERNAL_PATH).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({ "message": "Invalid or inactive API key" }));
        assert!(h.runner.calls().is_empty());

        let usage = h.usage.recv().await.unwrap();
        assert_eq!(usage.status_code, 401);
        assert_eq!(usage.component, "api_uspGetCustomers");
        assert_eq!(usage.application_id, None);
    }

    #[tokio::test]
    async fn missing_key_is_unauthenticated() {
        let mut h = Harness::new(get_allowed(), FakeRunner::returning(vec![])).await;

        let (status, body) = h.send("GET", INTERNAL_PATH, None, Body::empty()).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({ "message": "API key required" }));
        assert_eq!(h.usage.recv().await.unwrap().status_code, 401);
    }

    #[tokio::test]
    async fn post_body_overrides_query_parameters() {
        let actions = Actions {
            get: true,
            post: true,
            ..Default::default()
        };
        let h = Harness::new(actions, FakeRunner::returning(vec![json!({ "ok": true })])).await;
        let key = h.keys.full_key.clone();

        let (status, _) = h
            .send(
                "POST",
                &format!("{INTERNAL_PATH}?region=EMEA&page=2"),
                Some(&key),
                Body::from(r#"{"region":"APAC"}"#),
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        let (_, call) = &h.runner.calls()[0];
        assert_eq!(call.params["region"], "APAC");
        assert_eq!(call.params["page"], "2");
    }

    #[tokio::test]
    async fn non_object_body_is_malformed() {
        let actions = Actions {
            post: true,
            ..Default::default()
        };
        let mut h = Harness::new(actions, FakeRunner::returning(vec![])).await;
        let key = h.keys.full_key.clone();

        let (status, _) = h
            .send("POST", INTERNAL_PATH, Some(&key), Body::from("[1, 2]"))
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(h.runner.calls().is_empty());
        assert_eq!(h.usage.recv().await.unwrap().status_code, 400);
    }

    #[tokio::test]
    async fn empty_result_differs_between_routes() {
        let mut h = Harness::new(get_allowed(), FakeRunner::returning(vec![])).await;

        let (status, body) = h.get(INTERNAL_PATH).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let endpoint_key = h.keys.endpoint_key.clone();
        let (status, body) = h
            .send(
                "GET",
                "/public/salesdemo_staging/_proc/uspGetCustomers",
                Some(&endpoint_key),
                Body::empty(),
            )
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "message": "No results returned" }));

        assert_eq!(h.usage.recv().await.unwrap().status_code, 200);
        assert_eq!(h.usage.recv().await.unwrap().status_code, 500);
    }

    #[tokio::test]
    async fn public_route_rejects_application_keys() {
        let h = Harness::new(get_allowed(), FakeRunner::returning(vec![json!({})])).await;

        let (status, _) = h.get("/public/salesdemo_staging/_proc/uspGetCustomers").await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn unreachable_primary_fails_over() {
        let h = Harness::new(get_allowed(), FakeRunner::returning(vec![json!({ "id": 7 })])).await;
        // Only 127.0.0.1 is bound, so 127.0.0.2 refuses
        h.store
            .set_service_target(h.keys.service_id, "127.0.0.2", h.port, Some("127.0.0.1"));

        let (status, _) = h.get(INTERNAL_PATH).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.runner.calls()[0].0.host, "127.0.0.1");
    }

    #[tokio::test]
    async fn unreachable_hosts_are_reported() {
        let h = Harness::new(get_allowed(), FakeRunner::returning(vec![])).await;
        h.store.set_service_target(h.keys.service_id, "127.0.0.2", h.port, None);

        let (status, body) = h.get(INTERNAL_PATH).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body["message"],
            "Primary host unreachable and no failover host configured"
        );
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_keeps_driver_code() {
        let h = Harness::new(
            get_allowed(),
            FakeRunner::failing("function uspgetcustomers() does not exist", "42883"),
        )
        .await;

        let (status, body) = h.get(INTERNAL_PATH).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["details"]["code"], "42883");
    }

    #[tokio::test]
    async fn health_reports_connected_store() {
        let h = Harness::new(get_allowed(), FakeRunner::returning(vec![])).await;

        let (status, body) = h.send("GET", "/health", None, Body::empty()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["metadata_store"], "connected");
    }
}
