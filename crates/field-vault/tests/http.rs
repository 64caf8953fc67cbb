//! End-to-end HTTP tests against the full router.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use field_vault::audit::MemoryAuditSink;
use field_vault::derivation::KeyDerivationService;
use field_vault::pii::default_pii_fields;
use field_vault::secret::StaticSecretSource;
use field_vault::server::{router, state::AppState};
use field_vault::session::{SessionPolicy, SessionRegistry, SystemClock};
use field_vault::EncryptionFacade;
use serde_json::{json, Value};

fn context() -> HeaderName {
    HeaderName::from_static("x-context-id")
}

fn server(limit: u32) -> TestServer {
    let deriver = KeyDerivationService::new(
        Arc::new(StaticSecretSource::new(vec![0x77; 32])),
        Duration::from_secs(2),
        1,
    );
    let registry = SessionRegistry::new(
        deriver,
        SessionPolicy {
            operation_limit: limit,
            ..SessionPolicy::default()
        },
        Arc::new(SystemClock),
        Arc::new(MemoryAuditSink::new()),
    );
    let state = AppState::new(
        EncryptionFacade::new(registry),
        default_pii_fields(),
        "X-Context-Id".into(),
        16,
    );
    TestServer::new(router::build(state)).unwrap()
}

#[tokio::test]
async fn health_reports_ready() {
    let server = server(10);
    let resp = server.get("/health").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["derivation_version"], 1);
}

#[tokio::test]
async fn customer_record_lifecycle() {
    let server = server(100);
    let customer = json!({
        "id": 42,
        "fiscal_code": "RSSMRA80A01H501U",
        "first_name": "Mario",
        "last_name": "Rossi",
        "email": "mario.rossi@example.com",
        "phone": "+39 06 1234567",
        "city": "Roma"
    });

    let sealed: Value = server
        .post("/records/encrypt")
        .add_header(context(), HeaderValue::from_static("import-7"))
        .json(&json!({"tenant_id": "acme", "record": customer}))
        .await
        .json();
    assert_eq!(sealed["fields_transformed"], 5);
    assert_eq!(sealed["record"]["city"], "Roma");
    assert!(!sealed["record"].to_string().contains("Mario"));

    let foreign = server
        .post("/records/decrypt")
        .json(&json!({"tenant_id": "globex", "record": sealed["record"]}))
        .await;
    foreign.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(foreign.json::<Value>()["code"], "decryption_failed");

    let opened: Value = server
        .post("/records/decrypt")
        .add_header(context(), HeaderValue::from_static("import-7"))
        .json(&json!({"tenant_id": "acme", "record": sealed["record"]}))
        .await
        .json();
    assert_eq!(opened["record"], customer);

    let info: Value = server
        .get("/sessions/acme")
        .add_header(context(), HeaderValue::from_static("import-7"))
        .await
        .json();
    assert_eq!(info["operation_count"], 10);
    assert_eq!(info["state"], "active");

    server
        .delete("/contexts/import-7")
        .await
        .assert_status(StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn rotation_keeps_old_tokens_readable() {
    let server = server(100);
    let old: Value = server
        .post("/fields/encrypt")
        .json(&json!({"tenant_id": "acme", "plaintext": "before rotation"}))
        .await
        .json();

    server
        .post("/keys/rotate")
        .json(&json!({"derivation_version": 2}))
        .await
        .assert_status_ok();

    let new: Value = server
        .post("/fields/encrypt")
        .json(&json!({"tenant_id": "acme", "plaintext": "after rotation"}))
        .await
        .json();
    assert_eq!(new["derivation_version"], 2);

    let opened: Value = server
        .post("/fields/decrypt")
        .json(&json!({"tenant_id": "acme", "token": old["token"], "derivation_version": 1}))
        .await
        .json();
    assert_eq!(opened["plaintext"], "before rotation");

    server
        .post("/fields/decrypt")
        .json(&json!({"tenant_id": "acme", "token": old["token"]}))
        .await
        .assert_status(StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn rate_limited_batch_is_refused_whole() {
    let server = server(3);
    let resp = server
        .post("/fields/encrypt-batch")
        .add_header(context(), HeaderValue::from_static("batch"))
        .json(&json!({
            "tenant_id": "acme",
            "fields": {"a": "1", "b": "2", "c": "3", "d": "4"}
        }))
        .await;
    resp.assert_status(StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("retry-after"));

    let info: Value = server
        .get("/sessions/acme")
        .add_header(context(), HeaderValue::from_static("batch"))
        .await
        .json();
    assert_eq!(info["operation_count"], 0);

    server
        .post("/fields/encrypt-batch")
        .add_header(context(), HeaderValue::from_static("batch"))
        .json(&json!({"tenant_id": "acme", "fields": {"a": "1", "b": "2", "c": "3"}}))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn unknown_route_is_json_404() {
    let server = server(10);
    let resp = server.get("/nope").expect_failure().await;
    resp.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(resp.json::<Value>()["code"], "not_found");
}
