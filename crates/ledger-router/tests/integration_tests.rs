//! Integration tests for the Router service

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use ledger_engine::{Ledger, LedgerConfig, ManualClock};
use ledger_router::{
    config::{RouterConfig, StorageConfig},
    handlers::{create_router, AppState},
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt; // for oneshot

/// Helper to create the test application over a fresh in-memory ledger
fn create_test_app() -> Router {
    let ledger = Arc::new(Ledger::in_memory(LedgerConfig::lenient()));
    create_router(AppState::new(ledger, 50))
}

/// Send one request and decode the envelope
async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn create_organism(app: &Router) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/organisms",
        Some(json!({"name": "Maison Verre", "organismType": "brand", "tags": ["luxury"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["data"]["id"].as_str().unwrap().to_string()
}

fn create_change(lens: &str, value: Value, weight: f64) -> Value {
    json!({"lens": lens, "op": "create", "value": value, "weight": weight})
}

async fn propose(app: &Router, organism_id: &str, changes: Vec<Value>) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/mutations",
        Some(json!({"organismId": organism_id, "actor": "alice", "changes": changes})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["status"], "proposed");
    body["data"]["id"].as_str().unwrap().to_string()
}

async fn register_exclusion(app: &Router, severity: &str) {
    let (status, body) = send(
        app,
        "POST",
        "/constraints",
        Some(json!({
            "name": "luxury never discounts heavily",
            "severity": severity,
            "scope": "global",
            "rule": {
                "op": "exclusion",
                "left": {"lens": "brand.positioning", "values": ["luxury"]},
                "right": {"lens": "brand.discounting.strategy", "values": ["discount-heavy"]}
            }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert!(body["data"]["id"].as_str().unwrap().starts_with("cst_"));
}

/// Commits the exclusion scenario with a covering tradeoff and returns the conflict
async fn committed_exclusion(app: &Router, organism_id: &str) -> Value {
    register_exclusion(app, "soft").await;
    let mutation_id = propose(
        app,
        organism_id,
        vec![
            create_change("brand.positioning", json!("luxury"), 0.83),
            create_change("brand.discounting.strategy", json!("discount-heavy"), 0.6),
        ],
    )
    .await;

    let tradeoff = json!({
        "lenses": ["brand.positioning"],
        "sacrificed": "price accessibility",
        "gained": "premium perception"
    });
    let (status, body) = send(
        app,
        "POST",
        &format!("/mutations/{}/commit", mutation_id),
        Some(json!({"tradeoffs": [tradeoff]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (_, body) = send(
        app,
        "GET",
        &format!("/conflicts?organismId={}&status=active", organism_id),
        None,
    )
    .await;
    assert_eq!(body["data"]["total"], 1);
    body["data"]["items"][0].clone()
}

#[tokio::test]
async fn test_health_check_endpoint() {
    let app = create_test_app();

    let (status, body) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["organisms"], 0);
    assert!(body["meta"]["requestId"].as_str().unwrap().starts_with("req_"));
    assert!(body["meta"]["timestamp"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_organism_roundtrip() {
    let app = create_test_app();
    let organism_id = create_organism(&app).await;
    assert!(organism_id.starts_with("org_"));

    let (status, body) = send(&app, "GET", &format!("/organisms/{}", organism_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "Maison Verre");
    assert_eq!(body["data"]["organismType"], "brand");

    let (_, body) = send(&app, "GET", "/organisms", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_organism_is_not_found() {
    let app = create_test_app();
    let missing = ledger_domain::OrganismId::new();

    let (status, body) = send(&app, "GET", &format!("/organisms/{}", missing), None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert_eq!(body["error"]["details"]["kind"], "organism");
    assert!(body.get("data").is_none());
}

#[tokio::test]
async fn test_malformed_requests_use_error_envelope() {
    let app = create_test_app();

    let (status, body) = send(&app, "GET", "/organisms/org_nothex", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_OPERATION");

    let (status, body) = send(&app, "POST", "/organisms", Some(json!({"name": "no type"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);

    let (status, body) = send(&app, "POST", "/organisms", Some(json!({"name": " ", "organismType": "brand"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_OPERATION");
}

#[tokio::test]
async fn test_mutation_lifecycle() {
    let app = create_test_app();
    let organism_id = create_organism(&app).await;
    let mutation_id = propose(&app, &organism_id, vec![create_change("brand.tone", json!("warm"), 0.4)]).await;

    let (status, body) = send(&app, "POST", &format!("/mutations/{}/validate", mutation_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["hardFailures"], 0);
    assert_eq!(body["data"]["softFailures"], 0);

    let (status, body) = send(&app, "POST", &format!("/mutations/{}/commit", mutation_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "committed");

    let (_, body) = send(&app, "GET", &format!("/claims?organismId={}", organism_id), None).await;
    let claims = body["data"].as_array().unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0]["value"], "warm");
    assert_eq!(claims[0]["version"], 1);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/mutations/{}/rollback", mutation_id),
        Some(json!({"reason": "wrong tone", "actor": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "rolled_back");

    let (_, body) = send(&app, "GET", &format!("/claims?organismId={}", organism_id), None).await;
    assert!(body["data"].as_array().unwrap().is_empty());

    let (_, body) = send(
        &app,
        "GET",
        &format!("/claims?organismId={}&includeDeleted=true", organism_id),
        None,
    )
    .await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = send(&app, "GET", &format!("/mutations/{}", mutation_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "rolled_back");
}

#[tokio::test]
async fn test_reject_then_reject_again() {
    let app = create_test_app();
    let organism_id = create_organism(&app).await;
    let mutation_id = propose(&app, &organism_id, vec![create_change("brand.tone", json!("warm"), 0.4)]).await;
    let uri = format!("/mutations/{}/reject", mutation_id);

    let (status, body) = send(&app, "POST", &uri, Some(json!({"reason": "off brand"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "rejected");

    let (status, body) = send(&app, "POST", &uri, Some(json!({"reason": "again"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INVALID_TRANSITION");
    assert_eq!(body["error"]["details"]["from"], "rejected");
}

#[tokio::test]
async fn test_soft_failure_requires_tradeoff() {
    let app = create_test_app();
    let organism_id = create_organism(&app).await;
    register_exclusion(&app, "soft").await;
    let mutation_id = propose(
        &app,
        &organism_id,
        vec![
            create_change("brand.positioning", json!("luxury"), 0.83),
            create_change("brand.discounting.strategy", json!("discount-heavy"), 0.6),
        ],
    )
    .await;

    let (status, body) = send(&app, "POST", &format!("/mutations/{}/commit", mutation_id), None).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "TRADEOFF_REQUIRED");
    assert!(!body["error"]["details"]["lenses"].as_array().unwrap().is_empty());

    let (_, body) = send(&app, "GET", &format!("/claims?organismId={}", organism_id), None).await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_hard_failure_blocks_commit() {
    let app = create_test_app();
    let organism_id = create_organism(&app).await;
    register_exclusion(&app, "hard").await;
    let mutation_id = propose(
        &app,
        &organism_id,
        vec![
            create_change("brand.positioning", json!("luxury"), 0.83),
            create_change("brand.discounting.strategy", json!("discount-heavy"), 0.6),
        ],
    )
    .await;

    let (status, body) = send(&app, "POST", &format!("/mutations/{}/commit", mutation_id), None).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "CONSTRAINT_HARD_FAIL");
    assert!(!body["error"]["details"]["results"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_exclusion_conflict_listing_and_suppression() {
    let app = create_test_app();
    let organism_id = create_organism(&app).await;
    let conflict = committed_exclusion(&app, &organism_id).await;

    assert_eq!(conflict["type"], "exclusion-constraint");
    let severity = conflict["severity"].as_str().unwrap();
    assert!(severity == "medium" || severity == "high");

    let (_, body) = send(&app, "GET", "/conflicts?type=exclusion-constraint&limit=1", None).await;
    assert_eq!(body["data"]["limit"], 1);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 1);
    assert!(body["data"]["cursor"].is_null());

    let conflict_id = conflict["id"].as_str().unwrap();
    let (status, body) = send(
        &app,
        "POST",
        &format!("/conflicts/{}/suppress", conflict_id),
        Some(json!({"reason": "seasonal clearance", "approvedBy": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "suppressed");

    let (_, body) = send(&app, "GET", "/conflicts?status=active", None).await;
    assert_eq!(body["data"]["total"], 0);
    let (_, body) = send(&app, "GET", "/conflicts?status=suppressed", None).await;
    assert_eq!(body["data"]["total"], 1);

    let (status, _) = send(&app, "GET", "/conflicts?severity=catastrophic", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_resolve_conflict() {
    let app = create_test_app();
    let organism_id = create_organism(&app).await;
    let conflict = committed_exclusion(&app, &organism_id).await;
    let conflict_id = conflict["id"].as_str().unwrap();

    let (_, body) = send(&app, "GET", &format!("/claims?organismId={}", organism_id), None).await;
    let positioning = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["lens"] == "brand.positioning")
        .unwrap()["id"]
        .clone();
    let uri = format!("/conflicts/{}/resolve", conflict_id);

    let unrelated = json!({"lenses": ["brand.tone"], "sacrificed": "nothing", "gained": "nothing"});
    let (status, body) = send(
        &app,
        "POST",
        &uri,
        Some(json!({"strategy": "prefer", "chosenClaimId": positioning, "tradeoff": unrelated, "actor": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "TRADEOFF_REQUIRED");

    let tradeoff = json!({
        "lenses": ["brand.discounting.strategy"],
        "sacrificed": "discount volume",
        "gained": "coherent luxury positioning"
    });
    let (status, body) = send(
        &app,
        "POST",
        &uri,
        Some(json!({"strategy": "prefer", "chosenClaimId": positioning, "tradeoff": tradeoff, "actor": "alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["status"], "resolved");

    let (status, body) = send(&app, "GET", &format!("/conflicts/{}", conflict_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "resolved");
}

#[tokio::test]
async fn test_queries() {
    let app = create_test_app();
    let organism_id = create_organism(&app).await;
    let mutation_id = propose(&app, &organism_id, vec![create_change("brand.tone", json!("warm"), 0.4)]).await;
    send(&app, "POST", &format!("/mutations/{}/commit", mutation_id), None).await;

    let (status, body) = send(&app, "POST", "/query/evaluate", Some(json!({"organismId": organism_id}))).await;
    assert_eq!(status, StatusCode::OK);
    let coherence = body["data"]["coherence"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&coherence));

    let (status, body) = send(
        &app,
        "POST",
        "/query/explain",
        Some(json!({"organismId": organism_id, "lens": "brand.tone"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["value"], "warm");
    assert_eq!(body["data"]["lineage"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app,
        "POST",
        "/query/explain",
        Some(json!({"organismId": organism_id, "lens": "brand.missing"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, body) = send(
        &app,
        "POST",
        "/query/simulate",
        Some(json!({
            "organismId": organism_id,
            "changes": [{"lens": "brand.tone", "op": "set", "value": "cool"}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["coherenceBefore"].as_f64().is_some());

    let (_, body) = send(&app, "GET", &format!("/claims?organismId={}", organism_id), None).await;
    assert_eq!(body["data"][0]["value"], "warm");

    let (status, body) = send(
        &app,
        "POST",
        "/query/diff",
        Some(json!({
            "left": {"organismId": organism_id, "asOf": 0},
            "right": {"organismId": organism_id}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["added"], json!(["brand.tone"]));
}

#[tokio::test]
async fn test_projections() {
    let app = create_test_app();
    let organism_id = create_organism(&app).await;

    let (status, body) = send(&app, "GET", &format!("/projections/{}/summary", organism_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["kind"], "summary");
    assert!(body["data"]["id"].as_str().unwrap().starts_with("prj_"));

    let (status, body) = send(&app, "GET", &format!("/projections/{}/timeline?asOf=1", organism_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["asOf"], 1);

    let (status, _) = send(&app, "GET", &format!("/projections/{}/heatmap", organism_id), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_expired_proposal_is_gone() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let config = LedgerConfig {
        proposal_ttl_ms: 1_000,
        ..LedgerConfig::lenient()
    };
    let ledger = Arc::new(Ledger::in_memory(config).with_clock(clock.clone()));
    let app = create_router(AppState::new(ledger.clone(), 50));

    let organism_id = create_organism(&app).await;
    let mutation_id = propose(&app, &organism_id, vec![create_change("brand.tone", json!("warm"), 0.4)]).await;
    clock.advance(5_000);
    assert!(ledger.now() > 1_000_000);

    let (status, body) = send(&app, "POST", &format!("/mutations/{}/commit", mutation_id), None).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"]["code"], "MUTATION_EXPIRED");
    assert_eq!(body["error"]["details"]["mutationId"], mutation_id.as_str());
}

#[test]
fn test_sample_config_parses() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/router.toml");
    let config = RouterConfig::from_file(path).unwrap();

    assert_eq!(config.bind_addr(), "127.0.0.1:8080");
    assert!(matches!(config.storage, StorageConfig::Sqlite { .. }));
    assert!(!config.ledger.reject_unknown_actors);
    assert_eq!(config.janitor.sweep_interval_ms, 60_000);
}
