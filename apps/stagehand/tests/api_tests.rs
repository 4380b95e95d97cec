//! Integration tests for the Stagehand HTTP API.
//!
//! Uses axum-test to test the API handlers without starting a real server.

// Allow unwrap and panic in tests - these are standard for test code
#![allow(clippy::unwrap_used, clippy::panic)]

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{Value, json};
use stagehand::api::{AppState, HealthResponse, OpenScreenResponse, create_router};
use stagehand::config::{Config, FetchConfig};
use stagehand::screens::ScreenView;
use stagehand_core::Status;
use std::time::Duration;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn config_with(latency_ms: u64, fail_keys: &[&str]) -> Config {
    Config {
        fetch: FetchConfig {
            latency_ms,
            fail_keys: fail_keys.iter().map(|k| k.to_string()).collect(),
            max_age_ms: None,
        },
        ..Config::default()
    }
}

/// Create a test server over the demo fixture with instant fetches.
fn create_test_server() -> TestServer {
    create_test_server_with(config_with(0, &[]))
}

fn create_test_server_with(config: Config) -> TestServer {
    let state = AppState::from_config(&config);
    TestServer::new(create_router(state)).unwrap()
}

async fn open_roster(server: &TestServer, teacher: Option<&str>) -> u64 {
    let response = server
        .post("/screens/roster")
        .json(&json!({ "teacher_id": teacher }))
        .await;
    response.assert_status(StatusCode::CREATED);
    response.json::<OpenScreenResponse>().screen_id
}

/// Poll the screen until no stage is loading.
async fn settled(server: &TestServer, id: u64) -> ScreenView {
    for _ in 0..1000 {
        let view: ScreenView = server.get(&format!("/screens/{id}")).await.json();
        if view.settled {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("screen {id} never settled");
}

fn stage<'a>(view: &'a ScreenView, name: &str) -> &'a stagehand::screens::StageView {
    view.stages
        .iter()
        .find(|s| s.stage == name)
        .unwrap_or_else(|| panic!("no stage {name}"))
}

fn fetches(registry: &Value, name: &str) -> u64 {
    registry["tables"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["stage"] == name)
        .map(|t| t["fetches"].as_u64().unwrap())
        .unwrap_or(0)
}

// =============================================================================
// HEALTH ENDPOINT TESTS
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let server = create_test_server();

    let response = server.get("/health").await;
    response.assert_status_ok();

    let health: HealthResponse = response.json();
    assert_eq!(health.status, "ok");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    assert_eq!(health.screens, 0);
}

#[tokio::test]
async fn test_health_counts_open_screens() {
    let server = create_test_server();
    open_roster(&server, None).await;
    server
        .post("/screens/profile")
        .json(&json!({}))
        .await
        .assert_status(StatusCode::CREATED);

    let health: HealthResponse = server.get("/health").await.json();
    assert_eq!(health.screens, 2);
}

// =============================================================================
// ROSTER SCREEN TESTS
// =============================================================================

#[tokio::test]
async fn test_roster_loads_down_the_chain() {
    let server = create_test_server();
    let id = open_roster(&server, Some("1")).await;

    let view = settled(&server, id).await;
    assert_eq!(view.kind, "roster");

    let classes = stage(&view, "classes");
    assert_eq!(classes.status, Status::Ready);
    assert_eq!(classes.value[0]["name"], "Algebra A");

    let students = stage(&view, "students");
    assert_eq!(students.key, json!(10));
    assert_eq!(students.status, Status::Ready);

    let statistics = stage(&view, "statistics");
    assert_eq!(statistics.key, json!([100, 101]));
    assert_eq!(statistics.value["100"]["completion_rate"], 80);
    assert_eq!(statistics.value["101"]["completion_rate"], 40);
}

#[tokio::test]
async fn test_unkeyed_roster_is_idle() {
    let server = create_test_server();
    let id = open_roster(&server, None).await;

    let view = settled(&server, id).await;
    assert!(view.stages.iter().all(|s| s.status == Status::Idle));
}

#[tokio::test]
async fn test_switching_teacher_reloads_below() {
    let server = create_test_server();
    let id = open_roster(&server, Some("1")).await;
    settled(&server, id).await;

    server
        .put(&format!("/screens/{id}/root"))
        .json(&json!({ "key": "2" }))
        .await
        .assert_status_ok();

    let view = settled(&server, id).await;
    assert_eq!(stage(&view, "classes").key, json!("2"));
    assert_eq!(stage(&view, "students").key, json!(12));
    assert_eq!(stage(&view, "statistics").key, json!([120]));
}

#[tokio::test]
async fn test_clearing_root_idles_screen() {
    let server = create_test_server();
    let id = open_roster(&server, Some("1")).await;
    settled(&server, id).await;

    server
        .put(&format!("/screens/{id}/root"))
        .json(&json!({ "key": null }))
        .await
        .assert_status_ok();

    let view = settled(&server, id).await;
    for stage in &view.stages {
        assert_eq!(stage.status, Status::Idle);
        assert!(stage.value.is_null());
    }
}

#[tokio::test]
async fn test_root_key_of_wrong_type_is_bad_request() {
    let server = create_test_server();
    let id = open_roster(&server, None).await;

    let response = server
        .put(&format!("/screens/{id}/root"))
        .json(&json!({ "key": 5 }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("classes"));
}

// =============================================================================
// SELECTION TESTS
// =============================================================================

#[tokio::test]
async fn test_selection_pins_and_unpins() {
    let server = create_test_server();
    let id = open_roster(&server, Some("1")).await;
    settled(&server, id).await;

    server
        .put(&format!("/screens/{id}/selection"))
        .json(&json!({ "key": 11 }))
        .await
        .assert_status_ok();
    let view = settled(&server, id).await;
    assert_eq!(stage(&view, "students").key, json!(11));
    assert_eq!(stage(&view, "statistics").key, json!([110]));

    server
        .put(&format!("/screens/{id}/selection"))
        .json(&json!({ "key": null }))
        .await
        .assert_status_ok();
    let view = settled(&server, id).await;
    assert_eq!(stage(&view, "students").key, json!(10));
}

#[tokio::test]
async fn test_selecting_absent_class_conflicts() {
    let server = create_test_server();
    let id = open_roster(&server, Some("1")).await;
    settled(&server, id).await;

    server
        .put(&format!("/screens/{id}/selection"))
        .json(&json!({ "key": 12 }))
        .await
        .assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_profile_screen_has_no_selection() {
    let server = create_test_server();
    let response = server
        .post("/screens/profile")
        .json(&json!({ "student_id": 100 }))
        .await;
    let id = response.json::<OpenScreenResponse>().screen_id;

    server
        .put(&format!("/screens/{id}/selection"))
        .json(&json!({ "key": 1 }))
        .await
        .assert_status(StatusCode::CONFLICT);
}

// =============================================================================
// OTHER SCREENS
// =============================================================================

#[tokio::test]
async fn test_assignment_screen_summarizes() {
    let server = create_test_server();
    let response = server
        .post("/screens/assignment")
        .json(&json!({ "assignment_id": 1000 }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let opened: OpenScreenResponse = response.json();
    assert_eq!(opened.kind, "assignment");

    let view = settled(&server, opened.screen_id).await;
    let stats = stage(&view, "personal-assignment-stats");
    assert_eq!(stats.status, Status::Ready);
    assert_eq!(stats.value["submitted"], 2);
    assert_eq!(stats.value["average_score"], 75);
}

#[tokio::test]
async fn test_profile_screen_loads() {
    let server = create_test_server();
    let response = server
        .post("/screens/profile")
        .json(&json!({ "student_id": 110 }))
        .await;
    let id = response.json::<OpenScreenResponse>().screen_id;

    let view = settled(&server, id).await;
    let profile = stage(&view, "profile");
    assert_eq!(profile.value["class_name"], "Biology B");
    assert_eq!(profile.value["completion_rate"], 100);
}

#[tokio::test]
async fn test_failed_fetch_is_reported() {
    let server = create_test_server_with(config_with(0, &["classes:2"]));
    let id = open_roster(&server, Some("2")).await;

    let view = settled(&server, id).await;
    let classes = stage(&view, "classes");
    assert_eq!(classes.status, Status::Failed);
    assert!(classes.error.is_some());
    assert_eq!(stage(&view, "students").status, Status::Idle);
}

// =============================================================================
// REFRESH AND CLOSE
// =============================================================================

#[tokio::test]
async fn test_refresh_refetches_with_stale_value() {
    let server = create_test_server();
    let id = open_roster(&server, Some("1")).await;
    let before = settled(&server, id).await;
    let classes_before = stage(&before, "classes").version;

    server
        .post(&format!("/screens/{id}/refresh"))
        .await
        .assert_status_ok();

    let after = settled(&server, id).await;
    let classes = stage(&after, "classes");
    assert!(classes.version > classes_before);
    assert_eq!(classes.status, Status::Ready);
    assert_eq!(stage(&after, "students").key, json!(10));

    let registry: Value = server.get("/registry").await.json();
    assert_eq!(fetches(&registry, "classes"), 2);
}

#[tokio::test]
async fn test_close_screen() {
    let server = create_test_server();
    let id = open_roster(&server, Some("1")).await;

    server
        .delete(&format!("/screens/{id}"))
        .await
        .assert_status(StatusCode::NO_CONTENT);
    server
        .get(&format!("/screens/{id}"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .delete(&format!("/screens/{id}"))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

// =============================================================================
// REGISTRY TESTS
// =============================================================================

#[tokio::test]
async fn test_screens_share_in_flight_fetches() {
    let server = create_test_server_with(config_with(200, &[]));
    let first = open_roster(&server, Some("1")).await;
    let second = open_roster(&server, Some("1")).await;

    let a = settled(&server, first).await;
    let b = settled(&server, second).await;
    assert_eq!(stage(&a, "statistics").value, stage(&b, "statistics").value);

    let registry: Value = server.get("/registry").await.json();
    assert_eq!(fetches(&registry, "classes"), 1);
    assert_eq!(fetches(&registry, "students"), 1);
}

#[tokio::test]
async fn test_invalidate_entry() {
    let server = create_test_server();
    let id = open_roster(&server, Some("1")).await;
    settled(&server, id).await;

    let response = server
        .post("/invalidate")
        .json(&json!({ "stage": "students", "key": 10 }))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["removed"], true);

    let response = server
        .post("/invalidate")
        .json(&json!({ "stage": "students", "key": 10 }))
        .await;
    assert_eq!(response.json::<Value>()["removed"], false);
}

#[tokio::test]
async fn test_invalidate_rejects_unknown_stage_and_bad_key() {
    let server = create_test_server();

    server
        .post("/invalidate")
        .json(&json!({ "stage": "grades", "key": 1 }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .post("/invalidate")
        .json(&json!({ "stage": "students", "key": "ten" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_registry_lists_tables() {
    let server = create_test_server();
    let id = open_roster(&server, Some("1")).await;
    settled(&server, id).await;

    let registry: Value = server.get("/registry").await.json();
    let tables = registry["tables"].as_array().unwrap();
    assert!(tables.iter().any(|t| t["stage"] == "statistics" && t["cached"] == 1));
    assert!(tables.iter().all(|t| t["in_flight"] == 0));
}
