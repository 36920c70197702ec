//! End-to-end pipeline tests: mock HTTP sources, real orchestrator, memory
//! warehouse.

use std::sync::Arc;

use config::shared::{
    ApiConfig, AppConfig, EntityConfig, PlannerSourceConfig, RetryConfig, SourceKind, SyncConfig,
    TrackerSourceConfig, TransformKind, WarehouseConfig,
};
use serde_json::{Value, json};
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sync::error::ErrorKind;
use sync::identity::surrogate_id;
use sync::pipeline::{RunOptions, SyncOrchestrator};
use sync::test_utils::{FaultInjectingWarehouse, FaultPoint};
use sync::warehouse::{MemoryWarehouse, Warehouse};

fn entity(
    name: &str,
    source: SourceKind,
    path: &str,
    unique_key: &str,
    transform: TransformKind,
    incremental: bool,
) -> EntityConfig {
    EntityConfig {
        name: name.to_string(),
        source,
        path: path.to_string(),
        enabled: true,
        unique_key: unique_key.to_string(),
        sync_key: None,
        transform,
        incremental,
    }
}

fn test_config(
    tracker_uri: &str,
    planner_uri: &str,
    entities: Vec<EntityConfig>,
) -> Arc<AppConfig> {
    Arc::new(AppConfig {
        tracker: TrackerSourceConfig {
            base_url: tracker_uri.trim_end_matches('/').to_string(),
            api_key: "test-key".to_string().into(),
            workspace_id: "ws".to_string(),
            page_size: 200,
        },
        planner: PlannerSourceConfig {
            base_url: planner_uri.trim_end_matches('/').to_string(),
            api_token: "test-token".to_string().into(),
            page_limit: 200,
        },
        warehouse: WarehouseConfig::Memory,
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_factor: 2.0,
        },
        sync: SyncConfig {
            full_reload: false,
            max_concurrent_entities: 2,
            max_concurrent_requests: 4,
            page_fetch_concurrency: 2,
            run_timeout_secs: None,
            overlap_days: 0,
        },
        entities,
        api: ApiConfig::default(),
    })
}

/// Every unmatched request gets an empty array, which both response shapes
/// decode as an empty page.
async fn mount_empty_fallback(server: &MockServer) {
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .with_priority(250)
        .mount(server)
        .await;
}

fn people_records(range: std::ops::Range<u32>) -> Vec<Value> {
    range
        .map(|i| json!({"id": format!("p{i}"), "name": format!("Person {i}")}))
        .collect()
}

fn time_entry(id: u32, user: &str) -> Value {
    json!({
        "id": format!("e{id}"),
        "userId": user,
        "billable": true,
        "description": "work",
        "timeInterval": {
            "start": "2024-01-15T08:00:00Z",
            "end": "2024-01-15T09:00:00Z"
        }
    })
}

#[tokio::test]
async fn three_full_pages_merge_into_the_target() {
    let tracker = MockServer::start().await;
    let planner = MockServer::start().await;

    // 200 + 200 + 40 records; the short third page ends the iteration.
    for (page, range) in [(1, 0..200u32), (2, 200..400), (3, 400..440)] {
        Mock::given(method("GET"))
            .and(path("/workspaces/ws/users"))
            .and(query_param("page", page.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(people_records(range)))
            .with_priority(1)
            .mount(&tracker)
            .await;
    }
    mount_empty_fallback(&tracker).await;
    mount_empty_fallback(&planner).await;

    let config = test_config(
        &tracker.uri(),
        &planner.uri(),
        vec![entity(
            "people",
            SourceKind::Tracker,
            "/users",
            "id",
            TransformKind::Passthrough,
            false,
        )],
    );

    let warehouse = MemoryWarehouse::new();
    let orchestrator = SyncOrchestrator::new(config, warehouse.clone());
    let summary = orchestrator.run(RunOptions::default()).await.unwrap();

    assert_eq!(summary.total_rows(), 440);
    assert_eq!(summary.failed_count(), 0);

    let outcome = &summary.entities[0];
    let dedup = outcome.dedup.as_ref().unwrap();
    assert_eq!(dedup.received, 440);
    assert_eq!(dedup.unique, 440);
    assert_eq!(dedup.duplicates, 0);

    assert_eq!(warehouse.target_row_count("people").await.unwrap(), 440);
}

#[tokio::test]
async fn per_user_duplicates_collapse_and_identities_resolve() {
    let tracker = MockServer::start().await;
    let planner = MockServer::start().await;

    // Three tracker users; two of them exist in the planner with the same
    // email, the third has no counterpart.
    Mock::given(method("GET"))
        .and(path("/workspaces/ws/users"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "u1", "email": "ada@example.com"},
            {"id": "u2", "email": "grace@example.com"},
            {"id": "u3", "email": "nobody@example.com"},
        ])))
        .with_priority(1)
        .mount(&tracker)
        .await;

    Mock::given(method("GET"))
        .and(path("/people"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "values": [
                {"id": 101, "email": "Ada@Example.com"},
                {"id": 102, "email": "grace@example.com"},
            ]
        })))
        .with_priority(1)
        .mount(&planner)
        .await;

    // 23 logical entries observed 60 times in total: u1 sees all 23, u2
    // sees entries 1..=20, u3 sees entries 1..=17. The per-user fan-out
    // visits users in order, so the last observation of a shared entry
    // comes from u3.
    let user_entries: [(&str, u32); 3] = [("u1", 23), ("u2", 20), ("u3", 17)];
    for (user, count) in user_entries {
        let entries: Vec<Value> = (1..=count).map(|i| time_entry(i, user)).collect();
        Mock::given(method("GET"))
            .and(path(format!("/workspaces/ws/user/{user}/time-entries")))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(entries))
            .with_priority(1)
            .mount(&tracker)
            .await;
    }
    mount_empty_fallback(&tracker).await;
    mount_empty_fallback(&planner).await;

    let config = test_config(
        &tracker.uri(),
        &planner.uri(),
        vec![entity(
            "time_entries",
            SourceKind::Tracker,
            "/user/{user_id}/time-entries",
            "_tracker_id",
            TransformKind::TimeEntries,
            false,
        )],
    );

    let warehouse = MemoryWarehouse::new();
    let orchestrator = SyncOrchestrator::new(config, warehouse.clone());
    let summary = orchestrator.run(RunOptions::default()).await.unwrap();

    let outcome = &summary.entities[0];
    assert!(outcome.error.is_none());

    let dedup = outcome.dedup.as_ref().unwrap();
    assert_eq!(dedup.received, 60);
    assert_eq!(dedup.unique, 23);
    assert_eq!(dedup.duplicates, 37);
    assert!((dedup.duplication_ratio() - 2.608).abs() < 0.01);

    assert_eq!(outcome.rows_written, 23);
    assert_eq!(warehouse.target_row_count("time_entries").await.unwrap(), 23);

    let match_report = summary.match_report.as_ref().unwrap();
    assert_eq!(match_report.foreign_total, 3);
    assert_eq!(match_report.target_total, 2);
    assert_eq!(match_report.matched, 2);
    assert_eq!(match_report.unmatched, 1);
    assert!((match_report.match_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    assert_eq!(
        match_report.unmatched_values,
        vec!["nobody@example.com".to_string()]
    );

    // Rows last observed by u2 resolve to the planner person; rows last
    // observed by u3 fall back to the surrogate.
    let rows = warehouse.table_rows("time_entries").await;
    let by_user = |user: &str| {
        rows.iter()
            .find(|row| row.get("_tracker_user_id") == Some(&json!(user)))
            .unwrap()
    };

    let u2_row = by_user("u2");
    assert_eq!(u2_row.get("personId"), Some(&json!(102)));
    assert_eq!(u2_row.get("_matched_by_email"), Some(&json!(true)));
    assert_eq!(u2_row.get("billableMinutes"), Some(&json!(60)));

    let u3_row = by_user("u3");
    assert_eq!(u3_row.get("personId"), Some(&json!(surrogate_id("u3"))));
    assert_eq!(u3_row.get("_matched_by_email"), Some(&json!(false)));
}

#[tokio::test]
async fn one_failing_entity_does_not_abort_its_siblings() {
    let tracker = MockServer::start().await;
    let planner = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/workspaces/ws/users"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "u1"}, {"id": "u2"}, {"id": "u3"},
        ])))
        .with_priority(1)
        .mount(&tracker)
        .await;

    Mock::given(method("GET"))
        .and(path("/workspaces/ws/projects"))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(1)
        .mount(&tracker)
        .await;
    mount_empty_fallback(&tracker).await;
    mount_empty_fallback(&planner).await;

    let config = test_config(
        &tracker.uri(),
        &planner.uri(),
        vec![
            entity(
                "people",
                SourceKind::Tracker,
                "/users",
                "id",
                TransformKind::Passthrough,
                false,
            ),
            entity(
                "projects",
                SourceKind::Tracker,
                "/projects",
                "id",
                TransformKind::Passthrough,
                false,
            ),
        ],
    );

    let warehouse = MemoryWarehouse::new();
    let orchestrator = SyncOrchestrator::new(config, warehouse.clone());
    let summary = orchestrator.run(RunOptions::default()).await.unwrap();

    assert_eq!(summary.failed_count(), 1);
    assert!(!summary.all_failed());

    let people = summary.entities.iter().find(|e| e.entity == "people").unwrap();
    assert_eq!(people.rows_written, 3);

    let projects = summary
        .entities
        .iter()
        .find(|e| e.entity == "projects")
        .unwrap();
    let error = projects.error.as_ref().unwrap();
    assert_eq!(error.kind(), ErrorKind::SourceUnavailable);
    assert!(error.detail().unwrap().contains("2 attempts"));

    assert_eq!(warehouse.target_row_count("people").await.unwrap(), 3);
    assert_eq!(warehouse.target_row_count("projects").await.unwrap(), 0);
}

#[tokio::test]
async fn full_reload_replaces_previous_rows() {
    let tracker = MockServer::start().await;
    let planner = MockServer::start().await;

    // First run sees three users, the second run one; mocks are consumed
    // in order.
    Mock::given(method("GET"))
        .and(path("/workspaces/ws/users"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "u1"}, {"id": "u2"}, {"id": "u3"},
        ])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&tracker)
        .await;
    Mock::given(method("GET"))
        .and(path("/workspaces/ws/users"))
        .and(query_param("page", "1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": "u9"}])),
        )
        .up_to_n_times(1)
        .with_priority(2)
        .mount(&tracker)
        .await;
    mount_empty_fallback(&tracker).await;
    mount_empty_fallback(&planner).await;

    let config = test_config(
        &tracker.uri(),
        &planner.uri(),
        vec![entity(
            "people",
            SourceKind::Tracker,
            "/users",
            "id",
            TransformKind::Passthrough,
            false,
        )],
    );

    let warehouse = MemoryWarehouse::new();

    let orchestrator = SyncOrchestrator::new(config.clone(), warehouse.clone());
    orchestrator.run(RunOptions::default()).await.unwrap();
    assert_eq!(warehouse.target_row_count("people").await.unwrap(), 3);

    let orchestrator = SyncOrchestrator::new(config, warehouse.clone());
    let summary = orchestrator
        .run(RunOptions {
            full_reload: true,
            only: None,
        })
        .await
        .unwrap();

    assert!(summary.full_reload);
    assert_eq!(warehouse.target_row_count("people").await.unwrap(), 1);
    let rows = warehouse.table_rows("people").await;
    assert_eq!(rows[0].get("id"), Some(&json!("u9")));
}

#[tokio::test]
async fn incremental_entities_carry_the_checkpoint_forward() {
    let tracker = MockServer::start().await;
    let planner = MockServer::start().await;

    // First run: no checkpoint, so no modifiedAfter parameter.
    Mock::given(method("GET"))
        .and(path("/assignments"))
        .and(query_param_is_missing("modifiedAfter"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "values": [
                {"id": 1, "updatedAt": "2024-03-04T09:00:00Z"},
                {"id": 2, "updatedAt": "2024-03-05T10:00:00Z"},
            ]
        })))
        .with_priority(1)
        .mount(&planner)
        .await;

    // Second run: the checkpoint (max observed updatedAt, zero overlap)
    // must be sent as modifiedAfter.
    Mock::given(method("GET"))
        .and(path("/assignments"))
        .and(query_param("modifiedAfter", "2024-03-05T10:00:00Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"values": []})))
        .with_priority(1)
        .mount(&planner)
        .await;
    mount_empty_fallback(&tracker).await;
    mount_empty_fallback(&planner).await;

    let config = test_config(
        &tracker.uri(),
        &planner.uri(),
        vec![entity(
            "assignments",
            SourceKind::Planner,
            "/assignments",
            "id",
            TransformKind::Passthrough,
            true,
        )],
    );

    let warehouse = MemoryWarehouse::new();

    let orchestrator = SyncOrchestrator::new(config.clone(), warehouse.clone());
    let summary = orchestrator.run(RunOptions::default()).await.unwrap();
    assert_eq!(summary.total_rows(), 2);

    let checkpoint = warehouse.read_checkpoint("assignments").await.unwrap();
    let expected = chrono::DateTime::parse_from_rfc3339("2024-03-05T10:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    assert_eq!(checkpoint, Some(expected));

    let orchestrator = SyncOrchestrator::new(config, warehouse.clone());
    let summary = orchestrator.run(RunOptions::default()).await.unwrap();
    assert_eq!(summary.failed_count(), 0);
    assert_eq!(summary.total_rows(), 0);

    // Zero fetched rows leave the checkpoint untouched.
    let checkpoint = warehouse.read_checkpoint("assignments").await.unwrap();
    assert_eq!(checkpoint, Some(expected));
}

#[tokio::test]
async fn merge_fault_fails_the_entity_and_leaves_the_target_clean() {
    let tracker = MockServer::start().await;
    let planner = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/workspaces/ws/users"))
        .and(query_param("page", "1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": "u1"}, {"id": "u2"}])),
        )
        .with_priority(1)
        .mount(&tracker)
        .await;
    mount_empty_fallback(&tracker).await;
    mount_empty_fallback(&planner).await;

    let config = test_config(
        &tracker.uri(),
        &planner.uri(),
        vec![entity(
            "people",
            SourceKind::Tracker,
            "/users",
            "id",
            TransformKind::Passthrough,
            false,
        )],
    );

    let warehouse = FaultInjectingWarehouse::wrap(MemoryWarehouse::new());
    warehouse.arm(FaultPoint::MergeStaging);

    let orchestrator = SyncOrchestrator::new(config, warehouse.clone());
    let summary = orchestrator.run(RunOptions::default()).await.unwrap();

    assert!(summary.all_failed());
    let error = summary.entities[0].error.as_ref().unwrap();
    assert_eq!(error.kind(), ErrorKind::MergeFailed);
    assert_eq!(
        warehouse.inner().target_row_count("people").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn schema_evolution_fault_preserves_existing_rows() {
    let tracker = MockServer::start().await;
    let planner = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/workspaces/ws/users"))
        .and(query_param("page", "1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"id": "u1", "name": "Ada"}])),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&tracker)
        .await;
    Mock::given(method("GET"))
        .and(path("/workspaces/ws/users"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "u1", "name": "Ada", "team": "compilers"},
        ])))
        .up_to_n_times(1)
        .with_priority(2)
        .mount(&tracker)
        .await;
    mount_empty_fallback(&tracker).await;
    mount_empty_fallback(&planner).await;

    let config = test_config(
        &tracker.uri(),
        &planner.uri(),
        vec![entity(
            "people",
            SourceKind::Tracker,
            "/users",
            "id",
            TransformKind::Passthrough,
            false,
        )],
    );

    let warehouse = FaultInjectingWarehouse::wrap(MemoryWarehouse::new());

    let orchestrator = SyncOrchestrator::new(config.clone(), warehouse.clone());
    orchestrator.run(RunOptions::default()).await.unwrap();

    // The second run introduces a new column while column additions fail.
    warehouse.arm(FaultPoint::AddColumns);
    let orchestrator = SyncOrchestrator::new(config, warehouse.clone());
    let summary = orchestrator.run(RunOptions::default()).await.unwrap();

    let error = summary.entities[0].error.as_ref().unwrap();
    assert_eq!(error.kind(), ErrorKind::SchemaEvolutionFailed);

    // Target rows and schema are exactly as the first run left them.
    let rows = warehouse.inner().table_rows("people").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&json!("Ada")));
    assert_eq!(rows[0].get("team"), None);
    let schema = warehouse.inner().schema_of("people").await.unwrap();
    assert!(!schema.has_column("team"));
}

#[tokio::test]
async fn a_canceled_run_merges_nothing() {
    let tracker = MockServer::start().await;
    let planner = MockServer::start().await;
    mount_empty_fallback(&tracker).await;
    mount_empty_fallback(&planner).await;

    let config = test_config(
        &tracker.uri(),
        &planner.uri(),
        vec![entity(
            "people",
            SourceKind::Tracker,
            "/users",
            "id",
            TransformKind::Passthrough,
            false,
        )],
    );

    let warehouse = MemoryWarehouse::new();
    let orchestrator = SyncOrchestrator::new(config, warehouse.clone());

    // Shutdown signaled before the run starts: fetches abort immediately
    // and nothing reaches the target.
    orchestrator.shutdown_tx().shutdown().unwrap();
    let summary = orchestrator.run(RunOptions::default()).await.unwrap();

    assert!(summary.all_failed());
    assert_eq!(
        summary.entities[0].error.as_ref().unwrap().kind(),
        ErrorKind::SourceOperationCanceled
    );
    assert_eq!(warehouse.target_row_count("people").await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_only_filter_is_a_config_error() {
    let tracker = MockServer::start().await;
    let planner = MockServer::start().await;
    mount_empty_fallback(&tracker).await;
    mount_empty_fallback(&planner).await;

    let config = test_config(
        &tracker.uri(),
        &planner.uri(),
        vec![entity(
            "people",
            SourceKind::Tracker,
            "/users",
            "id",
            TransformKind::Passthrough,
            false,
        )],
    );

    let orchestrator = SyncOrchestrator::new(config, MemoryWarehouse::new());
    let error = orchestrator
        .run(RunOptions {
            full_reload: false,
            only: Some(vec!["nope".to_string()]),
        })
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ConfigError);
}
