//! Query engine integration tests against a mocked SQL Lab API.

use std::time::Duration;

use mockito::Matcher;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::harness::{platform, sequenced_body, settings, CSRF_TOKEN};
use analytics_mcp::query::{EngineSettings, PollPolicy, QueryState, SubmitOptions};

const RUNNING: &str = r#"{"status":"running"}"#;
const SUCCESS: &str = r#"{"status":"success"}"#;

#[tokio::test]
async fn test_select_one_end_to_end() {
    let mut p = platform(settings()).await;
    let execute = p
        .server
        .mock("POST", "/sqllab/execute")
        .match_header("x-csrftoken", CSRF_TOKEN)
        .match_body(Matcher::PartialJson(json!({
            "sql": "SELECT 1",
            "database_id": 1,
            "runAsync": true,
        })))
        .with_status(200)
        .with_body(r#"{"query_id":11,"status":"pending"}"#)
        .expect(1)
        .create_async()
        .await;
    let status = p
        .server
        .mock("GET", "/sqllab/query/11")
        .with_status(200)
        .with_body_from_request(sequenced_body(RUNNING, SUCCESS, 2))
        .expect(3)
        .create_async()
        .await;
    let results = p
        .server
        .mock("GET", "/sqllab/results/11")
        .with_status(200)
        .with_body(r#"{"columns":[{"name":"?column?","type":"INT"}],"data":[{"?column?":1}]}"#)
        .expect(1)
        .create_async()
        .await;

    let (handle, result) = p
        .context
        .engine
        .execute("SELECT 1", 1, &SubmitOptions::default(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(handle.query_id, "11");
    assert_eq!(handle.state(), QueryState::Success);
    assert_eq!(result.rows, vec![vec![json!(1)]]);
    assert_eq!(result.row_count, result.rows.len());
    assert_eq!(result.columns[0].data_type.as_deref(), Some("INT"));
    assert!(!result.truncated);

    p.login.assert_async().await;
    p.csrf.assert_async().await;
    execute.assert_async().await;
    status.assert_async().await;
    results.assert_async().await;
}

#[tokio::test]
async fn test_results_are_not_ready_while_running() {
    let mut p = platform(settings()).await;
    let _execute = p
        .server
        .mock("POST", "/sqllab/execute")
        .with_status(200)
        .with_body(r#"{"query":{"queryId":"abc","state":"running"}}"#)
        .create_async()
        .await;
    let results = p
        .server
        .mock("GET", "/sqllab/results/abc")
        .expect(0)
        .create_async()
        .await;

    let engine = &p.context.engine;
    let handle = engine
        .submit("SELECT * FROM orders", 1, &SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(handle.state(), QueryState::Running);

    let err = engine.fetch_results(&handle, None).await.unwrap_err();
    assert_eq!(err.kind(), "NOT_READY");
    assert_eq!(err.query_id(), Some("abc"));
    results.assert_async().await;
}

#[tokio::test]
async fn test_timeout_stops_remote_query_once() {
    let timeout = Duration::from_millis(300);
    let max_interval = Duration::from_millis(80);
    let mut p = platform(EngineSettings {
        policy: PollPolicy {
            timeout,
            poll_interval: Duration::from_millis(20),
            backoff_factor: 2.0,
            max_poll_interval: max_interval,
        },
        ..EngineSettings::default()
    })
    .await;
    let _execute = p
        .server
        .mock("POST", "/sqllab/execute")
        .with_status(200)
        .with_body(r#"{"query_id":"slow"}"#)
        .create_async()
        .await;
    let _status = p
        .server
        .mock("GET", "/sqllab/query/slow")
        .with_status(200)
        .with_body(RUNNING)
        .create_async()
        .await;
    let stop = p
        .server
        .mock("POST", "/sqllab/stop/slow")
        .with_status(200)
        .with_body(r#"{"result":"OK"}"#)
        .expect(1)
        .create_async()
        .await;

    let engine = &p.context.engine;
    let mut handle = engine
        .submit("SELECT pg_sleep(60)", 1, &SubmitOptions::default())
        .await
        .unwrap();

    let started = Instant::now();
    let err = engine
        .await_completion(
            &mut handle,
            timeout,
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), "TIMEOUT");
    assert_eq!(handle.state(), QueryState::TimedOut);
    assert!(elapsed >= timeout, "returned early after {elapsed:?}");
    assert!(
        elapsed < timeout + max_interval + Duration::from_millis(500),
        "overshot the deadline: {elapsed:?}"
    );
    stop.assert_async().await;
}

#[tokio::test]
async fn test_cancelled_wait_stops_query() {
    let mut p = platform(settings()).await;
    let _status = p
        .server
        .mock("GET", "/sqllab/query/q7")
        .with_status(200)
        .with_body(RUNNING)
        .create_async()
        .await;
    let stop = p
        .server
        .mock("POST", "/sqllab/stop/q7")
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let mut handle = analytics_mcp::query::QueryHandle::resume("q7");
    let err = p
        .context
        .engine
        .await_completion(
            &mut handle,
            Duration::from_secs(30),
            Duration::from_millis(20),
            &cancel,
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "CANCELLED");
    assert_eq!(handle.state(), QueryState::Stopped);
    stop.assert_async().await;
}

#[tokio::test]
async fn test_poll_failure_stops_query() {
    let mut p = platform(settings()).await;
    let _status = p
        .server
        .mock("GET", "/sqllab/query/q8")
        .with_status(503)
        .with_body("upstream unavailable")
        .create_async()
        .await;
    let stop = p
        .server
        .mock("POST", "/sqllab/stop/q8")
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let mut handle = analytics_mcp::query::QueryHandle::resume("q8");
    let err = p
        .context
        .engine
        .await_completion(
            &mut handle,
            Duration::from_secs(30),
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "SERVER_ERROR");
    stop.assert_async().await;
}

#[tokio::test]
async fn test_failed_query_surfaces_platform_message() {
    let mut p = platform(settings()).await;
    let _status = p
        .server
        .mock("GET", "/sqllab/query/9")
        .with_status(200)
        .with_body(r#"{"status":"failed","errorMessage":"relation \"nope\" does not exist"}"#)
        .create_async()
        .await;

    let engine = &p.context.engine;
    let handle = engine.status("9").await.unwrap();
    assert_eq!(handle.state(), QueryState::Failed);

    let err = engine.fetch_results(&handle, None).await.unwrap_err();
    assert_eq!(err.kind(), "FAILED");
    assert!(err.to_string().contains("relation \"nope\" does not exist"));
}

fn page_matcher(page: usize, size: usize) -> Matcher {
    Matcher::AllOf(vec![
        Matcher::UrlEncoded("page".into(), page.to_string()),
        Matcher::UrlEncoded("page_size".into(), size.to_string()),
    ])
}

#[tokio::test]
async fn test_paged_fetch_stops_at_short_page() {
    let mut p = platform(EngineSettings {
        page_size: Some(2),
        ..settings()
    })
    .await;
    let _status = p
        .server
        .mock("GET", "/sqllab/query/p1")
        .with_status(200)
        .with_body(SUCCESS)
        .create_async()
        .await;
    let first = p
        .server
        .mock("GET", "/sqllab/results/p1")
        .match_query(page_matcher(0, 2))
        .with_status(200)
        .with_body(r#"{"columns":["n"],"data":[[1],[2]]}"#)
        .expect(1)
        .create_async()
        .await;
    let second = p
        .server
        .mock("GET", "/sqllab/results/p1")
        .match_query(page_matcher(1, 2))
        .with_status(200)
        .with_body(r#"{"columns":["n"],"data":[[3]]}"#)
        .expect(1)
        .create_async()
        .await;

    let engine = &p.context.engine;
    let handle = engine.status("p1").await.unwrap();
    let result = engine.fetch_results(&handle, None).await.unwrap();

    assert_eq!(result.rows, vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]]);
    assert_eq!(result.row_count, 3);
    assert!(!result.truncated);
    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn test_fetch_truncates_at_max_rows() {
    let mut p = platform(EngineSettings {
        max_rows: 3,
        ..settings()
    })
    .await;
    let _status = p
        .server
        .mock("GET", "/sqllab/query/big")
        .with_status(200)
        .with_body(SUCCESS)
        .create_async()
        .await;
    let _page0 = p
        .server
        .mock("GET", "/sqllab/results/big")
        .match_query(page_matcher(0, 2))
        .with_status(200)
        .with_body(r#"{"columns":["n"],"data":[[1],[2]]}"#)
        .create_async()
        .await;
    let _page1 = p
        .server
        .mock("GET", "/sqllab/results/big")
        .match_query(page_matcher(1, 2))
        .with_status(200)
        .with_body(r#"{"columns":["n"],"data":[[3],[4]]}"#)
        .create_async()
        .await;
    let page2 = p
        .server
        .mock("GET", "/sqllab/results/big")
        .match_query(page_matcher(2, 2))
        .expect(0)
        .create_async()
        .await;

    let engine = &p.context.engine;
    let handle = engine.status("big").await.unwrap();
    let result = engine.fetch_results(&handle, Some(2)).await.unwrap();

    assert_eq!(result.row_count, 3);
    assert_eq!(result.rows.len(), 3);
    assert!(result.truncated);
    page2.assert_async().await;
}

#[tokio::test]
async fn test_discarded_results_are_expired() {
    let mut p = platform(settings()).await;
    let _status = p
        .server
        .mock("GET", "/sqllab/query/old")
        .with_status(200)
        .with_body(SUCCESS)
        .create_async()
        .await;
    let _results = p
        .server
        .mock("GET", "/sqllab/results/old")
        .with_status(410)
        .with_body(r#"{"message":"Data could not be retrieved"}"#)
        .create_async()
        .await;

    let engine = &p.context.engine;
    let handle = engine.status("old").await.unwrap();
    let err = engine.fetch_results(&handle, None).await.unwrap_err();
    assert_eq!(err.kind(), "EXPIRED");
}

#[tokio::test]
async fn test_estimate_cost() {
    let mut p = platform(settings()).await;
    let estimate = p
        .server
        .mock("GET", "/sqllab/estimate")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("sql".into(), "SELECT * FROM orders".into()),
            Matcher::UrlEncoded("database_id".into(), "2".into()),
        ]))
        .with_status(200)
        .with_body(r#"{"result":[{"Total cost":"1234.5"}]}"#)
        .expect(1)
        .create_async()
        .await;

    let cost = p
        .context
        .engine
        .estimate_cost("SELECT * FROM orders", 2)
        .await
        .unwrap();
    assert_eq!(cost.estimate, json!([{"Total cost": "1234.5"}]));
    estimate.assert_async().await;
}

#[tokio::test]
async fn test_estimate_unsupported_by_engine() {
    let mut p = platform(settings()).await;
    let _estimate = p
        .server
        .mock("GET", "/sqllab/estimate")
        .with_status(400)
        .with_body(r#"{"message":"Database does not support cost estimation"}"#)
        .create_async()
        .await;

    let err = p
        .context
        .engine
        .estimate_cost("SELECT 1", 3)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ESTIMATION_UNSUPPORTED");
    assert!(err.to_string().contains("does not support cost estimation"));
}

#[tokio::test]
async fn test_rejected_submission_carries_platform_message() {
    let mut p = platform(settings()).await;
    let _execute = p
        .server
        .mock("POST", "/sqllab/execute")
        .with_status(400)
        .with_body(r#"{"message":"syntax error at or near \"SELEC\""}"#)
        .create_async()
        .await;

    let err = p
        .context
        .engine
        .submit("SELEC 1", 1, &SubmitOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "SUBMISSION_REJECTED");
    assert!(err.to_string().contains("syntax error"));
}

#[tokio::test]
async fn test_read_only_mode_blocks_mutations_locally() {
    let mut p = platform(EngineSettings {
        read_only: true,
        ..settings()
    })
    .await;
    let execute = p
        .server
        .mock("POST", "/sqllab/execute")
        .with_status(200)
        .with_body(r#"{"query_id":1,"status":"running"}"#)
        .expect(1)
        .create_async()
        .await;

    let engine = &p.context.engine;
    let options = SubmitOptions::default();

    let err = engine.submit("DELETE FROM orders", 1, &options).await.unwrap_err();
    assert_eq!(err.kind(), "SUBMISSION_REJECTED");
    let err = engine
        .submit("SELECT 1; DROP TABLE orders", 1, &options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "SUBMISSION_REJECTED");

    engine
        .submit("SELECT id FROM orders WHERE total > 10", 1, &options)
        .await
        .unwrap();
    execute.assert_async().await;
}

#[tokio::test]
async fn test_stop_marks_query_stopped() {
    let mut p = platform(settings()).await;
    let stop = p
        .server
        .mock("POST", "/sqllab/stop/s1")
        .with_status(200)
        .with_body(r#"{"result":"OK"}"#)
        .expect(1)
        .create_async()
        .await;

    let mut handle = analytics_mcp::query::QueryHandle::resume("s1");
    let state = p.context.engine.stop(&mut handle).await.unwrap();
    assert_eq!(state, QueryState::Stopped);
    assert_eq!(handle.state(), QueryState::Stopped);
    stop.assert_async().await;
}
