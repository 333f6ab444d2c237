//! Session and gateway integration tests: token lifetime, single-flight
//! refresh and the 401 retry.

use chrono::Utc;
use futures::future::join_all;
use mockito::Matcher;
use tokio_test::{assert_err, assert_ok};

use super::harness::{sequenced_body, token_body, wire};
use analytics_mcp::query::EngineSettings;

#[tokio::test]
async fn test_concurrent_requests_share_one_refresh() {
    let mut server = mockito::Server::new_async().await;
    // Expires inside the 30s skew, so the first request must renew it.
    let login = server
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_body(token_body("stale", 10))
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .match_header("authorization", "Bearer r-stale")
        .with_status(200)
        .with_body(token_body("fresh", 3600))
        .expect(1)
        .create_async()
        .await;
    let me = server
        .mock("GET", "/me/")
        .match_header("authorization", "Bearer fresh")
        .with_status(200)
        .with_body(r#"{"result":{"username":"admin"}}"#)
        .expect(8)
        .create_async()
        .await;

    let ctx = wire(&server, EngineSettings::default());
    ctx.session.authenticate().await.unwrap();

    let responses = join_all((0..8).map(|_| ctx.gateway.get("/me/", None))).await;
    for response in responses {
        assert_eq!(response.unwrap().body["result"]["username"], "admin");
    }

    login.assert_async().await;
    refresh.assert_async().await;
    me.assert_async().await;
}

#[tokio::test]
async fn test_rejected_token_is_replaced_and_request_retried_once() {
    let mut server = mockito::Server::new_async().await;
    let login = server
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_body_from_request(sequenced_body(
            r#"{"access_token":"tok1","expires_in":3600}"#,
            r#"{"access_token":"tok2","expires_in":3600}"#,
            1,
        ))
        .expect(2)
        .create_async()
        .await;
    let rejected = server
        .mock("GET", "/chart/5")
        .match_header("authorization", "Bearer tok1")
        .with_status(401)
        .with_body(r#"{"msg":"Token has been revoked"}"#)
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("GET", "/chart/5")
        .match_header("authorization", "Bearer tok2")
        .with_status(200)
        .with_body(r#"{"result":{"id":5}}"#)
        .expect(1)
        .create_async()
        .await;

    let ctx = wire(&server, EngineSettings::default());
    let response = ctx.gateway.get("/chart/5", None).await.unwrap();
    assert_eq!(response.body["result"]["id"], 5);

    let current = ctx.session.current().await.unwrap();
    assert_eq!(current.access_token(), "tok2");

    login.assert_async().await;
    rejected.assert_async().await;
    accepted.assert_async().await;
}

#[tokio::test]
async fn test_persistent_401_is_unauthorized_after_one_retry() {
    let mut server = mockito::Server::new_async().await;
    let _login = server
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_body(token_body("tok", 3600))
        .expect(2)
        .create_async()
        .await;
    let resource = server
        .mock("GET", "/dashboard/")
        .with_status(401)
        .with_body("nope")
        .expect(2)
        .create_async()
        .await;

    let ctx = wire(&server, EngineSettings::default());
    let err = assert_err!(ctx.gateway.get("/dashboard/", None).await);
    assert_eq!(err.kind(), "UNAUTHORIZED");
    assert_eq!(err.status(), Some(401));

    resource.assert_async().await;
}

#[tokio::test]
async fn test_expired_refresh_result_falls_back_to_login() {
    let mut server = mockito::Server::new_async().await;
    let login = server
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_body_from_request(sequenced_body(
            r#"{"access_token":"old","refresh_token":"r-old","expires_in":5}"#,
            r#"{"access_token":"new","refresh_token":"r-new","expires_in":3600}"#,
            1,
        ))
        .expect(2)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_body(r#"{"access_token":"dead","expires_in":0}"#)
        .expect(1)
        .create_async()
        .await;

    let ctx = wire(&server, EngineSettings::default());
    ctx.session.authenticate().await.unwrap();

    let token = ctx.session.get_valid_token().await.unwrap();
    assert_eq!(token.access_token(), "new");
    assert!(token.expires_at() > Utc::now());

    login.assert_async().await;
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_query_parameters_are_forwarded() {
    let mut server = mockito::Server::new_async().await;
    let _login = server
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_body(token_body("tok", 3600))
        .create_async()
        .await;
    let tables = server
        .mock("GET", "/database/1/tables/")
        .match_query(Matcher::UrlEncoded("q".into(), "(schema_name:public)".into()))
        .with_status(200)
        .with_body(r#"{"count":1,"result":[{"value":"orders"}]}"#)
        .expect(1)
        .create_async()
        .await;

    let ctx = wire(&server, EngineSettings::default());
    let query = vec![("q".to_string(), "(schema_name:public)".to_string())];
    let response = assert_ok!(ctx.gateway.get("/database/1/tables/", Some(&query)).await);
    assert_eq!(response.body["count"], 1);
    tables.assert_async().await;
}
