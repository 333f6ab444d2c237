//! MCP server integration tests over an in-memory duplex pipe.

use std::sync::Arc;
use std::time::Duration;

use mockito::Matcher;
use serde_json::{json, Value};
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};
use tokio::task::JoinHandle;

use super::harness::{platform, settings, Platform, CSRF_TOKEN};
use analytics_mcp::error::Result;
use analytics_mcp::mcp::McpServer;
use analytics_mcp::tools::{Tool, ToolContext, ToolDefinition, ToolError, ToolRegistry};
use async_trait::async_trait;

/// Host side of a running server.
struct Host {
    writer: WriteHalf<DuplexStream>,
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    server: JoinHandle<Result<()>>,
}

impl Host {
    fn start(p: &Platform) -> Self {
        Self::start_with(ToolRegistry::with_defaults(), p)
    }

    fn start_with(registry: ToolRegistry, p: &Platform) -> Self {
        let (host, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let server = McpServer::new(Arc::new(registry), p.context.clone());
        let server = tokio::spawn(async move { server.serve(server_read, server_write).await });

        let (host_read, writer) = tokio::io::split(host);
        Self {
            writer,
            lines: BufReader::new(host_read).lines(),
            server,
        }
    }

    async fn send(&mut self, message: Value) {
        self.send_raw(&message.to_string()).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("no response within 5s")
            .unwrap()
            .expect("server closed the pipe");
        serde_json::from_str(&line).unwrap()
    }

    async fn request(&mut self, id: u64, method: &str, params: Value) -> Value {
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        let response = self.recv().await;
        assert_eq!(response["id"], id);
        response
    }

    /// Closes the host's end and waits for the server to finish.
    async fn close(mut self) {
        self.writer.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn tool_payload(response: &Value) -> (Value, bool) {
    let result = &response["result"];
    let text = result["content"][0]["text"].as_str().unwrap();
    (
        serde_json::from_str(text).unwrap(),
        result["isError"].as_bool().unwrap(),
    )
}

#[tokio::test]
async fn test_initialize_and_list_tools() {
    let p = platform(settings()).await;
    let mut host = Host::start(&p);

    let init = host
        .request(1, "initialize", json!({"protocolVersion": "2024-11-05", "capabilities": {}}))
        .await;
    assert_eq!(init["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(init["result"]["serverInfo"]["name"], "analytics-mcp");

    host.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await;

    let list = host.request(2, "tools/list", json!({})).await;
    let names: Vec<&str> = list["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"analytics_sqllab_execute_query"));
    assert!(names.contains(&"analytics_auth_authenticate"));
    assert!(names.contains(&"analytics_dashboard_list"));
    let execute = &list["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["name"] == "analytics_sqllab_execute_query")
        .unwrap()["inputSchema"];
    assert_eq!(execute["required"], json!(["sql", "database_id"]));

    host.close().await;
}

#[tokio::test]
async fn test_protocol_errors() {
    let p = platform(settings()).await;
    let mut host = Host::start(&p);

    host.send_raw("{this is not json").await;
    let parse = host.recv().await;
    assert_eq!(parse["error"]["code"], -32700);
    assert_eq!(parse["id"], Value::Null);

    let unknown = host.request(3, "resources/list", json!({})).await;
    assert_eq!(unknown["error"]["code"], -32601);

    let pong = host.request(4, "ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));

    host.close().await;
}

#[tokio::test]
async fn test_tool_failures_are_error_results() {
    let p = platform(settings()).await;
    let mut host = Host::start(&p);

    let response = host
        .request(5, "tools/call", json!({"name": "no_such_tool", "arguments": {}}))
        .await;
    let (payload, is_error) = tool_payload(&response);
    assert!(is_error);
    assert_eq!(payload["kind"], "UNKNOWN_TOOL");

    let response = host
        .request(
            6,
            "tools/call",
            json!({"name": "analytics_sqllab_execute_query", "arguments": {"sql": "SELECT 1"}}),
        )
        .await;
    let (payload, is_error) = tool_payload(&response);
    assert!(is_error);
    assert_eq!(payload["kind"], "INVALID_ARGUMENTS");

    host.close().await;
}

#[tokio::test]
async fn test_execute_query_tool() {
    let mut p = platform(settings()).await;
    let _execute = p
        .server
        .mock("POST", "/sqllab/execute")
        .with_status(200)
        .with_body(r#"{"query_id":21,"status":"success"}"#)
        .create_async()
        .await;
    let _status = p
        .server
        .mock("GET", "/sqllab/query/21")
        .with_status(200)
        .with_body(r#"{"status":"success"}"#)
        .create_async()
        .await;
    let _results = p
        .server
        .mock("GET", "/sqllab/results/21")
        .with_status(200)
        .with_body(r#"{"result":{"columns":["n"],"data":[[1]]}}"#)
        .create_async()
        .await;

    let mut host = Host::start(&p);
    let response = host
        .request(
            7,
            "tools/call",
            json!({
                "name": "analytics_sqllab_execute_query",
                "arguments": {"sql": "SELECT 1 AS n", "database_id": 1}
            }),
        )
        .await;
    let (payload, is_error) = tool_payload(&response);
    assert!(!is_error);
    assert_eq!(payload["query_id"], "21");
    assert_eq!(payload["state"], "SUCCESS");
    assert_eq!(payload["rows"], json!([[1]]));
    assert_eq!(payload["row_count"], 1);

    host.close().await;
}

#[tokio::test]
async fn test_platform_errors_carry_details() {
    let mut p = platform(settings()).await;
    let _dashboard = p
        .server
        .mock("GET", "/dashboard/404")
        .with_status(404)
        .with_body(r#"{"message":"Not found"}"#)
        .create_async()
        .await;

    let mut host = Host::start(&p);
    let response = host
        .request(
            8,
            "tools/call",
            json!({"name": "analytics_dashboard_get_by_id", "arguments": {"dashboard_id": 404}}),
        )
        .await;
    let (payload, is_error) = tool_payload(&response);
    assert!(is_error);
    assert_eq!(payload["kind"], "NOT_FOUND");
    assert_eq!(payload["details"]["status"], 404);

    host.close().await;
}

#[tokio::test]
async fn test_cancelled_call_stops_query_without_responding() {
    let mut p = platform(settings()).await;
    let _status = p
        .server
        .mock("GET", "/sqllab/query/long")
        .with_status(200)
        .with_body(r#"{"status":"running"}"#)
        .create_async()
        .await;
    let stop = p
        .server
        .mock("POST", "/sqllab/stop/long")
        .with_status(200)
        .with_body("{}")
        .expect(1)
        .create_async()
        .await;

    let mut host = Host::start(&p);
    host.send(json!({
        "jsonrpc": "2.0",
        "id": 10,
        "method": "tools/call",
        "params": {
            "name": "analytics_sqllab_await_query",
            "arguments": {"query_id": "long", "timeout_secs": 30}
        }
    }))
    .await;
    host.send(json!({
        "jsonrpc": "2.0",
        "method": "notifications/cancelled",
        "params": {"requestId": 10, "reason": "user aborted"}
    }))
    .await;

    // The next response belongs to the ping, not the cancelled call.
    let pong = host.request(11, "ping", json!({})).await;
    assert_eq!(pong["id"], 11);

    host.close().await;
    stop.assert_async().await;
}

#[tokio::test]
async fn test_auth_tools() {
    let p = platform(settings()).await;
    let mut host = Host::start(&p);

    let call = |id: u64, name: &str| {
        json!({"jsonrpc": "2.0", "id": id, "method": "tools/call",
               "params": {"name": name, "arguments": {}}})
    };

    host.send(call(20, "analytics_auth_status")).await;
    let (status, _) = tool_payload(&host.recv().await);
    assert_eq!(status["authenticated"], false);
    assert_eq!(status["username"], "admin");

    host.send(call(21, "analytics_auth_authenticate")).await;
    let (login, is_error) = tool_payload(&host.recv().await);
    assert!(!is_error);
    assert_eq!(login["authenticated"], true);

    host.send(call(22, "analytics_auth_status")).await;
    let (status, _) = tool_payload(&host.recv().await);
    assert_eq!(status["authenticated"], true);

    host.send(call(23, "analytics_auth_logout")).await;
    let (logout, _) = tool_payload(&host.recv().await);
    assert_eq!(logout["logged_out"], true);
    assert!(p.context.session.current().await.is_none());

    host.close().await;
}

struct Explodes;

#[async_trait]
impl Tool for Explodes {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "explodes".to_string(),
            description: "Always panics.".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, _ctx: &ToolContext, _args: Value) -> std::result::Result<Value, ToolError> {
        panic!("tool blew up");
    }
}

#[tokio::test]
async fn test_panicking_tool_gets_internal_error() {
    let p = platform(settings()).await;
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(Explodes));
    let mut host = Host::start_with(registry, &p);

    let response = host
        .request(30, "tools/call", json!({"name": "explodes", "arguments": {}}))
        .await;
    assert_eq!(response["error"]["code"], -32603);
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("tool blew up"));

    // The server keeps serving after the panic.
    let pong = host.request(31, "ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));

    host.close().await;
}

#[tokio::test]
async fn test_await_with_huge_timeout_is_clamped() {
    let mut p = platform(settings()).await;
    let _status = p
        .server
        .mock("GET", "/sqllab/query/q1")
        .with_status(200)
        .with_body(r#"{"status":"success"}"#)
        .create_async()
        .await;

    let mut host = Host::start(&p);
    let response = host
        .request(
            32,
            "tools/call",
            json!({
                "name": "analytics_sqllab_await_query",
                "arguments": {"query_id": "q1", "timeout_secs": 1e20}
            }),
        )
        .await;
    let (payload, is_error) = tool_payload(&response);
    assert!(!is_error);
    assert_eq!(payload["state"], "SUCCESS");

    host.close().await;
}

#[tokio::test]
async fn test_format_and_export_tools() {
    let mut p = platform(settings()).await;
    let format = p
        .server
        .mock("POST", "/sqllab/format_sql")
        .match_header("x-csrftoken", CSRF_TOKEN)
        .match_body(Matcher::PartialJson(json!({"sql": "select 1"})))
        .with_status(200)
        .with_body(r#"{"result":"SELECT\n  1"}"#)
        .expect(1)
        .create_async()
        .await;
    let _export = p
        .server
        .mock("GET", "/sqllab/export/abc")
        .with_status(200)
        .with_header("content-type", "text/csv")
        .with_body("n\n1\n")
        .create_async()
        .await;

    let mut host = Host::start(&p);
    let response = host
        .request(
            40,
            "tools/call",
            json!({"name": "analytics_sqllab_format_sql", "arguments": {"sql": "select 1"}}),
        )
        .await;
    let (payload, is_error) = tool_payload(&response);
    assert!(!is_error);
    assert_eq!(payload["result"], "SELECT\n  1");

    let response = host
        .request(
            41,
            "tools/call",
            json!({
                "name": "analytics_sqllab_export_query_results",
                "arguments": {"client_id": "abc"}
            }),
        )
        .await;
    let (payload, is_error) = tool_payload(&response);
    assert!(!is_error);
    assert_eq!(payload, json!("n\n1\n"));

    host.close().await;
    format.assert_async().await;
}
