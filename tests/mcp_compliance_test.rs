//! Streamable HTTP compliance tests for the MCP façade
//!
//! Exercises the session lifecycle, protocol negotiation, batched bodies,
//! notifications, and the cancellation race end to end over the HTTP
//! surface.

use actix_web::{test, web, App};
use authbridge::config::Config;
use authbridge::server::{configure_routes, AppState};
use serde_json::{json, Value};
use std::time::Duration;

async fn test_state() -> web::Data<AppState> {
    let config = Config::default();
    web::Data::new(AppState::build(config).await.unwrap())
}

fn initialize_body(id: u64, protocol_version: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": protocol_version,
            "clientInfo": {"name": "t", "version": "0"}
        }
    })
}

/// Run an initialize round-trip and return (session_id, response body)
async fn initialize_session<S>(app: &S) -> (String, Value)
where
    S: actix_web::dev::Service<
        actix_http::Request,
        Response = actix_web::dev::ServiceResponse,
        Error = actix_web::Error,
    >,
{
    let req = test::TestRequest::post()
        .uri("/mcp")
        .set_json(initialize_body(1, "2025-06-18"))
        .to_request();
    let resp = test::call_service(app, req).await;
    assert!(resp.status().is_success());

    let session_id = resp
        .headers()
        .get("Mcp-Session-Id")
        .expect("Mcp-Session-Id header")
        .to_str()
        .unwrap()
        .to_string();
    let body: Value = test::read_body_json(resp).await;
    (session_id, body)
}

#[actix_web::test]
async fn test_happy_initialize() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let (session_id, body) = initialize_session(&app).await;

    assert_eq!(body["result"]["protocolVersion"], "2025-06-18");
    assert_eq!(body["result"]["capabilities"]["tools"]["listChanged"], true);
    assert_eq!(body["result"]["capabilities"]["resources"]["subscribe"], true);

    // Session id is a UUID
    assert!(uuid::Uuid::parse_str(&session_id).is_ok());
}

#[actix_web::test]
async fn test_unknown_protocol_version_negotiates_to_latest() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let req = test::TestRequest::post()
        .uri("/mcp")
        .set_json(initialize_body(1, "2099-01-01"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["result"]["protocolVersion"], "2025-06-18");
}

#[actix_web::test]
async fn test_missing_session_header_is_400() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let req = test::TestRequest::post()
        .uri("/mcp")
        .set_json(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], -32000);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Mcp-Session-Id required"));
}

#[actix_web::test]
async fn test_unknown_session_is_404_not_400() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let req = test::TestRequest::post()
        .uri("/mcp")
        .insert_header(("Mcp-Session-Id", "3f2e08a4-0000-0000-0000-000000000000"))
        .set_json(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("Invalid session"));
}

#[actix_web::test]
async fn test_tools_list_and_call() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let (session_id, _) = initialize_session(&app).await;

    let req = test::TestRequest::post()
        .uri("/mcp")
        .insert_header(("Mcp-Session-Id", session_id.clone()))
        .set_json(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    let tools = body["result"]["tools"].as_array().unwrap();
    assert!(tools.iter().any(|t| t["name"] == "echo"));

    let req = test::TestRequest::post()
        .uri("/mcp")
        .insert_header(("Mcp-Session-Id", session_id))
        .set_json(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"message": "round trip"}}
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["result"]["isError"], false);
    assert_eq!(body["result"]["content"][0]["text"], "round trip");
}

#[actix_web::test]
async fn test_tool_call_with_invalid_input() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let (session_id, _) = initialize_session(&app).await;

    let req = test::TestRequest::post()
        .uri("/mcp")
        .insert_header(("Mcp-Session-Id", session_id))
        .set_json(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"message": 7}}
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;

    assert_eq!(body["result"]["isError"], true);
    assert!(body["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .starts_with("Invalid input:"));
}

#[actix_web::test]
async fn test_cancellation_race() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let (session_id, _) = initialize_session(&app).await;

    let call_req = test::TestRequest::post()
        .uri("/mcp")
        .insert_header(("Mcp-Session-Id", session_id.clone()))
        .set_json(json!({
            "jsonrpc": "2.0",
            "id": 42,
            "method": "tools/call",
            "params": {"name": "wait", "arguments": {"duration_ms": 2000}}
        }))
        .to_request();

    let call_future = test::call_service(&app, call_req);
    let cancel_future = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let cancel_req = test::TestRequest::post()
            .uri("/mcp")
            .insert_header(("Mcp-Session-Id", session_id.clone()))
            .set_json(json!({
                "jsonrpc": "2.0",
                "method": "notifications/cancelled",
                "params": {"requestId": 42, "reason": "abort"}
            }))
            .to_request();
        test::call_service(&app, cancel_req).await
    };

    let (call_resp, cancel_resp) = futures_util::join!(call_future, cancel_future);

    // The notification is acknowledged without a JSON-RPC response
    assert_eq!(cancel_resp.status(), 202);

    let body: Value = test::read_body_json(call_resp).await;
    assert_eq!(body["error"]["code"], -32603);
    assert_eq!(body["error"]["message"], "Request was cancelled");
}

#[actix_web::test]
async fn test_cancel_unknown_request_is_accepted() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let (session_id, _) = initialize_session(&app).await;

    let req = test::TestRequest::post()
        .uri("/mcp")
        .insert_header(("Mcp-Session-Id", session_id))
        .set_json(json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": {"requestId": 999, "reason": "nothing there"}
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 202);
}

#[actix_web::test]
async fn test_batch_dispatch() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let (session_id, _) = initialize_session(&app).await;

    let req = test::TestRequest::post()
        .uri("/mcp")
        .insert_header(("Mcp-Session-Id", session_id))
        .set_json(json!([
            {"jsonrpc": "2.0", "id": 10, "method": "ping"},
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
            {"jsonrpc": "2.0", "id": 11, "method": "tools/list"}
        ]))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body: Value = test::read_body_json(resp).await;
    let responses = body.as_array().unwrap();
    // The notification contributes no response
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["id"], 10);
    assert_eq!(responses[1]["id"], 11);
}

#[actix_web::test]
async fn test_logging_set_level_validation() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let (session_id, _) = initialize_session(&app).await;

    let req = test::TestRequest::post()
        .uri("/mcp")
        .insert_header(("Mcp-Session-Id", session_id.clone()))
        .set_json(json!({
            "jsonrpc": "2.0", "id": 5, "method": "logging/setLevel",
            "params": {"level": "warning"}
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].is_null());

    let req = test::TestRequest::post()
        .uri("/mcp")
        .insert_header(("Mcp-Session-Id", session_id))
        .set_json(json!({
            "jsonrpc": "2.0", "id": 6, "method": "logging/setLevel",
            "params": {"level": "chatty"}
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], -32602);
}

#[actix_web::test]
async fn test_method_not_found() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let (session_id, _) = initialize_session(&app).await;

    let req = test::TestRequest::post()
        .uri("/mcp")
        .insert_header(("Mcp-Session-Id", session_id))
        .set_json(json!({"jsonrpc": "2.0", "id": 9, "method": "tools/destroy"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], -32601);
}

#[actix_web::test]
async fn test_session_delete_then_404() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let (session_id, _) = initialize_session(&app).await;

    let req = test::TestRequest::delete()
        .uri("/mcp")
        .insert_header(("Mcp-Session-Id", session_id.clone()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    // A once-valid but now-deleted session reads as 404, not 400
    let req = test::TestRequest::post()
        .uri("/mcp")
        .insert_header(("Mcp-Session-Id", session_id))
        .set_json(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn test_get_without_session_header_is_405() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let req = test::TestRequest::get().uri("/mcp").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);
}

#[actix_web::test]
async fn test_delete_without_session_header_is_400() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let req = test::TestRequest::delete().uri("/mcp").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn test_protocol_version_header_rejection() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let req = test::TestRequest::post()
        .uri("/mcp")
        .insert_header(("Mcp-Protocol-Version", "1999-01-01"))
        .set_json(initialize_body(1, "2025-06-18"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
    assert!(resp.headers().contains_key("WWW-Authenticate"));
    assert!(resp.headers().contains_key("Mcp-Session-Id"));
}

#[actix_web::test]
async fn test_health_endpoint() {
    let state = test_state().await;
    let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
}
