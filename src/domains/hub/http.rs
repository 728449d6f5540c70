use super::protocol::ManagementFrame;
use super::Hub;
use crate::util::secret::constant_time_eq;
use http_body_util::BodyExt;
use hyper::body::Incoming as IncomingBody;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;

const SECRET_HEADER: &str = "x-hydra-secret";

fn json_response(status: StatusCode, body: Value) -> Response<String> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(body.to_string())
        .unwrap_or_else(|_| Response::new(String::new()))
}

/// Handle one HTTP/1 request on the management listener (`P+2`): the State
/// Hook Endpoint's `/set-state/<branchName>` route plus the `/ch-*` side-effect
/// routes (SPEC_FULL.md §4.5, §4.6). The caller (`main.rs`) demultiplexes
/// WebSocket upgrade requests to the management socket before this is
/// reached; everything else on this listener is plain HTTP/1, routed by
/// `(Method, path)`.
pub async fn handle_one(req: Request<IncomingBody>, hub: Arc<Hub>) -> Result<Response<String>, Infallible> {
    let presented = req
        .headers()
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !constant_time_eq(presented, &hub.hook_secret) {
        return Ok(json_response(StatusCode::FORBIDDEN, json!({ "error": "AuthFailure" })));
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Ok(json_response(StatusCode::BAD_REQUEST, json!({ "error": "invalid body" }))),
    };

    if method != Method::POST {
        return Ok(json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" })));
    }

    if let Some(branch_name) = path.strip_prefix("/set-state/") {
        return Ok(handle_set_state(&hub, branch_name, &body_bytes));
    }

    match path.as_str() {
        "/ch/close-tab" => Ok(handle_close_tab(&hub, &body_bytes)),
        "/ch/waituser" => Ok(handle_waituser(&hub, &body_bytes)),
        "/ch/openurl" => Ok(handle_openurl(&hub, &body_bytes)),
        _ => Ok(json_response(StatusCode::NOT_FOUND, json!({ "error": "not found" }))),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetStateBody {
    state: String,
    repo_hash: String,
}

/// `POST /set-state/<branchName>` — the agent-invoked hook script's notify
/// call (SPEC_FULL.md §4.6). Never panics on malformed input: responds 400
/// and moves on (SPEC_FULL.md §7). No live socket for the addressed branch
/// is a 404 — updates are never buffered for a later reconnect (see
/// DESIGN.md's resolution of the corresponding open question).
fn handle_set_state(hub: &Hub, branch_name: &str, body: &[u8]) -> Response<String> {
    let branch_name = urlencoding::decode(branch_name).map(|s| s.into_owned()).unwrap_or_else(|_| branch_name.to_string());
    let parsed: SetStateBody = match serde_json::from_slice(body) {
        Ok(b) => b,
        Err(_) => return json_response(StatusCode::BAD_REQUEST, json!({ "error": "malformed set-state body" })),
    };

    let delivered = match parsed.state.as_str() {
        "ready" => hub.send_ready_state_with_git_status(&parsed.repo_hash, &branch_name),
        "running" => hub.send_state_update(&parsed.repo_hash, &branch_name, "running"),
        other => {
            return json_response(StatusCode::BAD_REQUEST, json!({ "error": format!("unknown state '{other}'") }));
        }
    };

    if delivered {
        json_response(StatusCode::OK, json!({ "ok": true }))
    } else {
        json_response(StatusCode::NOT_FOUND, json!({ "error": "no live socket for that branch" }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddressedBody {
    repo_hash: String,
    branch_name: String,
}

fn delivery_response(delivered: bool) -> Response<String> {
    if delivered {
        json_response(StatusCode::OK, json!({ "ok": true }))
    } else {
        json_response(StatusCode::NOT_FOUND, json!({ "error": "no live management socket for that branch" }))
    }
}

fn handle_close_tab(hub: &Hub, body: &[u8]) -> Response<String> {
    let Ok(parsed) = serde_json::from_slice::<AddressedBody>(body) else {
        return json_response(StatusCode::BAD_REQUEST, json!({ "error": "malformed body" }));
    };
    delivery_response(hub.send_management_event(&parsed.repo_hash, &parsed.branch_name, ManagementFrame::CloseTab))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaituserBody {
    repo_hash: String,
    branch_name: String,
    text: String,
    commandline: String,
}

fn handle_waituser(hub: &Hub, body: &[u8]) -> Response<String> {
    let Ok(parsed) = serde_json::from_slice::<WaituserBody>(body) else {
        return json_response(StatusCode::BAD_REQUEST, json!({ "error": "malformed body" }));
    };
    delivery_response(hub.send_management_event(
        &parsed.repo_hash,
        &parsed.branch_name,
        ManagementFrame::Waituser { text: parsed.text, commandline: parsed.commandline },
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenurlBody {
    repo_hash: String,
    branch_name: String,
    url: String,
}

fn handle_openurl(hub: &Hub, body: &[u8]) -> Response<String> {
    let Ok(parsed) = serde_json::from_slice::<OpenurlBody>(body) else {
        return json_response(StatusCode::BAD_REQUEST, json!({ "error": "malformed body" }));
    };
    delivery_response(hub.send_management_event(&parsed.repo_hash, &parsed.branch_name, ManagementFrame::Openurl { url: parsed.url }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sessions::Registry;
    use std::path::PathBuf;

    fn test_hub() -> Hub {
        Hub::new(
            Arc::new(Registry::new("hydra-server-test")),
            "secret1234567890".to_string(),
            PathBuf::from("agent"),
            vec![],
            "http://127.0.0.1:1".to_string(),
        )
    }

    #[test]
    fn set_state_rejects_unknown_state_values() {
        let hub = test_hub();
        let body = br#"{"state":"sleeping","repoHash":"abcd1234"}"#;
        let response = handle_set_state(&hub, "feat", body);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn set_state_returns_not_found_with_no_live_socket() {
        let hub = test_hub();
        let body = br#"{"state":"running","repoHash":"abcd1234"}"#;
        let response = handle_set_state(&hub, "feat", body);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn close_tab_rejects_malformed_body() {
        let hub = test_hub();
        let response = handle_close_tab(&hub, b"not json");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
