mod common;

use common::{chat_request, concat_content, get_request, sse_data_lines, TestApp};
use serde_json::{json, Value};

#[tokio::test]
async fn no_peer_with_auto_retry_off_rejects_immediately() {
    let mut config = common::test_config();
    config.enable_auto_retry = false;
    let app = TestApp::with_config(config);

    let (status, body) = app
        .request(chat_request(json!({
            "model": "m-text",
            "messages": [{"role": "user", "content": "hi"}],
        })))
        .await;
    assert_eq!(status, 503);
    let error: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(error["error"]["code"], "no_peer");
}

#[tokio::test]
async fn parked_request_completes_after_the_agent_connects() {
    let app = TestApp::new();

    let router = app.app.clone();
    let call = tokio::spawn(async move {
        use http_body_util::BodyExt;
        use tower::util::ServiceExt;
        let request = chat_request(json!({
            "model": "m-text",
            "stream": false,
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).to_string())
    });

    // Let the request park before any peer exists.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(app.state.pending.depth(), 1);

    let mut agent = app.connect_agent().await;
    let (request_id, _) = agent.next_task().await;
    agent.send_fragment(&request_id, "a0:\"ok\"").await;
    agent.send_fragment(&request_id, "ad:{}").await;
    agent.send_done(&request_id).await;

    let (status, body) = call.await.unwrap();
    assert_eq!(status, 200);
    let completion: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(completion["choices"][0]["message"]["content"], "ok");
}

#[tokio::test]
async fn parked_request_times_out_as_gateway_timeout() {
    let mut config = common::test_config();
    config.retry_timeout_seconds = 1;
    let app = TestApp::with_config(config);

    let (status, body) = app
        .request(chat_request(json!({
            "model": "m-text",
            "messages": [{"role": "user", "content": "hi"}],
        })))
        .await;
    assert_eq!(status, 504);
    let error: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(error["error"]["code"], "recovery_timeout");
}

#[tokio::test]
async fn disconnect_mid_stream_replays_on_the_new_peer() {
    let app = TestApp::new();
    let mut first = app.connect_agent().await;

    let router = app.app.clone();
    let call = tokio::spawn(async move {
        use http_body_util::BodyExt;
        use tower::util::ServiceExt;
        let request = chat_request(json!({
            "model": "m-text",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let response = router.oneshot(request).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&body).to_string()
    });

    let (request_id, _) = first.next_task().await;
    first.send_fragment(&request_id, "a0:\"par\"").await;
    first.disconnect().await;

    // The channel survives the outage and the new peer receives the same
    // request id to replay.
    let mut second = app.connect_agent().await;
    let (replayed_id, payload) = second.next_task().await;
    assert_eq!(replayed_id, request_id);
    assert_eq!(payload["session_id"], "test-session");

    second.send_fragment(&replayed_id, "a0:\"tial\"").await;
    second.send_fragment(&replayed_id, "ad:{}").await;
    second.send_done(&replayed_id).await;

    let body = call.await.unwrap();
    let lines = sse_data_lines(&body);
    assert_eq!(concat_content(&lines), "partial");
    assert_eq!(lines.last().map(String::as_str), Some("[DONE]"));
    assert_eq!(app.state.registry.len().await, 0);
}

#[tokio::test]
async fn disconnect_without_auto_retry_drains_the_stream() {
    let mut config = common::test_config();
    config.enable_auto_retry = false;
    let app = TestApp::with_config(config);
    let mut agent = app.connect_agent().await;

    let router = app.app.clone();
    let call = tokio::spawn(async move {
        use http_body_util::BodyExt;
        use tower::util::ServiceExt;
        let request = chat_request(json!({
            "model": "m-text",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let response = router.oneshot(request).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&body).to_string()
    });

    let (request_id, _) = agent.next_task().await;
    agent.send_fragment(&request_id, "a0:\"par\"").await;
    agent.disconnect().await;

    let body = call.await.unwrap();
    let lines = sse_data_lines(&body);
    let error_lines: Vec<&String> = lines
        .iter()
        .filter(|line| line.contains("\"error\""))
        .collect();
    assert_eq!(error_lines.len(), 1);
    assert_eq!(lines.last().map(String::as_str), Some("[DONE]"));
    common::wait_for_cleanup(&app).await;
}

#[tokio::test]
async fn interstitial_triggers_one_refresh_and_content_filter() {
    let app = TestApp::new();
    let mut agent = app.connect_agent().await;

    let router = app.app.clone();
    let call = tokio::spawn(async move {
        use http_body_util::BodyExt;
        use tower::util::ServiceExt;
        let request = chat_request(json!({
            "model": "m-text",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let response = router.oneshot(request).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&body).to_string()
    });

    let (request_id, _) = agent.next_task().await;
    agent
        .send_fragment(&request_id, "<title>Just a moment...</title>")
        .await;

    let body = call.await.unwrap();
    let lines = sse_data_lines(&body);
    let terminal: Value = serde_json::from_str(&lines[lines.len() - 2]).unwrap();
    assert_eq!(terminal["choices"][0]["finish_reason"], "content_filter");
    assert_eq!(lines.last().map(String::as_str), Some("[DONE]"));

    // Exactly one refresh command per detection, verifying flag set until the
    // next peer connects.
    assert_eq!(agent.next_command().await, "refresh");
    assert!(app.state.link.is_verifying());
    let _second = app.connect_agent().await;
    assert!(!app.state.link.is_verifying());
}

#[tokio::test]
async fn health_reports_peer_and_backlog_state() {
    let app = TestApp::new();
    let (status, body) = app.request(get_request("/health")).await;
    assert_eq!(status, 200);
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["peer_connected"], false);
    assert_eq!(health["in_flight"], 0);

    let _agent = app.connect_agent().await;
    let (_, body) = app.request(get_request("/health")).await;
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["peer_connected"], true);
}
