//! Outbound Bot API client tests against a mock HTTP server.

use brewva_channels::telegram::api::TelegramApi;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn send_posts_params_verbatim_and_returns_message_id() {
    let server = MockServer::start().await;
    let params = serde_json::json!({ "chat_id": "12345", "text": "hello" });

    Mock::given(method("POST"))
        .and(path("/botbot-token/sendMessage"))
        .and(body_json(&params))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "result": { "message_id": 333 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = TelegramApi::with_base_url(server.uri(), "bot-token");
    let outcome = api.send("sendMessage", params).await.unwrap();
    assert_eq!(outcome.provider_message_id, Some(333));
}

#[tokio::test]
async fn send_without_message_id_in_result_is_still_ok() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/botbot-token/setMyCommands"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "result": true
        })))
        .mount(&server)
        .await;

    let api = TelegramApi::with_base_url(server.uri(), "bot-token");
    let outcome = api
        .send("setMyCommands", serde_json::json!({ "commands": [] }))
        .await
        .unwrap();
    assert_eq!(outcome.provider_message_id, None);
}

#[tokio::test]
async fn api_level_failure_maps_to_stable_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/botbot-token/sendMessage"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "ok": false,
            "error_code": 400,
            "description": "Bad Request: chat not found"
        })))
        .mount(&server)
        .await;

    let api = TelegramApi::with_base_url(server.uri(), "bot-token");
    let err = api
        .send("sendMessage", serde_json::json!({ "chat_id": "0", "text": "x" }))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "telegram_api_error:400:Bad Request: chat not found"
    );
}

#[tokio::test]
async fn ok_false_with_success_status_still_fails() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/botbot-token/sendMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests"
        })))
        .mount(&server)
        .await;

    let api = TelegramApi::with_base_url(server.uri(), "bot-token");
    let err = api
        .send("sendMessage", serde_json::json!({ "chat_id": "1", "text": "x" }))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "telegram_api_error:429:Too Many Requests");
}

#[tokio::test]
async fn send_message_wraps_send() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/botbot-token/sendMessage"))
        .and(body_json(
            &serde_json::json!({ "chat_id": "42", "text": "reply" }),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "result": { "message_id": 7 }
        })))
        .mount(&server)
        .await;

    let api = TelegramApi::with_base_url(server.uri(), "bot-token");
    let outcome = api.send_message("42", "reply").await.unwrap();
    assert_eq!(outcome.provider_message_id, Some(7));
}
