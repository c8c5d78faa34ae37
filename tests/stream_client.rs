//! Integration tests for the HTTP stream client using wiremock.

use async_trait::async_trait;
use std::time::Duration;
use streamchat_lib::api::{ChatStreamClient, GenerationOptions, HttpStreamClient};
use streamchat_lib::models::{ChatTurn, Role};
use streamchat_lib::stream::{StreamError, StreamHandler, StreamOutcome};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Delta(String),
    Done,
    Error(String),
}

#[derive(Default)]
struct Recorder {
    calls: Vec<Call>,
}

#[async_trait]
impl StreamHandler for Recorder {
    async fn on_delta(&mut self, delta: &str) {
        self.calls.push(Call::Delta(delta.to_string()));
    }
    async fn on_done(&mut self) {
        self.calls.push(Call::Done);
    }
    async fn on_error(&mut self, message: &str) {
        self.calls.push(Call::Error(message.to_string()));
    }
}

fn history() -> Vec<ChatTurn> {
    vec![
        ChatTurn::new(Role::System, "be brief"),
        ChatTurn::new(Role::User, "Hello"),
    ]
}

fn ndjson(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "application/x-ndjson")
}

async fn stream(
    client: &HttpStreamClient,
    cancel: &CancellationToken,
) -> (Result<StreamOutcome, StreamError>, Vec<Call>) {
    let mut recorder = Recorder::default();
    let result = client
        .stream_chat_completion(&history(), cancel, &mut recorder)
        .await;
    (result, recorder.calls)
}

#[tokio::test]
async fn posts_history_and_streams_deltas() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat/stream"))
        .and(header("content-type", "application/json"))
        .and(body_json(serde_json::json!({
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "Hello" }
            ]
        })))
        .respond_with(ndjson(
            "{\"delta\":\"Hi\"}\n{\"delta\":\" there\"}\n{\"done\":true}\n",
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = HttpStreamClient::new(mock_server.uri());
    let (result, calls) = stream(&client, &CancellationToken::new()).await;

    assert_eq!(result.expect("stream should succeed"), StreamOutcome::Completed);
    assert_eq!(
        calls,
        vec![
            Call::Delta("Hi".into()),
            Call::Delta(" there".into()),
            Call::Done
        ]
    );
}

#[tokio::test]
async fn sends_generation_options_when_set() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat/stream"))
        .and(body_json(serde_json::json!({
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "Hello" }
            ],
            "temperature": 0.5,
            "top_p": 0.25
        })))
        .respond_with(ndjson("{\"done\":true}\n"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = HttpStreamClient::new(format!("{}/", mock_server.uri())).options(
        GenerationOptions {
            temperature: Some(0.5),
            top_p: Some(0.25),
        },
    );
    let (result, calls) = stream(&client, &CancellationToken::new()).await;
    assert_eq!(result.unwrap(), StreamOutcome::Completed);
    assert_eq!(calls, vec![Call::Done]);
}

#[tokio::test]
async fn malformed_lines_and_error_records_do_not_stop_the_stream() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat/stream"))
        .respond_with(ndjson(
            "{\"delta\":\"a\"}\nnot json\n{\"error\":\"upstream hiccup\"}\n{\"delta\":\"b\"}\n",
        ))
        .mount(&mock_server)
        .await;

    let client = HttpStreamClient::new(mock_server.uri());
    let (result, calls) = stream(&client, &CancellationToken::new()).await;

    // no done record: end of body completes the stream
    assert_eq!(result.unwrap(), StreamOutcome::Completed);
    assert_eq!(
        calls,
        vec![
            Call::Delta("a".into()),
            Call::Error("upstream hiccup".into()),
            Call::Delta("b".into()),
            Call::Done
        ]
    );
}

#[tokio::test]
async fn error_status_carries_response_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat/stream"))
        .respond_with(ResponseTemplate::new(400).set_body_string("messages[] is required"))
        .mount(&mock_server)
        .await;

    let client = HttpStreamClient::new(mock_server.uri());
    let (result, calls) = stream(&client, &CancellationToken::new()).await;

    match result {
        Err(StreamError::Request { status, message }) => {
            assert_eq!(status, Some(400));
            assert_eq!(message, "messages[] is required");
        }
        other => panic!("expected request error, got {:?}", other),
    }
    assert!(calls.is_empty());
}

#[tokio::test]
async fn error_status_without_body_uses_status_message() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat/stream"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let client = HttpStreamClient::new(mock_server.uri());
    let (result, calls) = stream(&client, &CancellationToken::new()).await;

    let err = result.expect_err("503 should fail");
    assert!(matches!(err, StreamError::Request { status: Some(503), .. }));
    assert_eq!(err.to_string(), "Request failed (503)");
    assert!(calls.is_empty());
}

#[tokio::test]
async fn cancelled_before_start_sends_nothing() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat/stream"))
        .respond_with(ndjson("{\"delta\":\"a\"}\n{\"done\":true}\n"))
        .expect(0)
        .mount(&mock_server)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let client = HttpStreamClient::new(mock_server.uri());
    let (result, calls) = stream(&client, &cancel).await;

    assert_eq!(result.unwrap(), StreamOutcome::Cancelled);
    assert!(calls.is_empty());
}

#[tokio::test]
async fn cancel_aborts_a_slow_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat/stream"))
        .respond_with(ndjson("{\"delta\":\"late\"}\n").set_delay(Duration::from_secs(30)))
        .mount(&mock_server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let client = HttpStreamClient::new(mock_server.uri());
    let (result, calls) = tokio::time::timeout(Duration::from_secs(5), stream(&client, &cancel))
        .await
        .expect("cancellation should end the request promptly");

    assert_eq!(result.unwrap(), StreamOutcome::Cancelled);
    assert!(calls.is_empty());
}

#[tokio::test]
async fn unreachable_backend_is_a_transport_error() {
    // Nothing listens on the discard port
    let client = HttpStreamClient::new("http://127.0.0.1:9");
    let (result, calls) = stream(&client, &CancellationToken::new()).await;

    assert!(matches!(result, Err(StreamError::Transport(_))));
    assert!(calls.is_empty());
}
