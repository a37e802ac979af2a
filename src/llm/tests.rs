use super::*;
use crate::llm::openai::{AzureKeyAuth, AzureRequestCustomizer};
use crate::llm::recording::PlaybackState;
use anyhow::Result;
use axum::extract::{Json, Path, RawQuery};
use axum::http::{HeaderMap, StatusCode};
use axum::{routing::post, Router};
use bytes::Bytes;
use futures::stream;
use serde_json::json;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

// Request as seen by the mock server
#[derive(Debug, Clone)]
struct CapturedRequest {
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: serde_json::Value,
}

type MockResponse = (StatusCode, Vec<Vec<u8>>);

struct MockServer {
    base_url: String,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl MockServer {
    fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

// Serves the responses in order, repeating the last one once exhausted
async fn start_mock_server(responses: Vec<MockResponse>) -> MockServer {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let responses = Arc::new(Mutex::new(VecDeque::from(responses)));

    let captured = requests.clone();
    let app = Router::new().route(
        "/*path",
        post(
            move |Path(path): Path<String>,
                  RawQuery(query): RawQuery,
                  headers: HeaderMap,
                  Json(body): Json<serde_json::Value>| {
                let captured = captured.clone();
                let responses = responses.clone();
                async move {
                    captured.lock().unwrap().push(CapturedRequest {
                        path: format!("/{path}"),
                        query,
                        headers,
                        body,
                    });

                    let (status, parts) = {
                        let mut responses = responses.lock().unwrap();
                        if responses.len() > 1 {
                            responses.pop_front().unwrap()
                        } else {
                            responses.front().cloned().unwrap()
                        }
                    };
                    let content_type = if status.is_success() {
                        "text/event-stream"
                    } else {
                        "application/json"
                    };
                    let stream = stream::iter(
                        parts
                            .into_iter()
                            .map(|part| Ok::<_, std::io::Error>(Bytes::from(part))),
                    );

                    axum::response::Response::builder()
                        .status(status)
                        .header("content-type", content_type)
                        .body(axum::body::Body::from_stream(stream))
                        .unwrap()
                }
            },
        ),
    );

    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = TcpListener::bind(addr).await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockServer {
        base_url: format!("http://{}", server_addr),
        requests,
    }
}

// SSE body for the given events, cut into small pieces so that lines span
// several network chunks
fn sse_body(events: &[serde_json::Value]) -> Vec<Vec<u8>> {
    let mut body = String::new();
    for event in events {
        body.push_str(&format!("data: {}\n\n", event));
    }
    body.push_str("data: [DONE]\n\n");
    body.into_bytes().chunks(17).map(<[u8]>::to_vec).collect()
}

fn text_events() -> Vec<serde_json::Value> {
    vec![
        json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}, "finish_reason": null}]}),
        json!({"choices": [{"index": 0, "delta": {"content": "Hello"}, "finish_reason": null}]}),
        json!({"choices": [{"index": 0, "delta": {"content": " world"}, "finish_reason": null}]}),
        json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
    ]
}

fn request(model: &str) -> ChatRequest {
    ChatRequest {
        model: model.to_string(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: Some("Hello".to_string()),
            name: None,
            function_call: None,
        }],
        functions: Some(vec![FunctionDefinition {
            name: "execute_code".to_string(),
            description: "Run code".to_string(),
            parameters: json!({"type": "object"}),
        }]),
    }
}

async fn collect_chunks(stream: &mut Box<dyn ChunkStream>) -> Result<Vec<ChatChunk>> {
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next_chunk().await? {
        chunks.push(chunk);
    }
    Ok(chunks)
}

fn content_of(chunks: &[ChatChunk]) -> String {
    chunks
        .iter()
        .filter_map(|c| c.first_choice().and_then(|choice| choice.delta.content.clone()))
        .collect()
}

#[tokio::test]
async fn test_openai_streaming_request() -> Result<()> {
    let server = start_mock_server(vec![(StatusCode::OK, sse_body(&text_events()))]).await;
    let client = OpenAIClient::new("test-key".to_string(), server.base_url.clone());

    let mut stream = client.stream_chat(request("gpt-4")).await?;
    let chunks = collect_chunks(&mut stream).await?;

    assert_eq!(chunks.len(), 4);
    assert_eq!(content_of(&chunks), "Hello world");
    assert_eq!(
        chunks[3].choices[0].finish_reason,
        Some(FinishReason::Stop)
    );

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let captured = &requests[0];
    assert_eq!(captured.path, "/chat/completions");
    assert_eq!(
        captured.headers.get("authorization").unwrap().to_str()?,
        "Bearer test-key"
    );
    assert_eq!(captured.body["model"], "gpt-4");
    assert_eq!(captured.body["stream"], true);
    assert_eq!(captured.body["messages"][0]["content"], "Hello");
    assert_eq!(captured.body["functions"][0]["name"], "execute_code");
    Ok(())
}

#[tokio::test]
async fn test_azure_deployment_request() -> Result<()> {
    let server = start_mock_server(vec![(StatusCode::OK, sse_body(&text_events()))]).await;
    let client = OpenAIClient::with_customization(
        server.base_url.clone(),
        Box::new(AzureKeyAuth::new("azure-key".to_string())),
        Box::new(AzureRequestCustomizer::new("2023-07-01-preview".to_string())),
    );

    let mut stream = client.stream_chat(request("gpt4-deployment")).await?;
    assert_eq!(content_of(&collect_chunks(&mut stream).await?), "Hello world");

    let captured = &server.requests()[0];
    assert_eq!(
        captured.path,
        "/openai/deployments/gpt4-deployment/chat/completions"
    );
    assert_eq!(captured.query.as_deref(), Some("api-version=2023-07-01-preview"));
    assert_eq!(captured.headers.get("api-key").unwrap().to_str()?, "azure-key");
    assert!(captured.headers.get("authorization").is_none());
    assert!(captured.body.get("model").is_none());
    Ok(())
}

#[tokio::test]
async fn test_function_call_fragments_are_streamed() -> Result<()> {
    let events = vec![
        json!({"choices": [{"delta": {"role": "assistant", "content": null,
            "function_call": {"name": "execute_code", "arguments": ""}}}]}),
        json!({"choices": [{"delta": {"function_call": {"arguments": "{\"code\": \"pri"}}}]}),
        json!({"choices": [{"delta": {"function_call": {"arguments": "nt(1)\"}"}}}]}),
        json!({"choices": [{"delta": {}, "finish_reason": "function_call"}]}),
    ];
    let server = start_mock_server(vec![(StatusCode::OK, sse_body(&events))]).await;
    let client = OpenAIClient::new("test-key".to_string(), server.base_url.clone());

    let mut stream = client.stream_chat(request("gpt-4")).await?;
    let chunks = collect_chunks(&mut stream).await?;

    let arguments: String = chunks
        .iter()
        .filter_map(|c| {
            c.first_choice()
                .and_then(|choice| choice.delta.function_call.as_ref())
                .and_then(|call| call.arguments.clone())
        })
        .collect();
    assert_eq!(arguments, "{\"code\": \"print(1)\"}");
    assert_eq!(
        chunks[0].choices[0]
            .delta
            .function_call
            .as_ref()
            .and_then(|call| call.name.as_deref()),
        Some("execute_code")
    );
    assert_eq!(
        chunks[3].choices[0].finish_reason,
        Some(FinishReason::FunctionCall)
    );
    Ok(())
}

#[tokio::test]
async fn test_authentication_error_is_not_retried() -> Result<()> {
    let error = json!({"error": {"message": "Incorrect API key provided"}});
    let server = start_mock_server(vec![(
        StatusCode::UNAUTHORIZED,
        vec![error.to_string().into_bytes()],
    )])
    .await;
    let client = OpenAIClient::new("bad-key".to_string(), server.base_url.clone());

    let err = match client.stream_chat(request("gpt-4")).await {
        Ok(_) => panic!("expected an authentication error"),
        Err(e) => e,
    };
    assert_eq!(
        err.to_string(),
        "Authentication failed: Incorrect API key provided"
    );
    assert_eq!(server.requests().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_service_error_is_retried_before_streaming() -> Result<()> {
    let error = json!({"error": {"message": "The server had an error"}});
    let server = start_mock_server(vec![
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            vec![error.to_string().into_bytes()],
        ),
        (StatusCode::OK, sse_body(&text_events())),
    ])
    .await;
    let client = OpenAIClient::new("test-key".to_string(), server.base_url.clone());

    let mut stream = client.stream_chat(request("gpt-4")).await?;
    assert_eq!(content_of(&collect_chunks(&mut stream).await?), "Hello world");
    assert_eq!(server.requests().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_retries_give_up_after_limit() -> Result<()> {
    let error = json!({"error": {"message": "overloaded"}});
    let server = start_mock_server(vec![(
        StatusCode::SERVICE_UNAVAILABLE,
        vec![error.to_string().into_bytes()],
    )])
    .await;
    let client =
        OpenAIClient::new("test-key".to_string(), server.base_url.clone()).with_max_retries(1);

    let result = client.stream_chat(request("gpt-4")).await;
    assert!(result.is_err());
    assert_eq!(server.requests().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_recorded_stream_plays_back() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("session.json");

    let server = start_mock_server(vec![(StatusCode::OK, sse_body(&text_events()))]).await;
    let client = OpenAIClient::new("test-key".to_string(), server.base_url.clone())
        .with_recorder(Arc::new(APIRecorder::new(&path)));

    let mut stream = client.stream_chat(request("gpt-4")).await?;
    let live = collect_chunks(&mut stream).await?;

    let playback = PlaybackState::from_file(&path, true)?;
    assert_eq!(playback.session_count(), 1);
    let transport = PlaybackTransport::new(playback);

    let mut replay = transport.stream_chat(request("gpt-4")).await?;
    assert_eq!(collect_chunks(&mut replay).await?, live);
    assert!(transport.stream_chat(request("gpt-4")).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_recording_kept_when_turn_stops_at_finish_reason() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("session.json");

    let server = start_mock_server(vec![(StatusCode::OK, sse_body(&text_events()))]).await;
    let client = OpenAIClient::new("test-key".to_string(), server.base_url.clone())
        .with_recorder(Arc::new(APIRecorder::new(&path)));

    for _ in 0..2 {
        let mut stream = client.stream_chat(request("gpt-4")).await?;
        while let Some(chunk) = stream.next_chunk().await? {
            if chunk.choices[0].finish_reason.is_some() {
                break;
            }
        }
    }

    let transport = PlaybackTransport::new(PlaybackState::from_file(&path, true)?);
    for _ in 0..2 {
        let mut replay = transport.stream_chat(request("gpt-4")).await?;
        assert_eq!(content_of(&collect_chunks(&mut replay).await?), "Hello world");
    }
    Ok(())
}
