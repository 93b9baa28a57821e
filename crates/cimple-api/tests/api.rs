//! HTTP and websocket tests for the server.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use cimple_api::{Server, ServerConfig, build_app};
use cimple_core::ids::AgentId;
use cimple_core::messages::{BuildComplete, Envelope, Message, RegisterAgentMessage};
use futures::{SinkExt, Stream, StreamExt};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tower::ServiceExt;

fn config() -> ServerConfig {
    ServerConfig {
        check_interval_ms: 10,
        ..Default::default()
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_submit_build_is_accepted_and_listed() {
    let server = Server::new(config());
    let app = build_app(server.state());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/builds")
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"Url":"https://example.com/repo.git","Commit":"abc123"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(body_text(response).await.is_empty());

    let response = app
        .oneshot(Request::builder().uri("/builds").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let builds = body_json(response).await;
    assert_eq!(builds.as_array().unwrap().len(), 1);
    assert_eq!(builds[0]["build_url"], "https://example.com/repo.git#abc123");
    assert!(builds[0]["submission_date"].is_string());
}

#[tokio::test]
async fn test_malformed_build_is_unprocessable() {
    let server = Server::new(config());
    let app = build_app(server.state());

    for body in ["{not json", r#"{"Url": 5}"#, ""] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/builds")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_text(response).await, "Unprocessible entity");
    }
}

#[tokio::test]
async fn test_agents_empty_and_health() {
    let server = Server::new(config());
    let app = build_app(server.state());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/agents").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, serde_json::json!([]));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");
}

#[tokio::test]
async fn test_connection_requires_valid_agent_id() {
    let server = Server::new(config());
    let app = build_app(server.state());

    for uri in ["/agents/connection", "/agents/connection?id=not-a-uuid"] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
    }
}

async fn next_envelope<S>(ws: &mut S) -> Envelope
where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let WsMessage::Binary(data) = frame {
            return Envelope::decode(&data).unwrap();
        }
    }
}

#[tokio::test]
async fn test_agent_registers_and_completes_build_over_websocket() {
    let server = Server::new(config());
    let state = server.state();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve_with_listener(listener, std::future::pending()));

    let agent_id = AgentId::new();
    let url = format!("ws://{}/agents/connection?id={}", addr, agent_id.as_uuid());
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let register = Envelope::new(RegisterAgentMessage {
        agent_id,
        hostname: "builder-1".into(),
    });
    ws.send(WsMessage::Binary(register.encode().unwrap().into()))
        .await
        .unwrap();

    match next_envelope(&mut ws).await.body {
        Message::Confirmation(confirmation) => assert_eq!(confirmation.confirmed_id, register.id),
        other => panic!("expected confirmation, got {:?}", other),
    }

    let agents = state.agents.list().await.unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].hostname.as_deref(), Some("builder-1"));

    state
        .build_queue
        .queue(cimple_scheduler::BuildJob::git("https://example.com/repo.git", "abc123"))
        .await
        .unwrap();

    match next_envelope(&mut ws).await.body {
        Message::BuildGitRepository(request) => {
            assert_eq!(request.url, "https://example.com/repo.git");
            assert_eq!(request.commit, "abc123");
        }
        other => panic!("expected build request, got {:?}", other),
    }
    assert!(state.agents.list().await.unwrap()[0].busy);

    ws.send(WsMessage::Binary(
        Envelope::new(BuildComplete {}).encode().unwrap().into(),
    ))
    .await
    .unwrap();

    let mut idle = false;
    for _ in 0..100 {
        if !state.agents.list().await.unwrap()[0].busy {
            idle = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(idle, "agent should be idle after BuildComplete");

    ws.close(None).await.unwrap();
    let mut gone = false;
    for _ in 0..100 {
        if state.agents.list().await.unwrap().is_empty() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(gone, "agent should leave the pool after disconnecting");
}
