use std::time::Duration;

use agent_session::{
    EventKind, SessionClient, SessionConfig, SessionError, TransportError, STREAM_INTERRUPTED,
};
use assert_matches::assert_matches;
use serde_json::json;

mod support;

use support::{client, client_with, delta, done, fast_retry, frame, reset, test_config, Chunk, StreamScript};

async fn active_session(client: &SessionClient) -> agent_session::Session {
    client
        .create_session(SessionConfig::default())
        .await
        .expect("create")
}

fn deltas(events: &[agent_session::Event]) -> String {
    events.iter().filter_map(|event| event.content_delta()).collect()
}

#[tokio::test]
async fn resume_continues_after_last_event_without_duplicates() {
    let (client, transport) = client();
    let session = active_session(&client).await;
    transport.push_body(vec![delta("41", "a"), delta("42", "b"), reset()]);
    transport.push_body(vec![delta("42", "b"), delta("43", "c"), done("44")]);

    let mut stream = client.prompt(&session, "ping").expect("stream");
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event.expect("event"));
    }

    assert_eq!(deltas(&events), "abc");
    assert!(events.last().expect("last").is_done());

    let requests = transport.stream_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].last_event_id, None);
    assert_eq!(requests[1].last_event_id.as_deref(), Some("42"));
    assert!(requests[1].skip_duplicates);
    assert_eq!(requests[1].body, requests[0].body);
    assert_eq!(transport.bodies_dropped(), 2);
}

#[tokio::test]
async fn malformed_payload_is_a_single_terminal_decode_error() {
    let (client, transport) = client();
    let session = active_session(&client).await;
    transport.push_body(vec![
        delta("1", "p"),
        Chunk::Bytes(b"id: 2\ndata: {not json\n\n".to_vec()),
        delta("3", "o"),
    ]);
    transport.push_body(vec![done("4")]);

    let mut stream = client.prompt(&session, "ping").expect("stream");
    stream.next().await.expect("first").expect("ok");

    assert_matches!(
        stream.next().await,
        Some(Err(SessionError::DecodeError { ref session_id, .. })) if session_id == "sess-1"
    );
    assert!(stream.next().await.is_none());
    assert_eq!(transport.stream_requests().len(), 1);
    assert!(!session.has_open_stream());
}

#[tokio::test]
async fn connect_failures_are_retried_before_the_first_frame() {
    let (client, transport) = client();
    let session = active_session(&client).await;
    transport.push_stream(StreamScript::Refuse(TransportError::Connect(
        "connection refused".to_string(),
    )));
    transport.push_stream(StreamScript::Refuse(TransportError::Status {
        status: 503,
        message: "overloaded".to_string(),
    }));
    transport.push_body(vec![delta("1", "p"), done("2")]);

    let mut stream = client.prompt(&session, "ping").expect("stream");
    let first = stream.next().await.expect("event").expect("ok");

    assert_eq!(first.content_delta(), Some("p"));
    assert_eq!(transport.stream_requests().len(), 3);
    assert!(transport
        .stream_requests()
        .iter()
        .all(|request| request.last_event_id.is_none()));
}

#[tokio::test]
async fn exhausted_connect_budget_surfaces_connect_error() {
    let (client, transport) =
        client_with(test_config().with_retry(fast_retry().with_max_retries(1)));
    let session = active_session(&client).await;
    for _ in 0..3 {
        transport.push_stream(StreamScript::Refuse(TransportError::Connect(
            "connection refused".to_string(),
        )));
    }

    let mut stream = client.prompt(&session, "ping").expect("stream");
    assert_matches!(
        stream.next().await,
        Some(Err(SessionError::ConnectError { attempts: 2, .. }))
    );
    assert!(stream.next().await.is_none());
    assert_eq!(transport.stream_requests().len(), 2);
    assert!(!session.has_open_stream());
}

#[tokio::test]
async fn non_retryable_status_fails_on_first_attempt() {
    let (client, transport) = client();
    let session = active_session(&client).await;
    transport.push_stream(StreamScript::Refuse(TransportError::Status {
        status: 401,
        message: "invalid api key".to_string(),
    }));

    let mut stream = client.prompt(&session, "ping").expect("stream");
    assert_matches!(
        stream.next().await,
        Some(Err(SessionError::ConnectError {
            attempts: 1,
            source: TransportError::Status { status: 401, .. },
        }))
    );
    assert_eq!(transport.stream_requests().len(), 1);
}

#[tokio::test]
async fn idle_timeout_mid_stream_resumes() {
    let (client, transport) =
        client_with(test_config().with_idle_timeout(Duration::from_millis(80)));
    let session = active_session(&client).await;
    transport.push_body(vec![delta("1", "p"), Chunk::Stall]);
    transport.push_body(vec![delta("2", "o"), done("3")]);

    let mut stream = client.prompt(&session, "ping").expect("stream");
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event.expect("event"));
    }

    assert_eq!(deltas(&events), "po");
    assert_eq!(
        transport.stream_requests()[1].last_event_id.as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn unanswered_connect_times_out_and_retries() {
    let (client, transport) =
        client_with(test_config().with_idle_timeout(Duration::from_millis(80)));
    let session = active_session(&client).await;
    transport.push_stream(StreamScript::Hang);
    transport.push_body(vec![delta("1", "p"), done("2")]);

    let mut stream = client.prompt(&session, "ping").expect("stream");
    let first = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("connect must not wait forever")
        .expect("event")
        .expect("ok");

    assert_eq!(first.content_delta(), Some("p"));
    assert_eq!(transport.stream_requests().len(), 2);
}

#[tokio::test]
async fn unanswered_connect_without_retries_is_a_connect_error() {
    let (client, transport) = client_with(
        test_config()
            .with_idle_timeout(Duration::from_millis(80))
            .with_retry(fast_retry().with_max_retries(0)),
    );
    let session = active_session(&client).await;
    transport.push_stream(StreamScript::Hang);

    let mut stream = client.prompt(&session, "ping").expect("stream");
    let outcome = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("connect must not wait forever");

    assert_matches!(
        outcome,
        Some(Err(SessionError::ConnectError {
            attempts: 1,
            source: TransportError::IdleTimeout(_),
        }))
    );
    assert!(!session.has_open_stream());
}

#[tokio::test]
async fn id_only_frame_moves_the_resume_point() {
    let (client, transport) = client();
    let session = active_session(&client).await;
    transport.push_body(vec![
        delta("1", "a"),
        Chunk::Bytes(b"id: 5\n\n".to_vec()),
        reset(),
    ]);
    transport.push_body(vec![delta("5", "x"), delta("6", "b"), done("7")]);

    let mut stream = client.prompt(&session, "ping").expect("stream");
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event.expect("event"));
    }

    assert_eq!(deltas(&events), "ab");
    assert_eq!(
        transport.stream_requests()[1].last_event_id.as_deref(),
        Some("5")
    );
    assert_eq!(stream.last_event_id(), Some("7"));
}

#[tokio::test]
async fn half_received_frame_is_not_skipped_on_resume() {
    let (client, transport) = client();
    let session = active_session(&client).await;
    transport.push_body(vec![
        delta("1", "a"),
        Chunk::Bytes(b"id: 2\ndata: {\"type\":\"content.delta\",".to_vec()),
        reset(),
    ]);
    transport.push_body(vec![delta("2", "b"), done("3")]);

    let mut stream = client.prompt(&session, "ping").expect("stream");
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event.expect("event"));
    }

    assert_eq!(deltas(&events), "ab");
    assert_eq!(
        transport.stream_requests()[1].last_event_id.as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn prompt_can_continue_from_a_known_event() {
    let (client, transport) = client();
    let session = active_session(&client).await;
    transport.push_body(vec![delta("42", "b"), delta("43", "c"), done("44")]);

    let mut stream = client
        .resume_prompt(&session, "ping", "42")
        .expect("stream");
    assert_eq!(stream.last_event_id(), Some("42"));

    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event.expect("event"));
    }

    assert_eq!(deltas(&events), "c");
    let requests = transport.stream_requests();
    assert_eq!(requests[0].last_event_id.as_deref(), Some("42"));
    assert!(requests[0].skip_duplicates);
    assert_eq!(requests[0].body, json!({"prompt": "ping"}));
}

#[tokio::test]
async fn heartbeat_comments_produce_no_events() {
    let (client, transport) =
        client_with(test_config().with_idle_timeout(Duration::from_millis(500)));
    let session = active_session(&client).await;
    transport.push_body(vec![
        Chunk::Bytes(b": keep-alive\n\n".to_vec()),
        Chunk::Bytes(b": keep-alive\n\n".to_vec()),
        delta("1", "p"),
        done("2"),
    ]);

    let mut stream = client.prompt(&session, "ping").expect("stream");
    let first = stream.next().await.expect("event").expect("ok");
    assert_eq!(first.content_delta(), Some("p"));
    assert_eq!(transport.chunks_pulled(), 3);
}

#[tokio::test]
async fn break_without_event_id_ends_with_interrupted_error_event() {
    let (client, transport) = client();
    let session = active_session(&client).await;
    transport.push_body(vec![
        Chunk::Bytes(frame(None, "content.delta", json!({"delta": "par"}))),
        reset(),
    ]);

    let mut stream = client.prompt(&session, "ping").expect("stream");
    stream.next().await.expect("first").expect("ok");

    let terminal = stream.next().await.expect("terminal").expect("ok");
    assert_matches!(
        terminal.kind,
        EventKind::Error { ref code, .. } if code.as_deref() == Some(STREAM_INTERRUPTED)
    );
    assert!(stream.next().await.is_none());
    assert_matches!(
        stream.failure(),
        Some(SessionError::MidStreamError {
            last_event_id: None,
            source: TransportError::Read(_),
            ..
        })
    );
    assert_eq!(transport.stream_requests().len(), 1);
}

#[tokio::test]
async fn resume_budget_is_bounded() {
    let (client, transport) =
        client_with(test_config().with_retry(fast_retry().with_max_resumes(1)));
    let session = active_session(&client).await;
    transport.push_body(vec![delta("1", "p"), reset()]);
    transport.push_body(vec![reset()]);
    transport.push_body(vec![done("2")]);

    let response = agent_session::collect_response(client.prompt(&session, "ping").expect("stream"))
        .await
        .expect("partial response");

    assert_eq!(response.text, "p");
    assert_matches!(response.status, agent_session::ResponseStatus::Failed { .. });
    assert_eq!(transport.stream_requests().len(), 2);
}

#[tokio::test]
async fn disabled_resume_fails_fast_after_first_frame() {
    let (client, transport) =
        client_with(test_config().with_retry(fast_retry().with_resume(false)));
    let session = active_session(&client).await;
    transport.push_body(vec![delta("1", "p"), reset()]);

    let mut stream = client.prompt(&session, "ping").expect("stream");
    stream.next().await.expect("first").expect("ok");
    let terminal = stream.next().await.expect("terminal").expect("ok");

    assert_eq!(terminal.event_type(), "error");
    assert_matches!(
        stream.take_failure(),
        Some(SessionError::MidStreamError { last_event_id: Some(ref id), .. }) if id == "1"
    );
    assert_eq!(transport.stream_requests().len(), 1);
}

#[tokio::test]
async fn server_error_sharing_the_interrupted_code_does_not_fail_the_response() {
    let (client, transport) = client();
    let session = active_session(&client).await;
    transport.push_body(vec![
        delta("1", "p"),
        Chunk::Bytes(frame(
            Some("2"),
            "error",
            json!({"code": STREAM_INTERRUPTED, "message": "tool stream restarted"}),
        )),
        delta("3", "o"),
        done("4"),
    ]);

    let response = agent_session::collect_response(client.prompt(&session, "ping").expect("stream"))
        .await
        .expect("response");

    assert_eq!(response.text, "po");
    assert!(response.is_complete());
    assert_eq!(response.errors.len(), 1);
}
