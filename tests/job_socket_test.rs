//! End-to-end tests for the job socket against a local websocket server

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::protocol::Message};

use toyz_dispatch::config::Config;
use toyz_dispatch::protocol::{Response, TaskRequest};
use toyz_dispatch::session::{
    ChannelError, ChannelHandlers, ChannelState, RequestHandlers, SendOutcome, StreamHandler,
    TaskEvent,
};
use toyz_dispatch::transport::JobSocket;

type ServerSocket = WebSocketStream<TcpStream>;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept one connection and run `script` on it; returns the job config
async fn start_server<F, Fut, T>(script: F) -> (Config, JoinHandle<T>)
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        script(ws).await
    });

    let mut config = Config::default();
    config.server.url = format!("ws://{}", addr);
    config.server.job_path = "/job".to_string();
    config.server.max_connect_attempts = 1;
    (config, handle)
}

async fn send_json(ws: &mut ServerSocket, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn initialize(ws: &mut ServerSocket) {
    send_json(
        ws,
        json!({"id": "initialize", "user_id": "admin", "session_id": "s-1"}),
    )
    .await;
}

/// Next task frame written by the client
async fn read_task(ws: &mut ServerSocket) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("connection ended while waiting for a task: {:?}", other),
        }
    }
}

/// Keep the connection open until the client goes away
async fn drain(mut ws: ServerSocket) {
    while let Some(Ok(message)) = ws.next().await {
        if message.is_close() {
            break;
        }
    }
}

fn request_id(frame: &Value) -> u64 {
    frame["id"]["request_id"].as_u64().unwrap()
}

#[tokio::test]
async fn test_tasks_queued_before_initialize_are_sent_in_order() {
    let (gate_tx, gate_rx) = oneshot::channel::<()>();

    let (config, server) = start_server(|mut ws| async move {
        gate_rx.await.unwrap();
        initialize(&mut ws).await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            let frame = read_task(&mut ws).await;
            assert_eq!(frame["id"]["user_id"], "admin");
            assert_eq!(frame["id"]["session_id"], "s-1");
            let id = request_id(&frame);
            seen.push((frame["task"].as_str().unwrap().to_string(), id));
            send_json(&mut ws, json!({"id": "done", "request_id": id})).await;
        }
        drain(ws).await;
        seen
    })
    .await;

    let (client, handle) = JobSocket::from_config(&config, ChannelHandlers::default());

    let mut streams = Vec::new();
    for (index, task) in ["first", "second", "third"].into_iter().enumerate() {
        let responses = client
            .send_task(TaskRequest::new("toyz.web.tasks", task))
            .await
            .unwrap();
        assert_eq!(responses.outcome(), SendOutcome::Queued(index));
        streams.push(responses);
    }

    gate_tx.send(()).unwrap();
    client.wait_ready().await.unwrap();

    for responses in streams {
        let last = tokio::time::timeout(TEST_TIMEOUT, responses.finish())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.kind, "done");
    }

    client.shutdown();
    let seen = server.await.unwrap();
    assert_eq!(
        seen,
        vec![
            ("first".to_string(), 0),
            ("second".to_string(), 1),
            ("third".to_string(), 2)
        ]
    );

    drop(client);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_progress_frames_then_terminal_result() {
    let (config, server) = start_server(|mut ws| async move {
        initialize(&mut ws).await;
        let frame = read_task(&mut ws).await;
        assert_eq!(frame["module"], "toyz.web.tasks");
        assert_eq!(frame["parameters"]["path"], "/data");
        let id = request_id(&frame);

        for progress in [0.25, 0.75] {
            let frame = json!({
                "id": "progress",
                "request_id": id,
                "progress_update": true,
                "progress": progress
            });
            send_json(&mut ws, frame).await;
        }
        // Numeric strings are accepted as request ids
        send_json(
            &mut ws,
            json!({"id": "directory", "request_id": id.to_string(), "files": ["a.fits"]}),
        )
        .await;
        drain(ws).await;
    })
    .await;

    let (client, handle) = JobSocket::from_config(&config, ChannelHandlers::default());
    client.wait_ready().await.unwrap();

    let mut responses = client
        .send_task(TaskRequest::new("toyz.web.tasks", "get_file_tree").with_param("path", "/data"))
        .await
        .unwrap();
    assert_eq!(responses.outcome(), SendOutcome::Sent(0));

    let mut kinds = Vec::new();
    while let Some(frame) = tokio::time::timeout(TEST_TIMEOUT, responses.next())
        .await
        .unwrap()
    {
        let response = frame.unwrap();
        kinds.push((response.kind.clone(), response.is_progress_update()));
    }
    assert_eq!(
        kinds,
        vec![
            ("progress".to_string(), true),
            ("progress".to_string(), true),
            ("directory".to_string(), false)
        ]
    );

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.frames_sent, 1);
    assert_eq!(stats.pending, 0);

    client.shutdown();
    server.await.unwrap();
    drop(client);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_unsolicited_frames_reach_receive_handler() {
    let (config, server) = start_server(|mut ws| async move {
        initialize(&mut ws).await;
        send_json(&mut ws, json!({"id": "server_push", "value": "hello"})).await;
        send_json(&mut ws, json!({"id": "late_result", "request_id": 999})).await;
        drain(ws).await;
    })
    .await;

    let (pushed_tx, mut pushed_rx) = mpsc::unbounded_channel::<Response>();
    let handlers = ChannelHandlers::default().with_receive_handler(move |response: &Response| {
        let _ = pushed_tx.send(response.clone());
    });
    let (client, handle) = JobSocket::from_config(&config, handlers);
    client.wait_ready().await.unwrap();

    let first = tokio::time::timeout(TEST_TIMEOUT, pushed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.kind, "server_push");
    assert_eq!(first.get("value"), Some(&json!("hello")));

    let second = tokio::time::timeout(TEST_TIMEOUT, pushed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.kind, "late_result");
    assert_eq!(second.request_id, Some(999));

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.orphan_frames, 2);

    client.shutdown();
    server.await.unwrap();
    drop(client);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_error_override_falls_through_to_result_callback() {
    let (config, server) = start_server(|mut ws| async move {
        initialize(&mut ws).await;
        let frame = read_task(&mut ws).await;
        let id = request_id(&frame);
        send_json(
            &mut ws,
            json!({"id": "ERROR", "request_id": id, "error": "no such file", "traceback": ""}),
        )
        .await;
        drain(ws).await;
    })
    .await;

    let default_errors = Arc::new(AtomicUsize::new(0));
    let counter = default_errors.clone();
    let handlers = ChannelHandlers::default().with_error_handler(move |_: &Response| {
        counter.fetch_add(1, Ordering::SeqCst);
        ControlFlow::Break(())
    });
    let (client, handle) = JobSocket::from_config(&config, handlers);
    client.wait_ready().await.unwrap();

    let overrides = Arc::new(AtomicUsize::new(0));
    let seen = overrides.clone();
    let (stream, mut events) = StreamHandler::new();
    let request_handlers = RequestHandlers::new(stream).on_error(move |_: &Response| {
        seen.fetch_add(1, Ordering::SeqCst);
        ControlFlow::Continue(())
    });
    client
        .send_with(TaskRequest::new("toyz.web.tasks", "load_file"), request_handlers)
        .await
        .unwrap();

    let event = tokio::time::timeout(TEST_TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        TaskEvent::Response(response) => {
            assert_eq!(response.kind, "ERROR");
            assert_eq!(response.message(), Some("no such file"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    // ERROR carries no progress flag, so it ends the request
    assert!(events.recv().await.is_none());
    assert_eq!(overrides.load(Ordering::SeqCst), 1);
    assert_eq!(default_errors.load(Ordering::SeqCst), 0);

    client.shutdown();
    server.await.unwrap();
    drop(client);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_server_close_rejects_sends_and_warns_once() {
    let (config, server) = start_server(|mut ws| async move {
        initialize(&mut ws).await;
        ws.close(None).await.unwrap();
        drain(ws).await;
    })
    .await;

    let warnings = Arc::new(AtomicUsize::new(0));
    let counter = warnings.clone();
    let handlers = ChannelHandlers::default().with_close_warning(move |message: &str| {
        assert!(message.contains("disconnected"));
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (client, handle) = JobSocket::from_config(&config, handlers);

    let mut status = client.status_watch();
    tokio::time::timeout(TEST_TIMEOUT, status.wait_for(|state| *state == ChannelState::Closed))
        .await
        .unwrap()
        .unwrap();
    server.await.unwrap();

    for _ in 0..2 {
        let result = client
            .send_detached(TaskRequest::new("toyz.web.tasks", "save_session"))
            .await;
        assert!(matches!(result, Err(ChannelError::Closed(_))));
    }
    assert_eq!(warnings.load(Ordering::SeqCst), 1);

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.closed_sends, 2);

    drop(client);
    handle.await.unwrap();
}
