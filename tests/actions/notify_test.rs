//! Webhook notifications: direct posts, batching and backpressure.

use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};

use lokiactor::actions::{Action, ActionError, NotifyAction};
use lokiactor::model::{BatchDef, Labels, NotifyDef};

/// Read one HTTP request and return its body.
async fn read_body(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let body_start = end + 4;
            while buf.len() < body_start + len {
                let n = socket.read(&mut chunk).await.ok()?;
                if n == 0 {
                    return None;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            return Some(String::from_utf8_lossy(&buf[body_start..body_start + len]).into_owned());
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Answer every request with `status_line` and forward each posted `text`.
async fn capture_server(status_line: &'static str) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should expose local addr");
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let Some(body) = read_body(&mut socket).await else {
                    return;
                };
                let text = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v["text"].as_str().map(str::to_owned))
                    .unwrap_or(body);
                let _ = tx.send(text);
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    (format!("http://{addr}/hook"), rx)
}

/// Accept connections and never answer them.
async fn stalled_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should expose local addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}/hook")
}

fn notify_def(url: &str, template: &str, batch: Option<BatchDef>) -> NotifyDef {
    NotifyDef {
        webhook_url: url.to_owned(),
        timeout: Duration::from_secs(30),
        message_template: template.to_owned(),
        batch,
    }
}

fn batch(max_count: usize, prefix: &str, suffix: &str) -> Option<BatchDef> {
    Some(BatchDef {
        max_count,
        prefix: prefix.to_owned(),
        suffix: suffix.to_owned(),
    })
}

async fn next_post(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("webhook should be called")
        .expect("capture server should be running")
}

#[tokio::test]
async fn unbatched_message_is_posted_immediately() {
    let (url, mut rx) = capture_server("200 OK").await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (action, worker) = NotifyAction::spawn(
        &notify_def(&url, "${labels.app}: ${values.message}", None),
        shutdown_rx,
    )
    .expect("action should build");
    assert!(worker.is_none());
    assert!(!action.is_batched());

    let labels = Labels::from([("app".to_owned(), "api".to_owned())]);
    let result = action.execute(Utc::now(), "boom", &labels).await;
    assert!(result.is_ok(), "expected success, got {result:?}");
    assert_eq!(next_post(&mut rx).await, "api: boom");
}

#[tokio::test]
async fn non_200_response_is_an_error() {
    let (url, mut rx) = capture_server("500 Internal Server Error").await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (action, _) = NotifyAction::spawn(&notify_def(&url, "${values.message}", None), shutdown_rx)
        .expect("action should build");

    let result = action.execute(Utc::now(), "boom", &Labels::new()).await;
    assert!(matches!(result, Err(ActionError::HttpStatus(500))), "got {result:?}");
    assert_eq!(next_post(&mut rx).await, "boom");
}

#[tokio::test]
async fn accepted_but_not_ok_status_is_an_error() {
    let (url, _rx) = capture_server("204 No Content").await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (action, _) = NotifyAction::spawn(&notify_def(&url, "${values.message}", None), shutdown_rx)
        .expect("action should build");

    let result = action.execute(Utc::now(), "boom", &Labels::new()).await;
    assert!(matches!(result, Err(ActionError::HttpStatus(204))), "got {result:?}");
}

#[tokio::test]
async fn full_batch_is_sent_as_one_request() {
    let (url, mut rx) = capture_server("200 OK").await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (action, worker) = NotifyAction::spawn_with_idle_interval(
        &notify_def(&url, "${values.message}", batch(2, "```\n", "```")),
        shutdown_rx,
        Duration::from_secs(60),
    )
    .expect("action should build");
    assert!(worker.is_some());
    assert!(action.is_batched());

    for message in ["m1", "m2"] {
        let result = action.execute(Utc::now(), message, &Labels::new()).await;
        assert!(result.is_ok(), "expected enqueue, got {result:?}");
    }

    assert_eq!(next_post(&mut rx).await, "```\nm1\nm2\n```");
    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "only one request expected"
    );
}

#[tokio::test]
async fn idle_batch_is_flushed() {
    let (url, mut rx) = capture_server("200 OK").await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (action, _) = NotifyAction::spawn_with_idle_interval(
        &notify_def(&url, "${values.message}", batch(10, "", "")),
        shutdown_rx,
        Duration::from_millis(200),
    )
    .expect("action should build");

    let result = action.execute(Utc::now(), "only", &Labels::new()).await;
    assert!(result.is_ok(), "expected enqueue, got {result:?}");
    assert_eq!(next_post(&mut rx).await, "only\n");
}

#[tokio::test]
async fn pending_batch_is_flushed_on_shutdown() {
    let (url, mut rx) = capture_server("200 OK").await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (action, worker) = NotifyAction::spawn_with_idle_interval(
        &notify_def(&url, "${values.message}", batch(10, "[", "]")),
        shutdown_rx,
        Duration::from_secs(60),
    )
    .expect("action should build");
    let worker = worker.expect("batched action should have a worker");

    for message in ["a", "b"] {
        let result = action.execute(Utc::now(), message, &Labels::new()).await;
        assert!(result.is_ok(), "expected enqueue, got {result:?}");
    }
    shutdown_tx.send(true).expect("batcher should be listening");

    timeout(Duration::from_secs(5), worker)
        .await
        .expect("batcher should stop")
        .expect("batcher should not panic");
    assert_eq!(next_post(&mut rx).await, "[a\nb\n]");

    let result = action.execute(Utc::now(), "late", &Labels::new()).await;
    assert!(matches!(result, Err(ActionError::BatcherStopped)), "got {result:?}");
}

#[tokio::test]
async fn full_queue_drops_message_after_enqueue_timeout() {
    let url = stalled_server().await;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (action, _) = NotifyAction::spawn_with_idle_interval(
        &notify_def(&url, "${values.message}", batch(1, "", "")),
        shutdown_rx,
        Duration::from_secs(60),
    )
    .expect("action should build");

    // The batcher takes the first message and blocks posting it.
    let first = action.execute(Utc::now(), "stuck", &Labels::new()).await;
    assert!(first.is_ok(), "expected enqueue, got {first:?}");
    tokio::time::sleep(Duration::from_millis(300)).await;

    for i in 0..10 {
        let result = action.execute(Utc::now(), &format!("queued {i}"), &Labels::new()).await;
        assert!(result.is_ok(), "queue slot {i} should be free, got {result:?}");
    }

    let started = Instant::now();
    let result = action.execute(Utc::now(), "overflow", &Labels::new()).await;
    let waited = started.elapsed();

    assert!(matches!(result, Err(ActionError::QueueFull)), "got {result:?}");
    assert!(waited >= Duration::from_millis(150), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(2), "returned after {waited:?}");
}
