//! Integration tests for queue client/server communication
//!
//! These tests run the full request/response cycle between the queue client
//! and a server exposing the in-memory authority.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use outlane_common::Signal;
use outlane_queue::{
    Bounce, Command, Delivery, Headers, MemoryQueue, QueueAuthority, QueueClient, QueueError,
    QueueServer,
    protocol::{Payload, Request, Response, read_frame, write_frame},
};
use pretty_assertions::assert_eq;
use tokio::{net::TcpListener, sync::broadcast};

async fn serve(queue: MemoryQueue) -> (String, broadcast::Sender<Signal>) {
    let server = QueueServer::bind("127.0.0.1:0", Arc::new(queue))
        .await
        .unwrap();
    let address = server.local_addr().unwrap().to_string();
    let (tx, rx) = broadcast::channel(1);
    tokio::spawn(server.serve(rx));
    (address, tx)
}

fn delivery(seq: &str) -> Delivery {
    let mut headers = Headers::new();
    headers.add("Subject", "integration");
    Delivery::new("msg-1", seq, "sender@example.net", "rcpt@example.com")
        .with_headers(headers)
        .with_body_size(128)
}

#[tokio::test]
async fn full_lifecycle_over_the_wire() {
    let queue = MemoryQueue::new();
    queue.push("default", delivery("001"));
    queue.push("default", delivery("002"));
    let (address, _shutdown) = serve(queue.clone()).await;

    let client = QueueClient::new(address).with_timeout(Duration::from_secs(5));

    let first = client.get("default").await.unwrap().unwrap();
    assert_eq!(first.seq, "001");
    assert_eq!(first.headers.get_first("subject").as_deref(), Some("integration"));
    client.release(&first.lease()).await.unwrap();

    let second = client.get("default").await.unwrap().unwrap();
    client
        .defer(&second.lease(), Duration::from_secs(300))
        .await
        .unwrap();

    let bounce = Bounce::for_delivery(&second, "recipient", "550 5.1.1 nope", 1);
    client.bounce(&bounce).await.unwrap();

    assert!(client.get("default").await.unwrap().is_none());

    let names: Vec<_> = queue.commands().iter().map(Command::name).collect();
    assert_eq!(
        names,
        vec!["GET", "RELEASE", "GET", "DEFER", "BOUNCE", "GET"]
    );
    assert_eq!(queue.bounces(), vec![bounce]);
    assert_eq!(queue.pending("default")[0].deferred_count, 1);
}

#[tokio::test]
async fn lock_mismatch_is_reported_to_the_client() {
    let queue = MemoryQueue::new();
    queue.push("default", delivery("001"));
    let (address, _shutdown) = serve(queue).await;

    let client = QueueClient::new(address);
    let got = client.get("default").await.unwrap().unwrap();

    let mut lease = got.lease();
    lease.lock = "not-the-lock".into();

    let err = client.release(&lease).await.unwrap_err();
    assert!(matches!(err, QueueError::LockMismatch { ref id, ref seq } if id == "msg-1" && seq == "001"));
}

#[tokio::test]
async fn server_failures_become_errors() {
    let queue = MemoryQueue::new();
    queue.push("default", delivery("001"));
    queue.fail_next_updates(1);
    let (address, _shutdown) = serve(queue).await;

    let client = QueueClient::new(address);
    let got = client.get("default").await.unwrap().unwrap();

    assert!(matches!(
        client.release(&got.lease()).await,
        Err(QueueError::Server(_))
    ));
}

#[tokio::test]
async fn reconnects_once_after_the_server_hangs_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    // Answers exactly one request per connection, then hangs up.
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request: Request = read_frame(&mut stream).await.unwrap();
            assert!(matches!(request.command, Command::Get { .. }));
            write_frame(&mut stream, &Response::new(Payload::Delivery(None)))
                .await
                .unwrap();
        }
    });

    let client = QueueClient::new(address);
    assert!(client.get("default").await.unwrap().is_none());
    assert!(client.get("default").await.unwrap().is_none());
}

#[tokio::test]
async fn unreachable_server_is_an_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let client = QueueClient::new(address).with_timeout(Duration::from_secs(2));
    assert!(client.get("default").await.is_err());
}

#[tokio::test]
async fn silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    let client = QueueClient::new(address).with_timeout(Duration::from_millis(200));
    assert!(matches!(
        client.get("default").await,
        Err(QueueError::Timeout)
    ));
}
