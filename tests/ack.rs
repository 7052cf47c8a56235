mod common;

use common::*;
use muxio::{Ack, AckError, DisconnectReason, Server};
use serde_json::{json, Value};

#[tokio::test]
async fn ack_round_trip() {
    let server = Server::new();
    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    let socket = client.socket("/").unwrap();
    conn.clear();

    let task = {
        let socket = socket.clone();
        tokio::spawn(async move { socket.emit_with_ack::<Value>("ping", "hi").await })
    };
    wait_for(|| !conn.texts().is_empty()).await;
    assert_eq!(conn.texts(), vec!["21[\"ping\",\"hi\"]"]);

    feed(&client, "31[\"pong\"]").await;
    let (data, bin) = task.await.unwrap().unwrap();
    assert_eq!(data, json!(["pong"]));
    assert!(bin.is_empty());
}

#[tokio::test]
async fn handler_ack_answers_the_peer() {
    let server = Server::new();
    server.on_connect(|socket, _: ()| async move {
        socket.on("ping", |_socket, msg: String, _bin| async move {
            Ok(Ack::Data(format!("pong: {msg}")))
        });
    });

    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    conn.clear();

    feed(&client, "25[\"ping\",\"hi\"]").await;
    wait_for(|| !conn.texts().is_empty()).await;
    assert_eq!(conn.texts(), vec!["35[\"pong: hi\"]"]);
}

#[tokio::test]
async fn events_without_ack_id_produce_no_ack() {
    let server = Server::new();
    server.on_connect(|socket, _: ()| async move {
        socket.on("ping", |_socket, _: Value, _bin| async move {
            Ok(Ack::Data("pong"))
        });
    });

    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    conn.clear();

    feed(&client, "2[\"ping\",\"hi\"]").await;
    settle().await;
    assert!(conn.texts().is_empty());
}

#[tokio::test]
async fn packet_ids_increase_per_namespace() {
    let server = Server::new();
    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    let socket = client.socket("/").unwrap();
    conn.clear();

    for _ in 0..2 {
        let socket = socket.clone();
        tokio::spawn(async move { socket.emit_with_ack::<Value>("e", ()).await });
    }
    wait_for(|| conn.texts().len() == 2).await;

    let mut texts = conn.texts();
    texts.sort();
    assert_eq!(texts, vec!["21[\"e\"]", "22[\"e\"]"]);
}

#[tokio::test]
async fn acks_are_rejected_when_broadcasting() {
    let server = Server::new();
    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    let socket = client.socket("/").unwrap();

    let res = socket.to("r1").emit_with_ack::<Value>("ping", "hi").await;
    assert!(matches!(res, Err(AckError::BroadcastAck)));

    let res = socket.broadcast().emit_with_ack::<Value>("ping", "hi").await;
    assert!(matches!(res, Err(AckError::BroadcastAck)));

    // nothing reached the wire
    assert_eq!(conn.texts(), vec!["0"]);
}

#[tokio::test]
async fn pending_acks_resolve_when_the_socket_closes() {
    let server = Server::new();
    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    let socket = client.socket("/").unwrap();

    let task = {
        let socket = socket.clone();
        tokio::spawn(async move { socket.emit_with_ack::<Value>("ping", "hi").await })
    };
    wait_for(|| conn.texts().len() == 2).await;

    client.on_close(DisconnectReason::TransportClose).await;
    let res = task.await.unwrap();
    assert!(matches!(res, Err(AckError::SocketClosed)));
}

#[tokio::test]
async fn unknown_ack_ids_are_ignored() {
    let server = Server::new();
    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    let socket = client.socket("/").unwrap();

    feed(&client, "399[\"pong\"]").await;
    assert!(socket.connected());
}
