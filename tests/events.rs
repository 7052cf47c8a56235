mod common;

use std::sync::{Arc, Mutex};

use common::*;
use muxio::{Ack, Connection, Server};
use serde_json::{json, Value};

fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl Fn(Value) + Clone + Send + Sync + 'static) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let log = log.clone();
        move |v: Value| log.lock().unwrap().push(v)
    };
    (log, sink)
}

#[tokio::test]
async fn events_dispatch_to_their_listener() {
    let server = Server::new();
    let (log, sink) = recorder();
    server.on_connect(move |socket, _: ()| {
        let sink = sink.clone();
        async move {
            socket.on("greet", move |_socket, data: Value, _bin| {
                let sink = sink.clone();
                async move {
                    sink(data);
                    Ok(Ack::<()>::None)
                }
            });
        }
    });

    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    feed(&client, "2[\"greet\",\"hello\"]").await;
    wait_for(|| !log.lock().unwrap().is_empty()).await;

    assert_eq!(*log.lock().unwrap(), vec![json!("hello")]);
}

#[tokio::test]
async fn send_is_an_alias_for_the_message_event() {
    let server = Server::new();
    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    let socket = client.socket("/").unwrap();
    conn.clear();

    socket.send("hi").unwrap();
    socket.emit("message", "hi").unwrap();
    assert_eq!(conn.texts(), vec!["2[\"message\",\"hi\"]", "2[\"message\",\"hi\"]"]);
}

#[tokio::test]
async fn reserved_emits_never_reach_the_wire() {
    let server = Server::new();
    let (log, sink) = recorder();
    server.on_connect(move |socket, _: ()| {
        let sink = sink.clone();
        async move {
            socket.on("error", move |_socket, data: Value, _bin| {
                let sink = sink.clone();
                async move {
                    sink(data);
                    Ok(Ack::<()>::None)
                }
            });
        }
    });

    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    let socket = client.socket("/").unwrap();
    conn.clear();

    socket.emit("error", "boom").unwrap();
    wait_for(|| !log.lock().unwrap().is_empty()).await;

    assert_eq!(*log.lock().unwrap(), vec![json!("boom")]);
    assert!(conn.texts().is_empty());
}

#[tokio::test]
async fn reserved_events_from_the_wire_are_dropped() {
    let server = Server::new();
    let (log, sink) = recorder();
    server.on_connect(move |socket, _: ()| {
        let sink = sink.clone();
        async move {
            socket.on("disconnect", move |_socket, data: Value, _bin| {
                let sink = sink.clone();
                async move {
                    sink(data);
                    Ok(Ack::<()>::None)
                }
            });
        }
    });

    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    feed(&client, "2[\"disconnect\",\"spoofed\"]").await;
    settle().await;

    assert!(log.lock().unwrap().is_empty());
    assert!(client.socket("/").unwrap().connected());
}

#[tokio::test]
async fn event_middleware_errors_suppress_delivery() {
    let server = Server::new();
    let (log, sink) = recorder();
    server.on_connect(move |socket, _: ()| {
        let sink = sink.clone();
        async move {
            socket.use_middleware(|_socket, event, _payload| async move {
                if event == "evil" {
                    Err("blocked".into())
                } else {
                    Ok(())
                }
            });
            socket.on("evil", move |_socket, data: Value, _bin| {
                let sink = sink.clone();
                async move {
                    sink(data);
                    Ok(Ack::<()>::None)
                }
            });
        }
    });

    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    conn.clear();

    feed(&client, "2[\"evil\",1]").await;
    settle().await;

    assert_eq!(conn.texts(), vec!["4\"blocked\""]);
    assert!(log.lock().unwrap().is_empty());
    // the socket stays connected
    assert!(client.socket("/").unwrap().connected());
}

#[tokio::test]
async fn event_middleware_passes_other_events() {
    let server = Server::new();
    let (log, sink) = recorder();
    server.on_connect(move |socket, _: ()| {
        let sink = sink.clone();
        async move {
            socket.use_middleware(|_socket, event, _payload| async move {
                if event == "evil" {
                    Err("blocked".into())
                } else {
                    Ok(())
                }
            });
            socket.on("fine", move |_socket, data: Value, _bin| {
                let sink = sink.clone();
                async move {
                    sink(data);
                    Ok(Ack::<()>::None)
                }
            });
        }
    });

    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    feed(&client, "2[\"fine\",1]").await;
    wait_for(|| !log.lock().unwrap().is_empty()).await;
    assert_eq!(*log.lock().unwrap(), vec![json!(1)]);
}

#[tokio::test]
async fn binary_events_reassemble_before_dispatch() {
    let server = Server::new();
    let log: Arc<Mutex<Vec<(Value, Vec<Vec<u8>>)>>> = Arc::new(Mutex::new(Vec::new()));
    let log2 = log.clone();
    server.on_connect(move |socket, _: ()| {
        let log = log2.clone();
        async move {
            socket.on("file", move |_socket, data: Value, bin| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push((data, bin));
                    Ok(Ack::<()>::None)
                }
            });
        }
    });

    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;

    feed(&client, "52-[\"file\",\"doc\"]").await;
    // nothing dispatches until every attachment has arrived
    settle().await;
    assert!(log.lock().unwrap().is_empty());

    client.on_data(muxio::Frame::Binary(vec![1, 2])).await;
    client.on_data(muxio::Frame::Binary(vec![3])).await;
    wait_for(|| !log.lock().unwrap().is_empty()).await;

    let (data, bin) = log.lock().unwrap().pop().unwrap();
    assert_eq!(data, json!("doc"));
    assert_eq!(bin, vec![vec![1, 2], vec![3]]);
}

#[tokio::test]
async fn binary_payloads_ride_as_trailing_frames() {
    let server = Server::new();
    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    let socket = client.socket("/").unwrap();
    conn.clear();

    socket.bin(vec![vec![9, 9]]).emit("file", "doc").await.unwrap();
    assert_eq!(conn.texts(), vec!["51-[\"file\",\"doc\"]"]);
    assert_eq!(conn.binaries(), vec![vec![9, 9]]);
}

#[tokio::test]
async fn binary_flag_overrides_structural_detection() {
    let server = Server::new();
    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    let socket = client.socket("/").unwrap();
    conn.clear();

    // forced binary framing without payloads
    socket.binary(true).emit("x", 1).await.unwrap();
    assert_eq!(conn.texts(), vec!["50-[\"x\",1]"]);
    conn.clear();

    // suppressed binary framing despite payloads
    socket.binary(false).bin(vec![vec![1]]).emit("x", 1).await.unwrap();
    assert_eq!(conn.texts(), vec!["2[\"x\",1]"]);
    assert!(conn.binaries().is_empty());
}

#[tokio::test]
async fn volatile_direct_emits_drop_when_unwritable() {
    let server = Server::new();
    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    let socket = client.socket("/").unwrap();
    conn.clear();
    conn.set_writable(false);

    socket.volatile().emit("x", 1).await.unwrap();
    assert!(conn.texts().is_empty());

    conn.set_writable(true);
    socket.volatile().emit("x", 2).await.unwrap();
    assert_eq!(conn.texts(), vec!["2[\"x\",2]"]);
}

#[tokio::test]
async fn compress_is_forwarded_to_the_transport() {
    let server = Server::new();
    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    let socket = client.socket("/").unwrap();
    conn.clear();

    socket.compress(true).emit("x", 1).await.unwrap();
    socket.compress(false).emit("x", 2).await.unwrap();

    let opts = conn.write_opts();
    assert_eq!(opts.len(), 2);
    assert!(opts[0].compress);
    assert!(!opts[1].compress);
}

#[tokio::test]
async fn decode_errors_tear_the_connection_down() {
    let server = Server::new();
    let (log, sink) = recorder();
    server.on_connect(move |socket, _: ()| {
        let sink = sink.clone();
        async move {
            socket.on("error", move |_socket, data: Value, _bin| {
                let sink = sink.clone();
                async move {
                    sink(data);
                    Ok(Ack::<()>::None)
                }
            });
        }
    });

    let conn = StubConnection::new("c1");
    let client = connected(&server, &conn).await;
    let socket = client.socket("/").unwrap();

    feed(&client, "9zzz").await;
    wait_for(|| !log.lock().unwrap().is_empty()).await;
    wait_for(|| socket.disconnected()).await;

    assert_eq!(conn.ready_state(), muxio::ReadyState::Closed);
    assert_eq!(*log.lock().unwrap(), vec![json!("invalid packet type")]);

    // subsequent frames are ignored
    feed(&client, "2[\"x\"]").await;
}
