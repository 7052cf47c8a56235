mod common;

use std::sync::Arc;

use common::*;
use muxio::{Client, Server, Socket};

async fn trio(server: &Arc<Server>) -> [(Arc<StubConnection>, Arc<Client>, Arc<Socket>); 3] {
    let mut out = Vec::new();
    for id in ["a", "b", "c"] {
        let conn = StubConnection::new(id);
        let client = connected(server, &conn).await;
        let socket = client.socket("/").unwrap();
        conn.clear();
        out.push((conn, client, socket));
    }
    out.try_into().unwrap_or_else(|_| unreachable!())
}

#[tokio::test]
async fn broadcast_to_a_room_excludes_the_sender() {
    let server = Server::new();
    let [(ca, _, sa), (cb, _, sb), (cc, _, sc)] = trio(&server).await;
    for s in [&sa, &sb, &sc] {
        s.join("r1").await.unwrap();
    }

    sa.to("r1").emit("x", 1).await.unwrap();

    assert_eq!(cb.texts(), vec!["2[\"x\",1]"]);
    assert_eq!(cc.texts(), vec!["2[\"x\",1]"]);
    assert!(ca.texts().is_empty());
}

#[tokio::test]
async fn overlapping_rooms_deliver_once() {
    let server = Server::new();
    let [(_, _, sa), (cb, _, sb), _] = trio(&server).await;
    sb.join(["r1", "r2"]).await.unwrap();

    sa.to(["r1", "r2"]).emit("x", 1).await.unwrap();
    assert_eq!(cb.texts(), vec!["2[\"x\",1]"]);
}

#[tokio::test]
async fn leaving_a_room_stops_delivery() {
    let server = Server::new();
    let [(_, _, sa), (cb, _, sb), _] = trio(&server).await;
    sb.join("r1").await.unwrap();
    sb.leave("r1").await.unwrap();

    sa.to("r1").emit("x", 1).await.unwrap();
    assert!(cb.texts().is_empty());
}

#[tokio::test]
async fn namespace_emit_reaches_everyone() {
    let server = Server::new();
    let [(ca, _, _), (cb, _, _), (cc, _, _)] = trio(&server).await;

    server.emit("tick", 7).await.unwrap();

    for conn in [&ca, &cb, &cc] {
        assert_eq!(conn.texts(), vec!["2[\"tick\",7]"]);
    }
}

#[tokio::test]
async fn except_filters_room_members_out() {
    let server = Server::new();
    let [(ca, _, sa), (cb, _, sb), (cc, _, _)] = trio(&server).await;
    sb.join("muted").await.unwrap();

    sa.broadcast().except("muted").emit("x", 1).await.unwrap();

    assert!(ca.texts().is_empty());
    assert!(cb.texts().is_empty());
    assert_eq!(cc.texts(), vec!["2[\"x\",1]"]);
}

#[tokio::test]
async fn volatile_broadcast_skips_unwritable_transports() {
    let server = Server::new();
    let [(_, _, sa), (cb, _, sb), (cc, _, sc)] = trio(&server).await;
    sb.join("r1").await.unwrap();
    sc.join("r1").await.unwrap();
    cb.set_writable(false);

    sa.to("r1").volatile().emit("x", 1).await.unwrap();
    assert!(cb.texts().is_empty());
    assert_eq!(cc.texts(), vec!["2[\"x\",1]"]);

    // non-volatile writes still go through an open but unwritable transport
    sa.to("r1").emit("x", 2).await.unwrap();
    assert_eq!(cb.texts(), vec!["2[\"x\",2]"]);
}

#[tokio::test]
async fn within_includes_the_sender() {
    let server = Server::new();
    let [(ca, _, sa), (cb, _, sb), _] = trio(&server).await;
    sa.join("r1").await.unwrap();
    sb.join("r1").await.unwrap();

    sa.within("r1").emit("x", 1).await.unwrap();
    assert_eq!(ca.texts(), vec!["2[\"x\",1]"]);
    assert_eq!(cb.texts(), vec!["2[\"x\",1]"]);
}

#[tokio::test]
async fn every_socket_is_a_member_of_its_own_id_room() {
    let server = Server::new();
    let [(_, _, sa), (cb, _, sb), _] = trio(&server).await;

    // the sid doubles as a room name, giving point-to-point sends
    sa.to(sb.id.as_str().to_string()).emit("direct", "hi").await.unwrap();
    assert_eq!(cb.texts(), vec!["2[\"direct\",\"hi\"]"]);

    let rooms = sb.rooms().await.unwrap();
    assert!(rooms.contains(sb.id.as_str()));
}

#[tokio::test]
async fn all_sockets_spans_the_namespace() {
    let server = Server::new();
    let [(_, _, sa), (_, _, sb), (_, _, sc)] = trio(&server).await;

    let all = server.of("/").all_sockets().await.unwrap();
    assert_eq!(all.len(), 3);
    for s in [&sa, &sb, &sc] {
        assert!(all.contains(&s.id));
    }
}

#[tokio::test]
async fn operator_join_and_leave_move_room_members() {
    let server = Server::new();
    let [(_, _, sa), (cb, _, sb), _] = trio(&server).await;
    sb.join("r1").await.unwrap();

    // everyone in r1 also joins r2
    server.of("/").within("r1").join("r2").await.unwrap();
    sa.to("r2").emit("x", 1).await.unwrap();
    assert_eq!(cb.texts(), vec!["2[\"x\",1]"]);
    cb.clear();

    server.of("/").within("r1").leave("r2").await.unwrap();
    sa.to("r2").emit("x", 2).await.unwrap();
    assert!(cb.texts().is_empty());
}

#[tokio::test]
async fn operator_sockets_selects_room_members() {
    let server = Server::new();
    let [(_, _, sa), (_, _, sb), _] = trio(&server).await;
    sa.join("r1").await.unwrap();
    sb.join("r1").await.unwrap();

    let selected = server.of("/").within("r1").sockets().await.unwrap();
    let mut ids: Vec<_> = selected.iter().map(|s| s.id.as_str().to_string()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);
}
