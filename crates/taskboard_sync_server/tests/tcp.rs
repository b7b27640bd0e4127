//! Wire-level tests over a real TCP socket.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use taskboard_sync_protocol::{
    ClientMessage, EntityKind, Patch, Role, ServerMessage, Topic, UserId,
};
use taskboard_sync_server::{serve, MemoryEntityStore, ServerConfig, SyncServer};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

struct Wire {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Wire {
    async fn open(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send_raw(&mut self, frame: &str) {
        self.writer.write_all(frame.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn send(&mut self, message: &ClientMessage) {
        self.send_raw(&message.encode().unwrap()).await;
    }

    async fn recv(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .unwrap()
            .unwrap()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    async fn recv_message(&mut self) -> ServerMessage {
        let value = self.recv().await.unwrap();
        serde_json::from_value(value).unwrap()
    }
}

async fn start() -> (
    Arc<SyncServer<MemoryEntityStore>>,
    std::net::SocketAddr,
    oneshot::Sender<()>,
) {
    let store = Arc::new(MemoryEntityStore::new());
    let server = Arc::new(SyncServer::new(ServerConfig::default(), store));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(serve(server.clone(), listener, async {
        let _ = stopped.await;
    }));
    (server, addr, stop)
}

fn hello(user: &str, role: &str) -> String {
    json!({ "type": "hello", "user_id": user, "role": role }).to_string()
}

#[tokio::test]
async fn first_frame_must_be_hello() {
    let (_, addr, _stop) = start().await;
    let mut wire = Wire::open(addr).await;

    wire.send(&ClientMessage::Heartbeat).await;
    let refusal = wire.recv().await.unwrap();
    assert_eq!(refusal["type"], "error");
    assert!(refusal["message"].as_str().unwrap().contains("hello"));
    assert!(wire.recv().await.is_none());
}

#[tokio::test]
async fn malformed_frame_keeps_connection_open() {
    let (_, addr, _stop) = start().await;
    let mut wire = Wire::open(addr).await;
    wire.send_raw(&hello("alice", "member")).await;

    wire.send_raw("{not json").await;
    assert_eq!(wire.recv().await.unwrap()["type"], "error");

    wire.send(&ClientMessage::Heartbeat).await;
    assert_eq!(wire.recv_message().await, ServerMessage::HeartbeatAck);
}

#[tokio::test]
async fn create_and_broadcast_over_tcp() {
    let (server, addr, stop) = start().await;

    let mut watcher = Wire::open(addr).await;
    watcher.send_raw(&hello("bob", "member")).await;
    watcher
        .send(&ClientMessage::Subscribe {
            topic: Topic::TaskList,
        })
        .await;
    watcher.send(&ClientMessage::Heartbeat).await;
    // The ack proves the subscribe was handled first.
    assert_eq!(watcher.recv_message().await, ServerMessage::HeartbeatAck);

    let mut author = Wire::open(addr).await;
    author.send_raw(&hello("alice", "manager")).await;
    author
        .send(&ClientMessage::Create {
            request_id: Some(7),
            kind: EntityKind::Task,
            patch: Patch::new().set("title", "Over the wire"),
        })
        .await;

    let accepted = author.recv().await.unwrap();
    assert_eq!(accepted["type"], "accepted");
    assert_eq!(accepted["request_id"], 7);
    assert_eq!(accepted["version"], 1);

    let update = watcher.recv().await.unwrap();
    assert_eq!(update["type"], "update");
    assert_eq!(update["topic"], "task-list");
    assert_eq!(update["entity_id"], accepted["state"]["id"]);
    assert_eq!(update["actor"], "alice");

    assert_eq!(server.registry().len(), 2);
    assert_eq!(
        server
            .registry()
            .connections_for_user(&UserId::new("alice"))
            .len(),
        1
    );

    drop(author);
    stop.send(()).unwrap();
}

#[tokio::test]
async fn closing_the_socket_unregisters() {
    let (server, addr, _stop) = start().await;
    let mut wire = Wire::open(addr).await;
    wire.send_raw(&hello("carol", "admin")).await;
    wire.send(&ClientMessage::Heartbeat).await;
    assert_eq!(wire.recv_message().await, ServerMessage::HeartbeatAck);
    assert_eq!(server.registry().len(), 1);
    let id = server.registry().connections_for_user(&UserId::new("carol"))[0];
    assert_eq!(server.registry().actor(id).map(|a| a.role), Some(Role::Admin));

    drop(wire);
    for _ in 0..50 {
        if server.registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(server.registry().is_empty());
}
