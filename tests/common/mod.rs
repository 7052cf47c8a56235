//! In-memory transport stubs driving the layer the way a real transport
//! would: encoded frames in, recorded frames out.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use muxio::{Client, Connection, Frame, ReadyState, Server, TransportServer, WriteOptions};

pub struct StubConnection {
    id: String,
    parts: http::request::Parts,
    state: RwLock<ReadyState>,
    writable: AtomicBool,
    frames: Mutex<Vec<(Frame, WriteOptions)>>,
}

impl StubConnection {
    pub fn new(id: &str) -> Arc<Self> {
        let (parts, _) = http::Request::builder()
            .uri("/sock?lang=en")
            .body(())
            .unwrap()
            .into_parts();
        Arc::new(Self {
            id: id.to_string(),
            parts,
            state: RwLock::new(ReadyState::Open),
            writable: AtomicBool::new(true),
            frames: Mutex::new(Vec::new()),
        })
    }

    /// The text frames written so far, in order.
    pub fn texts(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(frame, _)| match frame {
                Frame::Text(msg) => Some(msg.clone()),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    /// The binary frames written so far, in order.
    pub fn binaries(&self) -> Vec<Vec<u8>> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(frame, _)| match frame {
                Frame::Binary(data) => Some(data.clone()),
                Frame::Text(_) => None,
            })
            .collect()
    }

    /// Write options recorded with each frame, in order.
    pub fn write_opts(&self) -> Vec<WriteOptions> {
        self.frames.lock().unwrap().iter().map(|(_, o)| *o).collect()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }
}

impl Connection for StubConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.read().unwrap()
    }

    fn writable(&self) -> bool {
        self.ready_state() == ReadyState::Open && self.writable.load(Ordering::SeqCst)
    }

    fn write(&self, frame: Frame, opts: WriteOptions) {
        self.frames.lock().unwrap().push((frame, opts));
    }

    fn close(&self) {
        *self.state.write().unwrap() = ReadyState::Closed;
    }

    fn req_parts(&self) -> &http::request::Parts {
        &self.parts
    }
}

#[derive(Default)]
pub struct StubTransport {
    pub initial: Mutex<Option<Vec<Frame>>>,
    pub closed: AtomicBool,
}

impl StubTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn initial_texts(&self) -> Option<Vec<String>> {
        self.initial.lock().unwrap().as_ref().map(|frames| {
            frames
                .iter()
                .filter_map(|frame| match frame {
                    Frame::Text(msg) => Some(msg.clone()),
                    Frame::Binary(_) => None,
                })
                .collect()
        })
    }
}

impl TransportServer for StubTransport {
    fn set_initial_packet(&self, frames: Vec<Frame>) {
        self.initial.lock().unwrap().replace(frames);
    }

    fn clear_initial_packet(&self) {
        self.initial.lock().unwrap().take();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Open a connection and wait for its default-namespace handshake.
pub async fn connected(server: &Arc<Server>, conn: &Arc<StubConnection>) -> Arc<Client> {
    let client = server.connection(conn.clone());
    wait_for(|| client.socket("/").is_some()).await;
    client
}

/// Feed an encoded text frame into the client.
pub async fn feed(client: &Arc<Client>, msg: &str) {
    client.on_data(Frame::Text(msg.to_string())).await;
}

/// Poll until the condition holds; panics after ~1s.
pub async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

/// Let spawned listener tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
