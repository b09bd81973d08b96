//! In-process mock backend node.
//!
//! Serves both halves of the node protocol: a framed message stream
//! (identify/ready handshake, scripted frame pushes, kill switches) and a
//! recording REST surface. Tests drive failure scenarios by flipping the
//! accept/resume switches and dropping live connections.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use reverb_cluster::events::ClusterEvent;
use reverb_cluster::node::NodeDescriptor;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: serde_json::Value,
}

enum ConnCommand {
    Frame(serde_json::Value),
    Kill,
}

struct MockState {
    /// Honor resume keys offered in identify frames.
    accept_resume: AtomicBool,
    /// When false, new stream connections are dropped before the
    /// handshake, simulating a node that is down.
    accepting: AtomicBool,
    session_counter: AtomicUsize,
    identifies: Mutex<Vec<serde_json::Value>>,
    stream_frames: Mutex<Vec<serde_json::Value>>,
    rest_requests: Mutex<Vec<RecordedRequest>>,
    connections: Mutex<Vec<mpsc::UnboundedSender<ConnCommand>>>,
}

pub struct MockNode {
    pub stream_addr: SocketAddr,
    pub rest_addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockNode {
    pub async fn start() -> Self {
        let stream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rest_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream_addr = stream_listener.local_addr().unwrap();
        let rest_addr = rest_listener.local_addr().unwrap();

        let state = Arc::new(MockState {
            accept_resume: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            session_counter: AtomicUsize::new(0),
            identifies: Mutex::new(Vec::new()),
            stream_frames: Mutex::new(Vec::new()),
            rest_requests: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        });

        tokio::spawn(run_stream_listener(Arc::clone(&state), stream_listener));
        tokio::spawn(run_rest_listener(Arc::clone(&state), rest_listener));

        Self {
            stream_addr,
            rest_addr,
            state,
        }
    }

    /// A descriptor pointing at this mock.
    pub fn descriptor(&self, name: &str) -> NodeDescriptor {
        let mut descriptor =
            NodeDescriptor::new(name, "127.0.0.1", self.stream_addr.port(), "mock-password");
        descriptor.rest_port = Some(self.rest_addr.port());
        descriptor
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.state.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn set_accept_resume(&self, accept: bool) {
        self.state.accept_resume.store(accept, Ordering::SeqCst);
    }

    /// Pushes a frame to every live stream connection.
    pub async fn push_frame(&self, frame: serde_json::Value) {
        let mut connections = self.state.connections.lock().await;
        connections.retain(|tx| tx.send(ConnCommand::Frame(frame.clone())).is_ok());
    }

    /// Drops every live stream connection.
    pub async fn kill_connections(&self) {
        let mut connections = self.state.connections.lock().await;
        for tx in connections.drain(..) {
            let _ = tx.send(ConnCommand::Kill);
        }
    }

    pub async fn identifies(&self) -> Vec<serde_json::Value> {
        self.state.identifies.lock().await.clone()
    }

    /// Frames the client sent after the handshake (e.g. configure_resume).
    pub async fn stream_frames(&self) -> Vec<serde_json::Value> {
        self.state.stream_frames.lock().await.clone()
    }

    pub async fn rest_requests(&self) -> Vec<RecordedRequest> {
        self.state.rest_requests.lock().await.clone()
    }

    pub async fn patch_requests(&self) -> Vec<RecordedRequest> {
        self.rest_requests()
            .await
            .into_iter()
            .filter(|r| r.method == "PATCH")
            .collect()
    }
}

async fn run_stream_listener(state: Arc<MockState>, listener: TcpListener) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        if !state.accepting.load(Ordering::SeqCst) {
            // Connection refused in spirit: drop before the handshake.
            continue;
        }
        tokio::spawn(handle_stream(Arc::clone(&state), stream));
    }
}

async fn handle_stream(state: Arc<MockState>, stream: TcpStream) {
    let (mut read_half, mut write_half) = stream.into_split();

    // Handshake: identify first, ready back.
    let Ok(raw) = read_frame(&mut read_half).await else {
        return;
    };
    let Ok(identify) = serde_json::from_slice::<serde_json::Value>(&raw) else {
        return;
    };
    let offered_resume = identify.get("resumeKey").is_some();
    state.identifies.lock().await.push(identify);

    let resumed = offered_resume && state.accept_resume.load(Ordering::SeqCst);
    let session_id = if resumed {
        "session-resumed".to_string()
    } else {
        format!(
            "session-{}",
            state.session_counter.fetch_add(1, Ordering::SeqCst)
        )
    };
    let ready = serde_json::json!({
        "op": "ready",
        "sessionId": session_id,
        "resumed": resumed,
    });
    if write_frame(&mut write_half, &ready).await.is_err() {
        return;
    }

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    state.connections.lock().await.push(cmd_tx);

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(ConnCommand::Frame(frame)) => {
                    if write_frame(&mut write_half, &frame).await.is_err() {
                        return;
                    }
                }
                Some(ConnCommand::Kill) | None => return,
            },
            result = read_frame(&mut read_half) => match result {
                Ok(raw) => {
                    if let Ok(frame) = serde_json::from_slice(&raw) {
                        state.stream_frames.lock().await.push(frame);
                    }
                }
                Err(_) => return,
            },
        }
    }
}

async fn read_frame(read: &mut OwnedReadHalf) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    read.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    read.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame(write: &mut OwnedWriteHalf, frame: &serde_json::Value) -> std::io::Result<()> {
    let data = serde_json::to_vec(frame).unwrap();
    write.write_all(&(data.len() as u32).to_be_bytes()).await?;
    write.write_all(&data).await?;
    write.flush().await
}

async fn run_rest_listener(state: Arc<MockState>, listener: TcpListener) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle_rest(Arc::clone(&state), req));
            let _ = http1::Builder::new().serve_connection(io, service).await;
        });
    }
}

async fn handle_rest(
    state: Arc<MockState>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
            }
        }
        Err(_) => serde_json::Value::Null,
    };

    state.rest_requests.lock().await.push(RecordedRequest {
        method,
        path: path.clone(),
        body,
    });

    let response_body = if path == "/v1/info" {
        serde_json::json!({"version": "mock", "buildTime": 0})
    } else if path.starts_with("/v1/loadtracks") {
        serde_json::json!({"loadType": "empty", "data": null})
    } else {
        serde_json::json!({})
    };

    Ok(Response::new(Full::new(Bytes::from(
        serde_json::to_vec(&response_body).unwrap(),
    ))))
}

/// Waits for the first event matching `predicate`, discarding everything
/// before it. Panics after `timeout`.
pub async fn wait_for<F>(
    rx: &mut mpsc::UnboundedReceiver<ClusterEvent>,
    timeout: Duration,
    mut predicate: F,
) -> ClusterEvent
where
    F: FnMut(&ClusterEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if predicate(&event) {
            return event;
        }
    }
}

/// Collects every event already queued.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ClusterEvent>) -> Vec<ClusterEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
