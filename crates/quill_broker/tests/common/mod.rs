//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use quill_broker::frame::{self, ACK};
use quill_broker::{BrokerConfig, ControlEnvelope, NodeId};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Upper bound for any polling loop in these tests.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a unique test directory path (not created on disk).
pub fn test_dir(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id();
    std::env::temp_dir()
        .join("quill-tests")
        .join(format!("{name}-{pid}-{ts}"))
}

/// Best-effort cleanup of a test directory.
pub fn cleanup_dir(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

/// Broker config with short registration bounds and no background ticker.
pub fn broker_config(node_id: NodeId, root: &Path, dirs: usize) -> BrokerConfig {
    let storage_dirs = (0..dirs).map(|i| root.join(format!("data-{i}"))).collect();
    let mut config = BrokerConfig::single_node(node_id, storage_dirs);
    config.registration_timeout = Duration::from_millis(300);
    config.checkpoint_interval = None;
    config
}

/// Poll `check` until it holds, panicking after `WAIT_TIMEOUT`.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let start = Instant::now();
    while !check() {
        assert!(start.elapsed() < WAIT_TIMEOUT, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Peer that accepts connections and reads frames but never acknowledges.
pub struct SilentPeer {
    pub addr: SocketAddr,
    accepted: Arc<Mutex<usize>>,
    task: JoinHandle<()>,
}

impl SilentPeer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind silent peer");
        let addr = listener.local_addr().expect("silent peer addr");
        let accepted = Arc::new(Mutex::new(0));
        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                *counter.lock().unwrap() += 1;
                held.push(stream);
            }
        });
        Self {
            addr,
            accepted,
            task,
        }
    }

    pub fn accepted(&self) -> usize {
        *self.accepted.lock().unwrap()
    }
}

impl Drop for SilentPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Peer that acknowledges every frame and records the decoded envelopes.
pub struct RecordingPeer {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<ControlEnvelope>>>,
    task: JoinHandle<()>,
}

impl RecordingPeer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind recording peer");
        Self::serve(listener)
    }

    /// Serve on a specific address, e.g. one handed out earlier by `reserve_addr`.
    pub async fn bind_at(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).await.expect("bind recording peer");
        Self::serve(listener)
    }

    fn serve(listener: TcpListener) -> Self {
        let addr = listener.local_addr().expect("recording peer addr");
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_acking(stream, sink.clone()));
            }
        });
        Self {
            addr,
            received,
            task,
        }
    }

    pub fn received(&self) -> Vec<ControlEnvelope> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for RecordingPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_acking(mut stream: TcpStream, sink: Arc<Mutex<Vec<ControlEnvelope>>>) {
    while let Ok(Some(payload)) = frame::read_frame(&mut stream).await {
        let envelope: ControlEnvelope = serde_json::from_slice(&payload).expect("decode envelope");
        sink.lock().unwrap().push(envelope);
        if stream.write_all(&[ACK]).await.is_err() {
            return;
        }
    }
}

/// A loopback address with nothing listening on it (yet).
pub async fn reserve_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind placeholder");
    listener.local_addr().expect("placeholder addr")
}
