//! Embedded message broker.
//!
//! A small TCP router speaking the [`protocol`](super::protocol) line format.
//! It runs as a [`Service`] so the service registry owns its lifecycle and
//! the bus client can gate `connect()` on its state.

use super::Payload;
use super::protocol::Frame;
use crate::error::{HubError, Result};
use crate::services::Service;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Pause after a failed `accept()` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// In-process broker bound to a local TCP address.
pub struct EmbeddedBroker {
    bind_addr: String,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<CancellationToken>,
    running: Arc<AtomicBool>,
}

impl EmbeddedBroker {
    /// Creates a broker that will bind `bind_addr` (e.g. `127.0.0.1:1883`)
    /// when started. Port 0 picks a free port.
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            local_addr: Mutex::new(None),
            shutdown: Mutex::new(CancellationToken::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Address actually bound by the last successful start.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Service for EmbeddedBroker {
    async fn start(&self) -> Result<JoinHandle<()>> {
        let listener =
            TcpListener::bind(&self.bind_addr)
                .await
                .map_err(|e| HubError::Service {
                    name: "embedded broker".to_owned(),
                    reason: format!("cannot bind {}: {e}", self.bind_addr),
                })?;
        let addr = listener.local_addr()?;
        let token = CancellationToken::new();
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
        self.running.store(true, Ordering::Release);
        info!(%addr, "embedded broker listening");

        let running = Arc::clone(&self.running);
        Ok(tokio::spawn(async move {
            accept_loop(listener, token).await;
            running.store(false, Ordering::Release);
            info!(%addr, "embedded broker stopped");
        }))
    }

    async fn stop(&self) {
        self.shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        if self.is_running() {
            self.local_addr()
        } else {
            None
        }
    }
}

async fn accept_loop(listener: TcpListener, token: CancellationToken) {
    let router = Arc::new(Router::default());
    let connections = TaskTracker::new();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&router),
                        token.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "broker accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }
    drop(listener);
    connections.close();
    connections.wait().await;
}

struct Peer {
    tx: mpsc::UnboundedSender<Frame>,
    filters: HashSet<String>,
}

/// Subscription table shared by all connections.
#[derive(Default)]
struct Router {
    next_id: AtomicU64,
    peers: Mutex<HashMap<u64, Peer>>,
}

impl Router {
    fn attach(&self, tx: mpsc::UnboundedSender<Frame>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers().insert(
            id,
            Peer {
                tx,
                filters: HashSet::new(),
            },
        );
        id
    }

    fn detach(&self, id: u64) {
        self.peers().remove(&id);
    }

    fn subscribe(&self, id: u64, filter: String) {
        if let Some(peer) = self.peers().get_mut(&id) {
            peer.filters.insert(filter);
        }
    }

    fn unsubscribe(&self, id: u64, filter: &str) {
        if let Some(peer) = self.peers().get_mut(&id) {
            peer.filters.remove(filter);
        }
    }

    /// Forwards to every peer with a matching filter, once per peer.
    fn route(&self, topic: &str, payload: &Payload) -> usize {
        let peers = self.peers();
        let mut delivered = 0;
        for peer in peers.values() {
            if peer
                .filters
                .iter()
                .any(|filter| super::topic_matches(filter, topic))
            {
                let frame = Frame::Message {
                    topic: topic.to_owned(),
                    payload: payload.clone(),
                };
                if peer.tx.send(frame).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn peers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Peer>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    token: CancellationToken,
) {
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = router.attach(tx);
    let mut lines = BufReader::new(read).lines();
    let mut client = peer.to_string();
    debug!(%peer, "broker client connected");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            outbound = rx.recv() => {
                let Some(frame) = outbound else { break };
                match frame.to_line() {
                    Ok(line) => {
                        if let Err(e) = write.write_all(line.as_bytes()).await {
                            debug!(%client, error = %e, "broker write failed");
                            break;
                        }
                    }
                    Err(e) => warn!(%client, error = %e, "cannot encode frame"),
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Frame::from_line(&line) {
                        Ok(Frame::Hello { client_id }) => client = client_id,
                        Ok(Frame::Subscribe { filter }) => match super::validate_filter(&filter) {
                            Ok(()) => router.subscribe(id, filter),
                            Err(e) => warn!(%client, error = %e, "rejected subscription"),
                        },
                        Ok(Frame::Unsubscribe { filter }) => router.unsubscribe(id, &filter),
                        Ok(Frame::Publish { topic, payload }) => {
                            let delivered = router.route(&topic, &payload);
                            debug!(%client, %topic, delivered, "routed publish");
                        }
                        Ok(Frame::Message { .. }) => {
                            warn!(%client, "ignoring message frame sent by a client");
                        }
                        Err(e) => warn!(%client, error = %e, "dropping bad frame"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(%client, error = %e, "broker read failed");
                    break;
                }
            }
        }
    }

    router.detach(id);
    debug!(%client, "broker client disconnected");
}
