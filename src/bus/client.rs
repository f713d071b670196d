//! Message bus client.
//!
//! `connect()` is a small state machine:
//!
//! 1. In embedded mode, read the broker service's state from the
//!    [`ServiceRegistry`] (after subscribing to state changes, so no
//!    transition is missed).
//! 2. If it is not `Running`, request a start and wait for the `Running`
//!    notification, bounded by `broker_start_timeout_secs`.
//! 3. On timeout, or if the broker reports `Failed`/`Stopped` after the
//!    start began, return [`HubError::BrokerNotReady`] without touching
//!    the network.
//! 4. Otherwise open the TCP connection, replay subscriptions, and hand the
//!    socket to a session task that reconnects with exponential backoff
//!    until [`MessageBusClient::disconnect`] is called.
//!
//! Inbound messages are dispatched to handlers on the session task in the
//! order the broker sent them.

use super::protocol::Frame;
use super::{ConnectionState, MessageBus, MessageHandler, Payload, SubscriptionId};
use crate::config::{BrokerMode, MessageBusConfig};
use crate::error::{HubError, Result};
use crate::runtime::{RuntimeEvent, RuntimeEvents};
use crate::services::{ServiceRegistry, ServiceState};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First reconnect delay; doubles up to `reconnect_interval_max_secs`.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct Subscription {
    filter: String,
    handler: MessageHandler,
}

struct Session {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// An attached socket plus the queue feeding its writer.
struct Connection {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    outbound: mpsc::UnboundedReceiver<Frame>,
}

/// Publish/subscribe client for the embedded or an external broker.
pub struct MessageBusClient {
    config: MessageBusConfig,
    client_id: String,
    services: Arc<ServiceRegistry>,
    events: RuntimeEvents,
    state: Mutex<ConnectionState>,
    subscriptions: Mutex<BTreeMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl MessageBusClient {
    /// Creates a disconnected client.
    pub fn new(config: MessageBusConfig, services: Arc<ServiceRegistry>) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("taskhub-{}", uuid::Uuid::new_v4().simple()));
        let events = services.events().clone();
        Self {
            config,
            client_id,
            services,
            events,
            state: Mutex::new(ConnectionState::Disconnected),
            subscriptions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            outbound: Mutex::new(None),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Identifier sent to the broker in the `hello` frame.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connects to the broker. A no-op while a session is active.
    ///
    /// # Errors
    ///
    /// - [`HubError::BrokerNotReady`] if the embedded broker is unregistered,
    ///   fails, stops, or does not reach `Running` within the timeout. No
    ///   connection is attempted in that case and nothing is retried.
    /// - [`HubError::Bus`] if the TCP connection cannot be opened.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
            debug!("bus client already connected");
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        if self.config.mode == BrokerMode::Embedded
            && let Err(e) = self.await_broker().await
        {
            error!(error = %e, "aborting message bus connect");
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        let stream = match self.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "message bus connect failed");
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        let connection = self.attach(stream);
        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).run_session(connection, token.clone()));
        *session = Some(Session { token, task });
        info!(client_id = %self.client_id, mode = %self.config.mode, "message bus connected");
        Ok(())
    }

    /// Closes the connection and stops reconnecting.
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.token.cancel();
            if let Err(e) = session.task.await {
                warn!(error = %e, "bus session task ended abnormally");
            }
        }
        self.detach_outbound();
        self.set_state(ConnectionState::Disconnected);
        info!("message bus disconnected");
    }

    /// Waits for the embedded broker to report `Running`.
    async fn await_broker(&self) -> Result<()> {
        let service = self.config.broker_service.as_str();
        let not_ready = |reason: String| HubError::BrokerNotReady {
            service: service.to_owned(),
            reason,
        };

        // Subscribe before reading the state so a transition in between is not lost.
        let mut changes = self.services.events().subscribe();
        // `Stopped`/`Failed` only end the wait once the start we are waiting
        // on has begun; earlier ones belong to a stop still in progress.
        let mut seen_starting = match self.services.state(service).await {
            None => return Err(not_ready("service is not registered".to_owned())),
            Some(ServiceState::Running) => return Ok(()),
            Some(ServiceState::Starting) => {
                debug!(%service, "broker is starting, waiting");
                true
            }
            Some(state) => {
                info!(%service, %state, "starting embedded broker");
                self.services.start(service).await?;
                false
            }
        };

        let timeout = self.config.broker_start_timeout();
        let wait = async {
            loop {
                match changes.recv().await {
                    Ok(RuntimeEvent::ServiceStateChanged {
                        service: name, new, ..
                    }) if name == service => match new {
                        ServiceState::Running => return Ok(()),
                        ServiceState::Starting => seen_starting = true,
                        ServiceState::Failed | ServiceState::Stopped if seen_starting => {
                            return Err(format!("broker reported {new}"));
                        }
                        ServiceState::Failed | ServiceState::Stopped => {
                            debug!(%service, %new, "broker finished stopping, waiting for start");
                        }
                        ServiceState::Stopping => {}
                    },
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "state notifications lagged, re-reading broker state");
                        if self.services.state(service).await == Some(ServiceState::Running) {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Closed) => {
                        return Err("state notification channel closed".to_owned());
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(not_ready(reason)),
            Err(_) => Err(not_ready(format!(
                "not running after {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn broker_address(&self) -> String {
        if self.config.mode == BrokerMode::Embedded
            && let Some(addr) = self.services.endpoint(&self.config.broker_service).await
        {
            return addr.to_string();
        }
        self.config.address()
    }

    async fn open_stream(&self) -> Result<TcpStream> {
        let addr = self.broker_address().await;
        let connect = TcpStream::connect(&addr);
        match tokio::time::timeout(self.config.broker_start_timeout(), connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(HubError::Bus(format!("cannot connect to {addr}: {e}"))),
            Err(_) => Err(HubError::Bus(format!("connect to {addr} timed out"))),
        }
    }

    /// Reconnect attempt. Never waits for the broker; a broker that is not
    /// `Running` simply fails this attempt.
    async fn reopen(&self) -> Result<TcpStream> {
        if self.config.mode == BrokerMode::Embedded {
            let state = self.services.state(&self.config.broker_service).await;
            if state != Some(ServiceState::Running) {
                return Err(HubError::BrokerNotReady {
                    service: self.config.broker_service.clone(),
                    reason: match state {
                        Some(state) => format!("broker is {state}"),
                        None => "service is not registered".to_owned(),
                    },
                });
            }
        }
        self.open_stream().await
    }

    /// Installs a fresh outbound queue and replays subscriptions into it.
    fn attach(&self, stream: TcpStream) -> Connection {
        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Frame::Hello {
            client_id: self.client_id.clone(),
        });
        {
            let mut outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
            for filter in self.active_filters() {
                let _ = tx.send(Frame::Subscribe { filter });
            }
            *outbound = Some(tx);
        }
        self.set_state(ConnectionState::Connected);
        Connection {
            read,
            write,
            outbound: rx,
        }
    }

    fn detach_outbound(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    async fn run_session(self: Arc<Self>, connection: Connection, token: CancellationToken) {
        let max_delay = self.config.reconnect_interval_max();
        let mut connection = connection;
        loop {
            let reason = self.drive(connection, &token).await;
            self.detach_outbound();
            if token.is_cancelled() {
                break;
            }
            warn!(%reason, "message bus connection lost");
            self.set_state(ConnectionState::Reconnecting);

            let mut delay = INITIAL_RECONNECT_DELAY;
            connection = loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        self.set_state(ConnectionState::Disconnected);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.reopen().await {
                    Ok(stream) => {
                        info!("message bus reconnected");
                        break self.attach(stream);
                    }
                    Err(e) => {
                        delay = (delay * 2).min(max_delay);
                        warn!(error = %e, retry_in_secs = delay.as_secs(), "message bus reconnect failed");
                    }
                }
            };
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Pumps one connection until it fails or the session is cancelled.
    async fn drive(&self, connection: Connection, token: &CancellationToken) -> String {
        let Connection {
            read,
            mut write,
            mut outbound,
        } = connection;
        let mut lines = BufReader::new(read).lines();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    while let Ok(frame) = outbound.try_recv() {
                        if write_frame(&mut write, &frame).await.is_err() {
                            break;
                        }
                    }
                    let _ = write.shutdown().await;
                    return "disconnect requested".to_owned();
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        return "outbound queue closed".to_owned();
                    };
                    if let Err(e) = write_frame(&mut write, &frame).await {
                        return format!("write failed: {e}");
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line),
                    Ok(None) => return "broker closed the connection".to_owned(),
                    Err(e) => return format!("read failed: {e}"),
                }
            }
        }
    }

    fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match Frame::from_line(line) {
            Ok(Frame::Message { topic, payload }) => {
                for handler in self.handlers_for(&topic) {
                    handler(&topic, &payload);
                }
            }
            Ok(other) => debug!(frame = ?other, "ignoring unexpected frame from broker"),
            Err(e) => warn!(error = %e, "dropping bad frame from broker"),
        }
    }

    fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|sub| super::topic_matches(&sub.filter, topic))
            .map(|sub| Arc::clone(&sub.handler))
            .collect()
    }

    fn active_filters(&self) -> Vec<String> {
        let subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        let mut filters: Vec<String> = subscriptions.values().map(|s| s.filter.clone()).collect();
        filters.sort();
        filters.dedup();
        filters
    }

    fn send_frame(&self, frame: Frame) -> bool {
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        outbound.as_ref().is_some_and(|tx| tx.send(frame).is_ok())
    }

    fn set_state(&self, new: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let old = *state;
        if old == new {
            return;
        }
        *state = new;
        debug!(%old, %new, "message bus state changed");
        self.events.emit(RuntimeEvent::BusStateChanged { old, new });
    }
}

async fn write_frame(write: &mut OwnedWriteHalf, frame: &Frame) -> Result<()> {
    let line = frame.to_line()?;
    write.write_all(line.as_bytes()).await?;
    Ok(())
}

impl MessageBus for MessageBusClient {
    fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<SubscriptionId> {
        super::validate_filter(filter)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let first = {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            let first = !subscriptions.values().any(|s| s.filter == filter);
            subscriptions.insert(
                id,
                Subscription {
                    filter: filter.to_owned(),
                    handler,
                },
            );
            first
        };
        if first {
            // Replayed on (re)connect when not currently connected.
            self.send_frame(Frame::Subscribe {
                filter: filter.to_owned(),
            });
        }
        debug!(%filter, "subscribed");
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let emptied = {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
            subscriptions.remove(&id).and_then(|removed| {
                let still_used = subscriptions.values().any(|s| s.filter == removed.filter);
                (!still_used).then_some(removed.filter)
            })
        };
        if let Some(filter) = emptied {
            self.send_frame(Frame::Unsubscribe {
                filter: filter.clone(),
            });
            debug!(%filter, "unsubscribed");
        }
    }

    fn publish(&self, topic: &str, payload: Payload) -> Result<()> {
        super::validate_topic(topic)?;
        let frame = Frame::Publish {
            topic: topic.to_owned(),
            payload,
        };
        if !self.send_frame(frame) {
            warn!(%topic, state = %self.state(), "cannot publish, message bus is not connected");
            return Err(HubError::Bus(format!(
                "cannot publish to `{topic}`: not connected"
            )));
        }
        self.events.emit(RuntimeEvent::MessagePublished {
            topic: topic.to_owned(),
        });
        Ok(())
    }
}
