//! Message bus client against the embedded broker.

use crate::helpers::{collect_until, rejections, successes, test_config, wait_for, write_module};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use taskhub::bus::{ConnectionState, EmbeddedBroker, MessageBusClient, MessageHandler};
use taskhub::config::MessageBusConfig;
use taskhub::manifest::Inputs;
use taskhub::runtime::RejectReason;
use taskhub::services::{Service, ServiceRegistry, ServiceState};
use taskhub::tasks::TaskOptions;
use taskhub::{HubError, MessageBus, Payload, RuntimeEvent, RuntimeEvents, TaskContext, TaskHub};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(10);
const BROKER: &str = "message_broker";

/// Broker stand-in that never finishes starting.
struct NeverReady;

#[async_trait]
impl Service for NeverReady {
    async fn start(&self) -> taskhub::Result<JoinHandle<()>> {
        std::future::pending::<taskhub::Result<JoinHandle<()>>>().await
    }

    async fn stop(&self) {}

    fn is_running(&self) -> bool {
        false
    }
}

/// Broker stand-in whose start always fails.
struct PortTaken;

#[async_trait]
impl Service for PortTaken {
    async fn start(&self) -> taskhub::Result<JoinHandle<()>> {
        Err(HubError::Service {
            name: BROKER.to_owned(),
            reason: "address in use".to_owned(),
        })
    }

    async fn stop(&self) {}

    fn is_running(&self) -> bool {
        false
    }
}

/// Embedded broker whose stop takes a while to be signalled.
struct SlowStop(EmbeddedBroker);

#[async_trait]
impl Service for SlowStop {
    async fn start(&self) -> taskhub::Result<JoinHandle<()>> {
        self.0.start().await
    }

    async fn stop(&self) {
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.0.stop().await;
    }

    fn is_running(&self) -> bool {
        self.0.is_running()
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        self.0.endpoint()
    }
}

fn client_config(port: u16) -> MessageBusConfig {
    MessageBusConfig {
        port,
        broker_start_timeout_secs: 1,
        reconnect_interval_max_secs: 2,
        ..MessageBusConfig::default()
    }
}

#[tokio::test]
async fn broker_that_never_starts_fails_connect_without_dialing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let services = Arc::new(ServiceRegistry::new(RuntimeEvents::new()));
    services.register(BROKER, Arc::new(NeverReady)).await;
    let client = Arc::new(MessageBusClient::new(client_config(port), Arc::clone(&services)));

    let err = client.connect().await.expect_err("broker never became ready");
    assert!(matches!(err, HubError::BrokerNotReady { .. }), "{err}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(services.state(BROKER).await, Some(ServiceState::Starting));

    let accepted = tokio::time::timeout(Duration::from_millis(1500), listener.accept()).await;
    assert!(accepted.is_err(), "client must not dial when the broker is not ready");
    assert!(
        client.publish("a/b", Payload::new()).is_err(),
        "publish without a connection must fail"
    );
}

#[tokio::test]
async fn failed_broker_aborts_connect_before_timeout() {
    let services = Arc::new(ServiceRegistry::new(RuntimeEvents::new()));
    services.register(BROKER, Arc::new(PortTaken)).await;
    let mut config = client_config(1);
    config.broker_start_timeout_secs = 30;
    let client = Arc::new(MessageBusClient::new(config, Arc::clone(&services)));

    let started = std::time::Instant::now();
    let err = client.connect().await.expect_err("broker failed");
    assert!(matches!(err, HubError::BrokerNotReady { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(services.state(BROKER).await, Some(ServiceState::Failed));
}

#[tokio::test]
async fn connect_during_broker_stop_waits_for_restart() {
    let services = Arc::new(ServiceRegistry::new(RuntimeEvents::new()));
    services
        .register(BROKER, Arc::new(SlowStop(EmbeddedBroker::new("127.0.0.1:0"))))
        .await;
    let mut changes = services.events().subscribe();
    services.start(BROKER).await.unwrap();
    let running = wait_for(&mut changes, TIMEOUT, |e| {
        matches!(e, RuntimeEvent::ServiceStateChanged { new: ServiceState::Running, .. })
    })
    .await;
    assert!(running.is_some(), "broker never started");

    let stopper = {
        let services = Arc::clone(&services);
        tokio::spawn(async move { services.stop(BROKER).await })
    };
    let stopping = wait_for(&mut changes, TIMEOUT, |e| {
        matches!(e, RuntimeEvent::ServiceStateChanged { new: ServiceState::Stopping, .. })
    })
    .await;
    assert!(stopping.is_some(), "broker never began stopping");

    let client = Arc::new(MessageBusClient::new(client_config(0), Arc::clone(&services)));
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(services.state(BROKER).await, Some(ServiceState::Running));
    stopper.await.unwrap().unwrap();

    client.disconnect().await;
    services.stop_all().await;
}

#[tokio::test]
async fn client_resubscribes_after_broker_is_replaced() {
    let events = RuntimeEvents::new();
    let services = Arc::new(ServiceRegistry::new(events.clone()));
    services
        .register(BROKER, Arc::new(EmbeddedBroker::new("127.0.0.1:0")))
        .await;
    let client = Arc::new(MessageBusClient::new(client_config(0), Arc::clone(&services)));
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler: MessageHandler = Arc::new(move |topic: &str, payload: &Payload| {
        let _ = tx.send((topic.to_owned(), payload.clone()));
    });
    client.subscribe("sensors/+/temp", handler).unwrap();
    client
        .publish("sensors/kitchen/temp", Payload::new())
        .unwrap();
    let (topic, _) = tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, "sensors/kitchen/temp");

    let mut changes = events.subscribe();
    services
        .register(BROKER, Arc::new(EmbeddedBroker::new("127.0.0.1:0")))
        .await;
    assert_eq!(services.state(BROKER).await.map(ServiceState::is_active), Some(true));

    let reconnected = wait_for(&mut changes, TIMEOUT, |e| {
        matches!(
            e,
            RuntimeEvent::BusStateChanged {
                old: ConnectionState::Reconnecting,
                new: ConnectionState::Connected,
            }
        )
    })
    .await;
    assert!(reconnected.is_some(), "client did not reconnect");

    client.publish("sensors/hall/temp", Payload::new()).unwrap();
    let (topic, _) = tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, "sensors/hall/temp");

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    services.stop_all().await;
}

const RELAY: &str = r#"
name = "Relay"
module_type = "relay"

[trigger]
type = "event"
[trigger.config]
topic = "relay/in"
max_hops = 1
"#;

#[tokio::test]
async fn events_round_trip_through_embedded_broker() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "relay", RELAY);
    let hub = TaskHub::start(test_config(dir.path())).await.unwrap();
    assert_eq!(
        hub.bus_client().map(|c| c.state()),
        Some(ConnectionState::Connected)
    );
    assert_eq!(
        hub.services().state(&hub.config().message_bus.broker_service).await,
        Some(ServiceState::Running)
    );

    hub.modules().register_body(
        "relay",
        Arc::new(|ctx: &TaskContext, _: &Inputs| -> anyhow::Result<()> {
            ctx.publish("relay/in", Payload::new())?;
            Ok(())
        }),
    );
    let mut events = hub.subscribe_events();
    hub.tasks()
        .create("relay", "relay", TaskOptions::default())
        .unwrap();
    hub.tasks().start("relay").unwrap();

    // Let the subscribe frame reach the broker before publishing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    hub.bus().publish("relay/in", Payload::new()).unwrap();

    let collected = collect_until(&mut events, TIMEOUT, |seen| {
        successes(seen, "relay") == 2 && !rejections(seen, "relay").is_empty()
    })
    .await;
    assert_eq!(rejections(&collected, "relay"), vec![RejectReason::HopLimit]);
    assert!(collected.iter().any(
        |e| matches!(e, RuntimeEvent::MessagePublished { topic } if topic == "relay/in")
    ));

    hub.shutdown().await;
    assert_eq!(
        hub.services().state(&hub.config().message_bus.broker_service).await,
        Some(ServiceState::Stopped)
    );
}
