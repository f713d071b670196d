//! Event dispatch: hop guard, input validation, and default injection.

use crate::helpers::{collect_until, offline_hub, payload, rejections, successes, write_module};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskhub::manifest::Inputs;
use taskhub::runtime::RejectReason;
use taskhub::tasks::TaskOptions;
use taskhub::{Payload, TaskContext};

const TIMEOUT: Duration = Duration::from_secs(10);

fn looper(max_hops: Option<u32>) -> String {
    let hops = max_hops
        .map(|n| format!("max_hops = {n}\n"))
        .unwrap_or_default();
    format!(
        r#"
name = "Looper"
module_type = "looper"

[trigger]
type = "event"
[trigger.config]
topic = "loop/ping"
{hops}"#
    )
}

/// Registers a body that records its hop count and republishes to its own topic.
fn self_feeding(hub: &taskhub::TaskHub) -> Arc<Mutex<Vec<u32>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    hub.modules().register_body(
        "looper",
        Arc::new(
            move |ctx: &TaskContext, _: &Inputs| -> anyhow::Result<()> {
                record.lock().unwrap().push(ctx.hop_count());
                ctx.publish("loop/ping", Payload::new())?;
                Ok(())
            },
        ),
    );
    seen
}

#[tokio::test]
async fn explicit_hop_ceiling_stops_a_loop() {
    let manifest = looper(Some(2));
    let (_dir, hub) = offline_hub(|root| write_module(root, "looper", &manifest)).await;
    let seen = self_feeding(&hub);
    let mut events = hub.subscribe_events();

    hub.tasks()
        .create("looper", "loop", TaskOptions::default())
        .unwrap();
    hub.tasks().start("loop").unwrap();
    hub.bus().publish("loop/ping", Payload::new()).unwrap();

    let collected = collect_until(&mut events, TIMEOUT, |seen| {
        successes(seen, "loop") == 3 && !rejections(seen, "loop").is_empty()
    })
    .await;
    assert_eq!(rejections(&collected, "loop"), vec![RejectReason::HopLimit]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    hub.shutdown().await;
}

#[tokio::test]
async fn default_hop_ceiling_is_five() {
    let manifest = looper(None);
    let (_dir, hub) = offline_hub(|root| write_module(root, "looper", &manifest)).await;
    let seen = self_feeding(&hub);
    let mut events = hub.subscribe_events();

    hub.tasks()
        .create("looper", "loop", TaskOptions::default())
        .unwrap();
    hub.tasks().start("loop").unwrap();
    hub.bus().publish("loop/ping", Payload::new()).unwrap();

    let collected = collect_until(&mut events, TIMEOUT, |seen| {
        successes(seen, "loop") == 6 && !rejections(seen, "loop").is_empty()
    })
    .await;
    assert_eq!(rejections(&collected, "loop"), vec![RejectReason::HopLimit]);
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    hub.shutdown().await;
}

#[tokio::test]
async fn inbound_hop_count_is_honored() {
    let manifest = looper(Some(2));
    let (_dir, hub) = offline_hub(|root| write_module(root, "looper", &manifest)).await;
    let seen = self_feeding(&hub);
    hub.tasks()
        .create("looper", "loop", TaskOptions::default())
        .unwrap();
    hub.tasks().start("loop").unwrap();

    let outcomes = hub
        .tasks()
        .on_event("loop/ping", &payload(json!({"__hops": 3})));
    assert_eq!(
        outcomes,
        vec![(
            "loop".to_owned(),
            taskhub::tasks::DispatchOutcome::Rejected(RejectReason::HopLimit)
        )]
    );
    assert!(seen.lock().unwrap().is_empty());
    hub.shutdown().await;
}

fn chain_module(module_type: &str) -> String {
    format!(
        r#"
name = "Chain {module_type}"
module_type = "{module_type}"

[trigger]
type = "event"
[trigger.config]
topic = "chain/#"
max_hops = 2
"#
    )
}

#[tokio::test]
async fn two_instances_on_one_pattern_stop_at_the_ceiling() {
    let (_dir, hub) = offline_hub(|root| {
        write_module(root, "forwarder", &chain_module("forwarder"));
        write_module(root, "observer", &chain_module("observer"));
    })
    .await;
    let seen = Arc::new(Mutex::new(Vec::<(&'static str, u32)>::new()));
    let record = Arc::clone(&seen);
    hub.modules().register_body(
        "forwarder",
        Arc::new(
            move |ctx: &TaskContext, _: &Inputs| -> anyhow::Result<()> {
                record.lock().unwrap().push(("a", ctx.hop_count()));
                ctx.publish("chain/next", Payload::new())?;
                Ok(())
            },
        ),
    );
    let record = Arc::clone(&seen);
    hub.modules().register_body(
        "observer",
        Arc::new(
            move |ctx: &TaskContext, _: &Inputs| -> anyhow::Result<()> {
                record.lock().unwrap().push(("b", ctx.hop_count()));
                Ok(())
            },
        ),
    );
    let mut events = hub.subscribe_events();
    for (module_type, name) in [("forwarder", "a"), ("observer", "b")] {
        hub.tasks()
            .create(module_type, name, TaskOptions::default())
            .unwrap();
        hub.tasks().start(name).unwrap();
    }

    hub.bus().publish("chain/start", Payload::new()).unwrap();
    let collected = collect_until(&mut events, TIMEOUT, |seen| {
        successes(seen, "a") == 3
            && successes(seen, "b") == 3
            && !rejections(seen, "a").is_empty()
            && !rejections(seen, "b").is_empty()
    })
    .await;
    assert_eq!(rejections(&collected, "a"), vec![RejectReason::HopLimit]);
    assert_eq!(rejections(&collected, "b"), vec![RejectReason::HopLimit]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut runs = seen.lock().unwrap().clone();
    runs.sort_unstable();
    assert_eq!(
        runs,
        vec![("a", 0), ("a", 1), ("a", 2), ("b", 0), ("b", 1), ("b", 2)]
    );
    hub.shutdown().await;
}

const READER: &str = r#"
name = "Reader"
module_type = "reader"

[trigger]
type = "event"
[trigger.config]
topic = "files/new"

[[inputs]]
name = "path"
type = "string"
required = true
"#;

#[tokio::test]
async fn missing_required_input_rejects_once_without_running() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "reader", READER)).await;
    let calls = Arc::new(Mutex::new(Vec::<Value>::new()));
    let record = Arc::clone(&calls);
    hub.modules().register_body(
        "reader",
        Arc::new(
            move |_: &TaskContext, inputs: &Inputs| -> anyhow::Result<()> {
                record.lock().unwrap().push(inputs["path"].clone());
                Ok(())
            },
        ),
    );
    let mut events = hub.subscribe_events();
    hub.tasks()
        .create("reader", "reader", TaskOptions::default())
        .unwrap();
    hub.tasks().start("reader").unwrap();

    hub.bus()
        .publish("files/new", payload(json!({"size": 4})))
        .unwrap();
    hub.bus()
        .publish("files/new", payload(json!({"path": "/tmp/a.txt"})))
        .unwrap();

    let collected =
        collect_until(&mut events, TIMEOUT, |seen| successes(seen, "reader") == 1).await;
    assert_eq!(
        rejections(&collected, "reader"),
        vec![RejectReason::MissingInput]
    );
    assert_eq!(*calls.lock().unwrap(), vec![json!("/tmp/a.txt")]);
    hub.shutdown().await;
}

#[tokio::test]
async fn wrong_input_type_is_rejected() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "reader", READER)).await;
    hub.modules().register_body(
        "reader",
        Arc::new(|_: &TaskContext, _: &Inputs| -> anyhow::Result<()> { Ok(()) }),
    );
    hub.tasks()
        .create("reader", "reader", TaskOptions::default())
        .unwrap();
    hub.tasks().start("reader").unwrap();

    let outcomes = hub
        .tasks()
        .on_event("files/new", &payload(json!({"path": 42})));
    assert_eq!(
        outcomes[0].1,
        taskhub::tasks::DispatchOutcome::Rejected(RejectReason::InvalidInput)
    );
    hub.shutdown().await;
}

const ADDER: &str = r#"
name = "Adder"
module_type = "adder"

[trigger]
type = "event"
[trigger.config]
topic = "numbers/+"

[inputs.x]
type = "integer"
default = 10
"#;

#[tokio::test]
async fn defaults_fill_absent_inputs() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "adder", ADDER)).await;
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let record = Arc::clone(&seen);
    hub.modules().register_body(
        "adder",
        Arc::new(
            move |_: &TaskContext, inputs: &Inputs| -> anyhow::Result<()> {
                record.lock().unwrap().push(Value::Object(inputs.clone()));
                Ok(())
            },
        ),
    );
    let mut events = hub.subscribe_events();
    hub.tasks()
        .create("adder", "adder", TaskOptions::default())
        .unwrap();
    hub.tasks().start("adder").unwrap();

    hub.bus().publish("numbers/a", Payload::new()).unwrap();
    hub.bus()
        .publish("numbers/b", payload(json!({"x": 3, "extra": true})))
        .unwrap();
    hub.bus().publish("other/c", payload(json!({"x": 99}))).unwrap();

    collect_until(&mut events, TIMEOUT, |seen| successes(seen, "adder") == 2).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![json!({"x": 10}), json!({"x": 3})]
    );
    hub.shutdown().await;
}

#[tokio::test]
async fn static_inputs_sit_between_payload_and_default() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "adder", ADDER)).await;
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let record = Arc::clone(&seen);
    hub.modules().register_body(
        "adder",
        Arc::new(
            move |_: &TaskContext, inputs: &Inputs| -> anyhow::Result<()> {
                record.lock().unwrap().push(inputs["x"].clone());
                Ok(())
            },
        ),
    );
    let mut events = hub.subscribe_events();
    let options = TaskOptions {
        inputs: payload(json!({"x": 7})),
        ..TaskOptions::default()
    };
    hub.tasks().create("adder", "adder", options).unwrap();
    hub.tasks().start("adder").unwrap();

    hub.tasks().on_event("numbers/a", &Payload::new());
    collect_until(&mut events, TIMEOUT, |seen| successes(seen, "adder") == 1).await;
    hub.tasks()
        .on_event("numbers/a", &payload(json!({"x": 1})));
    collect_until(&mut events, TIMEOUT, |seen| successes(seen, "adder") == 1).await;

    assert_eq!(*seen.lock().unwrap(), vec![json!(7), json!(1)]);
    hub.shutdown().await;
}
