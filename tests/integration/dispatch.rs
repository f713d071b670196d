//! Busy guard, schedule firing, retries, and manual runs.

use crate::helpers::{
    collect_until, is_outcome, offline_hub, rejections, successes, wait_for, write_module,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use taskhub::config::BusyPolicy;
use taskhub::manifest::Inputs;
use taskhub::runtime::RejectReason;
use taskhub::tasks::{DispatchOutcome, RetryPolicy, TaskOptions};
use taskhub::{Payload, RuntimeEvent, TaskContext, TaskStatus};

const TIMEOUT: Duration = Duration::from_secs(10);

const SLOW: &str = r#"
name = "Slow"
module_type = "slow"

[trigger]
type = "event"
[trigger.config]
topic = "slow/in"
"#;

const HOURLY: &str = r#"
name = "Hourly"
module_type = "hourly"

[trigger]
type = "schedule"
[trigger.config]
trigger = "interval"
hours = 1
"#;

const TICKER: &str = r#"
name = "Ticker"
module_type = "ticker"

[trigger]
type = "schedule"
[trigger.config]
trigger = "interval"
seconds = 1
"#;

fn sleeper(hub: &taskhub::TaskHub, module_type: &str, millis: u64) -> Arc<AtomicUsize> {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    hub.modules().register_body(
        module_type,
        Arc::new(
            move |_: &TaskContext, _: &Inputs| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(millis));
                Ok(())
            },
        ),
    );
    runs
}

#[tokio::test]
async fn drop_policy_rejects_while_busy() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "slow", SLOW)).await;
    let runs = sleeper(&hub, "slow", 300);
    let mut events = hub.subscribe_events();
    let options = TaskOptions {
        busy_policy: Some(BusyPolicy::Drop),
        ..TaskOptions::default()
    };
    hub.tasks().create("slow", "slow", options).unwrap();
    hub.tasks().start("slow").unwrap();

    let first = hub.tasks().on_event("slow/in", &Payload::new());
    let second = hub.tasks().on_event("slow/in", &Payload::new());
    assert_eq!(first[0].1, DispatchOutcome::Started);
    assert_eq!(second[0].1, DispatchOutcome::Rejected(RejectReason::Busy));
    assert_eq!(hub.tasks().status("slow").unwrap(), TaskStatus::Running);

    let collected = collect_until(&mut events, TIMEOUT, |seen| successes(seen, "slow") == 1).await;
    assert_eq!(rejections(&collected, "slow"), vec![RejectReason::Busy]);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn queue_policy_runs_backlog_in_order() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "slow", SLOW)).await;
    let runs = sleeper(&hub, "slow", 200);
    let mut events = hub.subscribe_events();
    let options = TaskOptions {
        busy_policy: Some(BusyPolicy::Queue { capacity: 1 }),
        ..TaskOptions::default()
    };
    hub.tasks().create("slow", "slow", options).unwrap();
    hub.tasks().start("slow").unwrap();

    let outcomes: Vec<DispatchOutcome> = (0..3)
        .map(|_| hub.tasks().on_event("slow/in", &Payload::new())[0].1)
        .collect();
    assert_eq!(
        outcomes,
        vec![
            DispatchOutcome::Started,
            DispatchOutcome::Queued { depth: 1 },
            DispatchOutcome::Rejected(RejectReason::BacklogFull),
        ]
    );
    assert_eq!(hub.tasks().backlog("slow").unwrap(), 1);

    collect_until(&mut events, TIMEOUT, |seen| successes(seen, "slow") == 2).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(hub.tasks().backlog("slow").unwrap(), 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn default_policy_queues_events() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "slow", SLOW)).await;
    let runs = sleeper(&hub, "slow", 100);
    let mut events = hub.subscribe_events();
    hub.tasks()
        .create("slow", "slow", TaskOptions::default())
        .unwrap();
    hub.tasks().start("slow").unwrap();

    for _ in 0..3 {
        hub.bus().publish("slow/in", Payload::new()).unwrap();
    }
    collect_until(&mut events, TIMEOUT, |seen| successes(seen, "slow") == 3).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    hub.shutdown().await;
}

#[tokio::test]
async fn overlapping_schedule_firing_is_skipped() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "hourly", HOURLY)).await;
    let runs = sleeper(&hub, "hourly", 300);
    let mut events = hub.subscribe_events();
    hub.tasks()
        .create("hourly", "hourly", TaskOptions::default())
        .unwrap();
    hub.tasks().start("hourly").unwrap();
    assert!(hub.tasks().next_run("hourly").is_some());

    assert_eq!(
        hub.tasks().on_trigger("hourly", &Payload::new()).unwrap(),
        DispatchOutcome::Started
    );
    assert_eq!(
        hub.tasks().on_trigger("hourly", &Payload::new()).unwrap(),
        DispatchOutcome::Rejected(RejectReason::Busy)
    );

    collect_until(&mut events, TIMEOUT, |seen| successes(seen, "hourly") == 1).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(hub.tasks().status("hourly").unwrap(), TaskStatus::Scheduled);
    hub.shutdown().await;
}

#[tokio::test]
async fn interval_schedule_fires() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "ticker", TICKER)).await;
    let runs = sleeper(&hub, "ticker", 0);
    let mut events = hub.subscribe_events();
    hub.tasks()
        .create("ticker", "ticker", TaskOptions::default())
        .unwrap();
    hub.tasks().start("ticker").unwrap();

    let fired = wait_for(&mut events, Duration::from_secs(5), |e| is_outcome(e, "ticker")).await;
    assert!(matches!(fired, Some(RuntimeEvent::TaskSucceeded { .. })));
    assert!(runs.load(Ordering::SeqCst) >= 1);

    hub.tasks().stop("ticker").unwrap();
    assert!(hub.tasks().next_run("ticker").is_none());
    hub.shutdown().await;
}

#[tokio::test]
async fn stop_lets_running_body_finish() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "slow", SLOW)).await;
    let runs = sleeper(&hub, "slow", 300);
    let mut events = hub.subscribe_events();
    hub.tasks()
        .create("slow", "slow", TaskOptions::default())
        .unwrap();
    hub.tasks().start("slow").unwrap();

    assert_eq!(
        hub.tasks().on_event("slow/in", &Payload::new())[0].1,
        DispatchOutcome::Started
    );
    hub.tasks().stop("slow").unwrap();
    assert_eq!(hub.tasks().status("slow").unwrap(), TaskStatus::Running);
    assert!(hub.tasks().on_event("slow/in", &Payload::new()).is_empty());

    collect_until(&mut events, TIMEOUT, |seen| successes(seen, "slow") == 1).await;
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while hub.tasks().status("slow").unwrap() == TaskStatus::Running {
        assert!(tokio::time::Instant::now() < deadline, "slot never released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hub.tasks().status("slow").unwrap(), TaskStatus::Stopped);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn paused_schedule_skips_until_resumed() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "ticker", TICKER)).await;
    let runs = sleeper(&hub, "ticker", 0);
    let mut events = hub.subscribe_events();
    hub.tasks()
        .create("ticker", "ticker", TaskOptions::default())
        .unwrap();
    hub.tasks().start("ticker").unwrap();
    hub.tasks().pause("ticker").unwrap();
    assert_eq!(hub.tasks().status("ticker").unwrap(), TaskStatus::Paused);

    let fired = wait_for(&mut events, Duration::from_millis(2500), |e| {
        is_outcome(e, "ticker")
    })
    .await;
    assert!(fired.is_none(), "paused schedule fired: {fired:?}");
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    hub.tasks().resume("ticker").unwrap();
    let fired = wait_for(&mut events, Duration::from_secs(5), |e| is_outcome(e, "ticker")).await;
    assert!(matches!(fired, Some(RuntimeEvent::TaskSucceeded { .. })));
    hub.shutdown().await;
}

#[tokio::test]
async fn failed_attempts_are_retried() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "hourly", HOURLY)).await;
    hub.modules().register_body(
        "hourly",
        Arc::new(|ctx: &TaskContext, _: &Inputs| -> anyhow::Result<()> {
            ctx.log_progress("checking");
            if ctx.attempt() < 2 {
                anyhow::bail!("flaky upstream");
            }
            Ok(())
        }),
    );
    let mut events = hub.subscribe_events();
    let options = TaskOptions {
        retry: Some(RetryPolicy::fixed(3, Duration::from_millis(20))),
        ..TaskOptions::default()
    };
    hub.tasks().create("hourly", "flaky", options).unwrap();

    hub.tasks().run_now("flaky", &Payload::new()).unwrap();
    let outcome = wait_for(&mut events, TIMEOUT, |e| is_outcome(e, "flaky")).await;
    match outcome {
        Some(RuntimeEvent::TaskSucceeded { attempt, .. }) => assert_eq!(attempt, 2),
        other => panic!("expected success, got {other:?}"),
    }
    hub.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_report_failure() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "hourly", HOURLY)).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    hub.modules().register_body(
        "hourly",
        Arc::new(
            move |_: &TaskContext, _: &Inputs| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("always broken")
            },
        ),
    );
    let mut events = hub.subscribe_events();
    let options = TaskOptions {
        retry: Some(RetryPolicy::fixed(3, Duration::from_millis(10))),
        ..TaskOptions::default()
    };
    hub.tasks().create("hourly", "broken", options).unwrap();

    hub.tasks().run_now("broken", &Payload::new()).unwrap();
    let outcome = wait_for(&mut events, TIMEOUT, |e| is_outcome(e, "broken")).await;
    match outcome {
        Some(RuntimeEvent::TaskFailed {
            attempts: reported,
            error,
            ..
        }) => {
            assert_eq!(reported, 3);
            assert!(error.contains("always broken"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    hub.shutdown().await;
}

#[tokio::test]
async fn panicking_body_fails_without_poisoning_the_pool() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "hourly", HOURLY)).await;
    hub.modules().register_body(
        "hourly",
        Arc::new(|_: &TaskContext, inputs: &Inputs| -> anyhow::Result<()> {
            if inputs.contains_key("boom") {
                panic!("body exploded");
            }
            Ok(())
        }),
    );
    let mut events = hub.subscribe_events();
    hub.tasks()
        .create("hourly", "fragile", TaskOptions::default())
        .unwrap();

    let mut boom = Payload::new();
    boom.insert("boom".to_owned(), serde_json::Value::Bool(true));
    hub.tasks().run_now("fragile", &boom).unwrap();
    let outcome = wait_for(&mut events, TIMEOUT, |e| is_outcome(e, "fragile")).await;
    match outcome {
        Some(RuntimeEvent::TaskFailed { error, .. }) => assert!(error.contains("panicked")),
        other => panic!("expected failure, got {other:?}"),
    }

    hub.tasks().run_now("fragile", &Payload::new()).unwrap();
    let outcome = wait_for(&mut events, TIMEOUT, |e| is_outcome(e, "fragile")).await;
    assert!(matches!(outcome, Some(RuntimeEvent::TaskSucceeded { .. })));
    hub.shutdown().await;
}

#[tokio::test]
async fn body_logs_are_broadcast() {
    let (_dir, hub) = offline_hub(|root| write_module(root, "hourly", HOURLY)).await;
    hub.modules().register_body(
        "hourly",
        Arc::new(|ctx: &TaskContext, _: &Inputs| -> anyhow::Result<()> {
            ctx.logger().info("hello from the body");
            Ok(())
        }),
    );
    let mut events = hub.subscribe_events();
    hub.tasks()
        .create("hourly", "chatty", TaskOptions::default())
        .unwrap();
    hub.tasks().run_now("chatty", &Payload::new()).unwrap();

    let log = wait_for(&mut events, TIMEOUT, |e| {
        matches!(e, RuntimeEvent::TaskLog { task, .. } if task == "chatty")
    })
    .await;
    match log {
        Some(RuntimeEvent::TaskLog { message, .. }) => assert_eq!(message, "hello from the body"),
        other => panic!("expected log, got {other:?}"),
    }
    hub.shutdown().await;
}
