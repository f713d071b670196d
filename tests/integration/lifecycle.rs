//! Module discovery, instance management, and persistence across restarts.

use crate::helpers::{is_outcome, payload, test_config, wait_for, write_module};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use taskhub::manifest::{EventSpec, Inputs, TriggerBinding};
use taskhub::tasks::{CONFIG_FILE, STATE_FILE, TaskOptions};
use taskhub::{HubError, Payload, RuntimeEvent, TaskContext, TaskHub, TaskStatus};

const TIMEOUT: Duration = Duration::from_secs(10);

const COUNTER: &str = r#"
name = "Counter"
module_type = "counter"
description = "Counts its own runs"

[trigger]
type = "event"
[trigger.config]
topic = "count/tick"

[settings]
step = 1
"#;

fn counting_body(hub: &TaskHub) {
    hub.modules().register_body(
        "counter",
        Arc::new(|ctx: &TaskContext, _: &Inputs| -> anyhow::Result<()> {
            let step = ctx.setting("step").and_then(|v| v.as_i64()).unwrap_or(1);
            ctx.state().with(|values| {
                let count = values.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
                values.insert("count".to_owned(), json!(count + step));
            })?;
            Ok(())
        }),
    );
}

#[tokio::test]
async fn discovery_lists_templates_and_skips_broken_ones() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "counter", COUNTER);
    write_module(dir.path(), "broken", "name = \"Broken\"\n");

    let hub = TaskHub::offline(test_config(dir.path())).await.unwrap();
    assert_eq!(hub.discovery().loaded, vec!["counter".to_owned()]);
    assert_eq!(hub.discovery().skipped.len(), 1);
    let template = hub.modules().get("counter").unwrap();
    assert_eq!(template.manifest.description, "Counts its own runs");
    hub.shutdown().await;
}

#[tokio::test]
async fn state_and_config_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "counter", COUNTER);

    let hub = TaskHub::offline(test_config(dir.path())).await.unwrap();
    counting_body(&hub);
    let mut events = hub.subscribe_events();
    let options = TaskOptions {
        persist_state: true,
        settings: payload(json!({"step": 5})),
        ..TaskOptions::default()
    };
    hub.tasks().create("counter", "counter", options).unwrap();
    hub.tasks().run_now("counter", &Payload::new()).unwrap();
    let outcome = wait_for(&mut events, TIMEOUT, |e| is_outcome(e, "counter")).await;
    assert!(matches!(outcome, Some(RuntimeEvent::TaskSucceeded { .. })));
    hub.shutdown().await;

    let task_dir = dir.path().join("tasks").join("counter");
    assert!(task_dir.join(CONFIG_FILE).is_file());
    assert!(task_dir.join(STATE_FILE).is_file());

    let mut config = test_config(dir.path());
    config.task_defaults.autostart = true;
    let hub = TaskHub::start(config).await.unwrap();
    counting_body(&hub);
    assert_eq!(hub.load_report().loaded, vec!["counter".to_owned()]);
    assert_eq!(hub.tasks().status("counter").unwrap(), TaskStatus::Listening);
    assert_eq!(hub.tasks().state("counter").unwrap()["count"], json!(5));
    assert_eq!(hub.tasks().config("counter").unwrap().settings["step"], json!(5));
    hub.shutdown().await;
}

#[tokio::test]
async fn disabled_instances_are_not_autostarted() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "counter", COUNTER);

    let hub = TaskHub::offline(test_config(dir.path())).await.unwrap();
    let options = TaskOptions {
        enabled: Some(false),
        ..TaskOptions::default()
    };
    hub.tasks().create("counter", "idle", options).unwrap();
    hub.tasks()
        .create("counter", "busy", TaskOptions::default())
        .unwrap();
    hub.shutdown().await;

    let mut config = test_config(dir.path());
    config.task_defaults.autostart = true;
    let hub = TaskHub::offline(config).await.unwrap();
    assert_eq!(hub.tasks().status("idle").unwrap(), TaskStatus::Configured);
    assert_eq!(hub.tasks().status("busy").unwrap(), TaskStatus::Listening);
    hub.shutdown().await;
}

#[tokio::test]
async fn start_and_stop_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "counter", COUNTER);

    let hub = TaskHub::offline(test_config(dir.path())).await.unwrap();
    let tasks = hub.tasks();
    tasks
        .create("counter", "kept", TaskOptions::default())
        .unwrap();
    tasks
        .create("counter", "halted", TaskOptions::default())
        .unwrap();
    let disabled = TaskOptions {
        enabled: Some(false),
        ..TaskOptions::default()
    };
    tasks.create("counter", "manual", disabled).unwrap();
    for name in ["kept", "halted", "manual"] {
        tasks.start(name).unwrap();
    }
    tasks.stop("halted").unwrap();
    tasks.pause("kept").unwrap();
    hub.shutdown().await;

    let mut config = test_config(dir.path());
    config.task_defaults.autostart = true;
    let hub = TaskHub::offline(config).await.unwrap();
    assert_eq!(hub.tasks().status("kept").unwrap(), TaskStatus::Listening);
    assert_eq!(hub.tasks().status("halted").unwrap(), TaskStatus::Configured);
    assert_eq!(hub.tasks().status("manual").unwrap(), TaskStatus::Listening);
    assert!(!hub.tasks().config("halted").unwrap().enabled);
    assert!(hub.tasks().config("manual").unwrap().enabled);
    hub.shutdown().await;
}

#[tokio::test]
async fn management_operations_keep_disk_in_sync() {
    let dir = tempfile::tempdir().unwrap();
    write_module(dir.path(), "counter", COUNTER);
    let hub = TaskHub::offline(test_config(dir.path())).await.unwrap();
    let tasks = hub.tasks();

    tasks
        .create("counter", "first", TaskOptions::default())
        .unwrap();
    assert!(matches!(
        tasks.create("counter", "first", TaskOptions::default()),
        Err(HubError::DuplicateName { .. })
    ));
    assert!(matches!(
        tasks.create("nope", "second", TaskOptions::default()),
        Err(HubError::UnknownTemplate { .. })
    ));

    let wrong_kind = TaskOptions {
        trigger: Some(TriggerBinding::Schedule(
            taskhub::manifest::ScheduleSpec::every_secs(60),
        )),
        ..TaskOptions::default()
    };
    assert!(matches!(
        tasks.create("counter", "second", wrong_kind),
        Err(HubError::Validation { .. })
    ));

    tasks.rename("first", "renamed").unwrap();
    let tasks_dir = dir.path().join("tasks");
    assert!(!tasks_dir.join("first").exists());
    assert!(tasks_dir.join("renamed").join("manifest.toml").is_file());

    tasks
        .update_config("renamed", |config| {
            config.trigger = TriggerBinding::Event(EventSpec::new("count/other").with_max_hops(1));
        })
        .unwrap();
    let reloaded = taskhub::tasks::TaskConfig::load(&tasks_dir.join("renamed")).unwrap();
    assert_eq!(
        reloaded.trigger,
        TriggerBinding::Event(EventSpec::new("count/other").with_max_hops(1))
    );

    tasks.delete("renamed").unwrap();
    assert!(!tasks_dir.join("renamed").exists());
    assert!(matches!(
        tasks.status("renamed"),
        Err(HubError::UnknownTask { .. })
    ));
    hub.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn script_module_runs_end_to_end() {
    if which::which("sh").is_err() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    write_module(
        dir.path(),
        "shell",
        r#"
name = "Shell"
module_type = "shell"
entry = "run.sh"
interpreter = "sh"

[trigger]
type = "event"
[trigger.config]
topic = "shell/in"

[assets]
copy_files = ["greeting.txt"]
"#,
    );
    let module_dir = dir.path().join("modules").join("shell");
    std::fs::write(
        module_dir.join("run.sh"),
        concat!(
            "read request\n",
            "greeting=$(cat greeting.txt)\n",
            "echo \"{\\\"type\\\":\\\"state\\\",\\\"key\\\":\\\"greeting\\\",\\\"value\\\":\\\"$greeting\\\"}\"\n",
        ),
    )
    .unwrap();
    std::fs::write(module_dir.join("greeting.txt"), "hi").unwrap();

    let hub = TaskHub::offline(test_config(dir.path())).await.unwrap();
    let mut events = hub.subscribe_events();
    hub.tasks()
        .create("shell", "shell", TaskOptions::default())
        .unwrap();
    hub.tasks().start("shell").unwrap();
    hub.bus().publish("shell/in", Payload::new()).unwrap();

    let outcome = wait_for(&mut events, TIMEOUT, |e| is_outcome(e, "shell")).await;
    assert!(
        matches!(outcome, Some(RuntimeEvent::TaskSucceeded { .. })),
        "{outcome:?}"
    );
    assert_eq!(hub.tasks().state("shell").unwrap()["greeting"], json!("hi"));
    hub.shutdown().await;
}
