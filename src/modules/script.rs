//! Task body that runs the instance's entry script as a child process.
//!
//! Protocol:
//!
//! - stdin receives one JSON object:
//!   `{"task", "settings", "inputs", "state", "attempt", "total_attempts", "hop_count"}`.
//! - every stdout line that parses as a JSON object with a `type` field is a
//!   record:
//!   - `{"type": "log", "level": "info", "message": "..."}`
//!   - `{"type": "publish", "topic": "...", "payload": {...}}`
//!   - `{"type": "state", "key": "...", "value": ...}`
//! - any other stdout line is logged as-is at info level.
//! - a non-zero exit status fails the attempt; stderr is included in the error.

use super::TaskBody;
use crate::bus::Payload;
use crate::manifest::Inputs;
use crate::runtime::TaskLogLevel;
use crate::tasks::TaskContext;
use anyhow::{Context as _, bail};
use serde::Deserialize;
use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Stderr bytes kept for error messages.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    Log {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
    Publish {
        topic: String,
        #[serde(default)]
        payload: Payload,
    },
    State {
        key: String,
        value: Value,
    },
}

/// Runs `interpreter script` (or the script directly) in the instance directory.
#[derive(Debug, Clone)]
pub struct ScriptBody {
    interpreter: Option<String>,
    script: PathBuf,
}

impl ScriptBody {
    pub fn new(interpreter: Option<String>, script: PathBuf) -> Self {
        Self {
            interpreter,
            script,
        }
    }

    fn command(&self) -> anyhow::Result<Command> {
        match &self.interpreter {
            Some(interpreter) => {
                let program = which::which(interpreter)
                    .with_context(|| format!("interpreter `{interpreter}` not found on PATH"))?;
                let mut command = Command::new(program);
                command.arg(&self.script);
                Ok(command)
            }
            None => Ok(Command::new(&self.script)),
        }
    }

    fn handle_line(ctx: &TaskContext, line: &str) -> anyhow::Result<()> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let Ok(record) = serde_json::from_str::<Record>(trimmed) else {
            ctx.logger().info(trimmed);
            return Ok(());
        };
        match record {
            Record::Log { level, message } => {
                let level = match level.as_deref() {
                    Some("debug") => TaskLogLevel::Debug,
                    Some("warn" | "warning") => TaskLogLevel::Warn,
                    Some("error") => TaskLogLevel::Error,
                    _ => TaskLogLevel::Info,
                };
                ctx.logger().log(level, &message);
            }
            Record::Publish { topic, payload } => {
                ctx.publish(&topic, payload)
                    .with_context(|| format!("script publish to `{topic}` failed"))?;
            }
            Record::State { key, value } => {
                ctx.update_state(&key, value)
                    .with_context(|| format!("script state write `{key}` failed"))?;
            }
        }
        Ok(())
    }
}

impl TaskBody for ScriptBody {
    fn execute(&self, ctx: &TaskContext, inputs: &Inputs) -> anyhow::Result<()> {
        if !self.script.is_file() {
            bail!("entry script {} does not exist", self.script.display());
        }
        let mut child = self
            .command()?
            .current_dir(ctx.task_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("cannot start {}", self.script.display()))?;

        let request = json!({
            "task": ctx.task_name(),
            "settings": ctx.settings(),
            "inputs": inputs,
            "state": ctx.state().snapshot(),
            "attempt": ctx.attempt(),
            "total_attempts": ctx.total_attempts(),
            "hop_count": ctx.hop_count(),
        });
        if let Some(mut stdin) = child.stdin.take() {
            // A script that ignores stdin may exit before reading it.
            if let Err(e) = writeln!(stdin, "{request}") {
                tracing::debug!(task = %ctx.task_name(), error = %e, "script closed stdin early");
            }
        }

        let stderr = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let mut protocol_error = None;
        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&raw);
                        if protocol_error.is_none()
                            && let Err(e) = Self::handle_line(ctx, &line)
                        {
                            protocol_error = Some(e);
                        }
                    }
                    Err(e) => {
                        // The child is still reaped below.
                        if protocol_error.is_none() {
                            protocol_error =
                                Some(anyhow::Error::new(e).context("reading script output"));
                        }
                        break;
                    }
                }
            }
        }

        let status = child.wait().context("waiting for script")?;
        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .map(|buf| tail(&buf))
            .unwrap_or_default();

        if !status.success() {
            if stderr.is_empty() {
                bail!("script exited with {status}");
            }
            bail!("script exited with {status}: {stderr}");
        }
        if let Some(e) = protocol_error {
            return Err(e);
        }
        if !stderr.is_empty() {
            ctx.logger().warn(&stderr);
        }
        Ok(())
    }
}

fn tail(buf: &[u8]) -> String {
    let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&buf[start..]).trim().to_owned()
}
