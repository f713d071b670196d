//! Task instance configuration (`config.toml`).
//!
//! The file in the instance directory is the durable source of truth. It is
//! rewritten atomically on every mutation and re-read afterwards.

use super::retry::RetryPolicy;
use crate::bus::Payload;
use crate::config::BusyPolicy;
use crate::error::{HubError, Result};
use crate::manifest::{ModuleManifest, TriggerBinding};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name of an instance configuration.
pub const CONFIG_FILE: &str = "config.toml";

/// Configuration of one task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Unique instance name; also the directory name.
    pub name: String,
    /// Template this instance was created from.
    pub module_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Flush `state.json` after every state write.
    #[serde(default)]
    pub persist_state: bool,
    /// Per-instance override of the event busy policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_policy: Option<BusyPolicy>,
    pub trigger: TriggerBinding,
    /// Static inputs; used when a trigger payload lacks a field.
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub inputs: Payload,
    /// Free-form settings handed to the task body.
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub settings: Payload,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_true() -> bool {
    true
}

/// Caller-supplied overrides for [`TaskRegistry::create`](super::TaskRegistry::create).
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub enabled: Option<bool>,
    pub persist_state: bool,
    /// Replaces the template's default trigger (kind must match).
    pub trigger: Option<TriggerBinding>,
    pub inputs: Payload,
    /// Merged over the template's default settings.
    pub settings: Payload,
    pub retry: Option<RetryPolicy>,
    pub busy_policy: Option<BusyPolicy>,
}

impl TaskConfig {
    /// Builds an instance config from a template and caller overrides.
    pub fn from_manifest(name: &str, manifest: &ModuleManifest, options: TaskOptions) -> Self {
        let mut settings = manifest.settings.clone();
        settings.extend(options.settings);
        Self {
            name: name.to_owned(),
            module_type: manifest.module_type.clone(),
            enabled: options.enabled.unwrap_or(manifest.enabled),
            persist_state: options.persist_state,
            busy_policy: options.busy_policy,
            trigger: options.trigger.unwrap_or_else(|| manifest.trigger.clone()),
            inputs: options.inputs,
            settings,
            retry: options.retry.unwrap_or_default(),
        }
    }

    /// Reads `config.toml` from an instance directory.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] if the file is missing, unparseable,
    /// or fails [`TaskConfig::validate`].
    pub fn load(task_dir: &Path) -> Result<Self> {
        let path = task_dir.join(CONFIG_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| HubError::Validation {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| HubError::Validation {
            reason: format!("invalid {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes `config.toml` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if a value cannot be represented in TOML,
    /// or an I/O error.
    pub fn save(&self, task_dir: &Path) -> Result<()> {
        let body = toml::to_string_pretty(self).map_err(|e| HubError::Config(e.to_string()))?;
        let path = task_dir.join(CONFIG_FILE);
        let tmp = task_dir.join(format!("{CONFIG_FILE}.tmp"));
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Checks the shape of the config on its own.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] for a bad name, trigger, retry policy,
    /// or busy policy.
    pub fn validate(&self) -> Result<()> {
        validate_task_name(&self.name)?;
        if self.module_type.trim().is_empty() {
            return Err(HubError::validation("`module_type` cannot be empty"));
        }
        self.trigger.validate()?;
        self.retry.validate()?;
        if let Some(BusyPolicy::Queue { capacity: 0 }) = self.busy_policy {
            return Err(HubError::validation(
                "`busy_policy` queue capacity must be at least 1",
            ));
        }
        Ok(())
    }

    /// Checks the config against the template it was created from.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] if the module type or trigger kind
    /// differs, or a static input is undeclared or mistyped.
    pub fn validate_against(&self, manifest: &ModuleManifest) -> Result<()> {
        self.validate()?;
        if self.module_type != manifest.module_type {
            return Err(HubError::Validation {
                reason: format!(
                    "task `{}` is a `{}` but its manifest declares `{}`",
                    self.name, self.module_type, manifest.module_type
                ),
            });
        }
        if self.trigger.kind() != manifest.trigger_kind() {
            return Err(HubError::Validation {
                reason: format!(
                    "task `{}` uses a {} trigger but module `{}` declares {}",
                    self.name,
                    self.trigger.kind(),
                    manifest.module_type,
                    manifest.trigger_kind()
                ),
            });
        }
        manifest.inputs.check_static_inputs(&self.inputs)
    }
}

/// Checks that `name` can be used as a directory name under the tasks root.
///
/// # Errors
///
/// Returns [`HubError::Validation`] for empty names, `.`/`..`, names with path
/// separators, surrounding whitespace, or control characters.
pub fn validate_task_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(HubError::validation("task name cannot be empty"));
    }
    if name.trim() != name {
        return Err(HubError::Validation {
            reason: format!("task name `{name}` has leading or trailing whitespace"),
        });
    }
    if name == "." || name == ".." {
        return Err(HubError::Validation {
            reason: format!("task name `{name}` points outside the tasks directory"),
        });
    }
    if name.contains(['/', '\\']) {
        return Err(HubError::Validation {
            reason: format!("task name `{name}` cannot contain path separators"),
        });
    }
    if name.chars().any(char::is_control) {
        return Err(HubError::Validation {
            reason: format!("task name `{}` contains control characters", name.escape_debug()),
        });
    }
    Ok(())
}
