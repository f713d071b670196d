//! Module template manifest (`manifest.toml`).
//!
//! Every module template directory contains a `manifest.toml` describing its
//! trigger, input schema, and assets. Task instances keep their own copy so
//! they do not depend on the template after creation.
//!
//! # Example `manifest.toml`
//!
//! ```toml
//! name = "Forwarder"
//! module_type = "forwarder"
//! version = "1.0.0"
//! description = "Republishes every event it receives."
//! entry = "main.py"
//! interpreter = "python3"
//!
//! [trigger]
//! type = "event"
//! [trigger.config]
//! topic = "chain/a"
//! max_hops = 2
//!
//! [[inputs]]
//! name = "x"
//! type = "integer"
//! default = 10
//!
//! [assets]
//! copy_files = ["templates/message.txt"]
//! ```

pub mod assets;
pub mod inputs;
pub mod trigger;

pub use assets::{AssetList, safe_relative_path};
pub use inputs::{InputField, InputSchema, InputType, Inputs};
pub use trigger::{EventSpec, ScheduleSpec, TriggerBinding, TriggerKind};

use crate::error::{HubError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name of a template manifest.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// Parsed, validated module template manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Display name.
    pub name: String,
    /// Unique catalog key.
    ///
    /// Lowercase ASCII letters, digits, `-` and `_` only.
    pub module_type: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Default `enabled` flag for new instances.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Script run for each execution when no native body is registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
    /// Interpreter for `entry` (looked up on `PATH`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    /// Default trigger for new instances; also fixes the trigger kind.
    pub trigger: TriggerBinding,
    #[serde(default, skip_serializing_if = "InputSchema::is_empty")]
    pub inputs: InputSchema,
    #[serde(default)]
    pub assets: AssetList,
    /// Default settings copied into new instances.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

fn default_version() -> String {
    "0.1.0".to_owned()
}

fn default_true() -> bool {
    true
}

impl ModuleManifest {
    /// Loads and validates `manifest.toml` from `dir`.
    ///
    /// # Errors
    ///
    /// - [`HubError::Validation`] if the file cannot be read or parsed, or a
    ///   field is malformed.
    /// - [`HubError::UnsafeAssetPath`] if an asset or the entry escapes `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&manifest_path).map_err(|e| HubError::Validation {
            reason: format!("cannot read {}: {e}", manifest_path.display()),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parses and validates manifest text.
    ///
    /// # Errors
    ///
    /// See [`ModuleManifest::load_from_dir`].
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(raw).map_err(|e| HubError::Validation {
            reason: format!("invalid manifest.toml: {e}"),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serializes the manifest back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if a setting cannot be represented in TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| HubError::Config(e.to_string()))
    }

    /// Validates that the manifest fields are well-formed.
    ///
    /// # Errors
    ///
    /// See [`ModuleManifest::load_from_dir`].
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HubError::validation("manifest.toml: `name` cannot be empty"));
        }
        if self.module_type.trim().is_empty() {
            return Err(HubError::validation(
                "manifest.toml: `module_type` cannot be empty",
            ));
        }
        if !self
            .module_type
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(HubError::Validation {
                reason: format!(
                    "manifest.toml: `module_type` `{}` is invalid (use lowercase letters, digits, - or _)",
                    self.module_type
                ),
            });
        }
        if self.version.trim().is_empty() {
            return Err(HubError::validation(
                "manifest.toml: `version` cannot be empty",
            ));
        }

        self.trigger.validate()?;
        self.inputs.validate()?;
        self.assets.validate()?;
        if let Some(entry) = &self.entry {
            safe_relative_path(entry)?;
        }
        Ok(())
    }

    /// Declared trigger kind.
    pub fn trigger_kind(&self) -> TriggerKind {
        self.trigger.kind()
    }

    /// Every file an instance copies: the entry script first, then assets.
    pub fn files_to_copy(&self) -> Vec<&str> {
        self.entry
            .iter()
            .map(String::as_str)
            .chain(self.assets.copy_files.iter().map(String::as_str))
            .collect()
    }
}
