//! Input schema and the input validation protocol.
//!
//! Inputs may be declared as an array of tables:
//!
//! ```toml
//! [[inputs]]
//! name = "x"
//! type = "integer"
//! required = false
//! default = 10
//! ```
//!
//! or as a map keyed by field name (ordered by name):
//!
//! ```toml
//! [inputs.x]
//! type = "integer"
//! default = 10
//! ```

use crate::error::{HubError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Field → value mapping handed to a task body.
pub type Inputs = serde_json::Map<String, Value>;

/// Declared type of an input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl InputType {
    /// Whether `value` is acceptable for this type.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

impl std::fmt::Display for InputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

/// One declared input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    /// Field name. Filled from the key in the map form.
    #[serde(default)]
    pub name: String,
    /// Type tag.
    #[serde(rename = "type", default)]
    pub kind: InputType,
    /// Abort dispatch when neither the payload nor a default provides a value.
    #[serde(default)]
    pub required: bool,
    /// Value injected when the payload omits the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl InputField {
    /// An optional field of any type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: InputType::Any,
            required: false,
            default: None,
            description: String::new(),
        }
    }

    pub fn of_type(mut self, kind: InputType) -> Self {
        self.kind = kind;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Ordered list of declared input fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct InputSchema {
    fields: Vec<InputField>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSchema {
    List(Vec<InputField>),
    Map(BTreeMap<String, InputField>),
}

impl<'de> Deserialize<'de> for InputSchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let fields = match RawSchema::deserialize(deserializer)? {
            RawSchema::List(fields) => fields,
            RawSchema::Map(map) => map
                .into_iter()
                .map(|(key, mut field)| {
                    if field.name.is_empty() {
                        field.name = key;
                    }
                    field
                })
                .collect(),
        };
        Ok(Self { fields })
    }
}

impl InputSchema {
    pub fn new(fields: Vec<InputField>) -> Self {
        Self { fields }
    }

    /// Declared fields in order.
    pub fn fields(&self) -> &[InputField] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&InputField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checks names and default values.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] for empty or duplicate names, names
    /// with characters other than letters, digits, `_` or `-`, or defaults
    /// that do not match the declared type.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(HubError::validation("input `name` cannot be empty"));
            }
            if !field
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(HubError::Validation {
                    reason: format!(
                        "input name `{}` is invalid (use letters, digits, - or _)",
                        field.name
                    ),
                });
            }
            if field.name.starts_with("__") {
                return Err(HubError::Validation {
                    reason: format!("input name `{}` is reserved", field.name),
                });
            }
            if !seen.insert(field.name.as_str()) {
                return Err(HubError::Validation {
                    reason: format!("input `{}` is declared twice", field.name),
                });
            }
            if let Some(default) = &field.default
                && !field.kind.accepts(default)
            {
                return Err(HubError::Validation {
                    reason: format!(
                        "default for input `{}` is not of type {}",
                        field.name, field.kind
                    ),
                });
            }
        }
        Ok(())
    }

    /// Checks that every key in `statics` is declared and well-typed.
    ///
    /// An empty schema accepts anything.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Validation`] naming the first bad key.
    pub fn check_static_inputs(&self, statics: &Inputs) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        for (key, value) in statics {
            let Some(field) = self.field(key) else {
                return Err(HubError::Validation {
                    reason: format!("input `{key}` is not declared by the module"),
                });
            };
            if !field.kind.accepts(value) {
                return Err(HubError::Validation {
                    reason: format!("input `{key}` must be of type {}", field.kind),
                });
            }
        }
        Ok(())
    }

    /// Maps `payload` to the task's resolved inputs.
    ///
    /// For each declared field, in order: the payload value; else the
    /// instance's static input; else the declared default; else, when the
    /// field is required, the dispatch is aborted; else the field is omitted.
    /// With no declared fields the payload passes through unchanged.
    ///
    /// # Errors
    ///
    /// - [`HubError::MissingRequiredInput`] for the first required field with no value.
    /// - [`HubError::Validation`] when a supplied value has the wrong type.
    pub fn resolve(&self, task: &str, payload: &Inputs, statics: &Inputs) -> Result<Inputs> {
        if self.is_empty() {
            let mut resolved = statics.clone();
            resolved.extend(payload.iter().map(|(k, v)| (k.clone(), v.clone())));
            return Ok(resolved);
        }

        let mut resolved = Inputs::new();
        for field in &self.fields {
            let value = payload
                .get(&field.name)
                .or_else(|| statics.get(&field.name))
                .or(field.default.as_ref());
            match value {
                Some(value) => {
                    if !field.kind.accepts(value) {
                        return Err(HubError::Validation {
                            reason: format!(
                                "task `{task}`: input `{}` must be of type {}",
                                field.name, field.kind
                            ),
                        });
                    }
                    resolved.insert(field.name.clone(), value.clone());
                }
                None if field.required => {
                    return Err(HubError::MissingRequiredInput {
                        task: task.to_owned(),
                        field: field.name.clone(),
                    });
                }
                None => {}
            }
        }
        Ok(resolved)
    }
}
