//! Action types for the guard pipeline
//!
//! An action is a proposed operation (generated code, a file edit, a shell
//! command) that must be judged before it is allowed to run. Actions are
//! immutable once built: corrections produce a new action through
//! [`Action::derive_with_content`].

use crate::types::{fingerprint, now, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Well-known context keys
pub mod context_keys {
    pub const WORKING_DIR: &str = "working_dir";
    pub const LANGUAGE: &str = "language";
    pub const TARGET_FILES: &str = "target_files";
    pub const USER_CONFIRMED: &str = "user_confirmed";
    pub const NETWORK_CONSENT: &str = "network_consent";
    pub const IMPACT_ANALYSIS: &str = "impact_analysis";
    pub const PREVIOUS_CONTENT: &str = "previous_content";
    pub const TEST_SCOPE: &str = "test_scope";
    pub const DERIVED_FROM: &str = "derived_from";
}

/// Kind of operation an action proposes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    CodeGeneration,
    FileEdit,
    ShellCommand,
    FileDelete,
    Custom(String),
}

impl ActionType {
    /// Whether the content is expected to be source code
    pub fn carries_code(&self) -> bool {
        matches!(self, ActionType::CodeGeneration | ActionType::FileEdit)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::CodeGeneration => f.write_str("CODE_GENERATION"),
            ActionType::FileEdit => f.write_str("FILE_EDIT"),
            ActionType::ShellCommand => f.write_str("SHELL_COMMAND"),
            ActionType::FileDelete => f.write_str("FILE_DELETE"),
            ActionType::Custom(name) => write!(f, "CUSTOM({})", name),
        }
    }
}

/// Ordered string-keyed context attached to an action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionContext(BTreeMap<String, Value>);

impl ActionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// String value for a key, if present and a string
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Truthy flag: `true`, or one of `"true"`, `"yes"`, `"1"`
    pub fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(value)) => *value,
            Some(Value::String(value)) => {
                matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "1")
            }
            Some(Value::Number(value)) => value.as_i64() == Some(1),
            _ => false,
        }
    }

    /// A list of strings; a bare string is treated as a one-element list
    pub fn strings(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::String(value)) => vec![value.clone()],
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Non-empty text under a key
    pub fn has_text(&self, key: &str) -> bool {
        self.str(key).map_or(false, |text| !text.trim().is_empty())
    }

    fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }
}

/// A proposed operation awaiting judgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    id: Uuid,
    action_type: ActionType,
    content: String,
    #[serde(default)]
    context: ActionContext,
    timestamp: Timestamp,
}

impl Action {
    /// Create a new action
    pub fn new(action_type: ActionType, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type,
            content: content.into(),
            context: ActionContext::new(),
            timestamp: now(),
        }
    }

    /// Shorthand for a code generation action
    pub fn code(content: impl Into<String>) -> Self {
        Self::new(ActionType::CodeGeneration, content)
    }

    /// Shorthand for a shell command action
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(ActionType::ShellCommand, command)
    }

    /// Shorthand for a file edit action
    pub fn file_edit(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(ActionType::FileEdit, content)
            .with_context(context_keys::TARGET_FILES, vec![path.into()])
    }

    /// Attach a context entry while building the action
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key, value.into());
        self
    }

    /// Get action ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn action_type(&self) -> &ActionType {
        &self.action_type
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn context(&self) -> &ActionContext {
        &self.context
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Build a new action with replaced content, keeping type and context.
    ///
    /// The new action has a fresh id and records the original id under
    /// `derived_from`.
    pub fn derive_with_content(&self, content: impl Into<String>) -> Action {
        let mut context = self.context.clone();
        context.insert(context_keys::DERIVED_FROM, Value::String(self.id.to_string()));
        Action {
            id: Uuid::new_v4(),
            action_type: self.action_type.clone(),
            content: content.into(),
            context,
            timestamp: now(),
        }
    }

    /// Build a new action of another type over the given content
    pub fn derive_as(&self, action_type: ActionType, content: impl Into<String>) -> Action {
        let mut derived = self.derive_with_content(content);
        derived.action_type = action_type;
        derived
    }

    /// Id of the action this one was derived from, if any
    pub fn derived_from(&self) -> Option<Uuid> {
        self.context
            .str(context_keys::DERIVED_FROM)
            .and_then(|id| Uuid::parse_str(id).ok())
    }

    /// Blake3 fingerprint of the content
    pub fn content_hash(&self) -> String {
        fingerprint(&self.content)
    }

    pub fn line_count(&self) -> usize {
        self.content.lines().count()
    }
}
