//! Command registry and bounded execution history.
//!
//! The registry is generic over the handler reference: the host stores the
//! owning extension, the worker stores a slot into its JS handler table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    Builtin,
    #[default]
    Generic,
    /// Requires an active editor context at execution time.
    TextEditor,
}

impl CommandKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Generic => "generic",
            Self::TextEditor => "textEditor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("Command ID is required")]
    MissingName,
    #[error("Command ID must be a string")]
    NameNotString,
    #[error("Command handler must be a function")]
    HandlerNotCallable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub kind: CommandKind,
    /// The name was already registered and has been replaced.
    pub shadowed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<'a, H> {
    pub kind: CommandKind,
    pub handler: &'a H,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandListing {
    pub builtin: Vec<String>,
    pub generic: Vec<String>,
    pub text_editor: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CommandRegistry<H> {
    builtins: BTreeMap<String, H>,
    generic: BTreeMap<String, H>,
    text_editor: BTreeMap<String, H>,
    history: ExecutionHistory,
}

impl<H> Default for CommandRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> CommandRegistry<H> {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(capacity: usize) -> Self {
        Self {
            builtins: BTreeMap::new(),
            generic: BTreeMap::new(),
            text_editor: BTreeMap::new(),
            history: ExecutionHistory::new(capacity),
        }
    }

    /// Register a handler under a name that arrives untyped from extension code.
    ///
    /// `handler` is `None` when the caller supplied something that cannot be
    /// invoked. Every precondition has its own error and a rejected call has
    /// no side effects. Replacing an existing registration is allowed and is
    /// reported through [`Registration::shadowed`].
    pub fn register(
        &mut self,
        name: &Value,
        kind: CommandKind,
        handler: Option<H>,
    ) -> Result<Registration, RegisterError> {
        let name = match name {
            Value::Null => return Err(RegisterError::MissingName),
            Value::String(s) if s.trim().is_empty() => return Err(RegisterError::MissingName),
            Value::String(s) => s.clone(),
            _ => return Err(RegisterError::NameNotString),
        };
        let handler = handler.ok_or(RegisterError::HandlerNotCallable)?;
        Ok(self.insert(name, kind, handler))
    }

    /// Typed registration for names that are already known to be strings.
    pub fn register_named(
        &mut self,
        name: &str,
        kind: CommandKind,
        handler: H,
    ) -> Result<Registration, RegisterError> {
        self.register(&Value::String(name.to_string()), kind, Some(handler))
    }

    fn insert(&mut self, name: String, kind: CommandKind, handler: H) -> Registration {
        // One active handler per name across the extension categories.
        let mut shadowed = match kind {
            CommandKind::Builtin => false,
            CommandKind::Generic => self.text_editor.remove(&name).is_some(),
            CommandKind::TextEditor => self.generic.remove(&name).is_some(),
        };
        shadowed |= self.map_mut(kind).insert(name.clone(), handler).is_some();
        if shadowed {
            tracing::warn!(command = %name, kind = kind.as_str(), "Command registration overwritten");
        }
        Registration {
            name,
            kind,
            shadowed,
        }
    }

    /// Remove `name` if its current handler satisfies `owned`.
    pub fn unregister<F>(&mut self, name: &str, owned: F) -> bool
    where
        F: Fn(&H) -> bool,
    {
        for kind in [CommandKind::Generic, CommandKind::TextEditor] {
            let map = self.map_mut(kind);
            if map.get(name).is_some_and(&owned) {
                map.remove(name);
                return true;
            }
        }
        false
    }

    /// Drop every extension registration whose handler fails `keep`.
    /// Returns the removed names.
    pub fn retain<F>(&mut self, keep: F) -> Vec<String>
    where
        F: Fn(&H) -> bool,
    {
        let mut removed = Vec::new();
        for map in [&mut self.generic, &mut self.text_editor] {
            map.retain(|name, handler| {
                let kept = keep(handler);
                if !kept {
                    removed.push(name.clone());
                }
                kept
            });
        }
        removed.sort();
        removed
    }

    /// Look up in order: built-in, generic, text-editor.
    pub fn lookup(&self, name: &str) -> Option<Resolved<'_, H>> {
        [
            (CommandKind::Builtin, &self.builtins),
            (CommandKind::Generic, &self.generic),
            (CommandKind::TextEditor, &self.text_editor),
        ]
        .into_iter()
        .find_map(|(kind, map)| map.get(name).map(|handler| Resolved { kind, handler }))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .builtins
            .keys()
            .chain(self.generic.keys())
            .chain(self.text_editor.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn listing(&self) -> CommandListing {
        CommandListing {
            builtin: self.builtins.keys().cloned().collect(),
            generic: self.generic.keys().cloned().collect(),
            text_editor: self.text_editor.keys().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.builtins.len() + self.generic.len() + self.text_editor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    pub const fn history_mut(&mut self) -> &mut ExecutionHistory {
        &mut self.history
    }

    const fn map_mut(&mut self, kind: CommandKind) -> &mut BTreeMap<String, H> {
        match kind {
            CommandKind::Builtin => &mut self.builtins,
            CommandKind::Generic => &mut self.generic,
            CommandKind::TextEditor => &mut self.text_editor,
        }
    }
}

/// Result of asking the host to execute a command. Only `Completed` is a
/// success; none of these is an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CommandOutcome {
    Completed(Value),
    NotFound,
    /// Denied by the permission policy; carries the policy reason.
    NotAllowed(String),
    /// The owning extension is not activated.
    NotActive,
    NoActiveEditor,
    /// The handler threw or rejected.
    Failed(String),
    /// The worker did not answer in time or exited mid-request.
    Unresponsive,
}

impl CommandOutcome {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// One-line error summary stored in the execution history.
    pub fn error_summary(&self, command: &str) -> Option<String> {
        match self {
            Self::Completed(_) => None,
            Self::NotFound => Some(format!("Command not found: {command}")),
            Self::NotAllowed(reason) => Some(format!("Command not allowed: {command} ({reason})")),
            Self::NotActive => Some(format!("Extension owning '{command}' is not active")),
            Self::NoActiveEditor => Some(format!("No active text editor for command '{command}'")),
            Self::Failed(error) => Some(error.clone()),
            Self::Unresponsive => Some(format!("Worker unresponsive while executing '{command}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub command: String,
    pub args: Vec<Value>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryEntry {
    pub fn success(
        command: impl Into<String>,
        args: Vec<Value>,
        timestamp: DateTime<Utc>,
        duration_ms: u64,
        result: Value,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            timestamp,
            duration_ms,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(
        command: impl Into<String>,
        args: Vec<Value>,
        timestamp: DateTime<Utc>,
        duration_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            args,
            timestamp,
            duration_ms,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn from_outcome(
        command: impl Into<String>,
        args: Vec<Value>,
        timestamp: DateTime<Utc>,
        duration_ms: u64,
        outcome: &CommandOutcome,
    ) -> Self {
        let command = command.into();
        match outcome {
            CommandOutcome::Completed(value) => {
                Self::success(command, args, timestamp, duration_ms, value.clone())
            }
            other => {
                let error = other.error_summary(&command).unwrap_or_default();
                Self::failure(command, args, timestamp, duration_ms, error)
            }
        }
    }

    pub const fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryFilter {
    #[serde(alias = "commandId")]
    pub command: Option<String>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        self.command.as_ref().is_none_or(|c| *c == entry.command)
            && self.success.is_none_or(|s| s == entry.succeeded())
            && self.since.is_none_or(|since| entry.timestamp >= since)
    }
}

/// Append-only ring; the oldest entry is evicted once capacity is exceeded.
#[derive(Debug, Clone)]
pub struct ExecutionHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl Default for ExecutionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn newest_first(&self) -> Vec<HistoryEntry> {
        self.entries.iter().rev().cloned().collect()
    }

    pub fn filter(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        self.entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
