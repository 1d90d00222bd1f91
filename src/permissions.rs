//! Command permission engine.
//!
//! A [`PermissionPolicy`] is an immutable snapshot; [`PolicyHandle`] lets the
//! host swap snapshots atomically between checks. Evaluation never mutates a
//! policy.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

/// Environment variable listing namespaces whose commands skip the policy.
pub const TRUSTED_NAMESPACES_ENV: &str = "EXTHOST_TRUSTED_NAMESPACES";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PermissionPolicy {
    #[serde(alias = "allowedCommands", alias = "allowed_commands")]
    pub allow: Vec<String>,
    #[serde(alias = "deniedCommands", alias = "denied_commands")]
    pub deny: Vec<String>,
    #[serde(alias = "alwaysAllowExecute", alias = "always_allow_execute")]
    pub always_allow: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub decision: PermissionDecision,
    pub command: String,
    pub reason: String,
}

impl PermissionCheck {
    fn new(decision: PermissionDecision, command: &str, reason: &str) -> Self {
        Self {
            decision,
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == PermissionDecision::Allow
    }
}

impl PermissionPolicy {
    pub fn allow_all() -> Self {
        Self {
            always_allow: true,
            ..Self::default()
        }
    }

    /// Evaluate a command against this snapshot.
    ///
    /// Deny-list matches win over allow-list matches. An empty allow-list
    /// denies anything not explicitly allowed.
    pub fn evaluate(&self, command: &str) -> PermissionCheck {
        let command = command.trim();
        if self.always_allow {
            return PermissionCheck::new(PermissionDecision::Allow, command, "always_allow");
        }
        if command.is_empty() {
            return PermissionCheck::new(PermissionDecision::Deny, command, "empty_command");
        }
        if self.deny.iter().any(|entry| entry_matches(entry, command)) {
            return PermissionCheck::new(PermissionDecision::Deny, command, "deny_list");
        }
        if self.allow.is_empty() {
            return PermissionCheck::new(PermissionDecision::Deny, command, "empty_allow_list");
        }
        if self.allow.iter().any(|entry| entry_matches(entry, command)) {
            PermissionCheck::new(PermissionDecision::Allow, command, "allow_list")
        } else {
            PermissionCheck::new(PermissionDecision::Deny, command, "not_in_allow_list")
        }
    }
}

/// Evaluate `command` against an optional policy. No policy denies everything.
pub fn evaluate(command: &str, policy: Option<&PermissionPolicy>) -> PermissionCheck {
    policy.map_or_else(
        || PermissionCheck::new(PermissionDecision::Deny, command.trim(), "no_policy"),
        |policy| policy.evaluate(command),
    )
}

pub fn is_allowed(command: &str, policy: Option<&PermissionPolicy>) -> bool {
    evaluate(command, policy).is_allowed()
}

/// Full check used by the host: built-in commands and trusted namespaces
/// bypass the policy before it is consulted.
pub fn check_command(
    command: &str,
    policy: Option<&PermissionPolicy>,
    is_builtin: bool,
    trusted: &TrustedNamespaces,
) -> PermissionCheck {
    if is_builtin {
        return PermissionCheck::new(PermissionDecision::Allow, command, "builtin");
    }
    if trusted.contains(command) {
        return PermissionCheck::new(PermissionDecision::Allow, command, "trusted_namespace");
    }
    evaluate(command, policy)
}

// An entry matches exactly, as a whole leading word ("git" matches
// "git status"), or as a prefix when it ends with `*`. Matching is anchored at
// the start, so "git push" does not match "git -C . push".
fn entry_matches(entry: &str, command: &str) -> bool {
    let entry = entry.trim();
    if entry.is_empty() {
        return false;
    }
    if let Some(prefix) = entry.strip_suffix('*') {
        return command.starts_with(prefix);
    }
    command == entry
        || command
            .strip_prefix(entry)
            .is_some_and(|rest| rest.starts_with(char::is_whitespace))
}

/// Namespaces whose commands bypass the policy, e.g. `test` covers `test.*`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedNamespaces(Vec<String>);

impl TrustedNamespaces {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            namespaces
                .into_iter()
                .map(|ns| ns.as_ref().trim().trim_end_matches('.').to_string())
                .filter(|ns| !ns.is_empty())
                .collect(),
        )
    }

    /// Parse a comma-separated list.
    pub fn parse(raw: &str) -> Self {
        Self::new(raw.split(','))
    }

    pub fn from_env() -> Option<Self> {
        std::env::var(TRUSTED_NAMESPACES_ENV)
            .ok()
            .map(|raw| Self::parse(&raw))
    }

    pub fn contains(&self, command: &str) -> bool {
        self.0.iter().any(|ns| {
            command
                .strip_prefix(ns.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// Shared, atomically swappable policy slot.
#[derive(Debug, Clone, Default)]
pub struct PolicyHandle(Arc<RwLock<Option<Arc<PermissionPolicy>>>>);

impl PolicyHandle {
    pub fn new(policy: Option<PermissionPolicy>) -> Self {
        Self(Arc::new(RwLock::new(policy.map(Arc::new))))
    }

    pub fn snapshot(&self) -> Option<Arc<PermissionPolicy>> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, policy: Option<PermissionPolicy>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = policy.map(Arc::new);
    }
}
