//! Command registry and execution history, driven through the public API.
//!
//! Covers:
//! - Registration preconditions and category switching
//! - Ownership-aware removal on deactivation
//! - History ring bounds and filtering

use chrono::{Duration, Utc};
use exthost::commands::{
    CommandKind, CommandOutcome, CommandRegistry, ExecutionHistory, HistoryEntry, HistoryFilter,
    RegisterError,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{Value, json};

// ============================================================================
// Registration
// ============================================================================

#[test]
fn untyped_names_are_validated_before_handlers() {
    let mut registry: CommandRegistry<&str> = CommandRegistry::new();
    assert_eq!(
        registry.register(&Value::Null, CommandKind::Generic, None),
        Err(RegisterError::MissingName)
    );
    assert_eq!(
        registry.register(&json!(42), CommandKind::Generic, Some("ext")),
        Err(RegisterError::NameNotString)
    );
    assert_eq!(
        registry.register(&json!("a.b"), CommandKind::Generic, None),
        Err(RegisterError::HandlerNotCallable)
    );
    assert!(registry.is_empty());
}

#[test]
fn builtins_win_lookup_over_extension_commands() {
    let mut registry: CommandRegistry<&str> = CommandRegistry::new();
    registry
        .register_named("exthost.listCommands", CommandKind::Builtin, "host")
        .expect("builtin");
    let registration = registry
        .register_named("exthost.listCommands", CommandKind::Generic, "ext")
        .expect("generic");
    assert!(!registration.shadowed);

    let resolved = registry.lookup("exthost.listCommands").expect("found");
    assert_eq!(resolved.kind, CommandKind::Builtin);
    assert_eq!(*resolved.handler, "host");
}

#[test]
fn text_editor_registration_replaces_generic() {
    let mut registry: CommandRegistry<&str> = CommandRegistry::new();
    registry
        .register_named("fmt.run", CommandKind::Generic, "a")
        .expect("generic");
    let registration = registry
        .register_named("fmt.run", CommandKind::TextEditor, "b")
        .expect("editor");
    assert!(registration.shadowed);
    let listing = registry.listing();
    assert!(listing.generic.is_empty());
    assert_eq!(listing.text_editor, vec!["fmt.run".to_string()]);
}

#[test]
fn retain_drops_only_the_departing_owner() {
    let mut registry: CommandRegistry<String> = CommandRegistry::new();
    for (name, owner) in [("a.one", "a"), ("a.two", "a"), ("b.one", "b")] {
        registry
            .register_named(name, CommandKind::Generic, owner.to_string())
            .expect("register");
    }
    let removed = registry.retain(|owner| owner != "a");
    assert_eq!(removed, vec!["a.one".to_string(), "a.two".to_string()]);
    assert_eq!(registry.names(), vec!["b.one".to_string()]);
    assert!(!registry.unregister("b.one", |owner| owner == "a"));
    assert!(registry.unregister("b.one", |owner| owner == "b"));
}

// ============================================================================
// History
// ============================================================================

#[test]
fn outcomes_become_history_entries() {
    let now = Utc::now();
    let ok = HistoryEntry::from_outcome("x", vec![json!(1)], now, 3, &CommandOutcome::Completed(json!("r")));
    assert!(ok.succeeded());
    assert_eq!(ok.result, Some(json!("r")));

    let denied = HistoryEntry::from_outcome(
        "x",
        vec![],
        now,
        0,
        &CommandOutcome::NotAllowed("deny_list".to_string()),
    );
    assert!(!denied.succeeded());
    assert_eq!(denied.error.as_deref(), Some("Command not allowed: x (deny_list)"));
}

#[test]
fn filter_since_excludes_older_entries() {
    let mut history = ExecutionHistory::new(10);
    let now = Utc::now();
    history.record(HistoryEntry::success("old", vec![], now - Duration::seconds(60), 0, json!(null)));
    history.record(HistoryEntry::success("new", vec![], now, 0, json!(null)));
    let filter = HistoryFilter {
        since: Some(now - Duration::seconds(1)),
        ..HistoryFilter::default()
    };
    let found: Vec<String> = history.filter(&filter).into_iter().map(|e| e.command).collect();
    assert_eq!(found, vec!["new".to_string()]);
}

#[test]
fn zero_capacity_still_keeps_latest() {
    let mut history = ExecutionHistory::new(0);
    history.record(HistoryEntry::success("a", vec![], Utc::now(), 0, json!(null)));
    history.record(HistoryEntry::success("b", vec![], Utc::now(), 0, json!(null)));
    assert_eq!(history.capacity(), 1);
    assert_eq!(history.newest_first()[0].command, "b");
}

proptest! {
    #[test]
    fn prop_history_is_bounded_and_keeps_newest(
        capacity in 1usize..20,
        count in 0usize..60,
    ) {
        let mut history = ExecutionHistory::new(capacity);
        for i in 0..count {
            history.record(HistoryEntry::success(format!("c{i}"), vec![], Utc::now(), 0, json!(i)));
        }
        prop_assert_eq!(history.len(), count.min(capacity));
        let kept: Vec<String> = history.iter().map(|e| e.command.clone()).collect();
        let expected: Vec<String> = (count.saturating_sub(capacity)..count).map(|i| format!("c{i}")).collect();
        prop_assert_eq!(kept, expected);
    }

    #[test]
    fn prop_blank_names_are_missing(name in "[ \t]{0,6}") {
        let mut registry: CommandRegistry<u8> = CommandRegistry::new();
        prop_assert_eq!(
            registry.register(&json!(name), CommandKind::Generic, Some(1)),
            Err(RegisterError::MissingName)
        );
    }
}
