//! Permission engine behavior across policies, bypasses and hot swaps.

use exthost::permissions::{
    PermissionDecision, PermissionPolicy, PolicyHandle, TrustedNamespaces, check_command,
    evaluate, is_allowed,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn policy(allow: &[&str], deny: &[&str]) -> PermissionPolicy {
    PermissionPolicy {
        allow: allow.iter().map(ToString::to_string).collect(),
        deny: deny.iter().map(ToString::to_string).collect(),
        always_allow: false,
    }
}

#[test]
fn settings_shape_deserializes() {
    let parsed: PermissionPolicy = serde_json::from_str(
        r#"{"allowedCommands": ["git", "npm run*"], "deniedCommands": ["git push"], "alwaysAllowExecute": false}"#,
    )
    .expect("parse policy");
    assert_eq!(parsed, policy(&["git", "npm run*"], &["git push"]));
}

#[test]
fn deny_beats_allow() {
    let p = policy(&["git"], &["git push"]);
    assert!(is_allowed("git status", Some(&p)));
    let check = evaluate("git push origin", Some(&p));
    assert_eq!(check.decision, PermissionDecision::Deny);
    assert_eq!(check.reason, "deny_list");
}

#[test]
fn deny_entries_only_match_leading_arguments() {
    let p = policy(&["git"], &["git push"]);
    assert!(!is_allowed("git push origin", Some(&p)));
    assert!(is_allowed("git -C . push", Some(&p)));
}

#[test]
fn word_prefix_does_not_match_longer_words() {
    let p = policy(&["git"], &[]);
    assert!(!is_allowed("gitk", Some(&p)));
    assert!(is_allowed("git", Some(&p)));
}

#[test]
fn wildcard_suffix_matches_prefix() {
    let p = policy(&["npm run*"], &[]);
    assert!(is_allowed("npm run build", Some(&p)));
    assert!(is_allowed("npm runner", Some(&p)));
    assert!(!is_allowed("npm install", Some(&p)));
}

#[test]
fn no_policy_and_empty_allow_list_deny() {
    assert_eq!(evaluate("ls", None).reason, "no_policy");
    assert_eq!(
        evaluate("ls", Some(&PermissionPolicy::default())).reason,
        "empty_allow_list"
    );
}

#[test]
fn always_allow_short_circuits() {
    let mut p = policy(&[], &["rm"]);
    p.always_allow = true;
    let check = evaluate("rm -rf build", Some(&p));
    assert!(check.is_allowed());
    assert_eq!(check.reason, "always_allow");
}

#[test]
fn builtins_and_trusted_namespaces_bypass() {
    let trusted = TrustedNamespaces::parse("test, demo.");
    assert_eq!(
        check_command("exthost.listCommands", None, true, &trusted).reason,
        "builtin"
    );
    assert_eq!(
        check_command("test.run", None, false, &trusted).reason,
        "trusted_namespace"
    );
    assert_eq!(
        check_command("demo.x", None, false, &trusted).reason,
        "trusted_namespace"
    );
    // Namespace must be followed by a dot.
    assert_eq!(check_command("testing.run", None, false, &trusted).reason, "no_policy");
}

#[test]
fn handle_swaps_snapshots_without_touching_old_ones() {
    let handle = PolicyHandle::new(Some(policy(&["a"], &[])));
    let before = handle.snapshot().expect("policy");
    handle.replace(Some(policy(&["b"], &[])));
    assert!(before.evaluate("a").is_allowed());
    let after = handle.snapshot().expect("policy");
    assert!(!after.evaluate("a").is_allowed());
    assert!(after.evaluate("b").is_allowed());
    handle.replace(None);
    assert!(handle.snapshot().is_none());
}

proptest! {
    #[test]
    fn prop_denied_entries_are_never_allowed(
        word in "[a-z]{1,8}",
        rest in "[a-z ]{0,12}",
        also_allowed in any::<bool>(),
    ) {
        let command = format!("{word} {rest}");
        let allow: Vec<&str> = if also_allowed { vec![word.as_str()] } else { vec![] };
        let p = policy(&allow, &[word.as_str()]);
        prop_assert!(!is_allowed(&command, Some(&p)));
    }

    #[test]
    fn prop_evaluation_is_pure(
        command in "[a-z ]{0,16}",
        allow in proptest::collection::vec("[a-z]{1,6}\\*?", 0..4),
    ) {
        let p = PermissionPolicy { allow, ..PermissionPolicy::default() };
        let first = evaluate(&command, Some(&p));
        let second = evaluate(&command, Some(&p));
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_no_policy_denies_everything(command in ".{0,32}") {
        prop_assert!(!is_allowed(&command, None));
    }
}
