use std::collections::BTreeSet;

use forgepad_common::protocol::jsonrpc::{
    is_supported_protocol_version, CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use forgepad_common::protocol::rpc_methods::IMPLEMENTED_METHODS;

#[test]
fn implemented_methods_are_unique() {
    let unique: BTreeSet<&str> = IMPLEMENTED_METHODS.iter().copied().collect();
    assert_eq!(unique.len(), IMPLEMENTED_METHODS.len(), "duplicate method name registered");
}

#[test]
fn method_names_are_namespaced_snake_case() {
    for method in IMPLEMENTED_METHODS {
        let (namespace, name) =
            method.split_once('.').unwrap_or_else(|| panic!("{method} should have a namespace"));
        assert!(!namespace.is_empty() && !name.is_empty(), "{method} has an empty segment");
        assert!(
            method.chars().all(|c| c.is_ascii_lowercase() || c == '.' || c == '_'),
            "{method} should be lowercase snake_case"
        );
    }
}

#[test]
fn every_namespace_is_known() {
    let namespaces: BTreeSet<&str> =
        IMPLEMENTED_METHODS.iter().filter_map(|m| m.split('.').next()).collect();
    let expected: BTreeSet<&str> = [
        "rpc",
        "daemon",
        "conversation",
        "chat",
        "view",
        "workspace",
        "errors",
        "terminal",
        "project",
        "sandbox",
    ]
    .into_iter()
    .collect();
    assert_eq!(namespaces, expected);
}

#[test]
fn current_protocol_version_is_supported() {
    assert!(SUPPORTED_PROTOCOL_VERSIONS.contains(&CURRENT_PROTOCOL_VERSION));
    assert!(is_supported_protocol_version(CURRENT_PROTOCOL_VERSION));
    assert!(!is_supported_protocol_version("forgepad-rpc.v0"));
}
