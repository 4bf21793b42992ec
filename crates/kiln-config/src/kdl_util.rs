// Helper functions for extracting values from KDL nodes

use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

/// First string argument, or a `MissingField` error naming `what`.
pub(crate) fn require_string_arg(node: &KdlNode, what: &str) -> ConfigResult<String> {
    get_first_string_arg(node)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField(what.to_string()))
}

/// A `key "value"` pair given as two positional arguments.
pub(crate) fn get_pair_args(node: &KdlNode, what: &str) -> ConfigResult<(String, String)> {
    let args = get_all_string_args(node);
    match args.as_slice() {
        [key, value] => Ok((key.clone(), value.clone())),
        _ => Err(ConfigError::invalid(
            what,
            format!("expected a key and a value, got {} arguments", args.len()),
        )),
    }
}

/// Commands from `run "…"` children of a block.
pub(crate) fn get_run_children(node: &KdlNode) -> Vec<String> {
    let mut commands = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "run" {
                if let Some(cmd) = get_first_string_arg(child) {
                    commands.push(cmd);
                }
            }
        }
    }
    commands
}
