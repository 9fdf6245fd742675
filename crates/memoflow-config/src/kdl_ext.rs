//! Helper functions for extracting values from KDL nodes.

use std::time::Duration;

use kdl::{KdlNode, KdlValue};

use crate::{ConfigError, ConfigResult};

fn field_name(node: &KdlNode, prop: &str) -> String {
    format!("{}.{}", node.name().value(), prop)
}

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

/// Non-negative integer property. A present but malformed value is an error.
pub(crate) fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| {
                ConfigError::invalid(
                    field_name(node, name),
                    format!("expected a non-negative integer, got {}", value),
                )
            }),
    }
}

pub(crate) fn get_u32_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u32>> {
    match get_u64_prop(node, name)? {
        None => Ok(None),
        Some(v) => u32::try_from(v).map(Some).map_err(|_| {
            ConfigError::invalid(field_name(node, name), format!("{} is out of range", v))
        }),
    }
}

/// Number property, accepting either an integer or a float.
pub(crate) fn get_f64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<f64>> {
    match node.get(name) {
        None => Ok(None),
        Some(KdlValue::Float(f)) => Ok(Some(*f)),
        Some(KdlValue::Integer(i)) => Ok(Some(*i as f64)),
        Some(other) => Err(ConfigError::invalid(
            field_name(node, name),
            format!("expected a number, got {}", other),
        )),
    }
}

pub(crate) fn get_secs_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    Ok(get_u64_prop(node, name)?.map(Duration::from_secs))
}

pub(crate) fn get_millis_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<Duration>> {
    Ok(get_u64_prop(node, name)?.map(Duration::from_millis))
}
