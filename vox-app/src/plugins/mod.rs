//! Built-in plugin kinds and the factory that resolves them by name.
//!
//! | Role | Kinds |
//! |------|-------|
//! | input | `stdin`, `socket` |
//! | output | `log`, `console` |
//! | service | `echo`, `clock`, `volume` |
//! | notifier | `log`, `jsonl` |

pub mod inputs;
pub mod notifiers;
pub mod outputs;
pub mod services;

use vox_core::{Params, PluginFactory, PluginHandle, Result, Role, VoxError};

/// Factory with every built-in kind registered.
pub fn builtin_factory() -> PluginFactory {
    let mut factory = PluginFactory::new();
    factory
        .register(Role::Input, "stdin", |_| {
            Ok(PluginHandle::input(inputs::StdinInput::new()))
        })
        .register(Role::Input, "socket", |params| {
            Ok(PluginHandle::input(inputs::SocketInput::from_params(params)?))
        })
        .register(Role::Output, "log", |params| {
            Ok(PluginHandle::output(outputs::LogOutput::from_params(params)?))
        })
        .register(Role::Output, "console", |_| {
            Ok(PluginHandle::output(outputs::ConsoleOutput))
        })
        .register(Role::Service, "echo", |_| {
            Ok(PluginHandle::service(services::EchoService))
        })
        .register(Role::Service, "clock", |_| {
            Ok(PluginHandle::service(services::ClockService))
        })
        .register(Role::Service, "volume", |params| {
            Ok(PluginHandle::service(services::VolumeService::from_params(params)?))
        })
        .register(Role::Notifier, "log", |_| {
            Ok(PluginHandle::notifier(notifiers::LogNotifier))
        })
        .register(Role::Notifier, "jsonl", |params| {
            Ok(PluginHandle::notifier(notifiers::JsonlNotifier::from_params(params)?))
        });
    factory
}

// ── Parameter helpers ───────────────────────────────────────────────────────

fn param_str<'a>(params: &'a Params, key: &str) -> Result<Option<&'a str>> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(VoxError::Configuration(format!(
            "parameter '{key}' must be a string, got {other}"
        ))),
    }
}

fn param_u64(params: &Params, key: &str) -> Result<Option<u64>> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            VoxError::Configuration(format!(
                "parameter '{key}' must be a non-negative integer, got {value}"
            ))
        }),
    }
}

fn required<T>(value: Option<T>, key: &str) -> Result<T> {
    value.ok_or_else(|| VoxError::Configuration(format!("missing required parameter '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> Params {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn every_builtin_kind_is_registered() {
        let factory = builtin_factory();
        assert_eq!(factory.kinds(Role::Input), vec!["socket", "stdin"]);
        assert_eq!(factory.kinds(Role::Output), vec!["console", "log"]);
        assert_eq!(factory.kinds(Role::Service), vec!["clock", "echo", "volume"]);
        assert_eq!(factory.kinds(Role::Notifier), vec!["jsonl", "log"]);
    }

    #[test]
    fn param_helpers_check_types() {
        let p = params(json!({ "level": "INFO", "port": 8008, "bad": -1 }));
        assert_eq!(param_str(&p, "level").unwrap(), Some("INFO"));
        assert_eq!(param_str(&p, "missing").unwrap(), None);
        assert!(param_str(&p, "port").is_err());
        assert_eq!(param_u64(&p, "port").unwrap(), Some(8008));
        assert!(param_u64(&p, "bad").is_err());
        assert!(required(param_u64(&p, "missing").unwrap(), "missing").is_err());
    }

    #[test]
    fn example_manifest_builds_with_builtin_kinds() {
        let manifest =
            vox_core::Manifest::from_json_str(include_str!("../../manifest.example.json"))
                .unwrap();
        let factory = builtin_factory();
        let descriptors = manifest.descriptors().unwrap();
        assert_eq!(descriptors.len(), 9);
        assert_eq!(descriptors[0].role, Role::Input);
        for descriptor in &descriptors {
            factory.build(descriptor).unwrap();
        }
    }
}
