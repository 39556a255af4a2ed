//! Plugin roles, descriptors and the in-process plugin traits.
//!
//! Configuration names plugins by `(role, kind)`. A [`PluginFactory`] maps
//! each pair to a constructor registered at process start, so loading a
//! plugin is a table lookup rather than reflection. Constructors receive the
//! entry's parameter mapping untouched; validating it is the plugin's job.
//!
//! Mutable plugins are wrapped in `Arc<parking_lot::Mutex<_>>` handles so
//! stage threads and the supervisor can share them. `parking_lot` is used for
//! its non-poisoning behaviour: a plugin that panics while holding its lock
//! must stay usable for diagnostics and restart.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bus::UtteranceSink;
use crate::error::{Result, VoxError};
use crate::events::{Notification, Payload, Response};

/// Free-form plugin parameters, passed through from configuration.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// The four closed plugin roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Input,
    Output,
    Service,
    Notifier,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Input, Role::Output, Role::Service, Role::Notifier];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Input => "input",
            Role::Output => "output",
            Role::Service => "service",
            Role::Notifier => "notifier",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = VoxError;

    /// Accepts singular or plural names in any case (`"inputs"`, `"Service"`).
    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "input" | "inputs" => Ok(Role::Input),
            "output" | "outputs" => Ok(Role::Output),
            "service" | "services" => Ok(Role::Service),
            "notifier" | "notifiers" => Ok(Role::Notifier),
            _ => Err(VoxError::UnknownRole(raw.to_string())),
        }
    }
}

/// Stable identifier of a registered plugin instance, e.g. `service/clock#0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub(crate) fn for_plugin(role: Role, kind: &str, index: usize) -> Self {
        Self(format!("{role}/{kind}#{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Immutable description of one configured plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub role: Role,
    pub kind: String,
    pub params: Params,
}

impl PluginDescriptor {
    pub fn new(role: Role, kind: impl Into<String>, params: Params) -> Self {
        Self {
            role,
            kind: kind.into(),
            params,
        }
    }

    /// Build a descriptor from an untyped role name.
    ///
    /// # Errors
    /// `VoxError::UnknownRole` if `role` is not one of the four roles.
    pub fn parse(role: &str, kind: impl Into<String>, params: Params) -> Result<Self> {
        Ok(Self::new(role.parse()?, kind, params))
    }
}

/// Cooperative cancellation flag handed to [`ServicePlugin::handle`].
///
/// The router sets it when a call exceeds its timeout. Services doing long
/// work should poll [`CancelToken::is_cancelled`] and bail out early.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Plugin traits
// ---------------------------------------------------------------------------

/// A producer of raw utterances (microphone, socket, stdin...).
///
/// `start` must return promptly; long-running capture belongs on a thread the
/// plugin owns. `stop` is bounded by the engine's shutdown grace period and
/// abandoned if it overruns.
pub trait InputPlugin: Send + 'static {
    fn start(&mut self, sink: UtteranceSink) -> Result<()>;

    fn stop(&mut self) -> Result<()>;
}

/// A consumer of responses (speech synthesis, logging...).
pub trait OutputPlugin: Send + 'static {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn deliver(&mut self, response: &Response) -> Result<()>;

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A command handler.
///
/// Services are shared across the router thread and the per-call handler
/// threads, hence `&self` and `Sync`. Keep mutable state behind a lock.
pub trait ServicePlugin: Send + Sync + 'static {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Whether this service claims the (normalized) command text.
    fn can_handle(&self, text: &str) -> bool;

    fn handle(&self, text: &str, cancel: &CancelToken) -> Result<Payload>;

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// A best-effort observer of lifecycle and audit notifications.
pub trait NotifierPlugin: Send + 'static {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn notify(&mut self, notification: &Notification) -> Result<()>;

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Type-erased, shareable handle to a constructed plugin.
#[derive(Clone)]
pub enum PluginHandle {
    Input(Arc<Mutex<dyn InputPlugin>>),
    Output(Arc<Mutex<dyn OutputPlugin>>),
    Service(Arc<dyn ServicePlugin>),
    Notifier(Arc<Mutex<dyn NotifierPlugin>>),
}

impl PluginHandle {
    pub fn input<P: InputPlugin>(plugin: P) -> Self {
        Self::Input(Arc::new(Mutex::new(plugin)))
    }

    pub fn output<P: OutputPlugin>(plugin: P) -> Self {
        Self::Output(Arc::new(Mutex::new(plugin)))
    }

    pub fn service<P: ServicePlugin>(plugin: P) -> Self {
        Self::Service(Arc::new(plugin))
    }

    pub fn notifier<P: NotifierPlugin>(plugin: P) -> Self {
        Self::Notifier(Arc::new(Mutex::new(plugin)))
    }

    pub fn role(&self) -> Role {
        match self {
            Self::Input(_) => Role::Input,
            Self::Output(_) => Role::Output,
            Self::Service(_) => Role::Service,
            Self::Notifier(_) => Role::Notifier,
        }
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

type Constructor = Box<dyn Fn(&Params) -> Result<PluginHandle> + Send + Sync>;

/// Resolves `(role, kind)` pairs to plugin constructors.
#[derive(Default)]
pub struct PluginFactory {
    constructors: HashMap<(Role, String), Constructor>,
}

impl PluginFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor. A later registration for the same pair wins.
    pub fn register<F>(&mut self, role: Role, kind: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&Params) -> Result<PluginHandle> + Send + Sync + 'static,
    {
        self.constructors
            .insert((role, kind.into()), Box::new(constructor));
        self
    }

    /// Sorted kind identifiers registered for `role`.
    pub fn kinds(&self, role: Role) -> Vec<&str> {
        let mut kinds: Vec<&str> = self
            .constructors
            .keys()
            .filter(|(r, _)| *r == role)
            .map(|(_, k)| k.as_str())
            .collect();
        kinds.sort_unstable();
        kinds
    }

    /// Construct the plugin a descriptor names.
    ///
    /// # Errors
    /// - `VoxError::UnknownKind` if nothing is registered for the pair.
    /// - `VoxError::Configuration` if the constructor rejects its parameters or
    ///   returns a handle of a different role.
    pub fn build(&self, descriptor: &PluginDescriptor) -> Result<PluginHandle> {
        let constructor = self
            .constructors
            .get(&(descriptor.role, descriptor.kind.clone()))
            .ok_or_else(|| VoxError::UnknownKind {
                role: descriptor.role,
                kind: descriptor.kind.clone(),
            })?;

        let handle = constructor(&descriptor.params).map_err(|e| match e {
            VoxError::Configuration(_) => e,
            other => VoxError::Configuration(format!(
                "{} '{}' rejected its parameters: {other}",
                descriptor.role, descriptor.kind
            )),
        })?;

        if handle.role() != descriptor.role {
            return Err(VoxError::Configuration(format!(
                "constructor for {} '{}' produced a {} plugin",
                descriptor.role,
                descriptor.kind,
                handle.role()
            )));
        }
        Ok(handle)
    }
}

impl fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFactory")
            .field("registered", &self.constructors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Null;

    impl OutputPlugin for Null {
        fn deliver(&mut self, _response: &Response) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn role_parses_singular_plural_and_case() {
        assert_eq!("inputs".parse::<Role>().unwrap(), Role::Input);
        assert_eq!("Service".parse::<Role>().unwrap(), Role::Service);
        assert_eq!(" notifier ".parse::<Role>().unwrap(), Role::Notifier);
        let err = "sensor".parse::<Role>().unwrap_err();
        assert!(matches!(err, VoxError::UnknownRole(ref r) if r == "sensor"));
    }

    #[test]
    fn descriptor_parse_rejects_unknown_role() {
        let err = PluginDescriptor::parse("widget", "x", Params::new()).unwrap_err();
        assert!(matches!(err, VoxError::UnknownRole(_)));
    }

    #[test]
    fn factory_builds_registered_kind() {
        let mut factory = PluginFactory::new();
        factory.register(Role::Output, "null", |_| Ok(PluginHandle::output(Null)));

        let handle = factory
            .build(&PluginDescriptor::new(Role::Output, "null", Params::new()))
            .expect("build null output");
        assert_eq!(handle.role(), Role::Output);
        assert_eq!(factory.kinds(Role::Output), vec!["null"]);
        assert!(factory.kinds(Role::Input).is_empty());
    }

    #[test]
    fn factory_reports_unknown_kind() {
        let factory = PluginFactory::new();
        let err = factory
            .build(&PluginDescriptor::new(Role::Service, "wiki", Params::new()))
            .unwrap_err();
        assert!(matches!(err, VoxError::UnknownKind { role: Role::Service, ref kind } if kind == "wiki"));
    }

    #[test]
    fn factory_rejects_role_mismatch() {
        let mut factory = PluginFactory::new();
        factory.register(Role::Service, "liar", |_| Ok(PluginHandle::output(Null)));
        let err = factory
            .build(&PluginDescriptor::new(Role::Service, "liar", Params::new()))
            .unwrap_err();
        assert!(matches!(err, VoxError::Configuration(_)));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
