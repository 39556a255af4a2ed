//! JSON manifest: key phrases, dispatch tuning and the plugin list.
//!
//! Required fields have no defaults on purpose; a manifest without a service
//! timeout or an overflow policy is rejected before anything starts.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bus::QueueConfig;
use crate::engine::EngineConfig;
use crate::error::{Result, VoxError};
use crate::phrase::KeyPhrase;
use crate::plugin::{Params, PluginDescriptor, Role};
use crate::supervisor::RestartPolicy;

/// Overrides `dispatch.serviceTimeoutMs` when set to a positive integer.
pub const SERVICE_TIMEOUT_ENV: &str = "VOX_SERVICE_TIMEOUT_MS";

fn default_notifier_queue_capacity() -> usize {
    32
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSettings {
    pub service_timeout_ms: u64,
    pub queue: QueueConfig,
    #[serde(default = "default_notifier_queue_capacity")]
    pub notifier_queue_capacity: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub restart: Option<RestartPolicy>,
    #[serde(default)]
    pub audit_commands: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentEntry {
    pub kind: String,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub key_phrases: Vec<String>,
    pub dispatch: DispatchSettings,
    /// Role name → entries in registration order.
    #[serde(default)]
    pub components: BTreeMap<String, Vec<ComponentEntry>>,
}

impl Manifest {
    /// Parse and validate a manifest document.
    ///
    /// # Errors
    /// `VoxError::Configuration` for malformed JSON, missing required fields
    /// or values that fail [`Manifest::validate`].
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(raw)
            .map_err(|e| VoxError::Configuration(format!("invalid manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            VoxError::Configuration(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        let manifest = Self::from_json_str(&raw)?;
        debug!(path = %path.display(), "manifest loaded");
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_phrases.is_empty() {
            return Err(VoxError::Configuration(
                "at least one key phrase is required".into(),
            ));
        }
        self.key_phrases()?;

        let d = &self.dispatch;
        if d.service_timeout_ms == 0 {
            return Err(VoxError::Configuration(
                "dispatch.serviceTimeoutMs must be greater than zero".into(),
            ));
        }
        if d.queue.capacity == 0 {
            return Err(VoxError::Configuration(
                "dispatch.queue.capacity must be greater than zero".into(),
            ));
        }
        if d.notifier_queue_capacity == 0 {
            return Err(VoxError::Configuration(
                "dispatch.notifierQueueCapacity must be greater than zero".into(),
            ));
        }
        if let Some(restart) = &d.restart {
            if restart.max_backoff_ms < restart.initial_backoff_ms {
                return Err(VoxError::Configuration(
                    "dispatch.restart.maxBackoffMs must be >= initialBackoffMs".into(),
                ));
            }
        }
        for role in self.components.keys() {
            Role::from_str(role)?;
        }
        Ok(())
    }

    /// Apply environment overrides. Invalid values are logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        let Ok(raw) = std::env::var(SERVICE_TIMEOUT_ENV) else {
            return;
        };
        match raw.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => {
                debug!(timeout_ms = ms, "service timeout overridden from environment");
                self.dispatch.service_timeout_ms = ms;
            }
            _ => warn!(value = %raw, "ignoring invalid {SERVICE_TIMEOUT_ENV}"),
        }
    }

    pub fn key_phrases(&self) -> Result<Vec<KeyPhrase>> {
        self.key_phrases.iter().map(|p| KeyPhrase::new(p)).collect()
    }

    /// Plugin descriptors grouped in start order, each role in manifest order.
    ///
    /// # Errors
    /// `VoxError::UnknownRole` if a `components` key is not a role.
    pub fn descriptors(&self) -> Result<Vec<PluginDescriptor>> {
        let mut by_role: Vec<(Role, &Vec<ComponentEntry>)> = self
            .components
            .iter()
            .map(|(role, entries)| Ok((Role::from_str(role)?, entries)))
            .collect::<Result<_>>()?;
        by_role.sort_by_key(|(role, _)| *role);

        Ok(by_role
            .into_iter()
            .flat_map(|(role, entries)| {
                entries
                    .iter()
                    .map(move |e| PluginDescriptor::new(role, e.kind.clone(), e.params.clone()))
            })
            .collect())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let d = &self.dispatch;
        EngineConfig {
            service_timeout: Duration::from_millis(d.service_timeout_ms),
            queue: d.queue,
            notifier_queue_capacity: d.notifier_queue_capacity,
            shutdown_grace: Duration::from_millis(d.shutdown_grace_ms),
            restart: d.restart,
            audit_commands: d.audit_commands,
        }
    }
}
