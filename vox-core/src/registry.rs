//! Plugin registry: ordered, typed lookup of plugin instances.
//!
//! Instances are listed per role in registration order, which is the order
//! they appear in configuration. Routing and fan-out rely on that order, so
//! it is never re-sorted.
//!
//! The registry only hands out `Arc<PluginInstance>` references; state
//! transitions on an instance are written exclusively by the supervisor.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, VoxError};
use crate::plugin::{InstanceId, PluginDescriptor, PluginFactory, PluginHandle, Role};

/// Lifecycle state of one plugin instance.
///
/// ```text
/// Created ─► Starting ─► Ready ─► Stopping ─► Stopped
///               │          │                     │
///               └──────────┴─► Failed ◄──────────┘ (restart: Failed/Stopped ─► Starting)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginState {
    Created,
    Starting,
    Ready,
    Failed,
    Stopping,
    Stopped,
}

pub struct PluginInstance {
    id: InstanceId,
    descriptor: PluginDescriptor,
    handle: PluginHandle,
    state: RwLock<PluginState>,
    /// Automatic restarts since creation or the last explicit restart.
    attempts: AtomicU32,
    /// Set once the restart budget is used up.
    exhausted: AtomicBool,
}

impl PluginInstance {
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.descriptor.role
    }

    pub fn kind(&self) -> &str {
        &self.descriptor.kind
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    pub fn handle(&self) -> &PluginHandle {
        &self.handle
    }

    pub fn state(&self) -> PluginState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == PluginState::Ready
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn restart_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Returns the previous state. Supervisor-only.
    pub(crate) fn set_state(&self, next: PluginState) -> PluginState {
        let mut guard = self.state.write();
        let prev = *guard;
        *guard = next;
        debug!(instance = %self.id, from = ?prev, to = ?next, "plugin state transition");
        prev
    }

    pub(crate) fn next_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst)
    }

    /// Clears the restart budget, including a previous exhaustion.
    pub(crate) fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.exhausted.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_exhausted(&self) {
        self.exhausted.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Diagnostic view of one instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub role: Role,
    pub kind: String,
    pub state: PluginState,
    pub restart_attempts: u32,
    pub exhausted: bool,
}

#[derive(Default)]
pub struct PluginRegistry {
    instances: RwLock<Vec<Arc<PluginInstance>>>,
    sealed: AtomicBool,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already-constructed plugin.
    ///
    /// # Errors
    /// - `VoxError::AlreadyStarted` once dispatch has started.
    /// - `VoxError::Configuration` if the handle's role disagrees with the
    ///   descriptor's.
    pub fn register(&self, descriptor: PluginDescriptor, handle: PluginHandle) -> Result<InstanceId> {
        if self.is_sealed() {
            return Err(VoxError::AlreadyStarted);
        }
        if handle.role() != descriptor.role {
            return Err(VoxError::Configuration(format!(
                "{} '{}' registered with a {} handle",
                descriptor.role,
                descriptor.kind,
                handle.role()
            )));
        }

        let mut instances = self.instances.write();
        let index = instances
            .iter()
            .filter(|i| i.role() == descriptor.role)
            .count();
        let id = InstanceId::for_plugin(descriptor.role, &descriptor.kind, index);
        instances.push(Arc::new(PluginInstance {
            id: id.clone(),
            descriptor,
            handle,
            state: RwLock::new(PluginState::Created),
            attempts: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
        }));
        debug!(instance = %id, "plugin registered");
        Ok(id)
    }

    /// Construct a plugin through `factory` and register it.
    pub fn register_from(
        &self,
        factory: &PluginFactory,
        descriptor: PluginDescriptor,
    ) -> Result<InstanceId> {
        if self.is_sealed() {
            return Err(VoxError::AlreadyStarted);
        }
        let handle = factory.build(&descriptor)?;
        self.register(descriptor, handle)
    }

    /// Instance ids for `role` in registration order, excluding failed ones.
    pub fn list(&self, role: Role) -> Vec<InstanceId> {
        self.instances
            .read()
            .iter()
            .filter(|i| i.role() == role && i.state() != PluginState::Failed)
            .map(|i| i.id.clone())
            .collect()
    }

    /// Every instance id for `role`, whatever its state.
    pub fn list_all(&self, role: Role) -> Vec<InstanceId> {
        self.instances
            .read()
            .iter()
            .filter(|i| i.role() == role)
            .map(|i| i.id.clone())
            .collect()
    }

    /// Ready instances for `role`, in registration order. Used for routing
    /// and fan-out.
    pub fn active(&self, role: Role) -> Vec<Arc<PluginInstance>> {
        self.instances
            .read()
            .iter()
            .filter(|i| i.role() == role && i.is_ready())
            .cloned()
            .collect()
    }

    pub(crate) fn instances(&self, role: Role) -> Vec<Arc<PluginInstance>> {
        self.instances
            .read()
            .iter()
            .filter(|i| i.role() == role)
            .cloned()
            .collect()
    }

    /// # Errors
    /// `VoxError::NotFound` if no instance has this id.
    pub fn get(&self, id: &InstanceId) -> Result<Arc<PluginInstance>> {
        self.instances
            .read()
            .iter()
            .find(|i| &i.id == id)
            .cloned()
            .ok_or_else(|| VoxError::NotFound(id.clone()))
    }

    pub fn status(&self) -> Vec<InstanceStatus> {
        self.instances
            .read()
            .iter()
            .map(|i| InstanceStatus {
                id: i.id.clone(),
                role: i.role(),
                kind: i.kind().to_string(),
                state: i.state(),
                restart_attempts: i.restart_attempts(),
                exhausted: i.is_exhausted(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }
}
