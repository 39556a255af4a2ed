//! Lifecycle supervisor: the single writer of plugin state.
//!
//! ## Ownership
//!
//! The supervisor runs on its own thread and is the only code that calls
//! `PluginInstance::set_state` once the engine has started. Every other
//! component (router, fan-out, inputs) reports problems through a
//! [`FaultReporter`], which posts a request to the supervisor's channel:
//!
//! ```text
//! router / fan-out / UtteranceSink::fail ──► FaultReporter ──► [requests] ──► Supervisor::run
//!                                                                               │
//!                                           registry state + LifecycleEvent ◄───┘
//! ```
//!
//! ## Restart policy
//!
//! None by default. With a [`RestartPolicy`], a failed instance is restarted
//! after `initial * 2^attempt` (capped at `max`) until `max_retries`
//! automatic attempts have been made. After that it emits `Exhausted` and is
//! never started again unless an explicit restart is requested.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, UtteranceSink};
use crate::diagnostics::DispatchDiagnostics;
use crate::error::{Result, VoxError};
use crate::events::{LifecycleEvent, Phase};
use crate::guard::{with_timeout, Guarded};
use crate::notify::NotifierHub;
use crate::plugin::{InstanceId, PluginHandle, Role};
use crate::registry::{PluginInstance, PluginRegistry, PluginState};

/// Poll interval when no restart is pending.
const IDLE_TICK: Duration = Duration::from_millis(100);

/// Start order: sinks before sources, so nothing is produced into a pipeline
/// whose consumers are not up yet.
const START_ORDER: [Role; 4] = [Role::Notifier, Role::Output, Role::Service, Role::Input];

pub(crate) enum SupervisorRequest {
    Fault {
        id: InstanceId,
        detail: String,
    },
    StopRole {
        role: Role,
        reply: Sender<()>,
    },
    Restart {
        id: InstanceId,
        reply: Sender<Result<()>>,
    },
    Exit,
}

/// Cloneable handle for reporting an unrecoverable plugin failure.
///
/// A detached reporter (no supervisor behind it) only logs.
#[derive(Clone, Default)]
pub struct FaultReporter {
    tx: Option<Sender<SupervisorRequest>>,
}

impl FaultReporter {
    pub(crate) fn new(tx: Sender<SupervisorRequest>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub fn report(&self, id: &InstanceId, detail: impl Into<String>) {
        let detail = detail.into();
        let Some(tx) = &self.tx else {
            warn!(instance = %id, detail = %detail, "fault reported with no supervisor attached");
            return;
        };
        if tx
            .send(SupervisorRequest::Fault {
                id: id.clone(),
                detail,
            })
            .is_err()
        {
            debug!(instance = %id, "supervisor gone, fault discarded");
        }
    }
}

/// Exponential backoff between automatic restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RestartPolicy {
    /// Delay before automatic restart number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

struct PendingRestart {
    id: InstanceId,
    due: Instant,
}

pub(crate) struct Supervisor {
    registry: Arc<PluginRegistry>,
    hub: NotifierHub,
    bus: Arc<EventBus>,
    policy: Option<RestartPolicy>,
    /// Bound on every start and stop call.
    grace: Duration,
    faults: FaultReporter,
    diagnostics: Arc<DispatchDiagnostics>,
    pending: Vec<PendingRestart>,
    stopping: HashSet<Role>,
}

impl Supervisor {
    pub(crate) fn new(
        registry: Arc<PluginRegistry>,
        hub: NotifierHub,
        bus: Arc<EventBus>,
        policy: Option<RestartPolicy>,
        grace: Duration,
        faults: FaultReporter,
        diagnostics: Arc<DispatchDiagnostics>,
    ) -> Self {
        Self {
            registry,
            hub,
            bus,
            policy,
            grace,
            faults,
            diagnostics,
            pending: Vec::new(),
            stopping: HashSet::new(),
        }
    }

    /// Start every registered instance. Failures are isolated: the instance
    /// is marked failed and the rest still start.
    pub(crate) fn start_all(&mut self) {
        for role in START_ORDER {
            for instance in self.registry.instances(role) {
                self.bring_up(&instance);
            }
        }
        let ready: usize = START_ORDER
            .iter()
            .map(|r| self.registry.active(*r).len())
            .sum();
        info!(ready, total = self.registry.len(), "plugin start-up pass complete");
    }

    /// Serve requests until `Exit` or until every sender is gone.
    pub(crate) fn run(mut self, requests: Receiver<SupervisorRequest>) {
        loop {
            match requests.recv_timeout(self.next_wakeup()) {
                Ok(SupervisorRequest::Fault { id, detail }) => self.on_fault(&id, detail),
                Ok(SupervisorRequest::StopRole { role, reply }) => {
                    self.stop_role(role);
                    let _ = reply.send(());
                }
                Ok(SupervisorRequest::Restart { id, reply }) => {
                    let _ = reply.send(self.restart(&id));
                }
                Ok(SupervisorRequest::Exit) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.run_due_restarts();
        }
        debug!("supervisor exiting");
    }

    fn next_wakeup(&self) -> Duration {
        let now = Instant::now();
        self.pending
            .iter()
            .map(|p| p.due.saturating_duration_since(now))
            .min()
            .map_or(IDLE_TICK, |d| d.min(IDLE_TICK))
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn emit(&self, instance: &PluginInstance, phase: Phase, detail: Option<String>) {
        let mut event = LifecycleEvent::new(instance.id().clone(), instance.role(), phase);
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.hub.lifecycle(event);
    }

    /// Starting → Ready, or Starting → Failed with a scheduled restart.
    fn bring_up(&mut self, instance: &Arc<PluginInstance>) -> bool {
        instance.set_state(PluginState::Starting);
        self.emit(instance, Phase::Starting, None);

        match self.invoke_start(instance) {
            Ok(()) => {
                instance.set_state(PluginState::Ready);
                if instance.role() == Role::Notifier {
                    self.hub.attach(instance);
                }
                self.emit(instance, Phase::Ready, None);
                info!(instance = %instance.id(), "plugin ready");
                true
            }
            Err(detail) => {
                error!(instance = %instance.id(), detail = %detail, "plugin failed to start");
                instance.set_state(PluginState::Failed);
                self.emit(instance, Phase::Failed, Some(detail));
                self.schedule_restart(instance);
                false
            }
        }
    }

    fn on_fault(&mut self, id: &InstanceId, detail: String) {
        let instance = match self.registry.get(id) {
            Ok(i) => i,
            Err(e) => {
                warn!(instance = %id, error = %e, "fault for unknown instance");
                return;
            }
        };
        if !matches!(instance.state(), PluginState::Ready | PluginState::Starting) {
            debug!(instance = %id, state = ?instance.state(), "fault ignored in this state");
            return;
        }

        error!(instance = %id, detail = %detail, "plugin failed");
        instance.set_state(PluginState::Failed);
        if instance.role() == Role::Notifier {
            self.hub.detach(id);
        }
        self.emit(&instance, Phase::Failed, Some(detail));

        // Release whatever the plugin still holds; the outcome does not
        // change its state.
        if let Err(stop_err) = self.invoke_stop(&instance) {
            debug!(instance = %id, error = %stop_err, "stop after failure did not complete");
        }
        self.schedule_restart(&instance);
    }

    fn schedule_restart(&mut self, instance: &PluginInstance) {
        let Some(policy) = self.policy else {
            return;
        };
        if self.stopping.contains(&instance.role()) {
            return;
        }
        if instance.restart_attempts() >= policy.max_retries {
            instance.mark_exhausted();
            let detail = format!("gave up after {} restart attempts", policy.max_retries);
            warn!(instance = %instance.id(), "{detail}");
            self.emit(instance, Phase::Exhausted, Some(detail));
            return;
        }

        let attempt = instance.next_attempt();
        let delay = policy.backoff(attempt);
        info!(
            instance = %instance.id(),
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "restart scheduled"
        );
        self.pending.retain(|p| &p.id != instance.id());
        self.pending.push(PendingRestart {
            id: instance.id().clone(),
            due: Instant::now() + delay,
        });
    }

    fn run_due_restarts(&mut self) {
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.due <= now);
        self.pending = later;

        for restart in due {
            let Ok(instance) = self.registry.get(&restart.id) else {
                continue;
            };
            if instance.state() != PluginState::Failed || self.stopping.contains(&instance.role()) {
                continue;
            }
            self.diagnostics
                .restarts
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.bring_up(&instance);
        }
    }

    /// Ready → Stopping → Stopped → Starting → Ready, on request.
    fn restart(&mut self, id: &InstanceId) -> Result<()> {
        let instance = self.registry.get(id)?;
        if self.stopping.contains(&instance.role()) {
            return Err(VoxError::NotRunning);
        }

        if instance.state() == PluginState::Ready {
            self.take_down(&instance);
        }
        self.pending.retain(|p| &p.id != id);
        instance.reset_attempts();
        self.diagnostics
            .restarts
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        if self.bring_up(&instance) {
            Ok(())
        } else {
            Err(VoxError::plugin(format!("{id} failed to restart")))
        }
    }

    /// Ready/Starting → Stopping → Stopped. A stop that errors or overruns
    /// still ends in Stopped; the detail says why.
    fn take_down(&self, instance: &PluginInstance) {
        instance.set_state(PluginState::Stopping);
        if instance.role() == Role::Notifier {
            self.hub.detach(instance.id());
        }
        self.emit(instance, Phase::Stopping, None);

        let detail = match self.invoke_stop(instance) {
            Ok(()) => None,
            Err(detail) => {
                warn!(instance = %instance.id(), detail = %detail, "plugin did not stop cleanly");
                Some(detail)
            }
        };
        instance.set_state(PluginState::Stopped);
        self.emit(instance, Phase::Stopped, detail);
    }

    fn stop_role(&mut self, role: Role) {
        self.stopping.insert(role);
        self.pending.retain(|p| {
            self.registry
                .get(&p.id)
                .map(|i| i.role() != role)
                .unwrap_or(false)
        });

        if role == Role::Notifier {
            // Flush queued notifications while notifiers are still up.
            self.hub.shutdown(self.grace);
        }

        for instance in self.registry.instances(role) {
            if matches!(instance.state(), PluginState::Ready | PluginState::Starting) {
                self.take_down(&instance);
            }
        }
        info!(role = %role, "role stopped");
    }

    // -----------------------------------------------------------------------
    // Guarded plugin calls
    // -----------------------------------------------------------------------

    fn invoke_start(&self, instance: &PluginInstance) -> std::result::Result<(), String> {
        let name = format!("vox-start-{}", instance.id());
        let outcome = match instance.handle().clone() {
            PluginHandle::Input(plugin) => {
                let sink = UtteranceSink::new(
                    instance.id().clone(),
                    Arc::clone(&self.bus),
                    self.faults.clone(),
                );
                with_timeout(name, self.grace, move || plugin.lock().start(sink))
            }
            PluginHandle::Output(plugin) => {
                with_timeout(name, self.grace, move || plugin.lock().start())
            }
            PluginHandle::Service(plugin) => with_timeout(name, self.grace, move || plugin.start()),
            PluginHandle::Notifier(plugin) => {
                with_timeout(name, self.grace, move || plugin.lock().start())
            }
        };
        self.settle("start", outcome)
    }

    fn invoke_stop(&self, instance: &PluginInstance) -> std::result::Result<(), String> {
        let name = format!("vox-stop-{}", instance.id());
        let outcome = match instance.handle().clone() {
            PluginHandle::Input(plugin) => {
                with_timeout(name, self.grace, move || plugin.lock().stop())
            }
            PluginHandle::Output(plugin) => {
                with_timeout(name, self.grace, move || plugin.lock().stop())
            }
            PluginHandle::Service(plugin) => with_timeout(name, self.grace, move || plugin.stop()),
            PluginHandle::Notifier(plugin) => {
                with_timeout(name, self.grace, move || plugin.lock().stop())
            }
        };
        self.settle("stop", outcome)
    }

    fn settle(&self, op: &str, outcome: Guarded<Result<()>>) -> std::result::Result<(), String> {
        match outcome {
            Guarded::Completed(Ok(())) => Ok(()),
            Guarded::Completed(Err(e)) => Err(format!("{op} failed: {e}")),
            Guarded::Panicked(msg) => Err(format!("{op} panicked: {msg}")),
            Guarded::TimedOut => Err(format!(
                "{op} did not finish within {}ms",
                self.grace.as_millis()
            )),
            Guarded::Unavailable(msg) => Err(format!("{op} could not run: {msg}")),
        }
    }
}
