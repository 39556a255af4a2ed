//! `DispatchEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! DispatchEngine::new() / from_manifest()
//!     └─► registry().register(..)   → plugins added, state = Created
//!         └─► start()               → registry sealed, stages spawned,
//!         │                           plugins started, status = Running
//!         └─► shutdown()            → intake closed, inputs stopped, bus drained
//!                                     (bounded by the grace period), stages
//!                                     joined or detached, remaining plugins stopped,
//!                                     status = Stopped
//! ```
//!
//! `start()`/`shutdown()` return an error rather than panicking when called
//! in the wrong state.
//!
//! ## Threading
//!
//! Three stage threads (matcher, router, fan-out) plus one supervisor
//! thread. The supervisor is the only writer of plugin state; the engine
//! talks to it over a request channel and waits for replies.

pub(crate) mod pipeline;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    bus::{EventBus, QueueConfig, UtteranceSink},
    config::Manifest,
    diagnostics::{DiagnosticsSnapshot, DispatchDiagnostics},
    error::{Result, VoxError},
    events::Notification,
    fanout::OutputFanout,
    notify::{LaneStats, NotifierHub},
    phrase::{KeyPhrase, PhraseMatcher},
    plugin::{InstanceId, PluginFactory, Role},
    registry::PluginRegistry,
    router::ServiceRouter,
    supervisor::{FaultReporter, RestartPolicy, Supervisor, SupervisorRequest},
};

use pipeline::StageContext;

const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Extra time a stage gets to notice `running == false` after the grace
/// period. Stages poll every 20ms, so only one stuck in a plugin call
/// overruns this.
const STAGE_EXIT_ALLOWANCE: Duration = Duration::from_millis(100);

/// Runtime tuning for `DispatchEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on one `ServicePlugin::handle` call.
    pub service_timeout: Duration,
    pub queue: QueueConfig,
    /// Per-notifier lane capacity.
    pub notifier_queue_capacity: usize,
    /// Bound on draining at shutdown and on each plugin start/stop call.
    pub shutdown_grace: Duration,
    /// `None` disables automatic restarts.
    pub restart: Option<RestartPolicy>,
    /// Mirror every command and response to notifiers.
    pub audit_commands: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineStatus {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// The top-level engine handle.
///
/// `DispatchEngine` is `Send + Sync`; all fields use interior mutability.
pub struct DispatchEngine {
    config: EngineConfig,
    registry: Arc<PluginRegistry>,
    bus: Arc<EventBus>,
    hub: NotifierHub,
    diagnostics: Arc<DispatchDiagnostics>,
    running: Arc<AtomicBool>,
    status: Mutex<EngineStatus>,
    /// Taken by `start()`.
    matcher: Mutex<Option<PhraseMatcher>>,
    requests_tx: Sender<SupervisorRequest>,
    requests_rx: Mutex<Option<Receiver<SupervisorRequest>>>,
    stages: Mutex<Vec<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchEngine {
    /// Create an idle engine. Register plugins through [`registry`] before
    /// calling [`start`].
    ///
    /// [`registry`]: DispatchEngine::registry
    /// [`start`]: DispatchEngine::start
    pub fn new(config: EngineConfig, key_phrases: Vec<KeyPhrase>) -> Self {
        let diagnostics = Arc::new(DispatchDiagnostics::default());
        let bus = Arc::new(EventBus::new(config.queue, Arc::clone(&diagnostics)));
        let hub = NotifierHub::new(
            config.notifier_queue_capacity,
            config.audit_commands,
            Arc::clone(&diagnostics),
        );
        let (requests_tx, requests_rx) = crossbeam_channel::unbounded();

        Self {
            config,
            registry: Arc::new(PluginRegistry::new()),
            bus,
            hub,
            diagnostics,
            running: Arc::new(AtomicBool::new(false)),
            status: Mutex::new(EngineStatus::Idle),
            matcher: Mutex::new(Some(PhraseMatcher::new(key_phrases))),
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            stages: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
        }
    }

    /// Build an engine and register every component the manifest lists,
    /// constructing each through `factory`.
    ///
    /// # Errors
    /// Any configuration, unknown-role or unknown-kind error. Nothing is
    /// started when this fails.
    pub fn from_manifest(manifest: &Manifest, factory: &PluginFactory) -> Result<Self> {
        manifest.validate()?;
        let engine = Self::new(manifest.engine_config(), manifest.key_phrases()?);
        for descriptor in manifest.descriptors()? {
            engine.registry.register_from(factory, descriptor)?;
        }
        info!(plugins = engine.registry.len(), "engine configured from manifest");
        Ok(engine)
    }

    /// Seal the registry, spawn the stage threads and start every plugin.
    ///
    /// Blocks until each plugin has either started or failed. A plugin that
    /// fails to start does not fail the engine.
    ///
    /// # Errors
    /// - `VoxError::AlreadyStarted` if called more than once.
    /// - `VoxError::Io` if a thread cannot be spawned. Stages already
    ///   spawned are stopped again and the engine ends `Stopped`.
    pub fn start(&self) -> Result<()> {
        let mut status = self.status.lock();
        if *status != EngineStatus::Idle {
            return Err(VoxError::AlreadyStarted);
        }
        let (Some(matcher), Some(requests_rx)) =
            (self.matcher.lock().take(), self.requests_rx.lock().take())
        else {
            return Err(VoxError::AlreadyStarted);
        };

        self.registry.seal();
        self.running.store(true, Ordering::SeqCst);

        let ctx = StageContext {
            bus: Arc::clone(&self.bus),
            running: Arc::clone(&self.running),
            hub: self.hub.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
        };
        let router = ServiceRouter::new(
            Arc::clone(&self.registry),
            self.config.service_timeout,
            self.hub.clone(),
            self.faults(),
            Arc::clone(&self.diagnostics),
        );
        let fanout = OutputFanout::new(
            Arc::clone(&self.registry),
            self.hub.clone(),
            self.faults(),
            Arc::clone(&self.diagnostics),
        );

        let mut spawned = Vec::with_capacity(3);
        let c = ctx.clone();
        let stages: [(&str, Box<dyn FnOnce() + Send>); 3] = [
            ("vox-matcher", Box::new(move || pipeline::run_matcher(c, matcher))),
            ("vox-router", {
                let c = ctx.clone();
                Box::new(move || pipeline::run_router(c, router))
            }),
            ("vox-fanout", Box::new(move || pipeline::run_fanout(ctx, fanout))),
        ];
        for (name, stage) in stages {
            match spawn(name, stage) {
                Ok(handle) => spawned.push(handle),
                Err(e) => {
                    abort_start(&self.running, spawned);
                    *status = EngineStatus::Stopped;
                    return Err(e);
                }
            }
        }

        // The supervisor starts every plugin on its own thread, so plugin
        // state only ever changes there, and reports back once the pass is
        // done.
        let mut supervisor = Supervisor::new(
            Arc::clone(&self.registry),
            self.hub.clone(),
            Arc::clone(&self.bus),
            self.config.restart,
            self.config.shutdown_grace,
            self.faults(),
            Arc::clone(&self.diagnostics),
        );
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let supervisor = spawn("vox-supervisor", move || {
            supervisor.start_all();
            let _ = started_tx.send(());
            supervisor.run(requests_rx)
        });
        let supervisor = match supervisor {
            Ok(handle) => handle,
            Err(e) => {
                abort_start(&self.running, spawned);
                *status = EngineStatus::Stopped;
                return Err(e);
            }
        };
        if started_rx.recv().is_err() {
            // start_all panicked; the thread is gone and nothing supervises.
            abort_start(&self.running, spawned);
            let _ = supervisor.join();
            *status = EngineStatus::Stopped;
            return Err(VoxError::plugin("supervisor exited during start-up"));
        }
        *self.stages.lock() = spawned;
        *self.supervisor.lock() = Some(supervisor);

        *status = EngineStatus::Running;
        info!(
            inputs = self.registry.list(Role::Input).len(),
            outputs = self.registry.list(Role::Output).len(),
            services = self.registry.list(Role::Service).len(),
            notifiers = self.registry.list(Role::Notifier).len(),
            "engine started"
        );
        Ok(())
    }

    /// Cooperative shutdown.
    ///
    /// Intake closes first and inputs are stopped; utterances already
    /// accepted keep flowing until every one is resolved or the grace period
    /// runs out. Services, outputs and notifiers are stopped afterwards.
    ///
    /// # Errors
    /// `VoxError::NotRunning` if the engine is not running.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut status = self.status.lock();
            if *status != EngineStatus::Running {
                return Err(VoxError::NotRunning);
            }
            *status = EngineStatus::Draining;
        }
        info!("engine shutdown requested");

        self.bus.close_intake();
        self.stop_role(Role::Input);

        let deadline = Instant::now() + self.config.shutdown_grace;
        while !self.bus.is_drained() && Instant::now() < deadline {
            thread::sleep(DRAIN_POLL);
        }
        if !self.bus.is_drained() {
            warn!(
                in_flight = self.bus.in_flight(),
                "grace period elapsed before the bus drained, forcing stop"
            );
        }

        self.running.store(false, Ordering::SeqCst);
        let stages: Vec<_> = self.stages.lock().drain(..).collect();
        let detached = join_stages(stages, deadline.max(Instant::now() + STAGE_EXIT_ALLOWANCE));
        if detached > 0 {
            warn!(detached, "stages still inside plugin calls were left running");
        }

        self.stop_role(Role::Service);
        self.stop_role(Role::Output);
        self.stop_role(Role::Notifier);

        let _ = self.requests_tx.send(SupervisorRequest::Exit);
        if let Some(supervisor) = self.supervisor.lock().take() {
            let _ = supervisor.join();
        }

        *self.status.lock() = EngineStatus::Stopped;
        let snap = self.diagnostics.snapshot();
        info!(
            accepted = snap.utterances_accepted,
            ignored = snap.utterances_ignored,
            responses = snap.responses_total(),
            restarts = snap.restarts,
            "engine stopped"
        );
        Ok(())
    }

    /// Stop and start one instance.
    ///
    /// # Errors
    /// - `VoxError::NotRunning` if the engine is not running.
    /// - `VoxError::NotFound` for an unknown id.
    /// - `VoxError::Plugin` if the instance fails to come back up.
    pub fn restart(&self, id: &InstanceId) -> Result<()> {
        if self.status() != EngineStatus::Running {
            return Err(VoxError::NotRunning);
        }
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.requests_tx
            .send(SupervisorRequest::Restart {
                id: id.clone(),
                reply,
            })
            .map_err(|_| VoxError::NotRunning)?;
        rx.recv().map_err(|_| VoxError::NotRunning)?
    }

    /// A sink for publishing utterances from outside the plugin set, e.g.
    /// an embedder's own recogniser. `source` names the producer in events.
    pub fn utterance_sink(&self, source: impl Into<InstanceId>) -> UtteranceSink {
        UtteranceSink::new(source.into(), Arc::clone(&self.bus), self.faults())
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Subscribe to every lifecycle and audit notification.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.hub.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn notifier_stats(&self) -> Vec<LaneStats> {
        self.hub.lane_stats()
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn faults(&self) -> FaultReporter {
        FaultReporter::new(self.requests_tx.clone())
    }

    /// Ask the supervisor to stop every instance of `role` and wait for it.
    fn stop_role(&self, role: Role) {
        let (reply, rx) = crossbeam_channel::bounded(1);
        if self
            .requests_tx
            .send(SupervisorRequest::StopRole { role, reply })
            .is_err()
            || rx.recv().is_err()
        {
            warn!(role = %role, "supervisor unavailable while stopping role");
        }
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("config", &self.config)
            .field("status", &*self.status.lock())
            .finish_non_exhaustive()
    }
}

impl Drop for DispatchEngine {
    fn drop(&mut self) {
        if self.status() == EngineStatus::Running {
            let _ = self.shutdown();
        }
    }
}

fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
    Ok(thread::Builder::new().name(name.to_string()).spawn(f)?)
}

/// Join each stage that exits before `deadline`; detach the rest.
///
/// Returns how many were detached.
fn join_stages(stages: Vec<JoinHandle<()>>, deadline: Instant) -> usize {
    let mut detached = 0;
    for stage in stages {
        while !stage.is_finished() && Instant::now() < deadline {
            thread::sleep(DRAIN_POLL);
        }
        if stage.is_finished() {
            let _ = stage.join();
        } else {
            detached += 1;
            warn!(
                stage = stage.thread().name().unwrap_or("unnamed"),
                "stage did not exit in time, detaching"
            );
        }
    }
    detached
}

/// Undo a partial `start()`: stop and join whatever stages were spawned.
fn abort_start(running: &AtomicBool, spawned: Vec<JoinHandle<()>>) {
    warn!(spawned = spawned.len(), "engine start failed, rolling back");
    running.store(false, Ordering::SeqCst);
    join_stages(spawned, Instant::now() + STAGE_EXIT_ALLOWANCE);
}
