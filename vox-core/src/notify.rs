//! Notifier hub: best-effort fan-out of lifecycle and audit notifications.
//!
//! Each notifier gets its own bounded queue and worker thread:
//!
//! ```text
//! notify() ──┬─► [lane: notifier/log#0]   ──► worker ──► NotifierPlugin::notify
//!            ├─► [lane: notifier/jsonl#1] ──► worker ──► NotifierPlugin::notify
//!            └─► broadcast::Sender (in-process observers)
//! ```
//!
//! `notify` never blocks. A full lane drops the notification and bumps that
//! lane's counter. Notifier errors and panics are counted and swallowed.
//! Counters outlive their lane: a detached or shut-down notifier keeps
//! reporting what it lost.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::diagnostics::DispatchDiagnostics;
use crate::events::{LifecycleEvent, Notification};
use crate::guard::{caught, Guarded};
use crate::plugin::{InstanceId, NotifierPlugin, PluginHandle};
use crate::registry::PluginInstance;

/// Observer channel capacity; lagging observers lose the oldest events.
const OBSERVER_CAP: usize = 256;

const JOIN_POLL: Duration = Duration::from_millis(5);

#[derive(Clone)]
struct LaneCounters {
    id: InstanceId,
    dropped: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

struct Lane {
    counters: LaneCounters,
    tx: Sender<Notification>,
    worker: Option<JoinHandle<()>>,
}

/// Per-notifier delivery counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneStats {
    pub notifier: InstanceId,
    /// Dropped because the lane was full.
    pub dropped: usize,
    /// Delivered but the notifier returned an error or panicked.
    pub failed: usize,
}

struct HubInner {
    /// Lock order: `lanes` before `retired`.
    lanes: Mutex<Vec<Lane>>,
    /// Counters of lanes that were detached or shut down.
    retired: Mutex<Vec<LaneCounters>>,
    observers: broadcast::Sender<Notification>,
    capacity: usize,
    audit: bool,
    diagnostics: Arc<DispatchDiagnostics>,
}

/// Cheap to clone; all clones share the same lanes.
#[derive(Clone)]
pub struct NotifierHub {
    inner: Arc<HubInner>,
}

impl NotifierHub {
    pub fn new(capacity: usize, audit: bool, diagnostics: Arc<DispatchDiagnostics>) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CAP);
        Self {
            inner: Arc::new(HubInner {
                lanes: Mutex::new(Vec::new()),
                retired: Mutex::new(Vec::new()),
                observers,
                capacity: capacity.max(1),
                audit,
                diagnostics,
            }),
        }
    }

    /// Whether commands and responses are mirrored to notifiers.
    pub fn audit_enabled(&self) -> bool {
        self.inner.audit
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.observers.subscribe()
    }

    pub fn lifecycle(&self, event: LifecycleEvent) {
        self.notify(Notification::Lifecycle(event));
    }

    /// Offer a notification to every lane without blocking.
    pub fn notify(&self, notification: Notification) {
        {
            let lanes = self.inner.lanes.lock();
            for lane in lanes.iter() {
                match lane.tx.try_send(notification.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        lane.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        self.inner
                            .diagnostics
                            .notifications_dropped
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        let _ = self.inner.observers.send(notification);
    }

    /// Start delivering to a ready notifier instance.
    pub(crate) fn attach(&self, instance: &PluginInstance) {
        let PluginHandle::Notifier(plugin) = instance.handle() else {
            return;
        };
        let mut lanes = self.inner.lanes.lock();
        if lanes.iter().any(|l| &l.counters.id == instance.id()) {
            return;
        }

        let (tx, rx) = crossbeam_channel::bounded::<Notification>(self.inner.capacity);
        let dropped = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let plugin = Arc::clone(plugin);
        let worker_failed = Arc::clone(&failed);
        let id = instance.id().clone();
        let worker_id = id.clone();

        let worker = thread::Builder::new()
            .name(format!("vox-notify-{}", id))
            .spawn(move || {
                for notification in rx.iter() {
                    deliver(&worker_id, &plugin, &notification, &worker_failed);
                }
                debug!(notifier = %worker_id, "notifier lane drained");
            });

        match worker {
            Ok(handle) => lanes.push(Lane {
                counters: LaneCounters {
                    id,
                    dropped,
                    failed,
                },
                tx,
                worker: Some(handle),
            }),
            Err(e) => warn!(notifier = %id, error = %e, "failed to spawn notifier worker"),
        }
    }

    /// Stop delivering to one notifier. Its queued notifications still drain.
    pub(crate) fn detach(&self, id: &InstanceId) {
        let mut lanes = self.inner.lanes.lock();
        let Some(pos) = lanes.iter().position(|l| &l.counters.id == id) else {
            return;
        };
        let lane = lanes.remove(pos);
        self.inner.retired.lock().push(lane.counters);
    }

    /// Close every lane and wait up to `grace` for queued notifications to
    /// be delivered. Workers still busy after the deadline are abandoned.
    pub fn shutdown(&self, grace: Duration) {
        let lanes: Vec<Lane> = {
            let mut live = self.inner.lanes.lock();
            let lanes = std::mem::take(&mut *live);
            self.inner
                .retired
                .lock()
                .extend(lanes.iter().map(|l| l.counters.clone()));
            lanes
        };
        let deadline = Instant::now() + grace;
        for mut lane in lanes {
            let Some(worker) = lane.worker.take() else {
                continue;
            };
            // Dropping the sender ends the worker's receive loop once drained.
            drop(lane.tx);
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                warn!(notifier = %lane.counters.id, "notifier still busy after grace period, abandoning");
            }
        }
    }

    /// Counters per notifier, live lanes first. A notifier that was
    /// detached and attached again reports the sum over all its lanes.
    pub fn lane_stats(&self) -> Vec<LaneStats> {
        let lanes = self.inner.lanes.lock();
        let retired = self.inner.retired.lock();
        let mut stats: Vec<LaneStats> = Vec::new();
        for counters in lanes.iter().map(|l| &l.counters).chain(retired.iter()) {
            let dropped = counters.dropped.load(Ordering::Relaxed);
            let failed = counters.failed.load(Ordering::Relaxed);
            match stats.iter_mut().find(|s| s.notifier == counters.id) {
                Some(s) => {
                    s.dropped += dropped;
                    s.failed += failed;
                }
                None => stats.push(LaneStats {
                    notifier: counters.id.clone(),
                    dropped,
                    failed,
                }),
            }
        }
        stats
    }
}

fn deliver(
    id: &InstanceId,
    plugin: &Arc<Mutex<dyn NotifierPlugin>>,
    notification: &Notification,
    failed: &AtomicUsize,
) {
    match caught(|| plugin.lock().notify(notification)) {
        Guarded::Completed(Ok(())) => {}
        Guarded::Completed(Err(e)) => {
            failed.fetch_add(1, Ordering::Relaxed);
            debug!(notifier = %id, error = %e, "notifier delivery failed");
        }
        Guarded::Panicked(msg) | Guarded::Unavailable(msg) => {
            failed.fetch_add(1, Ordering::Relaxed);
            debug!(notifier = %id, panic = %msg, "notifier panicked during delivery");
        }
        Guarded::TimedOut => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::events::Phase;
    use crate::plugin::{Params, PluginDescriptor, Role};
    use crate::registry::PluginRegistry;
    use crossbeam_channel::Receiver;

    /// Blocks every delivery until the gate sender is dropped.
    struct Gated {
        gate: Receiver<()>,
        seen: Arc<AtomicUsize>,
    }

    impl NotifierPlugin for Gated {
        fn notify(&mut self, _notification: &Notification) -> Result<()> {
            let _ = self.gate.recv();
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event() -> LifecycleEvent {
        LifecycleEvent::new(InstanceId::new("input/test#0"), Role::Input, Phase::Ready)
    }

    #[test]
    fn full_lane_drops_without_blocking_and_counts() {
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let seen = Arc::new(AtomicUsize::new(0));
        let registry = PluginRegistry::new();
        let id = registry
            .register(
                PluginDescriptor::new(Role::Notifier, "gated", Params::new()),
                PluginHandle::notifier(Gated {
                    gate: gate_rx,
                    seen: Arc::clone(&seen),
                }),
            )
            .unwrap();

        let diagnostics = Arc::new(DispatchDiagnostics::default());
        let hub = NotifierHub::new(1, false, Arc::clone(&diagnostics));
        hub.attach(&registry.get(&id).unwrap());

        let started = Instant::now();
        for _ in 0..5 {
            hub.lifecycle(event());
        }
        assert!(started.elapsed() < Duration::from_millis(200), "notify must not block");

        let stats = hub.lane_stats();
        assert_eq!(stats.len(), 1);
        assert!(stats[0].dropped >= 3, "dropped={}", stats[0].dropped);

        drop(gate_tx);
        hub.shutdown(Duration::from_secs(2));
        let delivered = seen.load(Ordering::SeqCst);
        let dropped = diagnostics.snapshot().notifications_dropped;
        assert_eq!(delivered + dropped, 5);
    }

    #[test]
    fn detached_lane_keeps_its_drop_count() {
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let registry = PluginRegistry::new();
        let id = registry
            .register(
                PluginDescriptor::new(Role::Notifier, "gated", Params::new()),
                PluginHandle::notifier(Gated {
                    gate: gate_rx,
                    seen: Arc::new(AtomicUsize::new(0)),
                }),
            )
            .unwrap();
        let hub = NotifierHub::new(1, false, Arc::new(DispatchDiagnostics::default()));
        let instance = registry.get(&id).unwrap();
        hub.attach(&instance);
        for _ in 0..5 {
            hub.lifecycle(event());
        }
        let before = hub.lane_stats()[0].dropped;
        assert!(before >= 3);

        hub.detach(&id);
        hub.lifecycle(event());
        assert_eq!(hub.lane_stats(), vec![LaneStats {
            notifier: id.clone(),
            dropped: before,
            failed: 0,
        }]);

        // Attached again: old and new lanes add up under one entry.
        drop(gate_tx);
        hub.attach(&instance);
        hub.shutdown(Duration::from_secs(2));
        let stats = hub.lane_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].dropped, before);
    }

    #[test]
    fn observers_see_every_notification() {
        let hub = NotifierHub::new(4, false, Arc::new(DispatchDiagnostics::default()));
        let mut rx = hub.subscribe();
        hub.lifecycle(event());
        let got = rx.try_recv().expect("observer should receive");
        assert_eq!(got.as_lifecycle().map(|e| e.phase), Some(Phase::Ready));
    }
}
