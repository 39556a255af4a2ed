//! Bounded, multi-producer event bus.
//!
//! One `crossbeam-channel` queue per event kind decouples producers from the
//! single consumer of that kind:
//!
//! ```text
//! inputs ──► [raw utterances] ──► matcher ──► [commands] ──► router ──► [responses] ──► fan-out
//! ```
//!
//! Producers never block. When a queue is full the configured
//! [`OverflowPolicy`] decides which event is lost and a drop counter records
//! it, so memory stays bounded and backpressure is observable.
//!
//! The bus also tracks how many accepted utterances are still unresolved.
//! An utterance resolves when the matcher ignores it, when any of its
//! descendants is dropped on overflow, or when fan-out finishes publishing
//! its response. Shutdown drains until that count reaches zero.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::diagnostics::DispatchDiagnostics;
use crate::events::{Command, RawUtterance, Response, UtteranceId};
use crate::plugin::InstanceId;
use crate::supervisor::FaultReporter;

/// Which event is lost when a queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Reject the incoming event; queued events are kept.
    DropNewest,
    /// Evict the oldest queued event to make room for the incoming one.
    DropOldest,
}

fn default_queue_capacity() -> usize {
    64
}

/// Sizing and overflow behaviour shared by the three event queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Required: there is no implicit overflow behaviour.
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Enqueue {
    queued: bool,
    evicted: bool,
}

impl Enqueue {
    fn lost(self) -> usize {
        usize::from(!self.queued) + usize::from(self.evicted)
    }
}

struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    policy: OverflowPolicy,
}

impl<T> BoundedQueue<T> {
    fn new(config: QueueConfig) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(config.capacity.max(1));
        Self {
            tx,
            rx,
            policy: config.overflow,
        }
    }

    fn push(&self, item: T) -> Enqueue {
        let item = match self.tx.try_send(item) {
            Ok(()) => {
                return Enqueue {
                    queued: true,
                    evicted: false,
                }
            }
            Err(TrySendError::Full(item)) => item,
            Err(TrySendError::Disconnected(_)) => {
                return Enqueue {
                    queued: false,
                    evicted: false,
                }
            }
        };

        match self.policy {
            OverflowPolicy::DropNewest => Enqueue {
                queued: false,
                evicted: false,
            },
            OverflowPolicy::DropOldest => {
                let evicted = self.rx.try_recv().is_ok();
                Enqueue {
                    queued: self.tx.try_send(item).is_ok(),
                    evicted,
                }
            }
        }
    }
}

pub struct EventBus {
    utterances: BoundedQueue<RawUtterance>,
    commands: BoundedQueue<Command>,
    responses: BoundedQueue<Arc<Response>>,
    intake_open: AtomicBool,
    in_flight: AtomicUsize,
    next_utterance: AtomicU64,
    diagnostics: Arc<DispatchDiagnostics>,
}

impl EventBus {
    pub fn new(config: QueueConfig, diagnostics: Arc<DispatchDiagnostics>) -> Self {
        Self {
            utterances: BoundedQueue::new(config),
            commands: BoundedQueue::new(config),
            responses: BoundedQueue::new(config),
            intake_open: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            next_utterance: AtomicU64::new(0),
            diagnostics,
        }
    }

    /// Offer a new utterance. Returns `false` if it was rejected or dropped.
    pub fn publish_utterance(
        &self,
        source: InstanceId,
        text: String,
        confidence: Option<f32>,
    ) -> bool {
        if !self.intake_open.load(Ordering::SeqCst) {
            self.diagnostics
                .utterances_rejected
                .fetch_add(1, Ordering::Relaxed);
            debug!(source = %source, "intake closed, utterance rejected");
            return false;
        }

        let utterance = RawUtterance {
            id: UtteranceId(self.next_utterance.fetch_add(1, Ordering::Relaxed)),
            source,
            text,
            timestamp: Utc::now(),
            confidence,
        };

        // Count before queueing so the consumer can never resolve first.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = self.utterances.push(utterance);
        self.account(outcome, &self.diagnostics.utterances_dropped, "utterance");
        if outcome.queued {
            self.diagnostics
                .utterances_accepted
                .fetch_add(1, Ordering::Relaxed);
        }
        outcome.queued
    }

    pub(crate) fn forward_command(&self, command: Command) -> bool {
        let outcome = self.commands.push(command);
        self.account(outcome, &self.diagnostics.commands_dropped, "command");
        outcome.queued
    }

    pub(crate) fn forward_response(&self, response: Arc<Response>) -> bool {
        let outcome = self.responses.push(response);
        self.account(outcome, &self.diagnostics.responses_dropped, "response");
        outcome.queued
    }

    /// Mark one in-flight utterance as fully handled.
    pub(crate) fn resolve(&self) {
        self.release(1);
    }

    pub(crate) fn utterances(&self) -> &Receiver<RawUtterance> {
        &self.utterances.rx
    }

    pub(crate) fn commands(&self) -> &Receiver<Command> {
        &self.commands.rx
    }

    pub(crate) fn responses(&self) -> &Receiver<Arc<Response>> {
        &self.responses.rx
    }

    /// Stop accepting new utterances; events already queued keep flowing.
    pub fn close_intake(&self) {
        self.intake_open.store(false, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.intake_open.load(Ordering::SeqCst)
    }

    /// Utterances accepted but not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_drained(&self) -> bool {
        self.in_flight() == 0
    }

    fn account(&self, outcome: Enqueue, counter: &AtomicUsize, kind: &'static str) {
        let lost = outcome.lost();
        if lost > 0 {
            counter.fetch_add(lost, Ordering::Relaxed);
            warn!(kind, lost, "queue full, event dropped");
            self.release(lost);
        }
    }

    fn release(&self, n: usize) {
        // Saturating: a stray resolve must not wrap the counter.
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(n))
            });
    }
}

/// Handle given to an input plugin for publishing what it hears.
#[derive(Clone)]
pub struct UtteranceSink {
    source: InstanceId,
    bus: Arc<EventBus>,
    faults: FaultReporter,
}

impl UtteranceSink {
    pub(crate) fn new(source: InstanceId, bus: Arc<EventBus>, faults: FaultReporter) -> Self {
        Self { source, bus, faults }
    }

    pub fn source(&self) -> &InstanceId {
        &self.source
    }

    /// Publish recognised text. Returns `false` if the bus refused it
    /// (shutting down, or the queue was full under drop-newest).
    pub fn emit(&self, text: impl Into<String>, confidence: Option<f32>) -> bool {
        self.bus
            .publish_utterance(self.source.clone(), text.into(), confidence)
    }

    /// Report an unrecoverable failure (device lost, socket closed...).
    /// The supervisor marks the input failed and applies the restart policy.
    pub fn fail(&self, detail: impl Into<String>) {
        self.faults.report(&self.source, detail);
    }
}

impl std::fmt::Debug for UtteranceSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtteranceSink")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
