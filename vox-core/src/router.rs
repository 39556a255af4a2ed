//! Service router: first-match selection with a bounded call.
//!
//! ## Per command
//!
//! ```text
//! 1. Ask each ready service, in registration order, can_handle(text)
//! 2. First `true` wins; nobody → Response{NoHandler}, no handler invoked
//! 3. Run handle(text) with whatever is left of the budget
//! 4. Ok → Response{Ok}; Err/panic → Response{HandlerError};
//!    budget spent → cancel token set, Response{Timeout}
//! ```
//!
//! Steps 1 and 3 both run on worker threads and share one budget, the
//! configured service timeout. A service that overruns it, in either step,
//! is reported to the supervisor. Nothing a service does can unwind into
//! the router. Successful routes emit no lifecycle events.
//!
//! A timed-out call is abandoned, not killed. If the service ignores its
//! cancel token the worker thread keeps running until the call returns.

use std::sync::{atomic::Ordering, Arc};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info_span, warn};

use crate::diagnostics::DispatchDiagnostics;
use crate::events::{Command, LifecycleEvent, Phase, Response};
use crate::guard::{caught, with_timeout, Guarded};
use crate::notify::NotifierHub;
use crate::plugin::{CancelToken, InstanceId, PluginHandle, Role};
use crate::registry::{PluginInstance, PluginRegistry};
use crate::supervisor::FaultReporter;

/// Outcome of asking the ready services who claims a command.
pub enum Selection {
    Claimed(Arc<PluginInstance>),
    Unclaimed,
    /// This instance's `can_handle` did not answer within the budget.
    Stalled(Arc<PluginInstance>),
}

pub struct ServiceRouter {
    registry: Arc<PluginRegistry>,
    timeout: Duration,
    hub: NotifierHub,
    faults: FaultReporter,
    diagnostics: Arc<DispatchDiagnostics>,
}

impl ServiceRouter {
    pub fn new(
        registry: Arc<PluginRegistry>,
        timeout: Duration,
        hub: NotifierHub,
        faults: FaultReporter,
        diagnostics: Arc<DispatchDiagnostics>,
    ) -> Self {
        Self {
            registry,
            timeout,
            hub,
            faults,
            diagnostics,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// First ready service claiming `text`, in registration order, asked
    /// on a worker thread and given at most `budget`.
    ///
    /// A service whose `can_handle` panics is reported to the supervisor and
    /// skipped.
    pub fn select(&self, text: &str, budget: Duration) -> Selection {
        let candidates = self.registry.active(Role::Service);
        if candidates.is_empty() {
            return Selection::Unclaimed;
        }

        let asking: Arc<Mutex<Option<Arc<PluginInstance>>>> = Arc::default();
        let worker_asking = Arc::clone(&asking);
        let text = text.to_string();
        let outcome = with_timeout("vox-claim".into(), budget, move || {
            let mut panicked = Vec::new();
            for instance in candidates {
                let PluginHandle::Service(service) = instance.handle() else {
                    continue;
                };
                *worker_asking.lock() = Some(Arc::clone(&instance));
                match caught(|| service.can_handle(&text)) {
                    Guarded::Completed(true) => return (Some(instance), panicked),
                    Guarded::Completed(false) => {}
                    Guarded::Panicked(msg) | Guarded::Unavailable(msg) => {
                        panicked.push((instance.id().clone(), msg));
                    }
                    Guarded::TimedOut => {}
                }
            }
            (None, panicked)
        });

        match outcome {
            Guarded::Completed((chosen, panicked)) => {
                for (id, msg) in panicked {
                    error!(instance = %id, panic = %msg, "can_handle panicked");
                    self.faults.report(&id, format!("can_handle panicked: {msg}"));
                }
                chosen.map_or(Selection::Unclaimed, Selection::Claimed)
            }
            Guarded::TimedOut => match asking.lock().take() {
                Some(instance) => Selection::Stalled(instance),
                None => Selection::Unclaimed,
            },
            Guarded::Panicked(msg) | Guarded::Unavailable(msg) => {
                error!(error = %msg, "service selection could not run");
                Selection::Unclaimed
            }
        }
    }

    /// Route one command to exactly one response.
    pub fn route(&self, command: &Command) -> Response {
        let span = info_span!(
            "route",
            command_id = %command.id,
            utterance_id = %command.origin,
        );
        let _enter = span.enter();

        self.diagnostics.commands_routed.fetch_add(1, Ordering::Relaxed);
        let response = self.dispatch(command);
        self.diagnostics.record_response(response.status);
        debug!(status = ?response.status, handler = ?response.handler, "command routed");
        response
    }

    fn dispatch(&self, command: &Command) -> Response {
        let deadline = Instant::now() + self.timeout;
        let instance = match self.select(&command.text, self.timeout) {
            Selection::Claimed(instance) => instance,
            Selection::Unclaimed => {
                debug!(text = %command.text, "no service claimed command");
                return Response::no_handler(command);
            }
            Selection::Stalled(instance) => {
                return self.timed_out(command, instance.id(), "can_handle");
            }
        };
        let PluginHandle::Service(service) = instance.handle() else {
            return Response::no_handler(command);
        };

        let id = instance.id().clone();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let worker_service = Arc::clone(service);
        let text = command.text.clone();

        let outcome = with_timeout(
            format!("vox-handler-{}", command.id),
            deadline.saturating_duration_since(Instant::now()),
            move || worker_service.handle(&text, &worker_cancel),
        );

        match outcome {
            Guarded::Completed(Ok(payload)) => Response::ok(command, id, payload),
            Guarded::Completed(Err(e)) => {
                warn!(instance = %id, error = %e, "service returned an error");
                self.report_failure(&instance, format!("{}: {e}", command.id));
                Response::handler_error(command, id, e.to_string())
            }
            Guarded::Panicked(msg) => {
                error!(instance = %id, panic = %msg, "service panicked");
                self.report_failure(&instance, format!("{}: panicked: {msg}", command.id));
                self.faults.report(&id, format!("handle panicked: {msg}"));
                Response::handler_error(command, id, msg)
            }
            Guarded::Unavailable(msg) => {
                error!(instance = %id, error = %msg, "could not spawn handler thread");
                self.report_failure(&instance, msg.clone());
                Response::handler_error(command, id, msg)
            }
            Guarded::TimedOut => {
                cancel.cancel();
                self.timed_out(command, &id, "handle")
            }
        }
    }

    fn timed_out(&self, command: &Command, id: &InstanceId, call: &str) -> Response {
        let detail = format!("{call} gave no answer within {}ms", self.timeout.as_millis());
        warn!(
            instance = %id,
            timeout_ms = self.timeout.as_millis() as u64,
            "{call} abandoned, it may still be running"
        );
        self.hub.lifecycle(
            LifecycleEvent::new(id.clone(), Role::Service, Phase::TimedOut)
                .with_detail(detail.clone()),
        );
        self.faults.report(id, detail.clone());
        Response::timeout(command, id.clone(), detail)
    }

    fn report_failure(&self, instance: &PluginInstance, detail: String) {
        self.hub.lifecycle(
            LifecycleEvent::new(instance.id().clone(), Role::Service, Phase::Failed)
                .with_detail(detail),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, VoxError};
    use crate::events::{CommandId, Payload, ResponseStatus, UtteranceId};
    use crate::plugin::{InstanceId, Params, PluginDescriptor, ServicePlugin};
    use crate::registry::PluginState;
    use crate::supervisor::SupervisorRequest;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    enum Script {
        Reply(&'static str),
        Fail,
        Panic,
        Sleep(Duration),
        /// `can_handle` blocks this long, then claims.
        StallClaim(Duration),
        /// Slow to claim, then slow to handle.
        SlowBoth(Duration, Duration),
    }

    struct Scripted {
        claims: &'static str,
        script: Script,
        calls: Arc<AtomicUsize>,
    }

    impl ServicePlugin for Scripted {
        fn can_handle(&self, text: &str) -> bool {
            if let Script::StallClaim(d) | Script::SlowBoth(d, _) = &self.script {
                std::thread::sleep(*d);
            }
            text.starts_with(self.claims)
        }

        fn handle(&self, _text: &str, cancel: &CancelToken) -> Result<Payload> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Reply(text) => Ok(Payload::text(*text)),
                Script::Fail => Err(VoxError::plugin("backend unreachable")),
                Script::Panic => panic!("index out of bounds"),
                Script::Sleep(d) | Script::SlowBoth(_, d) => {
                    std::thread::sleep(*d);
                    assert!(cancel.is_cancelled());
                    Ok(Payload::Empty)
                }
                Script::StallClaim(_) => Ok(Payload::text("late claim")),
            }
        }
    }

    struct Harness {
        router: ServiceRouter,
        diagnostics: Arc<DispatchDiagnostics>,
        hub: NotifierHub,
        faults: crossbeam_channel::Receiver<SupervisorRequest>,
    }

    impl Harness {
        fn faulted(&self) -> Vec<String> {
            self.faults
                .try_iter()
                .filter_map(|r| match r {
                    SupervisorRequest::Fault { id, .. } => Some(id.to_string()),
                    _ => None,
                })
                .collect()
        }
    }

    fn harness(services: Vec<(&'static str, Script, Arc<AtomicUsize>)>) -> Harness {
        let registry = Arc::new(PluginRegistry::new());
        for (claims, script, calls) in services {
            let id = registry
                .register(
                    PluginDescriptor::new(Role::Service, "scripted", Params::new()),
                    PluginHandle::service(Scripted {
                        claims,
                        script,
                        calls,
                    }),
                )
                .unwrap();
            registry.get(&id).unwrap().set_state(PluginState::Ready);
        }
        let diagnostics = Arc::new(DispatchDiagnostics::default());
        let hub = NotifierHub::new(8, false, Arc::clone(&diagnostics));
        let (faults_tx, faults) = crossbeam_channel::unbounded();
        let router = ServiceRouter::new(
            registry,
            Duration::from_millis(100),
            hub.clone(),
            FaultReporter::new(faults_tx),
            Arc::clone(&diagnostics),
        );
        Harness {
            router,
            diagnostics,
            hub,
            faults,
        }
    }

    fn command(text: &str) -> Command {
        Command {
            id: CommandId(1),
            text: text.into(),
            origin: UtteranceId(1),
            source: InstanceId::new("input/test#0"),
            timestamp: Utc::now(),
        }
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn unclaimed_command_yields_no_handler() {
        let calls = counter();
        let h = harness(vec![("what time", Script::Reply("noon"), Arc::clone(&calls))]);
        let response = h.router.route(&command("play jazz"));
        assert_eq!(response.status, ResponseStatus::NoHandler);
        assert_eq!(response.handler, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.diagnostics.snapshot().responses_no_handler, 1);
    }

    #[test]
    fn single_claimant_is_invoked_once() {
        let calls = counter();
        let h = harness(vec![("what time", Script::Reply("twelve o'clock"), Arc::clone(&calls))]);
        let response = h.router.route(&command("what time is it"));
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.payload, Payload::text("twelve o'clock"));
        assert_eq!(
            response.handler.as_ref().map(InstanceId::as_str),
            Some("service/scripted#0")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_registered_claimant_wins() {
        let first = counter();
        let second = counter();
        let h = harness(vec![
            ("volume", Script::Reply("first"), Arc::clone(&first)),
            ("volume", Script::Reply("second"), Arc::clone(&second)),
        ]);
        let response = h.router.route(&command("volume up"));
        assert_eq!(response.payload, Payload::text("first"));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_error_and_panic_become_responses() {
        let h = harness(vec![
            ("fail", Script::Fail, counter()),
            ("boom", Script::Panic, counter()),
        ]);
        let mut events = h.hub.subscribe();

        let err = h.router.route(&command("fail now"));
        assert_eq!(err.status, ResponseStatus::HandlerError);
        assert!(err.detail.as_deref().unwrap_or("").contains("backend unreachable"));

        let panicked = h.router.route(&command("boom"));
        assert_eq!(panicked.status, ResponseStatus::HandlerError);
        assert_eq!(h.diagnostics.snapshot().responses_handler_error, 2);

        let failed = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|n| n.as_lifecycle().map(|e| e.phase) == Some(Phase::Failed))
            .count();
        assert_eq!(failed, 2);
        // Only the panic is a fault; an Err leaves the service ready.
        assert_eq!(h.faulted(), vec!["service/scripted#1"]);
    }

    #[test]
    fn slow_handler_times_out_and_is_cancelled() {
        let h = harness(vec![(
            "slow",
            Script::Sleep(Duration::from_millis(300)),
            counter(),
        )]);
        let started = std::time::Instant::now();
        let response = h.router.route(&command("slow thing"));
        assert_eq!(response.status, ResponseStatus::Timeout);
        assert!(started.elapsed() < Duration::from_millis(280));
        assert_eq!(h.diagnostics.snapshot().responses_timeout, 1);
        assert_eq!(h.faulted(), vec!["service/scripted#0"]);
    }

    #[test]
    fn stalled_claim_check_times_out_within_budget() {
        let later = counter();
        let h = harness(vec![
            ("weather", Script::StallClaim(Duration::from_millis(600)), counter()),
            ("weather", Script::Reply("sunny"), Arc::clone(&later)),
        ]);
        let mut events = h.hub.subscribe();

        let started = std::time::Instant::now();
        let response = h.router.route(&command("weather today"));
        assert!(
            started.elapsed() < Duration::from_millis(400),
            "route took {:?}",
            started.elapsed()
        );
        assert_eq!(response.status, ResponseStatus::Timeout);
        assert_eq!(
            response.handler.as_ref().map(InstanceId::as_str),
            Some("service/scripted#0")
        );
        assert_eq!(later.load(Ordering::SeqCst), 0);
        assert_eq!(h.diagnostics.snapshot().responses_timeout, 1);
        assert_eq!(h.faulted(), vec!["service/scripted#0"]);

        let timed_out = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|n| n.as_lifecycle().map(|e| e.phase) == Some(Phase::TimedOut))
            .count();
        assert_eq!(timed_out, 1);
    }

    #[test]
    fn claim_and_handle_share_one_budget() {
        // Each step fits in the 100ms budget on its own; together they do not.
        let h = harness(vec![(
            "slow",
            Script::StallClaim(Duration::from_millis(60)),
            counter(),
        )]);
        let response = h.router.route(&command("slow thing"));
        assert_eq!(response.status, ResponseStatus::Ok);

        let h = harness(vec![(
            "slow",
            Script::SlowBoth(Duration::from_millis(60), Duration::from_millis(70)),
            counter(),
        )]);
        let started = std::time::Instant::now();
        let response = h.router.route(&command("slow thing"));
        assert_eq!(response.status, ResponseStatus::Timeout);
        assert!(started.elapsed() < Duration::from_millis(250));
    }
}
