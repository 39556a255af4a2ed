//! Output fan-out: one response, every ready output, registration order.
//!
//! Outputs share a single `Arc<Response>`; none of them can mutate it. A
//! failing output is counted and reported, and delivery continues with the
//! next one.

use std::sync::{atomic::Ordering, Arc};

use tracing::{debug, error, warn};

use crate::diagnostics::DispatchDiagnostics;
use crate::events::{LifecycleEvent, Phase, Response};
use crate::guard::{caught, Guarded};
use crate::notify::NotifierHub;
use crate::plugin::{PluginHandle, Role};
use crate::registry::PluginRegistry;
use crate::supervisor::FaultReporter;

/// Per-publish delivery tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct OutputFanout {
    registry: Arc<PluginRegistry>,
    hub: NotifierHub,
    faults: FaultReporter,
    diagnostics: Arc<DispatchDiagnostics>,
}

impl OutputFanout {
    pub fn new(
        registry: Arc<PluginRegistry>,
        hub: NotifierHub,
        faults: FaultReporter,
        diagnostics: Arc<DispatchDiagnostics>,
    ) -> Self {
        Self {
            registry,
            hub,
            faults,
            diagnostics,
        }
    }

    pub fn publish(&self, response: &Response) -> FanoutReport {
        let mut report = FanoutReport::default();

        for instance in self.registry.active(Role::Output) {
            let PluginHandle::Output(output) = instance.handle() else {
                continue;
            };
            let failure = match caught(|| output.lock().deliver(response)) {
                Guarded::Completed(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Guarded::Completed(Err(e)) => {
                    warn!(instance = %instance.id(), command_id = %response.command, error = %e, "output delivery failed");
                    e.to_string()
                }
                Guarded::Panicked(msg) | Guarded::Unavailable(msg) => {
                    error!(instance = %instance.id(), command_id = %response.command, panic = %msg, "output panicked");
                    self.faults
                        .report(instance.id(), format!("deliver panicked: {msg}"));
                    msg
                }
                Guarded::TimedOut => continue,
            };

            report.failed += 1;
            self.diagnostics.output_errors.fetch_add(1, Ordering::Relaxed);
            self.hub.lifecycle(
                LifecycleEvent::new(instance.id().clone(), Role::Output, Phase::Failed)
                    .with_detail(format!("{}: {failure}", response.command)),
            );
        }

        debug!(
            command_id = %response.command,
            delivered = report.delivered,
            failed = report.failed,
            "response published"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, VoxError};
    use crate::events::{Command, CommandId, UtteranceId};
    use crate::plugin::{InstanceId, OutputPlugin, Params, PluginDescriptor};
    use crate::registry::PluginState;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Record,
        Fail,
        Panic,
    }

    struct Scripted {
        name: &'static str,
        behaviour: Behaviour,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl OutputPlugin for Scripted {
        fn deliver(&mut self, _response: &Response) -> Result<()> {
            self.log.lock().push(self.name);
            match self.behaviour {
                Behaviour::Record => Ok(()),
                Behaviour::Fail => Err(VoxError::plugin("speaker busy")),
                Behaviour::Panic => panic!("speaker exploded"),
            }
        }
    }

    fn response() -> Response {
        let command = Command {
            id: CommandId(9),
            text: "play jazz".into(),
            origin: UtteranceId(4),
            source: InstanceId::new("input/test#0"),
            timestamp: Utc::now(),
        };
        Response::no_handler(&command)
    }

    #[test]
    fn every_output_gets_the_response_in_order_despite_failures() {
        let registry = Arc::new(PluginRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for (name, behaviour) in [
            ("first", Behaviour::Fail),
            ("second", Behaviour::Panic),
            ("third", Behaviour::Record),
        ] {
            let id = registry
                .register(
                    PluginDescriptor::new(Role::Output, name, Params::new()),
                    PluginHandle::output(Scripted {
                        name,
                        behaviour,
                        log: Arc::clone(&log),
                    }),
                )
                .unwrap();
            registry.get(&id).unwrap().set_state(PluginState::Ready);
        }

        let diagnostics = Arc::new(DispatchDiagnostics::default());
        let hub = NotifierHub::new(8, false, Arc::clone(&diagnostics));
        let mut events = hub.subscribe();
        let fanout = OutputFanout::new(
            Arc::clone(&registry),
            hub,
            FaultReporter::detached(),
            Arc::clone(&diagnostics),
        );

        let report = fanout.publish(&response());
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
        assert_eq!(report, FanoutReport { delivered: 1, failed: 2 });
        assert_eq!(diagnostics.snapshot().output_errors, 2);

        let failed: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|n| n.as_lifecycle().map(|e| e.component.to_string()))
            .collect();
        assert_eq!(failed, vec!["output/first#0", "output/second#1"]);
    }

    #[test]
    fn outputs_that_are_not_ready_are_skipped() {
        let registry = Arc::new(PluginRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(
                PluginDescriptor::new(Role::Output, "idle", Params::new()),
                PluginHandle::output(Scripted {
                    name: "idle",
                    behaviour: Behaviour::Record,
                    log: Arc::clone(&log),
                }),
            )
            .unwrap();

        let diagnostics = Arc::new(DispatchDiagnostics::default());
        let fanout = OutputFanout::new(
            registry,
            NotifierHub::new(8, false, Arc::clone(&diagnostics)),
            FaultReporter::detached(),
            diagnostics,
        );
        assert_eq!(fanout.publish(&response()), FanoutReport::default());
        assert!(log.lock().is_empty());
    }
}
