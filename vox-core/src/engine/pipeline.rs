//! Blocking stage loops.
//!
//! ## Stages
//!
//! ```text
//! matcher: RawUtterance ─► PhraseMatcher ─► Command        (or Ignored + resolve)
//! router:  Command      ─► ServiceRouter ─► Arc<Response>
//! fan-out: Arc<Response> ─► OutputFanout ─► resolve
//! ```
//!
//! Each stage owns one named OS thread and is the only consumer of its
//! queue, so per-input FIFO order is preserved end to end. Loops poll the
//! shared `running` flag between receives and exit once it is cleared.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::bus::EventBus;
use crate::diagnostics::DispatchDiagnostics;
use crate::events::{LifecycleEvent, Notification, Phase};
use crate::fanout::OutputFanout;
use crate::notify::NotifierHub;
use crate::phrase::PhraseMatcher;
use crate::plugin::Role;
use crate::router::ServiceRouter;

/// How long a stage blocks on its queue before re-checking `running`.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// State shared by every stage loop.
#[derive(Clone)]
pub struct StageContext {
    pub bus: Arc<EventBus>,
    pub running: Arc<AtomicBool>,
    pub hub: NotifierHub,
    pub diagnostics: Arc<DispatchDiagnostics>,
}

/// Receive the next item, or `None` once the stage should stop.
fn next<T>(ctx: &StageContext, rx: &Receiver<T>) -> Option<T> {
    loop {
        if !ctx.running.load(Ordering::Relaxed) {
            return None;
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(item) => return Some(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

pub fn run_matcher(ctx: StageContext, matcher: PhraseMatcher) {
    info!(phrases = matcher.phrases().len(), "matcher stage started");

    while let Some(utterance) = next(&ctx, ctx.bus.utterances()) {
        match matcher.match_utterance(&utterance) {
            Some(command) => {
                debug!(utterance_id = %utterance.id, command_id = %command.id, "key phrase matched");
                if ctx.hub.audit_enabled() {
                    ctx.hub.notify(Notification::Command(Arc::new(command.clone())));
                }
                ctx.bus.forward_command(command);
            }
            None => {
                ctx.diagnostics
                    .utterances_ignored
                    .fetch_add(1, Ordering::Relaxed);
                debug!(utterance_id = %utterance.id, source = %utterance.source, "no key phrase, utterance ignored");
                ctx.hub.lifecycle(
                    LifecycleEvent::new(utterance.source.clone(), Role::Input, Phase::Ignored)
                        .with_detail(format!("{}: {:?}", utterance.id, utterance.text)),
                );
                ctx.bus.resolve();
            }
        }
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        accepted = snap.utterances_accepted,
        ignored = snap.utterances_ignored,
        dropped = snap.utterances_dropped,
        rejected = snap.utterances_rejected,
        "matcher stage stopped"
    );
}

pub fn run_router(ctx: StageContext, router: ServiceRouter) {
    info!(timeout_ms = router.timeout().as_millis() as u64, "router stage started");

    while let Some(command) = next(&ctx, ctx.bus.commands()) {
        let response = Arc::new(router.route(&command));
        if ctx.hub.audit_enabled() {
            ctx.hub.notify(Notification::Response(Arc::clone(&response)));
        }
        ctx.bus.forward_response(response);
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        routed = snap.commands_routed,
        ok = snap.responses_ok,
        no_handler = snap.responses_no_handler,
        handler_error = snap.responses_handler_error,
        timeout = snap.responses_timeout,
        dropped = snap.commands_dropped,
        "router stage stopped"
    );
}

pub fn run_fanout(ctx: StageContext, fanout: OutputFanout) {
    info!("fan-out stage started");

    while let Some(response) = next(&ctx, ctx.bus.responses()) {
        fanout.publish(&response);
        ctx.bus.resolve();
    }

    let snap = ctx.diagnostics.snapshot();
    info!(
        responses = snap.responses_total(),
        output_errors = snap.output_errors,
        dropped = snap.responses_dropped,
        "fan-out stage stopped"
    );
}
