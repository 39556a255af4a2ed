//! Dispatch counters shared by every stage.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::events::ResponseStatus;

#[derive(Default)]
pub struct DispatchDiagnostics {
    pub utterances_accepted: AtomicUsize,
    /// Utterances offered after intake closed for shutdown.
    pub utterances_rejected: AtomicUsize,
    pub utterances_ignored: AtomicUsize,
    pub commands_routed: AtomicUsize,
    pub responses_ok: AtomicUsize,
    pub responses_no_handler: AtomicUsize,
    pub responses_handler_error: AtomicUsize,
    pub responses_timeout: AtomicUsize,
    pub utterances_dropped: AtomicUsize,
    pub commands_dropped: AtomicUsize,
    pub responses_dropped: AtomicUsize,
    pub output_errors: AtomicUsize,
    pub notifications_dropped: AtomicUsize,
    pub restarts: AtomicUsize,
}

impl DispatchDiagnostics {
    pub fn record_response(&self, status: ResponseStatus) {
        let counter = match status {
            ResponseStatus::Ok => &self.responses_ok,
            ResponseStatus::NoHandler => &self.responses_no_handler,
            ResponseStatus::HandlerError => &self.responses_handler_error,
            ResponseStatus::Timeout => &self.responses_timeout,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            utterances_accepted: self.utterances_accepted.load(Ordering::Relaxed),
            utterances_rejected: self.utterances_rejected.load(Ordering::Relaxed),
            utterances_ignored: self.utterances_ignored.load(Ordering::Relaxed),
            commands_routed: self.commands_routed.load(Ordering::Relaxed),
            responses_ok: self.responses_ok.load(Ordering::Relaxed),
            responses_no_handler: self.responses_no_handler.load(Ordering::Relaxed),
            responses_handler_error: self.responses_handler_error.load(Ordering::Relaxed),
            responses_timeout: self.responses_timeout.load(Ordering::Relaxed),
            utterances_dropped: self.utterances_dropped.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            responses_dropped: self.responses_dropped.load(Ordering::Relaxed),
            output_errors: self.output_errors.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub utterances_accepted: usize,
    pub utterances_rejected: usize,
    pub utterances_ignored: usize,
    pub commands_routed: usize,
    pub responses_ok: usize,
    pub responses_no_handler: usize,
    pub responses_handler_error: usize,
    pub responses_timeout: usize,
    pub utterances_dropped: usize,
    pub commands_dropped: usize,
    pub responses_dropped: usize,
    pub output_errors: usize,
    pub notifications_dropped: usize,
    pub restarts: usize,
}

impl DiagnosticsSnapshot {
    pub fn responses_total(&self) -> usize {
        self.responses_ok
            + self.responses_no_handler
            + self.responses_handler_error
            + self.responses_timeout
    }
}
