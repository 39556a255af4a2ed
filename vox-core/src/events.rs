//! Event types carried by the bus and delivered to notifiers.
//!
//! | Event | Produced by | Consumed by |
//! |-------|-------------|-------------|
//! | `RawUtterance` | input plugins | phrase matcher |
//! | `Command` | phrase matcher | service router |
//! | `Response` | service router | every output (shared, read-only) |
//! | `LifecycleEvent` | supervisor, router, fan-out, matcher | every notifier |
//!
//! All types serialize with camelCase field names so notifiers can write
//! them out verbatim.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plugin::{InstanceId, Role};

/// Sequence number of a [`RawUtterance`], unique per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UtteranceId(pub u64);

/// Sequence number of a [`Command`], unique per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u64);

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "utt-{}", self.0)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Pipeline events
// ---------------------------------------------------------------------------

/// Text recognised by an input, before wake-phrase matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUtterance {
    pub id: UtteranceId,
    /// Instance id of the producing input.
    pub source: InstanceId,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Recogniser confidence in [0.0, 1.0], if available.
    pub confidence: Option<f32>,
}

/// An utterance with its key phrase stripped, ready for routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    /// Normalized text after the key phrase; may be empty.
    pub text: String,
    pub origin: UtteranceId,
    pub source: InstanceId,
    pub timestamp: DateTime<Utc>,
}

/// What a service produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Payload {
    /// Nothing to say (e.g. an action that only has side effects).
    Empty,
    Text(String),
    Structured(serde_json::Value),
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }
}

/// Outcome class of a routed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseStatus {
    Ok,
    /// No registered service claimed the command.
    NoHandler,
    /// The chosen service returned an error or panicked.
    HandlerError,
    /// The chosen service did not answer within the configured timeout.
    Timeout,
}

/// The result of routing one command. Shared read-only by all outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub command: CommandId,
    /// Text of the originating command, kept for rendering.
    pub command_text: String,
    pub status: ResponseStatus,
    pub payload: Payload,
    /// The service that handled the command, if any was selected.
    pub handler: Option<InstanceId>,
    /// Opaque failure detail for `HandlerError` / `Timeout`.
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Response {
    pub fn ok(command: &Command, handler: InstanceId, payload: Payload) -> Self {
        Self::build(command, ResponseStatus::Ok, payload, Some(handler), None)
    }

    pub fn no_handler(command: &Command) -> Self {
        Self::build(command, ResponseStatus::NoHandler, Payload::Empty, None, None)
    }

    pub fn handler_error(command: &Command, handler: InstanceId, detail: impl Into<String>) -> Self {
        Self::build(
            command,
            ResponseStatus::HandlerError,
            Payload::Empty,
            Some(handler),
            Some(detail.into()),
        )
    }

    pub fn timeout(command: &Command, handler: InstanceId, detail: impl Into<String>) -> Self {
        Self::build(
            command,
            ResponseStatus::Timeout,
            Payload::Empty,
            Some(handler),
            Some(detail.into()),
        )
    }

    fn build(
        command: &Command,
        status: ResponseStatus,
        payload: Payload,
        handler: Option<InstanceId>,
        detail: Option<String>,
    ) -> Self {
        Self {
            command: command.id,
            command_text: command.text.clone(),
            status,
            payload,
            handler,
            detail,
            timestamp: Utc::now(),
        }
    }

    /// Human-facing rendering used by text outputs.
    ///
    /// Every status renders to something so the user always gets feedback,
    /// including when nothing handled the command.
    pub fn render(&self) -> String {
        match (self.status, &self.payload) {
            (ResponseStatus::Ok, Payload::Text(text)) => text.clone(),
            (ResponseStatus::Ok, Payload::Structured(value)) => value.to_string(),
            (ResponseStatus::Ok, Payload::Empty) => String::new(),
            (ResponseStatus::NoHandler, _) if self.command_text.is_empty() => {
                "Yes?".to_string()
            }
            (ResponseStatus::NoHandler, _) => {
                format!("Sorry, I don't know how to handle \"{}\"", self.command_text)
            }
            (ResponseStatus::HandlerError, _) => {
                "Sorry, something went wrong handling that".to_string()
            }
            (ResponseStatus::Timeout, _) => "Sorry, that took too long".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle events
// ---------------------------------------------------------------------------

/// Phase reported in a [`LifecycleEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Starting,
    Ready,
    Failed,
    Stopping,
    Stopped,
    /// An utterance matched no key phrase and was dropped.
    Ignored,
    /// A service call exceeded the router timeout.
    TimedOut,
    /// Restart budget used up; the instance is permanently excluded.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub component: InstanceId,
    pub role: Role,
    pub phase: Phase,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(component: InstanceId, role: Role, phase: Phase) -> Self {
        Self {
            component,
            role,
            phase,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Everything the notifier hub fans out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Notification {
    Lifecycle(LifecycleEvent),
    /// Audit copy of a routed command (only when auditing is enabled).
    Command(Arc<Command>),
    /// Audit copy of a produced response (only when auditing is enabled).
    Response(Arc<Response>),
}

impl Notification {
    pub fn as_lifecycle(&self) -> Option<&LifecycleEvent> {
        match self {
            Self::Lifecycle(ev) => Some(ev),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(text: &str) -> Command {
        Command {
            id: CommandId(4),
            text: text.into(),
            origin: UtteranceId(9),
            source: InstanceId::new("input/stdin#0"),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn response_serializes_with_camel_case_status() {
        let response = Response::no_handler(&command("play jazz"));
        let json = serde_json::to_value(&response).expect("serialize response");
        assert_eq!(json["status"], "noHandler");
        assert_eq!(json["command"], 4);
        assert_eq!(json["commandText"], "play jazz");
        assert_eq!(json["payload"]["type"], "empty");
        assert!(json["handler"].is_null());
    }

    #[test]
    fn notification_is_tagged_by_event_kind() {
        let ev = LifecycleEvent::new(
            InstanceId::new("service/clock#0"),
            Role::Service,
            Phase::TimedOut,
        )
        .with_detail("took 5000ms");
        let json = serde_json::to_value(Notification::Lifecycle(ev)).expect("serialize");
        assert_eq!(json["event"], "lifecycle");
        assert_eq!(json["component"], "service/clock#0");
        assert_eq!(json["role"], "service");
        assert_eq!(json["phase"], "timedOut");
        assert_eq!(json["detail"], "took 5000ms");

        let audit = Notification::Command(Arc::new(command("volume up")));
        let json = serde_json::to_value(&audit).expect("serialize audit");
        assert_eq!(json["event"], "command");
        assert_eq!(json["text"], "volume up");
        assert_eq!(json["origin"], 9);
    }

    #[test]
    fn render_gives_feedback_for_every_status() {
        let cmd = command("play jazz");
        let ok = Response::ok(&cmd, InstanceId::new("service/music#0"), Payload::text("playing"));
        assert_eq!(ok.render(), "playing");
        assert!(Response::no_handler(&cmd).render().contains("play jazz"));
        assert_eq!(Response::no_handler(&command("")).render(), "Yes?");
        let err = Response::handler_error(&cmd, InstanceId::new("service/music#0"), "boom");
        assert!(!err.render().is_empty());
        assert_eq!(err.detail.as_deref(), Some("boom"));
    }

    #[test]
    fn payload_rejects_unknown_type_tag() {
        let err = serde_json::from_str::<Payload>(r#"{"type":"audio","value":"x"}"#);
        assert!(err.is_err(), "expected unknown payload type to fail");
    }
}
