//! # vox-core
//!
//! Reusable command-dispatch core for voice assistants.
//!
//! ## Architecture
//!
//! ```text
//! InputPlugin ──► UtteranceSink ──► [utterances] ──► PhraseMatcher (thread)
//!                                                        │
//!                                                    [commands]
//!                                                        │
//!                                              ServiceRouter (thread) ──► ServicePlugin::handle
//!                                                        │                (worker thread + timeout)
//!                                                   [responses]
//!                                                        │
//!                                              OutputFanout (thread) ──► every OutputPlugin
//!
//! Supervisor (thread) ──► LifecycleEvent ──► NotifierHub ──► NotifierPlugin lanes
//!                                                     └──► broadcast observers
//! ```
//!
//! Queues are bounded with an explicit overflow policy. Plugin panics are
//! caught at every boundary and turned into typed outcomes.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod bus;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod events;
pub mod fanout;
pub mod guard;
pub mod notify;
pub mod phrase;
pub mod plugin;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod text;

// Convenience re-exports for downstream crates
pub use bus::{OverflowPolicy, QueueConfig, UtteranceSink};
pub use config::Manifest;
pub use diagnostics::DiagnosticsSnapshot;
pub use engine::{DispatchEngine, EngineConfig, EngineStatus};
pub use error::{Result, VoxError};
pub use events::{
    Command, LifecycleEvent, Notification, Payload, Phase, RawUtterance, Response, ResponseStatus,
};
pub use plugin::{
    CancelToken, InputPlugin, InstanceId, NotifierPlugin, OutputPlugin, Params, PluginDescriptor,
    PluginFactory, PluginHandle, Role, ServicePlugin,
};
pub use registry::{PluginRegistry, PluginState};
pub use supervisor::{FaultReporter, RestartPolicy};
