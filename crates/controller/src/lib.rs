//! ResourceSet controller: reconcile ResourceSets into cluster state.

#![forbid(unsafe_code)]

mod apply;
mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
mod gate;
mod metrics;
pub mod reconciler;
mod state;

pub use apply::{ApplyFailure, ApplyReport, REASON_APPLY_SUCCEEDED, REASON_PRUNE_FAILED};
pub use backoff::Backoff;
pub use config::ReconcilerConfig;
pub use controller::{references_provider, run};
pub use error::ReconcileError;
pub use events::{EventSink, KubeEventSink, RecordedEvent, RecordingEventSink};
pub use gate::check_dependencies;
pub use reconciler::{Reconciler, MAX_REQUEUE_INTERVAL};
