//! Shardview reassembly client library
//!
//! Models one mesh-fragment reassembly run against a remote inference
//! backend: rigid transformation algebra, the run state machine that folds
//! the backend's pose stream into step-indexed histories, notifications,
//! scrubbing helpers and a replayable JSON export.

pub mod lib {
    pub mod backend;
    pub mod events;
    pub mod export;
    pub mod geometry;
    pub mod playback;
    pub mod settings;
    pub mod task;
    pub mod transformation;
}

pub mod app {
    pub mod cli;
}

// Re-export commonly used types from lib modules
pub use lib::backend::InferenceBackend;
pub use lib::events::{format_metrics, EventBus, EventKind, SubscriptionId, TaskEvent};
pub use lib::export::ExportRecord;
pub use lib::geometry::{Bounds, FragmentGeometry, GeometryError, MeshGeometry};
pub use lib::playback::{trail_points, PlaybackState};
pub use lib::settings::{Settings, SettingsError};
pub use lib::task::{
    AssemblyTask, ExchangeFlow, FragmentInfo, RunSignal, StepRef, TaskError, TaskStatus,
};
pub use lib::transformation::{multiply_quaternions, rotate_vector, Transformation};
