//! nodeorch Orchestrator Library
//!
//! Client-side lifecycle orchestration for AI compute nodes. The orchestrator
//! discovers nodes from the backend catalog, installs prebuilt execution
//! bundles, activates and deactivates node processes, and keeps local state
//! consistent with the backend purely through server-pushed event streams and
//! polling.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator                 (composition root, owns every subscription)
//! ├── NodeRegistry             (catalog + running-status merge)
//! ├── ConcurrencyGuard         (per-node lock table)
//! ├── InstallationPipeline     (single-flight bundle install job)
//! ├── ActivationController     (per-node activation state machine)
//! ├── DownloadTracker          (platform download progress cache)
//! └── StreamRegistry           (install + per-node + download subscriptions)
//! ```
//!
//! All backend traffic goes through the [`backend::Backend`] trait;
//! [`client::HttpBackend`] speaks HTTP + SSE and [`backend::MockBackend`] is
//! a scriptable in-memory implementation for tests and demos.

pub mod activation;
pub mod backend;
pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod guard;
pub mod install;
pub mod notice;
pub mod orchestrator;
pub mod registry;
pub mod sse;
pub mod stream;

// Re-export commonly used types
pub use activation::{
    ActivationController, ActivationStatus, FailureMeta, ManualActivationForm, StopReport,
};
pub use backend::{Backend, MockBackend, MockCall, StopBehavior};
pub use client::{BundleDescriptor, HttpBackend, RegisterResponse, RunningInfo, RuntimeConfig};
pub use config::Config;
pub use download::DownloadState;
pub use error::{BackendError, OrchestratorError};
pub use guard::LockIntent;
pub use install::{InstallationJob, JobOutcome, StepStatus};
pub use notice::Notice;
pub use orchestrator::{ActivationPath, CommandOutcome, NodeView, Orchestrator};
pub use stream::EventStream;
