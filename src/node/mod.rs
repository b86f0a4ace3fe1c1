//! Server role: bundle cache, worker lifecycle, and the HTTP surface.
//!
//! A node owns its child processes exclusively; clients hold references
//! only through worker identifiers and the two long-lived streams.

pub mod auth;
pub mod bundles;
pub mod host;
pub mod registry;
pub mod server;
pub mod stats;

pub use bundles::{BundleRecord, BundleStore};
pub use host::{HostCommand, HostEvent, ProcessHost, SpawnedWorker, WorkerHost};
pub use registry::WorkerRegistry;
pub use server::{build_state, build_state_with_host, router, serve, AppState};
pub use stats::CpuSampler;
