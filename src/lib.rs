pub mod client;
pub mod config;
pub mod error;
pub mod hash;
pub mod node;
pub mod protocol;
pub mod shutdown;

pub use client::{PlacementPolicy, WorkerEvent, WorkerHandle, WorkerPool};
pub use config::{Credentials, NodeConfig};
pub use error::{FleetError, Result};
pub use protocol::SpawnOptions;
