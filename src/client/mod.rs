//! Caller role: node registration, placement, bundle upload, and worker
//! handles with stream demultiplexing and control-stream reconnection.

pub mod bundler;
pub mod handle;
pub mod node_client;
pub mod placement;
pub mod pool;

pub use bundler::{Bundler, FileBundler};
pub use handle::{WorkerEvent, WorkerHandle};
pub use node_client::{LoadSample, NodeClient, NodeIdentity};
pub use placement::PlacementPolicy;
pub use pool::WorkerPool;
