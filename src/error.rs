use thiserror::Error;

use crate::protocol::FaultPayload;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("No node available for placement")]
    NoNodeAvailable,

    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("Bundle rejected by node: {0}")]
    BundleRejected(String),

    #[error("Worker event stream disconnected before exit")]
    WorkerDisconnected,

    #[error("Worker faulted: {}: {}", .0.name, .0.message)]
    WorkerFault(FaultPayload),

    #[error("Worker exited with code {0}")]
    WorkerExited(i32),

    #[error("Worker has already exited")]
    WorkerAfterExit,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;
