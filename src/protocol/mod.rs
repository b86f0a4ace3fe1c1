//! Wire protocol shared by both roles.
//!
//! Events (node -> client) and control frames (client -> node) travel over
//! long-lived HTTP bodies as newline-terminated `name: value` records.
//! Binary payloads are base64-encoded so they survive the text-oriented
//! transport; the exit code and online flag stay plain ASCII.

mod frame;
mod options;

pub use frame::{ControlFrame, EventFrame, FaultPayload, LineParser};
pub use options::{CreateWorkerRequest, ResourceLimits, SpawnOptions};
