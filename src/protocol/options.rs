use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Spawn options forwarded opaquely to the child host (`extraData` on the
/// wire). Unknown keys are preserved verbatim for forward compatibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SpawnOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub argv: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec_argv: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_list: Option<serde_json::Value>,
    /// Whether the worker's standard input is writable from the handle.
    pub stdin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
    /// Merge the caller's current environment into `env` before spawning.
    /// Opt-in so credentials are not leaked to remote nodes by accident.
    #[serde(skip)]
    pub inherit_env: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_old_generation_size_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_young_generation_size_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_range_size_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_size_mb: Option<u64>,
}

/// Body of `POST /worker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkerRequest {
    pub bundle_hash: String,
    #[serde(default)]
    pub extra_data: SpawnOptions,
    #[serde(default)]
    pub exit_on_request_end: bool,
}
