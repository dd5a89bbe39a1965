//! Public request, response, and settings types for the sandexec library.
//!
//! - [`ExecutionRequest`]: the source snippet plus the names to read back
//! - [`ResponseKeys`]: one name or an ordered list of names
//! - [`ExecutionResponse`]: captured output and serialized result data
//! - [`ExecutionSettings`]: mode, wall-clock limit, output limit, pool sizing
//! - [`DEFAULT_MODULES`]: the baseline module configuration

use serde::{Deserialize, Deserializer, Serialize};

/// Module configuration used when `SERVER_MODULES` is not set.
pub const DEFAULT_MODULES: &str = "import tensor; import numeric as np; import math";

/// Local variable read back when a request names no keys.
pub const DEFAULT_RESPONSE_KEY: &str = "response";

/// Selects which local variables end up in the response `data` field.
///
/// A single name yields the serialized value itself; a list yields an object
/// keyed by name. An empty name or an empty list suppresses `data` entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResponseKeys {
    Single(String),
    Many(Vec<String>),
}

impl Default for ResponseKeys {
    fn default() -> Self {
        ResponseKeys::Single(DEFAULT_RESPONSE_KEY.to_string())
    }
}

impl ResponseKeys {
    /// Returns `true` when no `data` field should be produced.
    pub fn is_empty(&self) -> bool {
        match self {
            ResponseKeys::Single(key) => key.is_empty(),
            ResponseKeys::Many(keys) => keys.is_empty(),
        }
    }

    /// Parses the query-string form: a comma-separated list becomes
    /// [`ResponseKeys::Many`], anything else a single name.
    pub fn from_query(raw: &str) -> Self {
        if raw.contains(',') {
            ResponseKeys::Many(
                raw.split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_string)
                    .collect(),
            )
        } else {
            ResponseKeys::Single(raw.trim().to_string())
        }
    }
}

impl<'de> Deserialize<'de> for ResponseKeys {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Single(String),
            Many(Vec<String>),
        }

        // `null` behaves like an empty selection: no data field.
        Ok(match Option::<Raw>::deserialize(deserializer)? {
            Some(Raw::Single(key)) => ResponseKeys::Single(key),
            Some(Raw::Many(keys)) => ResponseKeys::Many(keys),
            None => ResponseKeys::Many(Vec::new()),
        })
    }
}

/// One snippet to execute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Source text. Empty source is a no-op.
    #[serde(default)]
    pub source: String,

    /// Names of the locals to return. Older clients send `return`.
    #[serde(
        rename = "responseKeys",
        alias = "response_keys",
        alias = "return",
        default
    )]
    pub response_keys: ResponseKeys,
}

impl ExecutionRequest {
    pub fn new(source: impl Into<String>, response_keys: ResponseKeys) -> Self {
        Self {
            source: source.into(),
            response_keys,
        }
    }
}

/// Result of a successful execution. Absent fields are omitted from JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Whether submitted code runs under the sandbox policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Guarded namespace plus the restricted compiler pass.
    #[default]
    Restricted,
    /// Direct execution; only import neutralization applies.
    Unrestricted,
}

/// Configuration shared by every call an [`Executor`](crate::Executor) makes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    pub mode: ExecutionMode,

    /// Wall-clock limit in nanoseconds. Default: 30 s.
    pub timeout_ns: u64,

    /// Maximum bytes of captured output per call. Default: 1 MiB.
    pub max_output_bytes: usize,

    /// Number of pre-warmed interpreters. `0` builds a fresh interpreter per call.
    pub pool_size: usize,

    /// Entries kept in the restricted-rewrite cache.
    pub rewrite_cache_size: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Restricted,
            timeout_ns: 30_000_000_000,
            max_output_bytes: 1_048_576,
            pool_size: 2,
            rewrite_cache_size: 256,
        }
    }
}

/// Interprets an environment-style boolean: `yes`, `true`, `t`, `1`
/// (case-insensitive) are true, everything else is false.
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "true" | "t" | "1"
    )
}
