// sandexec: sandboxed Python snippet execution on the RustPython VM, with
// tensor-aware JSON results.

/// Version of this crate, reported by the server's `GET /`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cache;
pub mod executor;
pub mod fault;
pub(crate) mod frozen;
pub mod output;
pub(crate) mod policy;
pub mod pool;
pub mod preprocess;
pub mod registry;
pub mod restrict;
pub(crate) mod serialize;
pub mod timeout;
pub(crate) mod translate;
pub mod types;
pub(crate) mod vm;

pub use cache::RewriteCache;
pub use executor::Executor;
pub use fault::{FaultKind, FaultPayload, SandboxFault, FAULT_STATUS};
pub use frozen::{NUMERIC_VERSION, TENSOR_VERSION};
pub use output::{normalize_output, OutputBuffer};
pub use pool::InterpreterPool;
pub use preprocess::clean_code;
pub use registry::{ModuleRegistry, ModuleSpec};
pub use restrict::{check_syntax, compile_restricted};
pub use types::{
    parse_flag, ExecutionMode, ExecutionRequest, ExecutionResponse, ExecutionSettings,
    ResponseKeys, DEFAULT_MODULES, DEFAULT_RESPONSE_KEY,
};
