//! Top-level orchestration of one execution.
//!
//! [`Executor::execute`] runs every request through the same stages:
//! 1. Empty source short-circuits to an empty response.
//! 2. [`clean_code`] neutralizes import statements.
//! 3. Restricted mode rewrites the source with [`compile_restricted`] through
//!    the [`RewriteCache`]; unrestricted mode only checks the syntax.
//! 4. The prepared [`Job`] goes to an idle [`InterpreterPool`] slot, or to a
//!    fresh interpreter on its own thread when the pool is disabled or busy.
//! 5. The caller waits at most `timeout_ns` for the result.
//!
//! An `Executor` is `Sync`: the HTTP server shares one across all requests.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::RewriteCache;
use crate::fault::SandboxFault;
use crate::policy::warn_unrestricted;
use crate::pool::{InterpreterPool, JobResult, WorkItem};
use crate::preprocess::clean_code;
use crate::registry::ModuleRegistry;
use crate::restrict::{check_syntax, compile_restricted};
use crate::timeout::{run_with_timeout, WaitError};
use crate::types::{ExecutionMode, ExecutionRequest, ExecutionResponse, ExecutionSettings};
use crate::vm::{build_interpreter, run_job, Job};

/// How long a call waits for an idle pool slot before using a fresh interpreter.
const POOL_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(2);

/// Executes requests against one module registry with fixed settings.
pub struct Executor {
    registry: Arc<ModuleRegistry>,
    settings: ExecutionSettings,
    cache: RewriteCache,
    pool: Option<InterpreterPool>,
}

impl Executor {
    /// Creates an executor and, when `settings.pool_size > 0`, starts and
    /// warms its interpreter pool.
    pub fn new(registry: ModuleRegistry, settings: ExecutionSettings) -> Result<Self, SandboxFault> {
        if settings.mode == ExecutionMode::Unrestricted {
            warn_unrestricted();
        }
        let registry = Arc::new(registry);
        let pool = match settings.pool_size {
            0 => None,
            size => Some(InterpreterPool::new(size, Arc::clone(&registry))?),
        };
        Ok(Self {
            cache: RewriteCache::new(settings.rewrite_cache_size),
            registry,
            settings,
            pool,
        })
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Resolves every configured module once in a throwaway interpreter.
    pub fn verify_modules(&self) -> Result<(), SandboxFault> {
        let interp = build_interpreter();
        interp.with_vm(|vm| self.registry.resolve(vm).map(drop))?;
        tracing::debug!(aliases = ?self.registry.aliases(), "module registry verified");
        Ok(())
    }

    /// Runs `request.source` and returns the captured output and requested locals.
    pub fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResponse, SandboxFault> {
        if request.source.is_empty() {
            return Ok(ExecutionResponse::default());
        }
        let start = Instant::now();

        let cleaned = clean_code(&request.source);
        let source = match self.settings.mode {
            ExecutionMode::Restricted => self.cache.get_or_rewrite(&cleaned, compile_restricted)?,
            ExecutionMode::Unrestricted => {
                check_syntax(&cleaned)?;
                cleaned
            }
        };
        let job = Job {
            source,
            mode: self.settings.mode,
            response_keys: request.response_keys.clone(),
            max_output_bytes: self.settings.max_output_bytes,
        };

        let result = self.run(job);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::debug!(elapsed_ms, "execution finished"),
            Err(fault) => tracing::debug!(elapsed_ms, error = %fault, "execution failed"),
        }
        result
    }

    fn run(&self, job: Job) -> JobResult {
        let timeout = Duration::from_nanos(self.settings.timeout_ns);

        let job = match &self.pool {
            Some(pool) => {
                let (response, rx) = mpsc::sync_channel(1);
                match pool.dispatch_work(WorkItem { job, response }, POOL_CHECKOUT_TIMEOUT.min(timeout)) {
                    Ok(()) => {
                        return match rx.recv_timeout(timeout) {
                            Ok(result) => result,
                            Err(RecvTimeoutError::Timeout) => Err(timeout_fault(timeout)),
                            Err(RecvTimeoutError::Disconnected) => Err(SandboxFault::other(
                                "RuntimeError",
                                WaitError::Panicked.to_string(),
                            )),
                        };
                    }
                    Err(item) => {
                        tracing::debug!("no idle pool slot, using a fresh interpreter");
                        item.job
                    }
                }
            }
            None => job,
        };

        let registry = Arc::clone(&self.registry);
        run_with_timeout(
            move || run_job(&build_interpreter(), &registry, &job),
            self.settings.timeout_ns,
        )
        .unwrap_or_else(|err| match err {
            WaitError::TimedOut(limit) => Err(timeout_fault(limit)),
            other => Err(SandboxFault::other("RuntimeError", other.to_string())),
        })
    }
}

fn timeout_fault(limit: Duration) -> SandboxFault {
    SandboxFault::other(
        "TimeoutError",
        format!("execution timed out after {} ms", limit.as_millis()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultKind;
    use crate::types::ResponseKeys;
    use serde_json::json;

    /// Pool disabled: nothing starts an interpreter until a job actually runs.
    fn executor(mode: ExecutionMode) -> Executor {
        let settings = ExecutionSettings {
            mode,
            pool_size: 0,
            ..ExecutionSettings::default()
        };
        Executor::new(ModuleRegistry::default(), settings).expect("executor")
    }

    fn request(source: &str) -> ExecutionRequest {
        ExecutionRequest::new(source, ResponseKeys::default())
    }

    // ── No VM needed ─────────────────────────────────────────────────────────

    #[test]
    fn test_empty_source_is_a_noop() {
        let response = executor(ExecutionMode::Restricted)
            .execute(&request(""))
            .expect("execute");
        assert_eq!(response, ExecutionResponse::default());
    }

    #[test]
    fn test_restricted_rejection_happens_before_execution() {
        let fault = executor(ExecutionMode::Restricted)
            .execute(&request("x = 1\n_secret = 2"))
            .unwrap_err();
        assert_eq!(fault.kind, FaultKind::SyntaxError);
        assert_eq!(fault.line_number, Some(2));
    }

    #[test]
    fn test_unrestricted_syntax_error() {
        let fault = executor(ExecutionMode::Unrestricted)
            .execute(&request("x = (1,"))
            .unwrap_err();
        assert_eq!(fault.kind, FaultKind::SyntaxError);
    }

    #[test]
    fn test_rejected_rewrites_are_not_cached() {
        let executor = executor(ExecutionMode::Restricted);
        let _ = executor.execute(&request("x = 1\n_bad = 2"));
        assert!(executor.cache.is_empty());
    }

    #[test]
    fn test_timeout_fault_message() {
        let fault = timeout_fault(Duration::from_millis(1500));
        assert_eq!(fault.kind, FaultKind::Other("TimeoutError".into()));
        assert_eq!(fault.message(), "TimeoutError: execution timed out after 1500 ms");
    }

    // ── Full pipeline ────────────────────────────────────────────────────────

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_execute_restricted() {
        let executor = executor(ExecutionMode::Restricted);
        let response = executor
            .execute(&request("import os\nresponse = np.array([1, 2, 3]).mean()"))
            .expect("execute");
        assert_eq!(response.data, Some(json!(2.0)));
        assert_eq!(executor.cache.len(), 1);
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_execute_on_pool() {
        let settings = ExecutionSettings {
            pool_size: 1,
            ..ExecutionSettings::default()
        };
        let executor = Executor::new(ModuleRegistry::default(), settings).expect("executor");
        for n in 0..3 {
            let response = executor
                .execute(&request(&format!("response = {n} * 2")))
                .expect("execute");
            assert_eq!(response.data, Some(json!(n * 2)));
        }
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_timeout() {
        let settings = ExecutionSettings {
            pool_size: 0,
            timeout_ns: 200_000_000,
            ..ExecutionSettings::default()
        };
        let executor = Executor::new(ModuleRegistry::default(), settings).expect("executor");
        let fault = executor.execute(&request("while True:\n    pass")).unwrap_err();
        assert_eq!(fault.kind, FaultKind::Other("TimeoutError".into()));
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_verify_modules_reports_missing_module() {
        let registry = ModuleRegistry::parse("import no_such_module").expect("parse");
        let settings = ExecutionSettings {
            pool_size: 0,
            ..ExecutionSettings::default()
        };
        let executor = Executor::new(registry, settings).expect("executor");
        let fault = executor.verify_modules().unwrap_err();
        assert_eq!(fault.kind, FaultKind::ModuleConfig);
    }
}
