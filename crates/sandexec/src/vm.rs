//! RustPython interpreter lifecycle and the per-call pipeline that runs inside it.
//!
//! [`build_interpreter`] creates an interpreter with the native stdlib, the
//! host's pure-Python stdlib on `sys.path` when one is installed, and the
//! frozen `numeric`/`tensor` modules. [`run_job`] executes one prepared
//! [`Job`] on it:
//!
//! 1. materialize the module registry,
//! 2. build the globals for the job's mode (see [`crate::policy`]),
//! 3. compile and run the source against those globals and a fresh locals dict,
//! 4. read the requested locals back and serialize them.
//!
//! Globals and locals are separate dicts, as with `exec(code, globals, locals)`:
//! a top-level function body does not see other top-level definitions.
//!
//! ## Output capture
//!
//! Restricted mode prints through the collector installed in the globals.
//! Unrestricted mode replaces `sys.stdout` with a writer object for the
//! duration of the call; [`StdoutCapture`] puts the previous stream back when
//! dropped, on every exit path.

use rustpython_vm::{
    builtins::PyDictRef,
    compiler::Mode,
    function::{ArgMapping, FuncArgs},
    scope::Scope,
    Interpreter, PyObjectRef, PyResult, VirtualMachine,
};
use serde_json::{Map, Value};

use crate::fault::SandboxFault;
use crate::frozen::add_frozen_modules;
use crate::output::OutputBuffer;
use crate::policy::{restricted_globals, unrestricted_globals};
use crate::registry::ModuleRegistry;
use crate::serialize::serialize;
use crate::translate::{compile_fault, translate_exception};
use crate::types::{ExecutionMode, ExecutionResponse, ResponseKeys};

/// Interpreter wrapper. Not `Send`: it lives and dies on one thread.
pub(crate) struct PyInterp {
    inner: Interpreter,
}

impl PyInterp {
    /// Runs `f` with the interpreter's VM entered.
    pub(crate) fn with_vm<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&VirtualMachine) -> R,
    {
        self.inner.enter(f)
    }
}

/// One execution, fully prepared on the calling thread. Everything in here is `Send`.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    /// Source ready to compile: cleaned, and rewritten in restricted mode.
    pub source: String,
    pub mode: ExecutionMode,
    pub response_keys: ResponseKeys,
    pub max_output_bytes: usize,
}

/// Stack size for every thread that runs an interpreter.
///
/// Debug builds spend far more native stack per Python frame than release
/// builds; at the 2 MiB default a call chain well under the recursion limit
/// overflows the thread before `RecursionError` can be raised.
pub(crate) const VM_THREAD_STACK_SIZE: usize = 256 * 1024 * 1024;

/// Host directories that may hold the pure-Python standard library.
///
/// `freeze-stdlib` only freezes the VM's own core modules. Modules such as
/// `json`, `random` or `statistics` are loaded from the first of these that
/// exists; the native modules from `rustpython_stdlib` shadow any extension
/// files found there.
const STDLIB_CANDIDATES: &[&str] = &[
    "/usr/local/lib/python3.13",
    "/usr/local/lib/python3.12",
    "/usr/local/lib/python3.11",
    "/usr/local/lib/python3.10",
    "/usr/lib/python3.13",
    "/usr/lib/python3.12",
    "/usr/lib/python3.11",
    "/usr/lib/python3.10",
    "/usr/lib/python3",
];

pub(crate) fn python_stdlib_paths() -> Vec<String> {
    STDLIB_CANDIDATES
        .iter()
        .filter(|path| std::path::Path::new(path).is_dir())
        .map(|path| path.to_string())
        .collect()
}

/// Creates an interpreter with the native stdlib, the host stdlib path and the
/// frozen modules.
pub(crate) fn build_interpreter() -> PyInterp {
    let mut settings = rustpython_vm::Settings::default();
    settings.path_list.extend(python_stdlib_paths());
    let inner = Interpreter::with_init(settings, |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
        add_frozen_modules(vm);
    });
    PyInterp { inner }
}

/// Executes `job` and builds the response.
pub(crate) fn run_job(
    interp: &PyInterp,
    registry: &ModuleRegistry,
    job: &Job,
) -> Result<ExecutionResponse, SandboxFault> {
    interp.with_vm(|vm| {
        let bindings = registry.resolve(vm)?;
        let output = OutputBuffer::new(job.max_output_bytes);

        let globals = match job.mode {
            ExecutionMode::Restricted => restricted_globals(vm, bindings, &output),
            ExecutionMode::Unrestricted => unrestricted_globals(vm, bindings),
        }
        .map_err(|exc| translate_exception(vm, &exc))?;
        let locals = vm.ctx.new_dict();
        let scope = Scope::with_builtins(
            Some(ArgMapping::from_dict_exact(locals.clone())),
            globals,
            vm,
        );

        let code = vm
            .compile(&job.source, Mode::Exec, "<inline>".to_owned())
            .map_err(|err| compile_fault(&err))?;

        let outcome = match job.mode {
            ExecutionMode::Restricted => vm.run_code_obj(code, scope),
            ExecutionMode::Unrestricted => StdoutCapture::install(vm, &output)
                .and_then(|_capture| vm.run_code_obj(code, scope)),
        };
        outcome.map_err(|exc| translate_exception(vm, &exc))?;

        let data = select_response(vm, &locals, &job.response_keys)?;
        Ok(ExecutionResponse {
            stdout: output.normalized(),
            data,
        })
    })
}

/// Reads the requested locals and serializes them.
///
/// A single key yields its value; several keys yield an object keyed by name.
/// A key the code never assigned serializes as `null`.
fn select_response(
    vm: &VirtualMachine,
    locals: &PyDictRef,
    keys: &ResponseKeys,
) -> Result<Option<Value>, SandboxFault> {
    if keys.is_empty() {
        return Ok(None);
    }
    let lookup = |key: &str| -> Result<Value, SandboxFault> {
        match locals.get_item_opt(key, vm) {
            Ok(Some(value)) => serialize(vm, &value),
            Ok(None) => Ok(Value::Null),
            Err(exc) => Err(translate_exception(vm, &exc)),
        }
    };
    match keys {
        ResponseKeys::Single(key) => lookup(key).map(Some),
        ResponseKeys::Many(keys) => {
            let mut object = Map::with_capacity(keys.len());
            for key in keys {
                object.insert(key.clone(), lookup(key)?);
            }
            Ok(Some(Value::Object(object)))
        }
    }
}

// ── Unrestricted stdout capture ───────────────────────────────────────────────

/// Swaps `sys.stdout` for a writer into an [`OutputBuffer`] until dropped.
pub(crate) struct StdoutCapture<'vm> {
    vm: &'vm VirtualMachine,
    previous: PyObjectRef,
}

impl<'vm> StdoutCapture<'vm> {
    pub(crate) fn install(vm: &'vm VirtualMachine, output: &OutputBuffer) -> PyResult<Self> {
        let previous = vm
            .sys_module
            .get_attr("stdout", vm)
            .unwrap_or_else(|_| vm.ctx.none());
        let writer = build_writer_object(vm, output.clone());
        vm.sys_module.set_attr("stdout", writer, vm)?;
        Ok(Self { vm, previous })
    }
}

impl Drop for StdoutCapture<'_> {
    fn drop(&mut self) {
        let _ = self
            .vm
            .sys_module
            .set_attr("stdout", self.previous.clone(), self.vm);
    }
}

/// A namespace object with `write(s)` and `flush()` backed by `output`.
fn build_writer_object(vm: &VirtualMachine, output: OutputBuffer) -> PyObjectRef {
    let write_fn = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let data = match args.args.first() {
                Some(obj) => obj.str(vm)?.as_str().to_owned(),
                None => String::new(),
            };
            output.write_str(&data).map_err(|err| {
                vm.new_exception_msg(vm.ctx.exceptions.runtime_error.to_owned(), err.to_string())
            })?;
            Ok(vm.ctx.new_int(data.chars().count()).into())
        },
    );
    let flush_fn = vm.new_function(
        "flush",
        |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> { Ok(vm.ctx.none()) },
    );

    let ns = vm.new_module("<writer>", vm.ctx.new_dict(), None);
    let _ = ns.set_attr("write", write_fn, vm);
    let _ = ns.set_attr("flush", flush_fn, vm);
    let _ = ns.set_attr("closed", vm.ctx.new_bool(false), vm);
    let _ = ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
    ns.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultKind;
    use crate::restrict::compile_restricted;
    use rustpython_vm::AsObject;
    use serde_json::json;

    fn job(source: &str, mode: ExecutionMode, keys: ResponseKeys) -> Job {
        let source = match mode {
            ExecutionMode::Restricted => compile_restricted(source).expect("rewrite"),
            ExecutionMode::Unrestricted => source.to_owned(),
        };
        Job {
            source,
            mode,
            response_keys: keys,
            max_output_bytes: 1_048_576,
        }
    }

    fn run(source: &str, mode: ExecutionMode, keys: ResponseKeys) -> Result<ExecutionResponse, SandboxFault> {
        let interp = build_interpreter();
        run_job(&interp, &ModuleRegistry::default(), &job(source, mode, keys))
    }

    // (1) default key read back from locals
    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_response_key_is_serialized() {
        let response = run("response = 2 + 2", ExecutionMode::Restricted, ResponseKeys::default())
            .expect("run");
        assert_eq!(response.data, Some(json!(4)));
        assert_eq!(response.stdout, None);
    }

    // (2) restricted print is collected and normalized
    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_restricted_print_is_captured() {
        let response = run(
            "print('hi')\nb = 5",
            ExecutionMode::Restricted,
            ResponseKeys::Single("b".into()),
        )
        .expect("run");
        assert_eq!(response.stdout.as_deref(), Some("hi"));
        assert_eq!(response.data, Some(json!(5)));
    }

    // (3) unrestricted stdout capture is restored afterwards
    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_unrestricted_stdout_capture_is_restored() {
        let interp = build_interpreter();
        let stdout_id = |interp: &PyInterp| {
            interp.with_vm(|vm| {
                vm.sys_module
                    .get_attr("stdout", vm)
                    .map(|stdout| stdout.get_id())
                    .ok()
            })
        };
        let before = stdout_id(&interp);

        let response = run_job(
            &interp,
            &ModuleRegistry::default(),
            &job("print('a')\nprint('b')", ExecutionMode::Unrestricted, ResponseKeys::Many(vec![])),
        )
        .expect("run");
        assert_eq!(response.stdout.as_deref(), Some("a\nb"));
        assert_eq!(response.data, None);
        assert_eq!(stdout_id(&interp), before);
    }

    // (4) several keys, one missing
    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_many_keys_with_missing_name() {
        let response = run(
            "a = [1, 2]",
            ExecutionMode::Restricted,
            ResponseKeys::Many(vec!["a".into(), "missing".into()]),
        )
        .expect("run");
        assert_eq!(response.data, Some(json!({"a": [1, 2], "missing": null})));
    }

    // (5) runtime failures are translated
    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_runtime_error_is_translated() {
        let fault = run("x = {}\ny = x['k']", ExecutionMode::Restricted, ResponseKeys::default())
            .unwrap_err();
        assert_eq!(fault.kind, FaultKind::KeyError);
        assert_eq!(fault.line_number, Some(2));
    }

    // (6) functions see globals but not other top-level locals
    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_registry_bindings_visible_in_functions() {
        let response = run(
            "def area(r):\n    return math.pi * r * r\nresponse = round(area(1), 2)",
            ExecutionMode::Restricted,
            ResponseKeys::default(),
        )
        .expect("run");
        assert_eq!(response.data, Some(json!(3.14)));
    }

    // (7) output limit surfaces as a fault
    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_output_limit() {
        let interp = build_interpreter();
        let mut job = job("print('x' * 100)", ExecutionMode::Restricted, ResponseKeys::default());
        job.max_output_bytes = 10;
        let fault = run_job(&interp, &ModuleRegistry::default(), &job).unwrap_err();
        assert_eq!(fault.kind, FaultKind::Other("RuntimeError".into()));
        assert!(fault.detail.contains("Output limit exceeded"), "{}", fault.detail);
    }

    // (8) a failing unrestricted call still restores sys.stdout
    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_stdout_restored_after_exception() {
        let interp = build_interpreter();
        let stdout = |interp: &PyInterp| {
            interp.with_vm(|vm| vm.sys_module.get_attr("stdout", vm).expect("stdout"))
        };
        let before = stdout(&interp);

        let fault = run_job(
            &interp,
            &ModuleRegistry::default(),
            &job("print('a')\n1/0", ExecutionMode::Unrestricted, ResponseKeys::default()),
        )
        .unwrap_err();
        assert_eq!(fault.kind, FaultKind::Other("ZeroDivisionError".into()));
        assert_eq!(fault.line_number, Some(2));
        assert!(stdout(&interp).is(&before));
    }

    // (9) rebinding a registry name only shadows it for that call
    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_registry_bindings_survive_a_call() {
        let interp = build_interpreter();
        let registry = ModuleRegistry::default();
        run_job(
            &interp,
            &registry,
            &job("np = None\nmath = 0\nresponse = np", ExecutionMode::Restricted, ResponseKeys::default()),
        )
        .expect("shadowing call");
        let response = run_job(
            &interp,
            &registry,
            &job(
                "response = [np.zeros(1).tolist(), math.floor(1.5)]",
                ExecutionMode::Restricted,
                ResponseKeys::default(),
            ),
        )
        .expect("next call");
        assert_eq!(response.data, Some(json!([[0.0], 1])));
    }

    // (10) the host's pure-Python stdlib is importable when installed
    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_host_stdlib_is_on_path() {
        if python_stdlib_paths().is_empty() {
            return;
        }
        let registry = ModuleRegistry::parse("import colorsys").expect("parse");
        let response = run_job(
            &build_interpreter(),
            &registry,
            &job(
                "response = [round(x, 2) for x in colorsys.rgb_to_hsv(1, 0.5, 0)]",
                ExecutionMode::Restricted,
                ResponseKeys::default(),
            ),
        )
        .expect("run");
        assert_eq!(response.data, Some(json!([0.08, 1.0, 1])));
    }
}
