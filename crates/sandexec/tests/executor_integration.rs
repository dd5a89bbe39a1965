//! End-to-end tests of `Executor::execute`: preprocessing, restricted rewrite,
//! guarded namespace, interpreter, serialization and fault translation wired
//! together the way the server uses them.

use std::sync::OnceLock;

use sandexec::{
    ExecutionMode, ExecutionRequest, ExecutionResponse, ExecutionSettings, Executor, FaultKind,
    ModuleRegistry, ResponseKeys, SandboxFault,
};
use serde_json::{json, Value};

/// One pooled executor shared by every test in this binary.
fn executor() -> &'static Executor {
    static EXECUTOR: OnceLock<Executor> = OnceLock::new();
    EXECUTOR.get_or_init(|| {
        Executor::new(ModuleRegistry::default(), ExecutionSettings::default()).expect("executor")
    })
}

fn unrestricted() -> &'static Executor {
    static EXECUTOR: OnceLock<Executor> = OnceLock::new();
    EXECUTOR.get_or_init(|| {
        let settings = ExecutionSettings {
            mode: ExecutionMode::Unrestricted,
            pool_size: 0,
            ..ExecutionSettings::default()
        };
        Executor::new(ModuleRegistry::default(), settings).expect("executor")
    })
}

fn run(source: &str, keys: ResponseKeys) -> Result<ExecutionResponse, SandboxFault> {
    executor().execute(&ExecutionRequest::new(source, keys))
}

fn key(name: &str) -> ResponseKeys {
    ResponseKeys::Single(name.to_string())
}

fn keys(names: &[&str]) -> ResponseKeys {
    ResponseKeys::Many(names.iter().map(|n| n.to_string()).collect())
}

// ── Concrete scenarios ───────────────────────────────────────────────────────

#[test]
fn test_literal_assignment() {
    let response = run("x = 1", key("x")).expect("execute");
    assert_eq!(response.data, Some(json!(1)));
    assert_eq!(response.stdout, None);
}

#[test]
fn test_scenario_arithmetic() {
    let response = run("a = 2 + 2", key("a")).expect("execute");
    assert_eq!(serde_json::to_value(&response).expect("json"), json!({"data": 4}));
}

#[test]
fn test_scenario_print_and_value() {
    let response = run("print('hi')\nb = 5", key("b")).expect("execute");
    assert_eq!(
        serde_json::to_value(&response).expect("json"),
        json!({"stdout": "hi", "data": 5})
    );
}

#[test]
fn test_scenario_import_is_neutralized() {
    let fault = run("import os\nos.system('ls')", ResponseKeys::default()).unwrap_err();
    assert_eq!(fault.kind, FaultKind::Other("NameError".into()));
    assert_eq!(fault.line_number, Some(2));
    assert_eq!(fault.status_code, 400);
    assert!(fault.message().starts_with("NameError at line 2:"), "{}", fault.message());
}

#[test]
fn test_scenario_empty_source() {
    let response = run("", ResponseKeys::default()).expect("execute");
    assert_eq!(serde_json::to_value(&response).expect("json"), json!({}));
}

#[test]
fn test_scenario_many_keys_with_missing_name() {
    let response = run("a = 'x'\nb = [1, 2.5]", keys(&["a", "b", "c"])).expect("execute");
    assert_eq!(response.data, Some(json!({"a": "x", "b": [1, 2.5], "c": null})));
}

// ── Properties ───────────────────────────────────────────────────────────────

#[test]
fn test_tensor_serialization_is_idempotent() {
    let response = run(
        "t = tensor.tensor([[1, 2], [3, 4]])\nplain = t.tolist()\narr = np.array(plain)",
        keys(&["t", "plain", "arr"]),
    )
    .expect("execute");
    let data = response.data.expect("data");
    assert_eq!(data["t"], json!([[1, 2], [3, 4]]));
    assert_eq!(data["t"], data["plain"]);
    assert_eq!(data["t"], data["arr"]);
}

#[test]
fn test_dunder_attribute_read_fails() {
    let fault = run("response = (1).__class__", ResponseKeys::default()).unwrap_err();
    assert_eq!(fault.kind, FaultKind::Other("AttributeError".into()));
    assert_eq!(fault.line_number, Some(1));
}

#[test]
fn test_private_name_is_a_syntax_fault() {
    let fault = run("ok = 1\n__secret__ = 2", ResponseKeys::default()).unwrap_err();
    assert_eq!(fault.kind, FaultKind::SyntaxError);
    assert_eq!(fault.line_number, Some(2));
}

#[test]
fn test_same_source_twice_is_identical() {
    let source = "values = [i * i for i in range(5)]\nprint(sum(values))\nresponse = values";
    let first = run(source, ResponseKeys::default()).expect("first");
    let second = run(source, ResponseKeys::default()).expect("second");
    assert_eq!(first, second);
    assert_eq!(first.stdout.as_deref(), Some("30"));
}

#[test]
fn test_no_state_leaks_between_calls() {
    run("leaked = 1", key("leaked")).expect("first");
    let fault = run("response = leaked", ResponseKeys::default()).unwrap_err();
    assert_eq!(fault.kind, FaultKind::Other("NameError".into()));
}

// ── Sandbox policy ───────────────────────────────────────────────────────────

#[test]
fn test_denied_builtin_raises_name_error() {
    let fault = run("response = open('/etc/passwd').read()", ResponseKeys::default()).unwrap_err();
    assert_eq!(fault.kind, FaultKind::Other("NameError".into()));
    assert!(fault.detail.contains("'open'"), "{}", fault.detail);
}

#[test]
fn test_registry_aliases_are_bound() {
    let response = run(
        "response = [round(math.sqrt(16)), np.zeros(2).tolist(), tensor.ones(1).numel()]",
        ResponseKeys::default(),
    )
    .expect("execute");
    assert_eq!(response.data, Some(json!([4, [0.0, 0.0], 1])));
}

#[test]
fn test_guarded_item_write_on_user_containers() {
    let response = run(
        "d = {}\nd['k'] = [1]\nd['k'].append(2)\nfirst, *rest = d['k']",
        keys(&["d", "first", "rest"]),
    )
    .expect("execute");
    assert_eq!(
        response.data,
        Some(json!({"d": {"k": [1, 2]}, "first": 1, "rest": [2]}))
    );
}

#[test]
fn test_unpacking_shape_mismatch() {
    let fault = run("a, b = [1, 2, 3]", ResponseKeys::default()).unwrap_err();
    assert_eq!(fault.kind, FaultKind::ValueError);
}

#[test]
fn test_key_error_line_number() {
    let fault = run("d = {'a': 1}\n\nx = d['b']", ResponseKeys::default()).unwrap_err();
    assert_eq!(fault.kind, FaultKind::KeyError);
    assert_eq!(fault.message(), "KeyError at line 3: b");
}

#[test]
fn test_unsupported_result_type() {
    let fault = run("response = {1, 2}", ResponseKeys::default()).unwrap_err();
    assert_eq!(fault.kind, FaultKind::TypeError);
    assert!(fault.detail.contains("set"), "{}", fault.detail);
}

#[test]
fn test_separator_inside_string_keeps_data() {
    let response = run("s = 'a; import b'; t = 1", keys(&["s", "t"])).expect("execute");
    assert_eq!(response.data, Some(json!({"s": "a; import b", "t": 1})));
}

#[test]
fn test_deep_recursion_is_a_recursion_error() {
    let fault = run(
        "def f(g, n):\n    return g(g, n + 1)\nf(f, 0)",
        ResponseKeys::default(),
    )
    .unwrap_err();
    assert_eq!(fault.kind, FaultKind::Other("RecursionError".into()));
}

// ── Unrestricted mode ────────────────────────────────────────────────────────

#[test]
fn test_unrestricted_allows_dunder_access_and_captures_stdout() {
    let response = unrestricted()
        .execute(&ExecutionRequest::new(
            "import os\nprint('a')\nresponse = (1).__class__.__name__",
            ResponseKeys::default(),
        ))
        .expect("execute");
    assert_eq!(response.stdout.as_deref(), Some("a"));
    assert_eq!(response.data, Some(Value::String("int".into())));
}

// ── Limits ───────────────────────────────────────────────────────────────────

#[test]
fn test_output_limit() {
    let settings = ExecutionSettings {
        pool_size: 0,
        max_output_bytes: 64,
        ..ExecutionSettings::default()
    };
    let executor = Executor::new(ModuleRegistry::default(), settings).expect("executor");
    let fault = executor
        .execute(&ExecutionRequest::new(
            "for i in range(100):\n    print('0123456789')",
            ResponseKeys::default(),
        ))
        .unwrap_err();
    assert!(fault.detail.contains("Output limit exceeded"), "{}", fault.detail);
}

#[test]
fn test_timeout() {
    let settings = ExecutionSettings {
        pool_size: 0,
        timeout_ns: 300_000_000,
        ..ExecutionSettings::default()
    };
    let executor = Executor::new(ModuleRegistry::default(), settings).expect("executor");
    let fault = executor
        .execute(&ExecutionRequest::new("while True:\n    pass", ResponseKeys::default()))
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::Other("TimeoutError".into()));
    assert_eq!(fault.message(), "TimeoutError: execution timed out after 300 ms");
}
