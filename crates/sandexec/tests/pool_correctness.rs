// Pool behaviour seen through the public API: slot reuse, concurrent callers,
// fallback to fresh interpreters when every slot is busy.

use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use sandexec::{
    ExecutionRequest, ExecutionSettings, Executor, FaultKind, InterpreterPool, ModuleRegistry,
    ResponseKeys,
};
use serde_json::json;

fn pooled(size: usize) -> Executor {
    let settings = ExecutionSettings {
        pool_size: size,
        ..ExecutionSettings::default()
    };
    Executor::new(ModuleRegistry::default(), settings).expect("executor")
}

fn request(source: &str) -> ExecutionRequest {
    ExecutionRequest::new(source, ResponseKeys::default())
}

#[test]
fn test_pool_starts_fully_idle() {
    let pool = InterpreterPool::new(2, Arc::new(ModuleRegistry::default())).expect("pool");
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.idle_count(), 2);
}

#[test]
fn test_pool_size_zero_is_clamped_for_direct_use() {
    let pool = InterpreterPool::new(0, Arc::new(ModuleRegistry::default())).expect("pool");
    assert_eq!(pool.size(), 1);
}

/// 8 threads × 5 calls on a 2-slot pool; every result must belong to its own call.
#[test]
fn test_concurrent_callers_get_their_own_results() {
    let executor = Arc::new(pooled(2));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8_i64)
        .map(|thread| {
            let executor = Arc::clone(&executor);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for call in 0..5_i64 {
                    let n = thread * 100 + call;
                    let response = executor
                        .execute(&request(&format!("print({n})\nresponse = {n} * 2")))
                        .expect("execute");
                    assert_eq!(response.data, Some(json!(n * 2)));
                    assert_eq!(response.stdout, Some(n.to_string()));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread should not panic");
    }
}

/// A call that tries to patch a shared class fails, and the next call on the
/// same slot sees the original class.
#[test]
fn test_class_patch_does_not_leak_to_next_call() {
    let executor = pooled(1);
    let fault = executor
        .execute(&request("np.ndarray.tolist = lambda self: 'hijacked'"))
        .unwrap_err();
    assert_eq!(fault.kind, FaultKind::TypeError);

    let response = executor.execute(&request("response = np.array([1, 2, 3])")).expect("execute");
    assert_eq!(response.data, Some(json!([1, 2, 3])));
}

/// A runaway call keeps its slot; the next call still completes on a fresh
/// interpreter once the checkout wait expires.
#[test]
fn test_busy_pool_falls_back_to_fresh_interpreter() {
    let settings = ExecutionSettings {
        pool_size: 1,
        timeout_ns: 5_000_000_000,
        ..ExecutionSettings::default()
    };
    let executor = Arc::new(Executor::new(ModuleRegistry::default(), settings).expect("executor"));

    let runaway = {
        let executor = Arc::clone(&executor);
        std::thread::spawn(move || executor.execute(&request("while True:\n    pass")))
    };
    // Let the runaway job take the only slot.
    std::thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    let response = executor.execute(&request("response = 'fresh'")).expect("execute");
    assert_eq!(response.data, Some(json!("fresh")));
    assert!(start.elapsed() < Duration::from_secs(5), "took {:?}", start.elapsed());

    let fault = runaway.join().expect("join").unwrap_err();
    assert_eq!(fault.kind, FaultKind::Other("TimeoutError".into()));
}
