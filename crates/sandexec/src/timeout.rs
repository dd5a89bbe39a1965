use std::io;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

use crate::vm::VM_THREAD_STACK_SIZE;

/// Why [`run_with_timeout`] produced no value.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("failed to spawn execution thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("execution thread panicked")]
    Panicked,
}

/// Run `f` on a new thread and wait at most `timeout_ns` nanoseconds for it.
///
/// On timeout the thread is abandoned, not joined: a tight Python loop cannot
/// be interrupted from outside, so it keeps running until it finishes or the
/// process exits. Everything it holds is owned or reference-counted, and its
/// result is dropped when the send fails.
pub fn run_with_timeout<F, T>(f: F, timeout_ns: u64) -> Result<T, WaitError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel::<T>();

    thread::Builder::new()
        .name("sandexec-vm".to_string())
        .stack_size(VM_THREAD_STACK_SIZE)
        .spawn(move || {
            let _ = tx.send(f());
        })?;

    let timeout = Duration::from_nanos(timeout_ns);
    match rx.recv_timeout(timeout) {
        Ok(result) => Ok(result),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(WaitError::TimedOut(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(WaitError::Panicked),
    }
}
