//! Captured-output buffer for one execution.
//!
//! [`OutputBuffer`] accumulates everything user code prints, whether through
//! the restricted print collector or the `sys.stdout` writer used in
//! unrestricted mode, and enforces a byte limit. Clones share the same data, so
//! the native functions installed in the interpreter can each hold one while
//! the engine reads the result afterwards.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Raised (as a Python `RuntimeError`) when a write would exceed the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Output limit exceeded: {limit_bytes} bytes")]
pub struct OutputLimitExceeded {
    pub limit_bytes: usize,
}

struct Inner {
    data: Vec<u8>,
    max_bytes: usize,
    limit_exceeded: bool,
}

/// Shared, size-limited output capture.
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: Vec::new(),
                max_bytes,
                limit_exceeded: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `data`. A write that would exceed the limit is rejected whole
    /// and leaves the buffer unchanged.
    pub fn write(&self, data: &[u8]) -> Result<(), OutputLimitExceeded> {
        let mut inner = self.lock();
        if inner.data.len() + data.len() > inner.max_bytes {
            inner.limit_exceeded = true;
            return Err(OutputLimitExceeded {
                limit_bytes: inner.max_bytes,
            });
        }
        inner.data.extend_from_slice(data);
        Ok(())
    }

    pub fn write_str(&self, text: &str) -> Result<(), OutputLimitExceeded> {
        self.write(text.as_bytes())
    }

    /// `true` once any write has been rejected.
    pub fn is_limit_exceeded(&self) -> bool {
        self.lock().limit_exceeded
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The captured text. Invalid UTF-8 is replaced, never an error.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock().data).into_owned()
    }

    /// The captured text in response form, see [`normalize_output`].
    pub fn normalized(&self) -> Option<String> {
        normalize_output(&self.contents())
    }
}

/// Normalizes captured text for the response: nothing written means no
/// `stdout` field; otherwise lines are re-joined with `\n`, which drops the
/// trailing newline `print` adds.
pub fn normalize_output(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    Some(raw.lines().collect::<Vec<_>>().join("\n"))
}
