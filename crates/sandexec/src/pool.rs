//! Interpreter pool: persistent-thread-per-slot actor model.
//!
//! ## Design
//!
//! Each pool slot is a dedicated OS thread that:
//! 1. Builds one `PyInterp` and materializes the module registry in it, so the
//!    first call on the slot does not pay for stdlib or frozen-module imports.
//! 2. Records the `sys.modules` names present after warming.
//! 3. Blocks on a `Receiver<WorkItem>`. For each item it runs the job, removes
//!    every module imported during the call from `sys.modules`, and sends the
//!    result back on the item's own channel.
//!
//! The interpreter never leaves its slot thread (`PyInterp` is not `Send`);
//! only the `SyncSender<WorkItem>` handles move between threads, through a
//! `Mutex<VecDeque<_>>` + `Condvar` queue of idle slots.
//!
//! ## Timeouts
//!
//! When the caller stops waiting, the slot keeps running the job. Its send then
//! fails on the disconnected channel and is ignored; the slot resets and
//! rejoins the idle queue once the job finishes. A job that never finishes
//! keeps its slot busy for good, and callers fall back to fresh interpreters.

use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rustpython_vm::builtins::{PyDict, PyStr};

use crate::fault::SandboxFault;
use crate::registry::ModuleRegistry;
use crate::types::ExecutionResponse;
use crate::vm::{build_interpreter, run_job, Job, PyInterp, VM_THREAD_STACK_SIZE};

pub(crate) type JobResult = Result<ExecutionResponse, SandboxFault>;

/// A job plus the one-shot channel its result goes back on. All fields are `Send`.
pub(crate) struct WorkItem {
    pub job: Job,
    pub response: SyncSender<JobResult>,
}

type SlotQueue = Arc<(Mutex<VecDeque<SyncSender<WorkItem>>>, Condvar)>;

fn lock_queue(
    lock: &Mutex<VecDeque<SyncSender<WorkItem>>>,
) -> MutexGuard<'_, VecDeque<SyncSender<WorkItem>>> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

fn release_slot(available: &SlotQueue, tx: SyncSender<WorkItem>) {
    let (lock, cvar) = &**available;
    lock_queue(lock).push_back(tx);
    cvar.notify_one();
}

// ── Pool slot ────────────────────────────────────────────────────────────────

fn start_slot_thread(
    slot_id: usize,
    registry: Arc<ModuleRegistry>,
    available: SlotQueue,
    ready: mpsc::Sender<()>,
) -> std::io::Result<()> {
    // Capacity 1: a slot holds at most one item, and only while it is checked out.
    let (tx, rx) = mpsc::sync_channel::<WorkItem>(1);

    std::thread::Builder::new()
        .name(format!("sandexec-pool-slot-{slot_id}"))
        .stack_size(VM_THREAD_STACK_SIZE)
        .spawn(move || {
            let interp = build_interpreter();
            if let Err(fault) = interp.with_vm(|vm| registry.resolve(vm).map(drop)) {
                tracing::warn!(slot_id, error = %fault, "pool slot could not warm the module registry");
            }
            let baseline = module_names(&interp);

            release_slot(&available, tx.clone());
            let _ = ready.send(());

            while let Ok(item) = rx.recv() {
                let result = catch_panic(slot_id, || run_job(&interp, &registry, &item.job));
                reset_sys_modules(&interp, &baseline);
                // The caller may have timed out and dropped its receiver.
                let _ = item.response.send(result);
                release_slot(&available, tx.clone());
            }
        })?;
    Ok(())
}

/// Runs `f`, turning a panic into a fault so the slot survives it.
fn catch_panic<F>(slot_id: usize, f: F) -> JobResult
where
    F: FnOnce() -> JobResult,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        tracing::error!(slot_id, "execution panicked on pool slot");
        Err(SandboxFault::other("RuntimeError", "execution thread panicked"))
    })
}

// ── sys.modules baseline capture and reset ──────────────────────────────────

fn module_names(interp: &PyInterp) -> HashSet<String> {
    interp.with_vm(|vm| {
        let Ok(modules) = vm.sys_module.get_attr("modules", vm) else {
            return HashSet::new();
        };
        let Some(modules) = modules.downcast_ref::<PyDict>() else {
            return HashSet::new();
        };
        modules
            .into_iter()
            .filter_map(|(key, _)| key.downcast_ref::<PyStr>().map(|s| s.as_str().to_owned()))
            .collect()
    })
}

/// Removes every `sys.modules` entry that is not in `baseline`.
fn reset_sys_modules(interp: &PyInterp, baseline: &HashSet<String>) {
    let imported: Vec<String> = module_names(interp)
        .into_iter()
        .filter(|name| !baseline.contains(name))
        .collect();
    if imported.is_empty() {
        return;
    }
    tracing::trace!(count = imported.len(), "removing modules imported during the call");
    interp.with_vm(|vm| {
        let Ok(modules) = vm.sys_module.get_attr("modules", vm) else {
            return;
        };
        let Some(modules) = modules.downcast_ref::<PyDict>() else {
            return;
        };
        for name in imported {
            let _ = modules.del_item(name.as_str(), vm);
        }
    });
}

// ── InterpreterPool ──────────────────────────────────────────────────────────

/// Fixed-size pool of pre-warmed interpreters sharing one module registry.
pub struct InterpreterPool {
    available: SlotQueue,
    target_size: usize,
}

impl InterpreterPool {
    /// Starts `size` slot threads (at least one) and blocks until every slot
    /// has warmed its interpreter.
    pub fn new(size: usize, registry: Arc<ModuleRegistry>) -> Result<Self, SandboxFault> {
        let target_size = size.max(1);
        let available: SlotQueue = Arc::new((
            Mutex::new(VecDeque::with_capacity(target_size)),
            Condvar::new(),
        ));
        let (ready_tx, ready_rx) = mpsc::channel();

        for slot_id in 0..target_size {
            start_slot_thread(
                slot_id,
                Arc::clone(&registry),
                Arc::clone(&available),
                ready_tx.clone(),
            )
            .map_err(|err| {
                SandboxFault::other("RuntimeError", format!("failed to spawn pool slot: {err}"))
            })?;
        }
        drop(ready_tx);

        for _ in 0..target_size {
            ready_rx.recv().map_err(|_| {
                SandboxFault::other("RuntimeError", "pool slot died during startup")
            })?;
        }
        tracing::debug!(size = target_size, "interpreter pool ready");

        Ok(InterpreterPool {
            available,
            target_size,
        })
    }

    /// Hands `work` to an idle slot, waiting at most `checkout_timeout` for one.
    ///
    /// On failure the item comes back unsent so the caller can run it elsewhere.
    pub(crate) fn dispatch_work(
        &self,
        work: WorkItem,
        checkout_timeout: Duration,
    ) -> Result<(), WorkItem> {
        let (lock, cvar) = &*self.available;
        let deadline = Instant::now() + checkout_timeout;

        let slot_tx = {
            let mut queue = lock_queue(lock);
            loop {
                if let Some(tx) = queue.pop_front() {
                    break tx;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(work);
                }
                queue = cvar
                    .wait_timeout(queue, remaining)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        // A slot whose thread died has a disconnected channel.
        slot_tx.send(work).map_err(|mpsc::SendError(work)| work)
    }

    /// Number of slots waiting for work.
    pub fn idle_count(&self) -> usize {
        lock_queue(&self.available.0).len()
    }

    /// Total number of slots, idle or busy.
    pub fn size(&self) -> usize {
        self.target_size
    }
}
