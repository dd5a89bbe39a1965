//! Conversion of interpreter exceptions and compile errors into [`SandboxFault`]s.
//!
//! ## Line numbers
//!
//! A line number attached to the exception itself (`SyntaxError.lineno`) wins.
//! Otherwise the unwound traceback is consulted: the outermost user frame for
//! the four recognized kinds, the innermost frame for everything else. No
//! usable frame means no line number.

use rustpython_parser::ParseError;
use rustpython_vm::{
    builtins::PyBaseExceptionRef, compiler::CompileError, AsObject, PyObjectRef, TryFromObject,
    VirtualMachine,
};

use crate::fault::{FaultKind, SandboxFault};

/// Builds the fault for an exception raised while compiling or running user code.
///
/// The formatted traceback is logged at `error` level.
pub(crate) fn translate_exception(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> SandboxFault {
    let kind = classify(vm, exc);
    let detail = exception_detail(vm, exc);
    let line_number = attached_line(vm, exc).or_else(|| {
        let lines = traceback_lines(vm, exc);
        if kind.is_recognized() {
            lines.first().copied()
        } else {
            lines.last().copied()
        }
    });

    let mut traceback = String::new();
    let _ = vm.write_exception(&mut traceback, exc);
    tracing::error!(kind = %kind, line = ?line_number, "{}", traceback.trim_end());

    SandboxFault::new(kind, detail, line_number).with_class_name(exc.class().name().to_string())
}

/// Fault for source the interpreter's own compiler rejected.
pub(crate) fn compile_fault(err: &CompileError) -> SandboxFault {
    let (row, _col) = err.python_location();
    let line = u32::try_from(row).ok().filter(|line| *line > 0);
    tracing::error!(line = ?line, "compile error: {err}");
    SandboxFault::syntax(err.to_string(), line)
}

/// Fault for source the parser rejected. `offset` is resolved against `source`.
pub(crate) fn parse_fault(source: &str, err: &ParseError) -> SandboxFault {
    let line = line_of_offset(source, usize::from(err.offset));
    tracing::error!(line, "parse error: {}", err.error);
    SandboxFault::syntax(err.error.to_string(), Some(line))
}

/// 1-based line containing byte `offset` of `source`.
pub(crate) fn line_of_offset(source: &str, offset: usize) -> u32 {
    let end = offset.min(source.len());
    let newlines = source.as_bytes()[..end].iter().filter(|b| **b == b'\n').count();
    u32::try_from(newlines + 1).unwrap_or(u32::MAX)
}

/// `str(exc.args[0])`, or an empty string for an exception raised without arguments.
pub(crate) fn exception_detail(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
    let args = exc.args();
    match args.as_slice().first() {
        Some(first) => first
            .str(vm)
            .map(|s| s.as_str().to_owned())
            .unwrap_or_default(),
        None => String::new(),
    }
}

fn classify(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> FaultKind {
    let exceptions = &vm.ctx.exceptions;
    if exc.fast_isinstance(exceptions.key_error) {
        FaultKind::KeyError
    } else if exc.fast_isinstance(exceptions.syntax_error) {
        FaultKind::SyntaxError
    } else if exc.fast_isinstance(exceptions.type_error) {
        FaultKind::TypeError
    } else if exc.fast_isinstance(exceptions.value_error) {
        FaultKind::ValueError
    } else {
        FaultKind::Other(exc.class().name().to_string())
    }
}

fn attached_line(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> Option<u32> {
    let lineno = exc.as_object().get_attr("lineno", vm).ok()?;
    positive_line(vm, lineno)
}

/// Line numbers of every traceback entry, outermost first.
fn traceback_lines(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> Vec<u32> {
    let mut lines = Vec::new();
    let mut current = exc.as_object().get_attr("__traceback__", vm).ok();
    while let Some(tb) = current.filter(|tb| !vm.is_none(tb)) {
        if let Some(line) = tb
            .get_attr("tb_lineno", vm)
            .ok()
            .and_then(|lineno| positive_line(vm, lineno))
        {
            lines.push(line);
        }
        current = tb.get_attr("tb_next", vm).ok();
    }
    lines
}

fn positive_line(vm: &VirtualMachine, value: PyObjectRef) -> Option<u32> {
    if vm.is_none(&value) {
        return None;
    }
    u32::try_from_object(vm, value).ok().filter(|line| *line > 0)
}
