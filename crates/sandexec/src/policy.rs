//! Execution namespaces and the guard functions the restricted rewrite calls.
//!
//! ## Restricted globals
//!
//! The interpreter always resolves unknown names through its own builtins
//! module, so the namespace cannot simply omit dangerous builtins. Instead,
//! every builtin outside [`ALLOWED_BUILTINS`] (exception classes aside) is
//! shadowed in the globals dict by a stub that raises `NameError` when called.
//! Names starting with `_` are left alone: user code cannot spell them, and
//! the interpreter needs `__build_class__`.
//!
//! On top of that the globals carry the guard hooks
//!
//! | name                      | behaviour                                        |
//! |---------------------------|--------------------------------------------------|
//! | `_getattr_`, `getattr`    | attribute read with name policy                  |
//! | `_getitem_`               | item read on list/tuple/dict/array/tensor only   |
//! | `_getiter_`               | `iter`                                           |
//! | `_unpack_sequence_`       | shape-checked unpacking                          |
//! | `_iter_unpack_sequence_`  | the above applied to every item of an iterable   |
//! | `_write_`                 | lets dict/list/array targets through             |
//! | `_print_`, `print`        | writes to the call's [`OutputBuffer`]            |
//!
//! plus `time` and the module registry bindings.

use std::sync::Once;

use rustpython_vm::{
    builtins::{PyDictRef, PyList, PyStr, PyStrRef, PyTuple, PyType},
    function::{FuncArgs, OptionalArg},
    AsObject, PyObjectRef, PyResult, TryFromObject, VirtualMachine,
};

use crate::output::OutputBuffer;
use crate::registry::import_module;

/// Builtins user code may call in restricted mode.
pub const ALLOWED_BUILTINS: &[&str] = &[
    "abs", "all", "any", "ascii", "bin", "bool", "bytes", "callable", "chr", "classmethod",
    "complex", "dict", "divmod", "enumerate", "filter", "float", "frozenset", "hash", "hex",
    "id", "int", "isinstance", "issubclass", "iter", "len", "list", "map", "max", "min",
    "next", "oct", "ord", "pow", "property", "range", "repr", "reversed", "round", "set",
    "slice", "sorted", "staticmethod", "str", "sum", "super", "tuple", "zip", "Ellipsis",
    "NotImplemented", "None", "True", "False",
];

/// Attributes that expose frames, code objects or the type hierarchy.
const RESTRICTED_ATTRIBUTES: &[&str] = &[
    "gi_frame", "gi_code", "gi_yieldfrom", "cr_frame", "cr_code", "cr_await", "ag_frame",
    "ag_code", "f_back", "f_builtins", "f_code", "f_globals", "f_locals", "f_trace",
    "co_code", "tb_frame", "tb_next", "mro",
];

/// Classes whose instances `_getitem_` accepts besides list, tuple and dict.
const SUBSCRIPTABLE_CLASSES: &[(&str, &str)] = &[("numeric", "ndarray"), ("tensor", "Tensor")];

/// Attribute that marks a class as a valid `_write_` target.
const GUARDED_WRITES: &str = "_guarded_writes";

static UNRESTRICTED_WARNING: Once = Once::new();

/// Logs the unrestricted-mode warning, once per process.
pub(crate) fn warn_unrestricted() {
    UNRESTRICTED_WARNING.call_once(|| {
        tracing::warn!(
            "sandbox restrictions are DISABLED: submitted code runs with full builtins \
             and can reach the host. Never expose this mode to untrusted input."
        );
    });
}

/// Globals for unrestricted mode: a plain module namespace plus the registry bindings.
pub(crate) fn unrestricted_globals(
    vm: &VirtualMachine,
    bindings: Vec<(String, PyObjectRef)>,
) -> PyResult<PyDictRef> {
    let globals = vm.ctx.new_dict();
    globals.set_item("__name__", vm.ctx.new_str("__main__").into(), vm)?;
    for (alias, object) in bindings {
        globals.set_item(alias.as_str(), object, vm)?;
    }
    Ok(globals)
}

/// Globals for restricted mode. `output` receives everything `print` writes.
pub(crate) fn restricted_globals(
    vm: &VirtualMachine,
    bindings: Vec<(String, PyObjectRef)>,
    output: &OutputBuffer,
) -> PyResult<PyDictRef> {
    let globals = vm.ctx.new_dict();
    shadow_builtins(vm, &globals)?;

    let getattr: PyObjectRef = vm.new_function("_getattr_", guarded_getattr).into();
    globals.set_item("_getattr_", getattr.clone(), vm)?;
    globals.set_item("getattr", getattr, vm)?;

    let subscriptable = subscriptable_classes(vm)?;
    let getitem = vm.new_function(
        "_getitem_",
        move |obj: PyObjectRef, key: PyObjectRef, vm: &VirtualMachine| {
            guarded_getitem(vm, &subscriptable, obj, key)
        },
    );
    globals.set_item("_getitem_", getitem.into(), vm)?;

    globals.set_item("_getiter_", vm.builtins.get_attr("iter", vm)?, vm)?;
    globals.set_item(
        "_unpack_sequence_",
        vm.new_function("_unpack_sequence_", unpack_sequence).into(),
        vm,
    )?;
    globals.set_item(
        "_iter_unpack_sequence_",
        vm.new_function("_iter_unpack_sequence_", iter_unpack_sequence).into(),
        vm,
    )?;
    globals.set_item("_write_", vm.new_function("_write_", guarded_write).into(), vm)?;

    let print = print_collector(vm, output.clone());
    globals.set_item("_print_", print.clone(), vm)?;
    globals.set_item("print", print, vm)?;

    globals.set_item("time", import_module(vm, "time")?, vm)?;
    for (alias, object) in bindings {
        globals.set_item(alias.as_str(), object, vm)?;
    }
    Ok(globals)
}

fn shadow_builtins(vm: &VirtualMachine, globals: &PyDictRef) -> PyResult<()> {
    for (key, value) in vm.builtins.dict() {
        let Some(name) = key.downcast_ref::<PyStr>().map(|s| s.as_str().to_owned()) else {
            continue;
        };
        if name.starts_with('_') || ALLOWED_BUILTINS.contains(&name.as_str()) || is_exception_class(vm, &value) {
            continue;
        }
        let stub = deny_stub(vm, name.clone());
        globals.set_item(name.as_str(), stub, vm)?;
    }
    Ok(())
}

fn is_exception_class(vm: &VirtualMachine, value: &PyObjectRef) -> bool {
    value.downcast_ref::<PyType>().is_some()
        && value
            .is_subclass(vm.ctx.exceptions.base_exception_type.as_object(), vm)
            .unwrap_or(false)
}

fn deny_stub(vm: &VirtualMachine, name: String) -> PyObjectRef {
    vm.new_function("denied", move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        Err(vm.new_exception_msg(
            vm.ctx.exceptions.name_error.to_owned(),
            format!("name '{name}' is not defined"),
        ))
    })
    .into()
}

// ── Attribute and item reads ──────────────────────────────────────────────────

/// Rejects attribute names the sandbox never hands out.
fn check_attribute_name(vm: &VirtualMachine, obj: &PyObjectRef, name: &str) -> PyResult<()> {
    if name.starts_with('_') {
        return Err(vm.new_attribute_error(format!(
            "\"{name}\" is an invalid attribute name because it starts with \"_\"."
        )));
    }
    if RESTRICTED_ATTRIBUTES.contains(&name) {
        return Err(vm.new_attribute_error(format!("\"{name}\" is a restricted attribute name.")));
    }
    if (name == "format" || name == "format_map") && obj.fast_isinstance(vm.ctx.types.str_type) {
        return Err(vm.new_exception_msg(
            vm.ctx.exceptions.not_implemented_error.to_owned(),
            "Using the format*() methods of `str` is not safe".to_owned(),
        ));
    }
    Ok(())
}

fn guarded_getattr(
    obj: PyObjectRef,
    name: PyStrRef,
    default: OptionalArg<PyObjectRef>,
    vm: &VirtualMachine,
) -> PyResult<PyObjectRef> {
    check_attribute_name(vm, &obj, name.as_str())?;
    match (obj.get_attr(&name, vm), default) {
        (Ok(value), _) => Ok(value),
        (Err(exc), OptionalArg::Present(default))
            if exc.fast_isinstance(vm.ctx.exceptions.attribute_error) =>
        {
            Ok(default)
        }
        (Err(exc), _) => Err(exc),
    }
}

fn subscriptable_classes(vm: &VirtualMachine) -> PyResult<Vec<PyObjectRef>> {
    SUBSCRIPTABLE_CLASSES
        .iter()
        .map(|(module, class)| import_module(vm, module)?.get_attr(*class, vm))
        .collect()
}

fn guarded_getitem(
    vm: &VirtualMachine,
    subscriptable: &[PyObjectRef],
    obj: PyObjectRef,
    key: PyObjectRef,
) -> PyResult<PyObjectRef> {
    let class = obj.class();
    let types = &vm.ctx.types;
    let allowed = class.is(types.list_type)
        || class.is(types.tuple_type)
        || class.is(types.dict_type)
        || subscriptable.iter().any(|cls| class.is(cls));
    if !allowed {
        let shown = obj
            .repr(vm)
            .map(|s| s.as_str().to_owned())
            .unwrap_or_else(|_| format!("<{}>", class.name()));
        return Err(vm.new_type_error(format!(
            "subscript access is not allowed on {shown} of type '{}'",
            class.name()
        )));
    }
    obj.get_item(&*key, vm)
}

// ── Writes ────────────────────────────────────────────────────────────────────

fn guarded_write(obj: PyObjectRef, vm: &VirtualMachine) -> PyResult<PyObjectRef> {
    let class = obj.class();
    if class.is(vm.ctx.types.dict_type) || class.is(vm.ctx.types.list_type) {
        return Ok(obj);
    }
    // Classes are shared by every call on an interpreter; only instances
    // opt in to writes.
    if let Some(cls) = obj.downcast_ref::<PyType>() {
        return Err(vm.new_type_error(format!(
            "cannot assign to attributes of class '{}'",
            cls.name()
        )));
    }
    let marked = obj
        .get_attr(GUARDED_WRITES, vm)
        .ok()
        .map_or(false, |flag| flag.try_to_bool(vm).unwrap_or(false));
    if marked {
        return Ok(obj);
    }
    Err(vm.new_type_error(format!(
        "'{}' object does not support item or attribute assignment",
        class.name()
    )))
}

// ── Unpacking ─────────────────────────────────────────────────────────────────

/// One position of an unpacking target.
#[derive(Debug, Clone, PartialEq)]
enum UnpackSpec {
    Plain,
    Starred,
    Nested(Vec<UnpackSpec>),
}

/// Parses the tuple literal the rewrite emits: `0` plain, `1` starred, a
/// tuple for a nested target.
fn parse_spec(vm: &VirtualMachine, spec: &PyObjectRef) -> PyResult<Vec<UnpackSpec>> {
    let tuple = spec
        .downcast_ref::<PyTuple>()
        .ok_or_else(|| vm.new_type_error("unpack spec must be a tuple".to_owned()))?;
    tuple
        .as_slice()
        .iter()
        .map(|item| {
            if item.downcast_ref::<PyTuple>().is_some() {
                return parse_spec(vm, item).map(UnpackSpec::Nested);
            }
            match u8::try_from_object(vm, item.clone())? {
                0 => Ok(UnpackSpec::Plain),
                1 => Ok(UnpackSpec::Starred),
                other => Err(vm.new_value_error(format!("invalid unpack spec entry {other}"))),
            }
        })
        .collect()
}

fn unpack_with(vm: &VirtualMachine, value: PyObjectRef, specs: &[UnpackSpec]) -> PyResult<PyObjectRef> {
    let list = vm.ctx.types.list_type.as_object().call((value,), vm)?;
    let list = list
        .downcast::<PyList>()
        .map_err(|_| vm.new_type_error("cannot unpack non-sequence".to_owned()))?;
    let mut items = list.borrow_vec().to_vec();

    let star = specs.iter().position(|spec| *spec == UnpackSpec::Starred);
    let fixed = specs.len() - usize::from(star.is_some());
    let got = items.len();
    match star {
        None if got > fixed => {
            return Err(vm.new_value_error(format!(
                "too many values to unpack (expected {fixed})"
            )))
        }
        None if got < fixed => {
            return Err(vm.new_value_error(format!(
                "not enough values to unpack (expected {fixed}, got {got})"
            )))
        }
        Some(_) if got < fixed => {
            return Err(vm.new_value_error(format!(
                "not enough values to unpack (expected at least {fixed}, got {got})"
            )))
        }
        _ => {}
    }

    for (position, spec) in specs.iter().enumerate() {
        let UnpackSpec::Nested(inner) = spec else {
            continue;
        };
        let index = match star {
            Some(star) if position > star => got - (specs.len() - position),
            _ => position,
        };
        items[index] = unpack_with(vm, items[index].clone(), inner)?;
    }
    Ok(vm.ctx.new_list(items).into())
}

fn unpack_sequence(value: PyObjectRef, spec: PyObjectRef, vm: &VirtualMachine) -> PyResult<PyObjectRef> {
    let specs = parse_spec(vm, &spec)?;
    unpack_with(vm, value, &specs)
}

fn iter_unpack_sequence(
    iterable: PyObjectRef,
    spec: PyObjectRef,
    vm: &VirtualMachine,
) -> PyResult<PyObjectRef> {
    let specs = parse_spec(vm, &spec)?;
    let unpack = vm.new_function(
        "_unpack_item_",
        move |item: PyObjectRef, vm: &VirtualMachine| unpack_with(vm, item, &specs),
    );
    vm.ctx
        .types
        .map_type
        .as_object()
        .call((unpack, iterable), vm)
}

// ── print ─────────────────────────────────────────────────────────────────────

fn print_collector(vm: &VirtualMachine, output: OutputBuffer) -> PyObjectRef {
    vm.new_function("print", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
        let mut sep = " ".to_owned();
        let mut end = "\n".to_owned();
        for (keyword, value) in &args.kwargs {
            match keyword.as_str() {
                "sep" => sep = optional_str(vm, keyword, value)?.unwrap_or(sep),
                "end" => end = optional_str(vm, keyword, value)?.unwrap_or(end),
                "flush" => {}
                "file" if vm.is_none(value) => {}
                other => {
                    return Err(vm.new_type_error(format!(
                        "'{other}' is an invalid keyword argument for print()"
                    )))
                }
            }
        }

        let parts = args
            .args
            .iter()
            .map(|arg| arg.str(vm).map(|s| s.as_str().to_owned()))
            .collect::<PyResult<Vec<_>>>()?;
        let text = format!("{}{end}", parts.join(&sep));
        output.write_str(&text).map_err(|err| {
            vm.new_exception_msg(vm.ctx.exceptions.runtime_error.to_owned(), err.to_string())
        })?;
        Ok(vm.ctx.none())
    })
    .into()
}

fn optional_str(vm: &VirtualMachine, keyword: &str, value: &PyObjectRef) -> PyResult<Option<String>> {
    if vm.is_none(value) {
        return Ok(None);
    }
    match value.downcast_ref::<PyStr>() {
        Some(s) => Ok(Some(s.as_str().to_owned())),
        None => Err(vm.new_type_error(format!(
            "{keyword} must be None or a string, not {}",
            value.class().name()
        ))),
    }
}
