//! Conversion of interpreter values into JSON.
//!
//! Every value is first classified into a [`ValueKind`]; anything outside the
//! closed set fails the call instead of being stringified or dropped.
//! Tensors, arrays and array scalars are converted through their own
//! `tolist()`/`item()` first.

use rustpython_vm::{
    builtins::{PyDict, PyFloat, PyInt, PyList, PyStr, PyTuple, PyType},
    AsObject, PyObjectRef, PyResult, VirtualMachine,
};
use serde_json::{Map, Number, Value};

use crate::fault::SandboxFault;
use crate::registry::import_module;
use crate::translate::translate_exception;

/// Containers nested deeper than this are rejected.
const MAX_DEPTH: usize = 512;

/// Serializes `value` into JSON.
pub(crate) fn serialize(vm: &VirtualMachine, value: &PyObjectRef) -> Result<Value, SandboxFault> {
    Serializer::new(vm).to_json(value)
}

enum ValueKind {
    None,
    Bool(bool),
    Int(Number),
    Float(f64),
    Str(String),
    List(Vec<PyObjectRef>),
    Tuple(Vec<PyObjectRef>),
    Dict(Vec<(PyObjectRef, PyObjectRef)>),
    Tensor,
    Array,
    Scalar,
    Unsupported(String),
}

struct Serializer<'vm> {
    vm: &'vm VirtualMachine,
    tensor_class: Option<PyObjectRef>,
    array_class: Option<PyObjectRef>,
    scalar_class: Option<PyObjectRef>,
    /// Ids of the containers currently being serialized.
    stack: Vec<usize>,
}

impl<'vm> Serializer<'vm> {
    fn new(vm: &'vm VirtualMachine) -> Self {
        let class = |module: &str, name: &'static str| {
            import_module(vm, module)
                .and_then(|module| module.get_attr(name, vm))
                .ok()
        };
        Self {
            vm,
            tensor_class: class("tensor", "Tensor"),
            array_class: class("numeric", "ndarray"),
            scalar_class: class("numeric", "generic"),
            stack: Vec::new(),
        }
    }

    fn to_json(&mut self, value: &PyObjectRef) -> Result<Value, SandboxFault> {
        let kind = self.classify(value).map_err(|exc| translate_exception(self.vm, &exc))?;
        match kind {
            ValueKind::None => Ok(Value::Null),
            ValueKind::Bool(b) => Ok(Value::Bool(b)),
            ValueKind::Int(n) => Ok(Value::Number(n)),
            ValueKind::Float(f) => Number::from_f64(f).map(Value::Number).ok_or_else(|| {
                SandboxFault::value_error("Out of range float values are not JSON compliant")
            }),
            ValueKind::Str(s) => Ok(Value::String(s)),
            ValueKind::List(items) | ValueKind::Tuple(items) => self.nested(value, |this| {
                items
                    .iter()
                    .map(|item| this.to_json(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }),
            ValueKind::Dict(entries) => self.nested(value, |this| {
                let mut object = Map::with_capacity(entries.len());
                for (key, item) in &entries {
                    let key = object_key(this.to_json(key)?, key)?;
                    object.insert(key, this.to_json(item)?);
                }
                Ok(Value::Object(object))
            }),
            ValueKind::Tensor => {
                let converted = self
                    .call(value, "detach")
                    .and_then(|detached| self.call(&detached, "tolist"))
                    .map_err(|exc| translate_exception(self.vm, &exc))?;
                self.to_json(&converted)
            }
            ValueKind::Array => {
                let converted = self
                    .call(value, "tolist")
                    .map_err(|exc| translate_exception(self.vm, &exc))?;
                self.to_json(&converted)
            }
            ValueKind::Scalar => {
                let converted = self
                    .call(value, "item")
                    .map_err(|exc| translate_exception(self.vm, &exc))?;
                self.to_json(&converted)
            }
            ValueKind::Unsupported(type_name) => Err(SandboxFault::type_error(format!(
                "Object of type {type_name} is not JSON serializable"
            ))),
        }
    }

    /// Runs `f` with `container` on the cycle-detection stack.
    fn nested<F>(&mut self, container: &PyObjectRef, f: F) -> Result<Value, SandboxFault>
    where
        F: FnOnce(&mut Self) -> Result<Value, SandboxFault>,
    {
        let id = container.get_id();
        if self.stack.contains(&id) {
            return Err(SandboxFault::value_error("Circular reference detected"));
        }
        if self.stack.len() >= MAX_DEPTH {
            return Err(SandboxFault::value_error(format!(
                "value is nested more than {MAX_DEPTH} levels deep"
            )));
        }
        self.stack.push(id);
        let result = f(self);
        self.stack.pop();
        result
    }

    fn call(&self, value: &PyObjectRef, method: &str) -> PyResult<PyObjectRef> {
        self.vm.call_method(value, method, ())
    }

    fn classify(&self, value: &PyObjectRef) -> PyResult<ValueKind> {
        let vm = self.vm;
        if vm.is_none(value) {
            return Ok(ValueKind::None);
        }
        if value.class().is(vm.ctx.types.bool_type) {
            return Ok(ValueKind::Bool(value.is(&vm.ctx.true_value)));
        }
        if let Some(int) = value.downcast_ref::<PyInt>() {
            let big = int.as_bigint();
            let number = i64::try_from(big)
                .map(Number::from)
                .or_else(|_| u64::try_from(big).map(Number::from))
                .map_err(|_| {
                    vm.new_value_error(format!("integer {big} is out of range for JSON"))
                })?;
            return Ok(ValueKind::Int(number));
        }
        if let Some(float) = value.downcast_ref::<PyFloat>() {
            return Ok(ValueKind::Float(float.to_f64()));
        }
        if let Some(s) = value.downcast_ref::<PyStr>() {
            return Ok(ValueKind::Str(s.as_str().to_owned()));
        }
        if is_instance(value, self.tensor_class.as_ref()) {
            return Ok(ValueKind::Tensor);
        }
        if is_instance(value, self.array_class.as_ref()) {
            return Ok(ValueKind::Array);
        }
        if is_instance(value, self.scalar_class.as_ref()) {
            return Ok(ValueKind::Scalar);
        }
        if let Some(list) = value.downcast_ref::<PyList>() {
            return Ok(ValueKind::List(list.borrow_vec().to_vec()));
        }
        if let Some(tuple) = value.downcast_ref::<PyTuple>() {
            return Ok(ValueKind::Tuple(tuple.as_slice().to_vec()));
        }
        if let Some(dict) = value.downcast_ref::<PyDict>() {
            return Ok(ValueKind::Dict(dict.into_iter().collect()));
        }
        Ok(ValueKind::Unsupported(value.class().name().to_string()))
    }
}

fn is_instance(value: &PyObjectRef, class: Option<&PyObjectRef>) -> bool {
    class
        .and_then(|class| class.downcast_ref::<PyType>())
        .map_or(false, |class| value.fast_isinstance(class))
}

/// Renders a serialized dict key as a JSON object key.
fn object_key(key: Value, original: &PyObjectRef) -> Result<String, SandboxFault> {
    match key {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("null".to_owned()),
        Value::Array(_) | Value::Object(_) => Err(SandboxFault::type_error(format!(
            "keys must be str, int, float, bool or None, not {}",
            original.class().name()
        ))),
    }
}
