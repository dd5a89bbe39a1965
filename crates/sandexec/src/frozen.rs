//! Python modules compiled into the interpreter at build time.
//!
//! - `numeric`: small n-dimensional arrays (`ndarray`, scalar types, array
//!   constructors, reductions, elementwise math)
//! - `tensor`: a `Tensor` array subclass with the familiar tensor surface
//!   (`requires_grad`, `detach`, `numpy`, `size`, `dim`)
//!
//! Both depend only on native modules (`math`), so no host Python
//! installation is needed.

use rustpython_vm::VirtualMachine;

/// Version reported by `tensor.__version__` and `GET /`.
pub const TENSOR_VERSION: &str = "0.1.0";

/// Version reported by `numeric.__version__`.
pub const NUMERIC_VERSION: &str = "0.1.0";

/// Registers the frozen modules. Called from the interpreter init hook.
pub(crate) fn add_frozen_modules(vm: &mut VirtualMachine) {
    vm.add_frozen(rustpython_vm::py_freeze!(
        source = r#"
"""Small n-dimensional numeric arrays."""

import math

__version__ = "0.1.0"

pi = math.pi
e = math.e

# Module-level sum/max/min below shadow the builtins.
_sum, _max, _min = sum, max, min


def _prod(values):
    out = 1
    for v in values:
        out *= v
    return out


def _unwrap(value):
    if isinstance(value, generic):
        return value.item()
    return value


def _check_element(value):
    value = _unwrap(value)
    if not isinstance(value, (bool, int, float)):
        raise TypeError(f"unsupported element type: {type(value).__name__}")
    return value


def _shape_of(data):
    shape = []
    while isinstance(data, (list, tuple, ndarray)):
        if isinstance(data, ndarray):
            shape.extend(data._shape)
            break
        shape.append(len(data))
        if not data:
            break
        data = data[0]
    return tuple(shape)


def _flatten(data, shape, depth=0):
    if isinstance(data, ndarray):
        if data._shape != tuple(shape[depth:]):
            raise ValueError("setting an array element with a sequence: inhomogeneous shape")
        return list(data._flat)
    if depth == len(shape):
        if isinstance(data, (list, tuple)):
            raise ValueError("setting an array element with a sequence: inhomogeneous shape")
        return [_check_element(data)]
    if not isinstance(data, (list, tuple)) or len(data) != shape[depth]:
        raise ValueError("setting an array element with a sequence: inhomogeneous shape")
    out = []
    for item in data:
        out.extend(_flatten(item, shape, depth + 1))
    return out


def _nest(flat, shape):
    if not shape:
        return flat[0]
    if len(shape) == 1:
        return list(flat)
    step = _prod(shape[1:])
    return [_nest(flat[i * step:(i + 1) * step], shape[1:]) for i in range(shape[0])]


def _infer(flat):
    if not flat:
        return "float64"
    if all(isinstance(v, bool) for v in flat):
        return "bool"
    if all(isinstance(v, int) for v in flat):
        return "int64"
    return "float64"


def _dtype_name(dtype):
    if dtype is None:
        return None
    if isinstance(dtype, str):
        name = dtype
    elif dtype is bool or dtype is bool_:
        name = "bool"
    elif dtype is int or dtype is int64:
        name = "int64"
    elif dtype is float or dtype is float64:
        name = "float64"
    else:
        raise TypeError(f"data type {dtype!r} not understood")
    aliases = {"int": "int64", "float": "float64", "int32": "int64", "float32": "float64"}
    name = aliases.get(name, name)
    if name not in ("bool", "int64", "float64"):
        raise TypeError(f"data type {dtype!r} not understood")
    return name


def _cast(value, dtype):
    if dtype == "bool":
        return bool(value)
    if dtype == "int64":
        return int(value)
    return float(value)


def _scalar(value):
    if isinstance(value, bool):
        return bool_(value)
    if isinstance(value, int):
        return int64(value)
    if isinstance(value, float):
        return float64(value)
    return value


def _normalize_shape(shape):
    if isinstance(shape, (int, generic)):
        return (int(shape),)
    return tuple(int(s) for s in shape)


class generic:
    """Base class of the scalar types returned by reductions and indexing."""

    def __init__(self, value=0):
        self._value = self._convert(_unwrap(value))

    @staticmethod
    def _convert(value):
        return value

    def item(self):
        return self._value

    def __repr__(self):
        return repr(self._value)

    def __str__(self):
        return str(self._value)

    def __int__(self):
        return int(self._value)

    def __float__(self):
        return float(self._value)

    def __bool__(self):
        return bool(self._value)

    def __hash__(self):
        return hash(self._value)

    def __neg__(self):
        return _scalar(-self._value)

    def __abs__(self):
        return _scalar(abs(self._value))


class bool_(generic):
    _convert = staticmethod(bool)


class int64(generic):
    _convert = staticmethod(int)

    def __index__(self):
        return self._value


class float64(generic):
    _convert = staticmethod(float)


def _scalar_op(op):
    def method(self, other):
        if isinstance(other, ndarray):
            return NotImplemented
        return _scalar(op(self._value, _unwrap(other)))
    return method


def _scalar_rop(op):
    def method(self, other):
        return _scalar(op(_unwrap(other), self._value))
    return method


def _scalar_cmp(op):
    def method(self, other):
        if isinstance(other, ndarray):
            return NotImplemented
        return op(self._value, _unwrap(other))
    return method


_ARITHMETIC = (
    ("add", lambda a, b: a + b),
    ("sub", lambda a, b: a - b),
    ("mul", lambda a, b: a * b),
    ("truediv", lambda a, b: a / b),
    ("floordiv", lambda a, b: a // b),
    ("mod", lambda a, b: a % b),
    ("pow", lambda a, b: a ** b),
)

_COMPARISON = (
    ("eq", lambda a, b: a == b),
    ("ne", lambda a, b: a != b),
    ("lt", lambda a, b: a < b),
    ("le", lambda a, b: a <= b),
    ("gt", lambda a, b: a > b),
    ("ge", lambda a, b: a >= b),
)

for _name, _op in _ARITHMETIC:
    setattr(generic, f"__{_name}__", _scalar_op(_op))
    setattr(generic, f"__r{_name}__", _scalar_rop(_op))
for _name, _op in _COMPARISON:
    setattr(generic, f"__{_name}__", _scalar_cmp(_op))


def _broadcast(left, right):
    ls, rs = left._shape, right._shape
    if ls == rs:
        return left._flat, right._flat, ls
    if len(right._flat) == 1:
        return left._flat, right._flat * len(left._flat), ls
    if len(left._flat) == 1:
        return left._flat * len(right._flat), right._flat, rs
    if len(rs) < len(ls) and ls[len(ls) - len(rs):] == rs:
        return left._flat, right._flat * (len(left._flat) // len(right._flat)), ls
    if len(ls) < len(rs) and rs[len(rs) - len(ls):] == ls:
        return left._flat * (len(right._flat) // len(left._flat)), right._flat, rs
    raise ValueError(f"operands could not be broadcast together with shapes {ls} {rs}")


def _axis(axis, ndim):
    axis = int(axis)
    if axis < 0:
        axis += ndim
    if not 0 <= axis < ndim:
        raise ValueError(f"axis {axis} is out of bounds for array of dimension {ndim}")
    return axis


def _mean(values):
    return _sum(values) / len(values)


def _checked(name, fn):
    def reduce(values):
        if not values:
            raise ValueError(f"zero-size array to reduction operation {name} which has no identity")
        return fn(values)
    return reduce


class ndarray:
    """Dense row-major array of bool, int64 or float64 elements."""

    _guarded_writes = True
    __hash__ = None

    def __init__(self, data, shape=None, dtype=None):
        inferred = _shape_of(data)
        flat = _flatten(data, inferred)
        if shape is not None:
            shape = _normalize_shape(shape)
            if _prod(shape) != len(flat):
                raise ValueError(f"cannot reshape array of size {len(flat)} into shape {shape}")
        else:
            shape = inferred
        dtype = _dtype_name(dtype)
        if dtype is None:
            dtype = data._dtype if isinstance(data, ndarray) else _infer(flat)
        self._flat = [_cast(v, dtype) for v in flat]
        self._shape = shape
        self._dtype = dtype
        self._setup()

    def _setup(self):
        pass

    @classmethod
    def _from_flat(cls, flat, shape, dtype):
        out = object.__new__(cls)
        out._flat = [_cast(v, dtype) for v in flat]
        out._shape = tuple(shape)
        out._dtype = dtype
        out._setup()
        return out

    def _wrap(self, flat, shape, dtype=None):
        return type(self)._from_flat(flat, shape, dtype or _infer(flat))

    def _element(self, value):
        return _scalar(value)

    # ── attributes ────────────────────────────────────────────────────────

    @property
    def shape(self):
        return self._shape

    @property
    def ndim(self):
        return len(self._shape)

    @property
    def size(self):
        return len(self._flat)

    @property
    def dtype(self):
        return self._dtype

    @property
    def T(self):
        return self.transpose()

    # ── conversion ────────────────────────────────────────────────────────

    def tolist(self):
        return _nest(self._flat, self._shape)

    def item(self):
        if len(self._flat) != 1:
            raise ValueError("can only convert an array of size 1 to a Python scalar")
        return self._flat[0]

    def copy(self):
        return self._wrap(list(self._flat), self._shape, self._dtype)

    def astype(self, dtype):
        return self._wrap(list(self._flat), self._shape, _dtype_name(dtype))

    def reshape(self, *shape):
        if len(shape) == 1 and not isinstance(shape[0], (int, generic)):
            shape = shape[0]
        shape = list(_normalize_shape(shape))
        if shape.count(-1) > 1:
            raise ValueError("can only specify one unknown dimension")
        if -1 in shape:
            known = _prod(s for s in shape if s != -1)
            if known == 0 or len(self._flat) % known:
                raise ValueError(f"cannot reshape array of size {len(self._flat)} into shape {tuple(shape)}")
            shape[shape.index(-1)] = len(self._flat) // known
        if _prod(shape) != len(self._flat):
            raise ValueError(f"cannot reshape array of size {len(self._flat)} into shape {tuple(shape)}")
        return self._wrap(list(self._flat), tuple(shape), self._dtype)

    def flatten(self):
        return self._wrap(list(self._flat), (len(self._flat),), self._dtype)

    ravel = flatten

    def transpose(self):
        if len(self._shape) < 2:
            return self.copy()
        shape = tuple(reversed(self._shape))
        flat = []
        for position in range(len(self._flat)):
            index = []
            rest = position
            for dim in reversed(shape):
                index.append(rest % dim)
                rest //= dim
            source = 0
            for dim, i in zip(self._shape, index):
                source = source * dim + i
            flat.append(self._flat[source])
        return self._wrap(flat, shape, self._dtype)

    # ── indexing ──────────────────────────────────────────────────────────

    def _positions(self, key):
        if not isinstance(key, tuple):
            key = (key,)
        if len(key) > len(self._shape):
            raise IndexError("too many indices for array")
        key = key + (slice(None),) * (len(self._shape) - len(key))
        positions = [0]
        shape = []
        for axis, k in enumerate(key):
            n = self._shape[axis]
            if isinstance(k, slice):
                indices = list(range(*k.indices(n)))
                shape.append(len(indices))
            elif isinstance(k, (int, generic)):
                i = int(k)
                if i < 0:
                    i += n
                if not 0 <= i < n:
                    raise IndexError(f"index {int(k)} is out of bounds for axis {axis} with size {n}")
                indices = [i]
            else:
                raise IndexError("only integers and slices are valid indices")
            stride = _prod(self._shape[axis + 1:])
            positions = [p + i * stride for p in positions for i in indices]
        return positions, tuple(shape)

    def __getitem__(self, key):
        positions, shape = self._positions(key)
        values = [self._flat[p] for p in positions]
        if not shape:
            return self._element(values[0])
        return self._wrap(values, shape, self._dtype)

    def __setitem__(self, key, value):
        positions, _ = self._positions(key)
        if isinstance(value, (list, tuple, ndarray)):
            values = ndarray(value)._flat
        else:
            values = [_check_element(value)]
        if len(values) == 1:
            values = values * len(positions)
        if len(values) != len(positions):
            raise ValueError(f"could not assign {len(values)} values to {len(positions)} positions")
        for p, v in zip(positions, values):
            self._flat[p] = _cast(v, self._dtype)

    def __len__(self):
        if not self._shape:
            raise TypeError("len() of unsized object")
        return self._shape[0]

    def __iter__(self):
        for i in range(len(self)):
            yield self[i]

    def __bool__(self):
        if len(self._flat) != 1:
            raise ValueError(
                "The truth value of an array with more than one element is ambiguous. Use a.any() or a.all()"
            )
        return bool(self._flat[0])

    def __repr__(self):
        return f"array({self.tolist()!r})"

    __str__ = __repr__

    # ── arithmetic ────────────────────────────────────────────────────────

    def _binary(self, other, op, reflected=False):
        if not isinstance(other, ndarray):
            other = ndarray(other)
        left, right, shape = _broadcast(self, other)
        if reflected:
            left, right = right, left
        return self._wrap([op(a, b) for a, b in zip(left, right)], shape)

    def _unary(self, op):
        return self._wrap([op(v) for v in self._flat], self._shape)

    def __neg__(self):
        return self._unary(lambda v: -v)

    def __pos__(self):
        return self.copy()

    def __abs__(self):
        return self._unary(abs)

    def __matmul__(self, other):
        return dot(self, other)

    def __rmatmul__(self, other):
        return dot(other, self)

    # ── reductions ────────────────────────────────────────────────────────

    def _reduce(self, fn, axis):
        if axis is None:
            return self._element(fn(self._flat))
        axis = _axis(axis, len(self._shape))
        outer = _prod(self._shape[:axis])
        n = self._shape[axis]
        inner = _prod(self._shape[axis + 1:])
        out = []
        for o in range(outer):
            for i in range(inner):
                out.append(fn([self._flat[(o * n + k) * inner + i] for k in range(n)]))
        return self._wrap(out, self._shape[:axis] + self._shape[axis + 1:])

    def sum(self, axis=None):
        return self._reduce(_sum, axis)

    def mean(self, axis=None):
        return self._reduce(_checked("mean", _mean), axis)

    def max(self, axis=None):
        return self._reduce(_checked("maximum", _max), axis)

    def min(self, axis=None):
        return self._reduce(_checked("minimum", _min), axis)

    def prod(self, axis=None):
        return self._reduce(_prod, axis)

    def any(self):
        return any(self._flat)

    def all(self):
        return all(self._flat)

    def argmax(self):
        values = _checked("argmax", list)(self._flat)
        return int64(values.index(_max(values)))

    def argmin(self):
        values = _checked("argmin", list)(self._flat)
        return int64(values.index(_min(values)))

    def dot(self, other):
        return dot(self, other)


def _array_op(op):
    def method(self, other):
        return self._binary(other, op)
    return method


def _array_rop(op):
    def method(self, other):
        return self._binary(other, op, reflected=True)
    return method


for _name, _op in _ARITHMETIC:
    setattr(ndarray, f"__{_name}__", _array_op(_op))
    setattr(ndarray, f"__r{_name}__", _array_rop(_op))
for _name, _op in _COMPARISON:
    setattr(ndarray, f"__{_name}__", _array_op(_op))


# ── constructors ──────────────────────────────────────────────────────────────

def array(data, dtype=None):
    return ndarray(data, dtype=dtype)


def asarray(data, dtype=None):
    if isinstance(data, ndarray) and (dtype is None or _dtype_name(dtype) == data._dtype):
        return data
    return ndarray(data, dtype=dtype)


def full(shape, fill_value, dtype=None):
    shape = _normalize_shape(shape)
    fill_value = _check_element(fill_value)
    dtype = _dtype_name(dtype) or _infer([fill_value])
    return ndarray._from_flat([fill_value] * _prod(shape), shape, dtype)


def zeros(shape, dtype="float64"):
    return full(shape, 0, dtype)


def ones(shape, dtype="float64"):
    return full(shape, 1, dtype)


def arange(start, stop=None, step=1, dtype=None):
    if stop is None:
        start, stop = 0, start
    start, stop, step = _unwrap(start), _unwrap(stop), _unwrap(step)
    if step == 0:
        raise ValueError("step must not be zero")
    count = _max(0, math.ceil((stop - start) / step))
    flat = [start + i * step for i in range(count)]
    return ndarray._from_flat(flat, (count,), _dtype_name(dtype) or (_infer(flat) if flat else "int64"))


def linspace(start, stop, num=50, endpoint=True):
    num = int(num)
    if num < 0:
        raise ValueError(f"Number of samples, {num}, must be non-negative.")
    if num == 1:
        return ndarray._from_flat([float(start)], (1,), "float64")
    div = (num - 1) if endpoint else num
    step = (stop - start) / div if div else 0.0
    flat = [float(start + i * step) for i in range(num)]
    if endpoint and num > 1:
        flat[-1] = float(stop)
    return ndarray._from_flat(flat, (num,), "float64")


# ── functions ─────────────────────────────────────────────────────────────────

def sum(a, axis=None):
    return asarray(a).sum(axis)


def mean(a, axis=None):
    return asarray(a).mean(axis)


def max(a, axis=None):
    return asarray(a).max(axis)


def min(a, axis=None):
    return asarray(a).min(axis)


def prod(a, axis=None):
    return asarray(a).prod(axis)


def _elementwise(fn):
    def apply(x):
        if isinstance(x, (list, tuple, ndarray)):
            return asarray(x)._unary(fn)
        return float64(fn(_unwrap(x)))
    return apply


sqrt = _elementwise(math.sqrt)
exp = _elementwise(math.exp)
log = _elementwise(math.log)
sin = _elementwise(math.sin)
cos = _elementwise(math.cos)
absolute = _elementwise(abs)


def dot(a, b):
    a, b = asarray(a), asarray(b)
    if a.ndim == 0 or b.ndim == 0:
        return a * b
    if a.ndim > 2 or b.ndim > 2:
        raise ValueError("dot is only supported for arrays of at most two dimensions")
    if a.ndim == 1 and b.ndim == 1:
        if len(a._flat) != len(b._flat):
            raise ValueError(f"shapes {a.shape} and {b.shape} not aligned")
        return a._element(_sum(x * y for x, y in zip(a._flat, b._flat)))
    left = a if a.ndim == 2 else a.reshape(1, -1)
    right = b if b.ndim == 2 else b.reshape(-1, 1)
    n, k = left._shape
    k2, m = right._shape
    if k != k2:
        raise ValueError(f"shapes {a.shape} and {b.shape} not aligned")
    flat = []
    for i in range(n):
        for j in range(m):
            total = 0
            for t in range(k):
                total += left._flat[i * k + t] * right._flat[t * m + j]
            flat.append(total)
    if a.ndim == 1:
        shape = (m,)
    elif b.ndim == 1:
        shape = (n,)
    else:
        shape = (n, m)
    return a._wrap(flat, shape)


matmul = dot
"#,
        module_name = "numeric"
    ));

    vm.add_frozen(rustpython_vm::py_freeze!(
        source = r#"
"""Tensors on top of numeric arrays."""

import numeric

__version__ = "0.1.0"


def _size(args):
    if len(args) == 1 and isinstance(args[0], (list, tuple)):
        return tuple(args[0])
    return tuple(args)


class Tensor(numeric.ndarray):
    """An ndarray with tensor naming and a `requires_grad` flag."""

    def __init__(self, data, dtype=None, requires_grad=False):
        numeric.ndarray.__init__(self, data, dtype=dtype)
        self.requires_grad = bool(requires_grad)

    def _setup(self):
        self.requires_grad = False

    def _element(self, value):
        return type(self)._from_flat([value], (), numeric._infer([value]))

    def detach(self):
        return Tensor._from_flat(list(self._flat), self._shape, self._dtype)

    def numpy(self):
        if self.requires_grad:
            raise RuntimeError(
                "Can't call numpy() on Tensor that requires grad. Use tensor.detach().numpy() instead."
            )
        return numeric.ndarray._from_flat(list(self._flat), self._shape, self._dtype)

    def size(self, dim=None):
        if dim is None:
            return self._shape
        return self._shape[numeric._axis(dim, len(self._shape))]

    def dim(self):
        return len(self._shape)

    def numel(self):
        return len(self._flat)

    def requires_grad_(self, requires_grad=True):
        self.requires_grad = bool(requires_grad)
        return self

    def __repr__(self):
        body = self.tolist()
        if self.requires_grad:
            return f"tensor({body!r}, requires_grad=True)"
        return f"tensor({body!r})"

    __str__ = __repr__


def tensor(data, dtype=None, requires_grad=False):
    return Tensor(data, dtype=dtype, requires_grad=requires_grad)


def from_numpy(array):
    return Tensor(array)


def zeros(*size, dtype="float64"):
    return Tensor(numeric.zeros(_size(size), dtype))


def ones(*size, dtype="float64"):
    return Tensor(numeric.ones(_size(size), dtype))


def full(size, fill_value, dtype=None):
    return Tensor(numeric.full(size, fill_value, dtype))


def arange(start, end=None, step=1, dtype=None):
    return Tensor(numeric.arange(start, end, step, dtype))


def linspace(start, end, steps):
    return Tensor(numeric.linspace(start, end, steps))


def stack(tensors, dim=0):
    if dim != 0:
        raise ValueError("stack only supports dim=0")
    return Tensor([numeric.asarray(t).tolist() for t in tensors])


def is_tensor(obj):
    return isinstance(obj, Tensor)
"#,
        module_name = "tensor"
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::build_interpreter;
    use rustpython_vm::compiler::Mode;

    /// Runs `source` and returns `str(result)` from the scope.
    fn eval(source: &str) -> String {
        let interp = build_interpreter();
        interp.with_vm(|vm| {
            let scope = vm.new_scope_with_builtins();
            let code = vm
                .compile(source, Mode::Exec, "<test>".to_owned())
                .expect("test source compiles");
            if let Err(exc) = vm.run_code_obj(code, scope.clone()) {
                let mut traceback = String::new();
                let _ = vm.write_exception(&mut traceback, &exc);
                panic!("test source raised:\n{traceback}");
            }
            let result = scope
                .globals
                .get_item("result", vm)
                .expect("result is set");
            result.str(vm).expect("str").as_str().to_owned()
        })
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_versions_match() {
        assert_eq!(eval("import tensor\nresult = tensor.__version__"), TENSOR_VERSION);
        assert_eq!(eval("import numeric\nresult = numeric.__version__"), NUMERIC_VERSION);
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_array_arithmetic_and_reduction() {
        let out = eval(
            "import numeric as np\n\
             a = np.array([[1, 2], [3, 4]])\n\
             result = ((a * 2 + 1).tolist(), a.sum(), a.sum(axis=0).tolist(), a.shape, a.dtype)",
        );
        assert_eq!(out, "([[3, 5], [7, 9]], 10, [4, 6], (2, 2), 'int64')");
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_array_indexing_and_assignment() {
        let out = eval(
            "import numeric as np\n\
             a = np.arange(6).reshape(2, 3)\n\
             a[0, 1] = 10\n\
             result = (a[0].tolist(), a[:, 2].tolist(), a[1, -1], a.T.shape)",
        );
        assert_eq!(out, "([0, 10, 2], [2, 5], 5, (3, 2))");
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_matmul() {
        let out = eval(
            "import numeric as np\n\
             a = np.array([[1, 2], [3, 4]])\n\
             b = np.array([1, 1])\n\
             result = ((a @ a).tolist(), np.dot(a, b).tolist(), np.dot(b, b))",
        );
        assert_eq!(out, "([[7, 10], [15, 22]], [3, 7], 2)");
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_tensor_surface() {
        let out = eval(
            "import tensor\n\
             t = tensor.tensor([[1.0, 2.0], [3.0, 4.0]], requires_grad=True)\n\
             result = (t.size(), t.size(1), t.dim(), t.numel(), t.detach().numpy().tolist(), repr(t[0, 0]))",
        );
        assert_eq!(
            out,
            "((2, 2), 2, 2, 4, [[1.0, 2.0], [3.0, 4.0]], 'tensor(1.0)')"
        );
    }

    #[test]
    #[ignore = "slow: VM init per test"]
    fn test_tensor_numpy_requires_detach() {
        let out = eval(
            "import tensor\n\
             t = tensor.ones(2).requires_grad_()\n\
             try:\n    t.numpy()\n    result = 'no error'\n\
             except RuntimeError as err:\n    result = 'detach' in str(err)",
        );
        assert_eq!(out, "True");
    }
}
