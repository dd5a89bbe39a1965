//! The module allow-list: which modules user code can reach, and under which names.
//!
//! The configuration is a snippet of import statements
//! (`"import tensor; import numeric as np; from math import pi"`). It is parsed
//! structurally into [`ModuleSpec`]s once, and [`ModuleRegistry::resolve`]
//! materializes the specs inside an interpreter whenever a namespace is built.
//!
//! Anything but plain absolute imports is rejected up front, so a registry is
//! either complete or never built.

use rustpython_parser::{ast, Parse};
use rustpython_vm::{builtins::PyBaseExceptionRef, AsObject, PyObjectRef, PyResult, VirtualMachine};

use crate::fault::SandboxFault;
use crate::translate::{exception_detail, line_of_offset};
use crate::types::DEFAULT_MODULES;

/// One bound name and the module (or module attribute) it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    /// Name visible to user code.
    pub alias: String,
    /// Fully qualified target, e.g. `numeric` or `math.pi`.
    pub target: String,
}

/// Immutable, parsed module configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRegistry {
    specs: Vec<ModuleSpec>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        // The default configuration is a constant and always parses.
        Self::parse(DEFAULT_MODULES).unwrap_or(Self { specs: Vec::new() })
    }
}

impl ModuleRegistry {
    /// Parses a configuration string.
    ///
    /// `import X` binds `X`, `import X as Y` binds `Y`, `import X.Y` binds the
    /// root package `X`, and `from X import Y [as Z]` binds `Y` (or `Z`) to
    /// `X.Y`. Relative imports, star imports, and any non-import statement are
    /// a [`FaultKind::ModuleConfig`](crate::FaultKind::ModuleConfig) fault.
    pub fn parse(config: &str) -> Result<Self, SandboxFault> {
        let suite = ast::Suite::parse(config, "<modules>").map_err(|err| {
            let line = line_of_offset(config, usize::from(err.offset));
            SandboxFault::module_config(format!(
                "the module configuration contains syntax errors (line {line}): {}",
                err.error
            ))
        })?;

        let mut specs = Vec::new();
        for stmt in &suite {
            match stmt {
                ast::Stmt::Import(import) => {
                    for alias in &import.names {
                        let name = alias.name.as_str();
                        let spec = match &alias.asname {
                            Some(asname) => ModuleSpec {
                                alias: asname.as_str().to_string(),
                                target: name.to_string(),
                            },
                            None => ModuleSpec {
                                alias: name.split('.').next().unwrap_or(name).to_string(),
                                target: name.to_string(),
                            },
                        };
                        specs.push(spec);
                    }
                }
                ast::Stmt::ImportFrom(import) => {
                    let level = import.level.as_ref().map_or(0, |level| level.to_u32());
                    let module = match (&import.module, level) {
                        (Some(module), 0) => module.as_str(),
                        _ => {
                            return Err(SandboxFault::module_config(
                                "relative imports are not supported in the module configuration",
                            ))
                        }
                    };
                    for alias in &import.names {
                        let name = alias.name.as_str();
                        if name == "*" {
                            return Err(SandboxFault::module_config(format!(
                                "star imports are not supported in the module configuration: from {module} import *"
                            )));
                        }
                        specs.push(ModuleSpec {
                            alias: alias
                                .asname
                                .as_ref()
                                .map_or(name, |asname| asname.as_str())
                                .to_string(),
                            target: format!("{module}.{name}"),
                        });
                    }
                }
                other => {
                    let line = line_of_offset(config, usize::from(ast::Ranged::start(other)));
                    return Err(SandboxFault::module_config(format!(
                        "the module configuration may only contain import statements (line {line})"
                    )));
                }
            }
        }

        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[ModuleSpec] {
        &self.specs
    }

    /// Bound names, in configuration order.
    pub fn aliases(&self) -> Vec<&str> {
        self.specs.iter().map(|spec| spec.alias.as_str()).collect()
    }

    /// Imports every target and returns `(alias, object)` bindings.
    ///
    /// Modules load from the frozen set and the native stdlib compiled into
    /// the interpreter. An unresolvable target is a module-configuration fault.
    pub(crate) fn resolve(
        &self,
        vm: &VirtualMachine,
    ) -> Result<Vec<(String, PyObjectRef)>, SandboxFault> {
        self.specs
            .iter()
            .map(|spec| {
                resolve_spec(vm, spec)
                    .map(|object| (spec.alias.clone(), object))
                    .map_err(|exc| config_fault(vm, spec, &exc))
            })
            .collect()
    }
}

fn resolve_spec(vm: &VirtualMachine, spec: &ModuleSpec) -> PyResult<PyObjectRef> {
    match import_module(vm, &spec.target) {
        // `import X.Y` binds the root package, like the import statement does.
        Ok(module) if spec.target.starts_with(&format!("{}.", spec.alias)) => {
            import_module(vm, &spec.alias).or(Ok(module))
        }
        Ok(module) => Ok(module),
        Err(exc) => {
            // `from X import Y` where Y is an attribute rather than a submodule.
            let Some((parent, attr)) = spec.target.rsplit_once('.') else {
                return Err(exc);
            };
            let parent = import_module(vm, parent)?;
            let attr = vm.ctx.new_str(attr);
            parent.get_attr(&attr, vm).map_err(|_| exc)
        }
    }
}

/// Imports `name` through the interpreter's own `__import__` and returns the
/// module from `sys.modules` (not the root package `__import__` hands back).
pub(crate) fn import_module(vm: &VirtualMachine, name: &str) -> PyResult<PyObjectRef> {
    let import = vm.builtins.get_attr("__import__", vm)?;
    import.call((vm.ctx.new_str(name),), vm)?;
    let modules = vm.sys_module.get_attr("modules", vm)?;
    vm.call_method(&modules, "__getitem__", (vm.ctx.new_str(name),))
}

fn config_fault(vm: &VirtualMachine, spec: &ModuleSpec, exc: &PyBaseExceptionRef) -> SandboxFault {
    let class_name = exc.class().name().to_string();
    SandboxFault::module_config(format!(
        "cannot bind '{}' to '{}': {}: {}",
        spec.alias,
        spec.target,
        class_name,
        exception_detail(vm, exc)
    ))
}
