// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Explicit catalogue of user modules, functions and classes.
//!
//! A container resolves its [`FunctionDefinition`] against a
//! [`FunctionRegistry`] built by the embedding binary. Resolution failures are
//! startup failures: they are reported once for the whole invocation before
//! any input is fetched.
//!
//! # Example
//!
//! ```ignore
//! use polyester_runtime::{Callable, FunctionRegistry, Module};
//!
//! let registry = FunctionRegistry::new().with_module(
//!     Module::new("functions")
//!         .function("square", Callable::plain(|args| Ok(args.arg::<i64>(0)?.pow(2)))),
//! );
//! ```

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::failure::panic_to_raised;
use crate::function::{Callable, ExecutionShape, Raised};
use crate::types::FunctionDefinition;

/// A user class whose methods can be invoked as container functions.
///
/// One instance is constructed per container. `enter` runs before the first
/// input and `exit` after the last output has been flushed.
#[async_trait]
pub trait UserClass: Send + Sync + 'static {
    async fn enter(&self) -> Result<(), Raised> {
        Ok(())
    }

    async fn exit(&self) {}

    /// The method `name` bound to this instance.
    fn method(self: Arc<Self>, name: &str) -> Option<Callable>;
}

type Constructor = dyn Fn() -> Result<Arc<dyn UserClass>, Raised> + Send + Sync;
type Loader = dyn Fn() -> Result<(), Raised> + Send + Sync;

#[derive(Clone)]
pub struct ClassDef {
    name: String,
    constructor: Arc<Constructor>,
}

impl ClassDef {
    pub fn new<F, T>(name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> Result<T, Raised> + Send + Sync + 'static,
        T: UserClass,
    {
        Self {
            name: name.into(),
            constructor: Arc::new(move || {
                constructor().map(|obj| Arc::new(obj) as Arc<dyn UserClass>)
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef").field("name", &self.name).finish()
    }
}

/// A named group of functions and classes.
#[derive(Clone)]
pub struct Module {
    name: String,
    guarded: bool,
    loader: Option<Arc<Loader>>,
    functions: HashMap<String, Callable>,
    classes: HashMap<String, ClassDef>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guarded: true,
            loader: None,
            functions: HashMap::new(),
            classes: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(mut self, name: impl Into<String>, callable: Callable) -> Self {
        self.functions.insert(name.into(), callable);
        self
    }

    pub fn class(mut self, class: ClassDef) -> Self {
        self.classes.insert(class.name.clone(), class);
        self
    }

    /// Hook run when the module is resolved. A raised signal or panic is an
    /// import failure.
    pub fn with_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn() -> Result<(), Raised> + Send + Sync + 'static,
    {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Mark the module as running its entrypoint when loaded, outside an
    /// entrypoint guard. Such a module cannot be used inside a container.
    pub fn unguarded(mut self) -> Self {
        self.guarded = false;
        self
    }

    fn load(&self) -> Result<(), Raised> {
        match &self.loader {
            Some(loader) => std::panic::catch_unwind(AssertUnwindSafe(|| loader()))
                .unwrap_or_else(|payload| Err(panic_to_raised(payload))),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut functions: Vec<_> = self.functions.keys().collect();
        functions.sort();
        let mut classes: Vec<_> = self.classes.keys().collect();
        classes.sort();
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("guarded", &self.guarded)
            .field("functions", &functions)
            .field("classes", &classes)
            .finish()
    }
}

/// Why a [`FunctionDefinition`] could not be turned into a callable.
#[derive(Debug, Clone, Error)]
pub enum StartupError {
    #[error("no module named '{0}'")]
    ModuleNotFound(String),

    #[error("module '{module}' failed to load")]
    LoadFailed { module: String, raised: Raised },

    #[error("module '{0}' runs its entrypoint when loaded")]
    Unguarded(String),

    #[error("module '{module}' has no function '{function}'")]
    FunctionNotFound { module: String, function: String },

    #[error("module '{module}' has no class '{class}'")]
    ClassNotFound { module: String, class: String },

    #[error("class '{class}' has no method '{method}'")]
    MethodNotFound { class: String, method: String },

    #[error("'{name}' is declared {declared} but is {actual}")]
    ShapeMismatch {
        name: String,
        declared: ExecutionShape,
        actual: ExecutionShape,
    },

    /// A class instance raised or panicked in one of its lifecycle stages
    #[error("'{class}' failed during {stage}")]
    Lifecycle {
        class: String,
        stage: &'static str,
        raised: Raised,
    },
}

impl StartupError {
    /// Extra guidance appended to the startup traceback.
    pub fn hint(&self) -> Option<String> {
        match self {
            StartupError::Unguarded(module) => Some(format!(
                "module '{module}' has no entrypoint guard; move the code that starts the \
                 app behind an entrypoint guard so loading the module only registers functions"
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Init,
    Enter,
    Call,
    Exit,
}

/// Lifecycle events of class instances, owned by whoever runs the container.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<(String, LifecycleEvent)>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, class: &str, event: LifecycleEvent) {
        debug!(class = %class, event = ?event, "Lifecycle event");
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((class.to_string(), event));
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.entries().into_iter().map(|(_, e)| e).collect()
    }

    pub fn entries(&self) -> Vec<(String, LifecycleEvent)> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// A constructed class instance backing a `Class.method` target.
#[derive(Clone)]
pub struct Instance {
    pub class: String,
    pub object: Arc<dyn UserClass>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance").field("class", &self.class).finish_non_exhaustive()
    }
}

/// A resolved callable, ready to dispatch.
#[derive(Debug, Clone)]
pub struct Target {
    pub qualname: String,
    pub callable: Callable,
    pub instance: Option<Instance>,
}

#[derive(Debug, Clone, Default)]
pub struct FunctionRegistry {
    modules: HashMap<String, Module>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, module: Module) -> Self {
        self.register(module);
        self
    }

    /// Add `module`, replacing any module of the same name.
    pub fn register(&mut self, module: Module) {
        self.modules.insert(module.name.clone(), module);
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    /// Load the module named by `def` and look up its callable.
    ///
    /// For `Class.method` targets this constructs the instance and records
    /// `Init` in `events`; entering it is left to the caller.
    pub fn resolve(
        &self,
        def: &FunctionDefinition,
        events: &EventLog,
    ) -> Result<Target, StartupError> {
        let module = self
            .modules
            .get(&def.module_name)
            .ok_or_else(|| StartupError::ModuleNotFound(def.module_name.clone()))?;

        module.load().map_err(|raised| StartupError::LoadFailed {
            module: module.name.clone(),
            raised,
        })?;
        if !module.guarded {
            return Err(StartupError::Unguarded(module.name.clone()));
        }

        let (callable, instance) = match def.function_name.split_once('.') {
            Some((class, method)) => {
                let class_def =
                    module
                        .classes
                        .get(class)
                        .ok_or_else(|| StartupError::ClassNotFound {
                            module: module.name.clone(),
                            class: class.to_string(),
                        })?;
                let lifecycle = |stage: &'static str, raised: Raised| StartupError::Lifecycle {
                    class: class.to_string(),
                    stage,
                    raised,
                };
                let object = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    (class_def.constructor)()
                }))
                .unwrap_or_else(|payload| Err(panic_to_raised(payload)))
                .map_err(|raised| lifecycle("construction", raised))?;
                events.record(class, LifecycleEvent::Init);
                let callable = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    object.clone().method(method)
                }))
                .map_err(|payload| lifecycle("method lookup", panic_to_raised(payload)))?
                .ok_or_else(|| StartupError::MethodNotFound {
                    class: class.to_string(),
                    method: method.to_string(),
                })?;
                let instance = Instance {
                    class: class.to_string(),
                    object,
                };
                (callable, Some(instance))
            }
            None => {
                let callable = module.functions.get(&def.function_name).cloned().ok_or_else(
                    || StartupError::FunctionNotFound {
                        module: module.name.clone(),
                        function: def.function_name.clone(),
                    },
                )?;
                (callable, None)
            }
        };

        if callable.shape() != def.shape {
            return Err(StartupError::ShapeMismatch {
                name: def.qualified_name(),
                declared: def.shape,
                actual: callable.shape(),
            });
        }

        debug!(qualname = %def.qualified_name(), shape = %def.shape, "Resolved function");
        Ok(Target {
            qualname: def.qualified_name(),
            callable,
            instance,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::function::FunctionArgs;

    struct Counter {
        base: i64,
    }

    #[async_trait]
    impl UserClass for Counter {
        fn method(self: Arc<Self>, name: &str) -> Option<Callable> {
            match name {
                "add" => Some(Callable::plain(move |args: FunctionArgs| {
                    Ok(self.base + args.arg::<i64>(0)?)
                })),
                _ => None,
            }
        }
    }

    fn registry() -> FunctionRegistry {
        FunctionRegistry::new()
            .with_module(
                Module::new("functions")
                    .function("square", Callable::plain(|args| Ok(args.arg::<i64>(0)?.pow(2))))
                    .class(ClassDef::new("Counter", || Ok(Counter { base: 10 }))),
            )
            .with_module(
                Module::new("broken")
                    .with_loader(|| Err(Raised::exception("ImportError", "no module named 'nope'"))),
            )
            .with_module(Module::new("script").unguarded())
    }

    fn def(module: &str, function: &str, shape: ExecutionShape) -> FunctionDefinition {
        FunctionDefinition::new(module, function, shape)
    }

    #[test]
    fn test_resolve_plain_function() {
        let target = registry()
            .resolve(&def("functions", "square", ExecutionShape::Plain), &EventLog::new())
            .unwrap();
        assert_eq!(target.qualname, "functions.square");
        assert!(target.instance.is_none());
        let Callable::Plain(f) = target.callable else {
            panic!("expected plain callable");
        };
        assert_eq!(f(FunctionArgs::positional(vec![json!(3)])).unwrap(), json!(9));
    }

    #[test]
    fn test_resolve_class_method_records_init() {
        let events = EventLog::new();
        let target = registry()
            .resolve(&def("functions", "Counter.add", ExecutionShape::Plain), &events)
            .unwrap();
        assert_eq!(target.instance.as_ref().map(|i| i.class.as_str()), Some("Counter"));
        assert_eq!(events.events(), vec![LifecycleEvent::Init]);
    }

    #[test]
    fn test_resolution_failures() {
        let events = EventLog::new();
        let r = registry();
        let cases = [
            (def("missing", "f", ExecutionShape::Plain), "ModuleNotFound"),
            (def("broken", "f", ExecutionShape::Plain), "LoadFailed"),
            (def("script", "f", ExecutionShape::Plain), "Unguarded"),
            (def("functions", "cube", ExecutionShape::Plain), "FunctionNotFound"),
            (def("functions", "Nope.add", ExecutionShape::Plain), "ClassNotFound"),
            (def("functions", "Counter.sub", ExecutionShape::Plain), "MethodNotFound"),
            (def("functions", "square", ExecutionShape::Generator), "ShapeMismatch"),
        ];
        for (d, expected) in cases {
            let err = r.resolve(&d, &events).unwrap_err();
            assert!(
                format!("{err:?}").starts_with(expected),
                "{} resolved to {err:?}",
                d.qualified_name()
            );
        }
    }

    #[test]
    fn test_panicking_loader_is_load_failure() {
        let r = FunctionRegistry::new()
            .with_module(Module::new("explodes").with_loader(|| panic!("module init blew up")));
        match r.resolve(&def("explodes", "f", ExecutionShape::Plain), &EventLog::new()) {
            Err(StartupError::LoadFailed {
                raised: Raised::Exception(exc),
                ..
            }) => assert_eq!(exc.message(), "module init blew up"),
            other => panic!("unexpected {other:?}"),
        }
    }

    struct Fragile;

    #[async_trait]
    impl UserClass for Fragile {
        fn method(self: Arc<Self>, name: &str) -> Option<Callable> {
            match name {
                "f" => Some(Callable::plain(|args: FunctionArgs| Ok(json!(args.args)))),
                _ => panic!("no dispatch table for '{name}'"),
            }
        }
    }

    #[test]
    fn test_panicking_constructor_is_lifecycle_failure() {
        let events = EventLog::new();
        let r = FunctionRegistry::new().with_module(
            Module::new("functions")
                .class(ClassDef::new("Boom", || -> Result<Counter, Raised> {
                    panic!("ctor blew up")
                })),
        );
        match r.resolve(&def("functions", "Boom.f", ExecutionShape::Plain), &events) {
            Err(StartupError::Lifecycle {
                class,
                stage: "construction",
                raised: Raised::Exception(exc),
            }) => {
                assert_eq!(class, "Boom");
                assert_eq!(exc.message(), "ctor blew up");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(events.events().is_empty());
    }

    #[test]
    fn test_panicking_method_lookup_is_lifecycle_failure() {
        let events = EventLog::new();
        let r = FunctionRegistry::new()
            .with_module(Module::new("functions").class(ClassDef::new("Fragile", || Ok(Fragile))));

        assert!(
            r.resolve(&def("functions", "Fragile.f", ExecutionShape::Plain), &events)
                .is_ok()
        );
        match r.resolve(&def("functions", "Fragile.g", ExecutionShape::Plain), &events) {
            Err(StartupError::Lifecycle {
                stage: "method lookup",
                raised: Raised::Exception(exc),
                ..
            }) => assert_eq!(exc.message(), "no dispatch table for 'g'"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unguarded_hint_names_guard() {
        let hint = StartupError::Unguarded("script".into()).hint().unwrap();
        assert!(hint.contains("entrypoint guard"));
    }
}
