//! User modules: Rhai scripts next to the app document.
//!
//! Importing a module compiles `<app_dir>/<name>.rhai` and runs its top-level
//! statements once in a scope private to that module. Functions are later
//! called with widget handles bound by parameter name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use panel_protocol::CallableRef;
use rhai::module_resolvers::FileModuleResolver;
use rhai::{AST, CallFnOptions, Dynamic, Engine, FnPtr, Map, Scope};
use tracing::{debug, info};

use super::WorkerError;
use super::marshal::Bridge;
use super::remote::{RemoteHandle, register_handle_api};

/// Parameter that receives every widget handle, keyed by id.
pub const CATCH_ALL: &str = "widgets";

pub const EXTENSION: &str = "rhai";

pub type Widgets = BTreeMap<String, RemoteHandle>;

struct UserModule {
    ast: AST,
    scope: Scope<'static>,
}

/// An engine with the handle surface, `import` resolved against the app
/// directory, and `print`/`debug` going to the worker log.
pub fn build_engine(app_dir: &Path) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(FileModuleResolver::new_with_path(app_dir));
    engine.on_print(|text| info!(target: "user", "{text}"));
    engine.on_debug(|text, source, pos| debug!(target: "user", source = source.unwrap_or(""), %pos, "{text}"));
    register_handle_api(&mut engine);
    engine
}

pub struct UserModules {
    engine: Engine,
    app_dir: PathBuf,
    modules: BTreeMap<String, UserModule>,
    bridge: Arc<Bridge>,
}

impl UserModules {
    pub fn new(bridge: Arc<Bridge>, app_dir: &Path) -> Self {
        Self {
            engine: build_engine(app_dir),
            app_dir: app_dir.to_path_buf(),
            modules: BTreeMap::new(),
            bridge,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn module_path(&self, name: &str) -> PathBuf {
        self.app_dir.join(format!("{name}.{EXTENSION}"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Compiles and runs one module, then indexes its functions so function
    /// pointers can be named when they cross to the supervisor.
    pub fn import(&mut self, name: &str) -> Result<(), WorkerError> {
        if self.contains(name) {
            return Ok(());
        }
        let path = self.module_path(name);
        let ast = self
            .engine
            .compile_file(path.clone())
            .map_err(|e| WorkerError::Script(format!("{}: {e}", path.display())))?;
        let mut scope = Scope::new();
        self.engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| WorkerError::Script(format!("{name}: {e}")))?;
        self.bridge
            .index_functions(name, ast.iter_functions().map(|f| f.name.to_string()));
        info!(module = name, functions = ast.iter_functions().count(), "module imported");
        self.modules.insert(name.to_string(), UserModule { ast, scope });
        Ok(())
    }

    /// Calls `module.function`, filling each parameter from `widgets`.
    pub fn call(&mut self, callable: &CallableRef, widgets: &Widgets) -> Result<Dynamic, WorkerError> {
        let UserModule { ast, scope } = self
            .modules
            .get_mut(&callable.module)
            .ok_or_else(|| WorkerError::Script(format!("module `{}` is not imported", callable.module)))?;
        let params: Vec<String> = ast
            .iter_functions()
            .find(|f| f.name == callable.function)
            .map(|f| f.params.iter().map(|p| p.to_string()).collect())
            .ok_or_else(|| WorkerError::Script(format!("`{callable}` is not defined")))?;
        let args = bind_widgets(callable, &params, widgets)?;
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        self.engine
            .call_fn_with_options::<Dynamic>(options, scope, ast, &callable.function, args)
            .map_err(|e| WorkerError::Script(format!("{callable}: {e}")))
    }

    /// Calls a function pointer defined in `module`, with no arguments.
    pub fn call_ptr(&self, module: &str, f: &FnPtr) -> Result<Dynamic, WorkerError> {
        let user = self
            .modules
            .get(module)
            .ok_or_else(|| WorkerError::Script(format!("module `{module}` is not imported")))?;
        f.call::<Dynamic>(&self.engine, &user.ast, ())
            .map_err(|e| WorkerError::Script(format!("{module}.{}: {e}", f.fn_name())))
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }
}

fn bind_widgets(callable: &CallableRef, params: &[String], widgets: &Widgets) -> Result<Vec<Dynamic>, WorkerError> {
    params
        .iter()
        .map(|param| {
            if let Some(handle) = widgets.get(param) {
                return Ok(Dynamic::from(handle.clone()));
            }
            if param == CATCH_ALL {
                let all: Map = widgets
                    .iter()
                    .map(|(id, h)| (id.as_str().into(), Dynamic::from(h.clone())))
                    .collect();
                return Ok(Dynamic::from_map(all));
            }
            Err(WorkerError::Script(format!(
                "{callable}: parameter `{param}` names no widget"
            )))
        })
        .collect()
}
