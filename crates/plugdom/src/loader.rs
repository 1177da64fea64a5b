//! # Remote Loader
//!
//! The object every domain starts with. It lives in the domain's resident
//! store as a tiny module that answers liveness pings, and it is the only
//! component allowed to turn a file into a plugin object. Every path is
//! checked against the domain's module scope before the file is opened.

use std::path::Path;

use wasmtime::Linker;
use wasmtime::Module;
use wasmtime::Store;
use wasmtime::TypedFunc;

use crate::context::DomainCtx;
use crate::contract::PLUGIN;
use crate::discovery;
use crate::discovery::Constructed;
use crate::error::Error;
use crate::error::Result;
use crate::handles::HandleId;
use crate::policy::ModuleScope;

const RESIDENT: &str = r#"
(module
  (func (export "loader.ping") (param i32) (result i32)
    local.get 0
    i32.const 1
    i32.add))
"#;

pub(crate) struct RemoteLoader {
    handle: HandleId,
    scope: ModuleScope,
    ping: TypedFunc<i32, i32>,
}

impl RemoteLoader {
    /// Instantiates the resident module inside `store`.
    pub(crate) fn install(
        store: &mut Store<DomainCtx>,
        linker: &Linker<DomainCtx>,
        handle: HandleId,
        scope: ModuleScope,
    ) -> Result<Self> {
        let module = Module::new(store.engine(), RESIDENT)?;
        let instance = linker.instantiate(&mut *store, &module)?;
        let ping = instance.get_typed_func::<i32, i32>(&mut *store, "loader.ping")?;
        Ok(Self { handle, scope, ping })
    }

    pub(crate) fn handle(&self) -> HandleId {
        self.handle
    }

    /// `value + 1`, computed inside the sandbox. Wraps on overflow.
    pub(crate) fn ping(&self, store: &mut Store<DomainCtx>, value: i32) -> Result<i32> {
        self.ping.call(store, value).map_err(Error::from_trap)
    }

    /// Loads the module at `module_path` and constructs its plugin entry in
    /// `store`, which belongs to the new object alone.
    pub(crate) fn load(
        &self,
        store: &mut Store<DomainCtx>,
        linker: &Linker<DomainCtx>,
        module_path: &str,
    ) -> Result<Constructed> {
        let path = self.scope.check(module_path)?;
        let module = read_module(store, &path)?;
        tracing::info!(domain = %store.data().domain(), path = %path.display(), "module loaded");
        discovery::construct(store, linker, &module, &PLUGIN)
    }
}

/// Reads a `.wasm` binary or `.wat` text module.
fn read_module(store: &Store<DomainCtx>, path: &Path) -> Result<Module> {
    let bytes = std::fs::read(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Module::new(store.engine(), &bytes)?)
}
