//! # Isolation Domain
//!
//! One isolated execution context: its resident loader, an optional
//! compiler, and every object instantiated inside it. The loader and each
//! object have a wasmtime store of their own, so releasing a handle drops
//! its object's instance and memory without touching the rest.
//!
//! ```text
//! Created --activate--> Active --dispose--> Disposed
//! ```
//!
//! `load`, `compile` and `ping` require `Active`. A failed `ping` means the
//! loader is gone and disposes the domain. `dispose` waits for the call
//! currently inside the domain to finish, then drops every store and
//! revokes every handle. Callers that were queued behind it fail with
//! `DomainTornDown`; later calls on its handles fail with `HandleExpired`.
//!
//! Calls into one domain are serialized by its sandbox mutex. A host
//! callback that calls back into the domain it is serving is refused with
//! `InvalidState`. Disposing from inside such a callback is deferred until
//! the outer call returns.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use wasmtime::Engine;
use wasmtime::Instance;
use wasmtime::Linker;
use wasmtime::Store;
use wasmtime::Val;

use crate::compiler::CompilerBackend;
use crate::compiler::DynamicCompiler;
use crate::context::DomainCtx;
use crate::contract;
use crate::contract::HostCallback;
use crate::contract::SCRIPT;
use crate::diagnostics::Diagnostics;
use crate::discovery;
use crate::discovery::Constructed;
use crate::error::Error;
use crate::error::Result;
use crate::handles::DomainId;
use crate::handles::HandleId;
use crate::invoker::HandleKind;
use crate::invoker::Invoker;
use crate::lease::LeaseConfig;
use crate::lease::Sponsor;
use crate::loader::RemoteLoader;
use crate::payload;
use crate::payload::Value;
use crate::policy::CapabilityPolicy;
use crate::policy::ModuleScope;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DomainState {
    Created,
    Active,
    Disposed,
}

thread_local! {
    static ENTERED: RefCell<Vec<DomainId>> = const { RefCell::new(Vec::new()) };
}

fn is_entered(id: DomainId) -> bool {
    ENTERED.with(|entered| entered.borrow().contains(&id))
}

/// Marks the current thread as running inside a domain's store.
struct EnterScope(DomainId);

impl EnterScope {
    fn new(id: DomainId) -> Self {
        ENTERED.with(|entered| entered.borrow_mut().push(id));
        Self(id)
    }
}

impl Drop for EnterScope {
    fn drop(&mut self) {
        ENTERED.with(|entered| {
            let mut entered = entered.borrow_mut();
            if let Some(pos) = entered.iter().rposition(|id| *id == self.0) {
                entered.remove(pos);
            }
        });
    }
}

/// A plugin or script object and the store it alone lives in.
struct GuestObject {
    store: Store<DomainCtx>,
    instance: Instance,
    entry: String,
    this: i32,
}

/// Everything that lives inside the isolation boundary.
struct Sandbox {
    /// Holds the resident loader only.
    store: Store<DomainCtx>,
    linker: Linker<DomainCtx>,
    loader: RemoteLoader,
    objects: HashMap<HandleId, GuestObject>,
}

impl Sandbox {
    /// A fresh store for one object of this domain.
    fn object_store(&self) -> Store<DomainCtx> {
        Store::new(self.store.engine(), self.store.data().clone())
    }

    fn adopt(&mut self, id: HandleId, store: Store<DomainCtx>, constructed: Constructed) {
        self.objects.insert(
            id,
            GuestObject {
                store,
                instance: constructed.instance,
                entry: constructed.entry.name,
                this: constructed.this,
            },
        );
    }

    /// Drops the objects of handles that were released, revoked or lapsed.
    fn reclaim(&mut self) {
        let domain = self.store.data().domain();
        for id in self.store.data().invoker().take_retired() {
            if self.objects.remove(&id).is_some() {
                tracing::debug!(domain = %domain, handle = %id, "object dropped");
            }
        }
    }

    fn call(&mut self, id: HandleId, method: &str, args: &[Val]) -> Result<Vec<Value>> {
        let object = self.objects.get_mut(&id).ok_or(Error::HandleExpired(id))?;
        let export = format!("{}.{}", object.entry, method);
        let func = object.instance.get_func(&mut object.store, &export).ok_or_else(|| {
            Error::Wasm(wasmtime::Error::msg(format!("{} has no method '{}'", object.entry, method)))
        })?;

        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Val::I32(object.this));
        params.extend_from_slice(args);

        let mut results = vec![Val::I32(0); func.ty(&object.store).results().len()];
        func.call(&mut object.store, &params, &mut results)
            .map_err(Error::from_trap)?;
        payload::check_all(&results)
    }
}

/// Keeps the resident loader alive while its domain is active.
struct DomainSponsor {
    domain: Weak<DomainInner>,
    grant: Duration,
}

impl Sponsor for DomainSponsor {
    fn renewal(&self, _: HandleId) -> Option<Duration> {
        self.domain
            .upgrade()
            .filter(|domain| domain.state() == DomainState::Active)
            .map(|_| self.grant)
    }
}

pub(crate) struct DomainInner {
    id: DomainId,
    name: String,
    policy: CapabilityPolicy,
    engine: Engine,
    lease: LeaseConfig,
    state: Mutex<DomainState>,
    invoker: Arc<Invoker>,
    loader: HandleId,
    compiler: Option<DynamicCompiler>,
    sandbox: Mutex<Option<Sandbox>>,
    dispose_pending: AtomicBool,
}

impl DomainInner {
    pub(crate) fn state(&self) -> DomainState {
        *self.state.lock()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            DomainState::Active => Ok(()),
            state => Err(Error::InvalidState(format!("{} is {:?}", self.id, state))),
        }
    }

    /// Runs `f` with exclusive access to the store.
    fn enter<R>(&self, f: impl FnOnce(&mut Sandbox) -> Result<R>) -> Result<R> {
        if is_entered(self.id) {
            return Err(Error::InvalidState(format!(
                "re-entrant call into {} from one of its own callbacks",
                self.id
            )));
        }

        let result = {
            let mut guard = self.sandbox.lock();
            // Queued behind a dispose: the sandbox is gone, or about to be.
            let sandbox = match guard.as_mut() {
                Some(sandbox) if self.state() == DomainState::Active => sandbox,
                _ => return Err(Error::DomainTornDown(self.id)),
            };
            let result = {
                let _scope = EnterScope::new(self.id);
                f(sandbox)
            };
            sandbox.reclaim();
            result
        };

        if self.dispose_pending.swap(false, Ordering::SeqCst) {
            self.dispose();
        }
        result
    }

    /// Reclaims dead objects now, unless a call holds the sandbox. That
    /// call reclaims them when it returns.
    fn try_reclaim(&self) {
        if let Some(mut guard) = self.sandbox.try_lock() {
            if let Some(sandbox) = guard.as_mut() {
                sandbox.reclaim();
            }
        }
    }

    fn activate(self: &Arc<Self>, scope: ModuleScope) -> Result<()> {
        let mut store = Store::new(&self.engine, DomainCtx::new(self.id, self.invoker.clone()));
        let mut linker = Linker::new(&self.engine);
        contract::link_host(&mut linker)?;
        let loader = RemoteLoader::install(&mut store, &linker, self.loader, scope)?;

        self.invoker.sponsor(
            loader.handle(),
            Arc::new(DomainSponsor {
                domain: Arc::downgrade(self),
                grant: self.lease.initial,
            }),
        )?;

        let domain = Arc::downgrade(self);
        self.invoker.on_retire(move || {
            if let Some(domain) = domain.upgrade() {
                domain.try_reclaim();
            }
        });

        *self.sandbox.lock() = Some(Sandbox {
            store,
            linker,
            loader,
            objects: HashMap::new(),
        });
        *self.state.lock() = DomainState::Active;

        tracing::info!(
            domain = %self.id,
            name = %self.name,
            dynamic = self.policy.allows_dynamic_compilation(),
            "domain created"
        );
        Ok(())
    }

    /// Calls `method` on the guest object behind `id`.
    fn invoke(&self, id: HandleId, method: &str, args: &[Val]) -> Result<Vec<Value>> {
        if self.state() != DomainState::Active {
            return Err(Error::HandleExpired(id));
        }
        self.invoker
            .dispatch(id, args, || self.enter(|sandbox| sandbox.call(id, method, args)))
    }

    fn ping(&self, value: i32) -> Result<i32> {
        self.ensure_active()?;
        let answer = self.invoker.dispatch(self.loader, &[Val::I32(value)], || {
            self.enter(|sandbox| sandbox.loader.ping(&mut sandbox.store, value))
        });

        if let Err(e @ (Error::HandleExpired(_) | Error::Wasm(_))) = &answer {
            tracing::warn!(domain = %self.id, error = %e, "loader did not answer, disposing domain");
            self.dispose();
        }
        answer
    }

    fn load(&self, module_path: &str) -> Result<(HandleId, String)> {
        self.ensure_active()?;
        let loaded = self.invoker.dispatch(self.loader, &[], || {
            self.enter(|sandbox| {
                let mut store = sandbox.object_store();
                let constructed = sandbox.loader.load(&mut store, &sandbox.linker, module_path)?;
                let entry = constructed.entry.name.clone();
                let id = self.invoker.register(HandleKind::Plugin);
                sandbox.adopt(id, store, constructed);
                Ok((id, entry))
            })
        });

        match &loaded {
            Ok((id, entry)) => {
                tracing::info!(domain = %self.id, handle = %id, entry = %entry, path = module_path, "plugin loaded")
            }
            Err(e) if !e.is_fault() => {
                tracing::debug!(domain = %self.id, path = module_path, error = %e, "no plugin constructed")
            }
            Err(e) => tracing::warn!(domain = %self.id, path = module_path, error = %e, "load failed"),
        }
        loaded
    }

    fn compile(self: &Arc<Self>, source: &str) -> Result<Compilation> {
        let compiler = self.compiler.as_ref().ok_or_else(|| {
            Error::PolicyViolation(format!("dynamic compilation is not permitted in {}", self.id))
        })?;

        let output = compiler.compile(&self.engine, source);
        let diagnostics = output.diagnostics;
        let Some(unit) = output.unit else {
            tracing::info!(domain = %self.id, errors = diagnostics.errors().count(), "compilation failed");
            return Ok(Compilation { script: None, diagnostics });
        };

        let (id, entry) = self.enter(|sandbox| {
            let mut store = sandbox.object_store();
            let constructed = discovery::construct(&mut store, &sandbox.linker, &unit, &SCRIPT)?;
            let entry = constructed.entry.name.clone();
            let id = self.invoker.register(HandleKind::Script);
            sandbox.adopt(id, store, constructed);
            Ok((id, entry))
        })?;

        tracing::info!(domain = %self.id, handle = %id, entry = %entry, "script compiled");
        Ok(Compilation {
            script: Some(ScriptHandle {
                remote: RemoteRef::new(self, id, entry),
            }),
            diagnostics,
        })
    }

    pub(crate) fn dispose(&self) {
        *self.state.lock() = DomainState::Disposed;

        if is_entered(self.id) {
            self.dispose_pending.store(true, Ordering::SeqCst);
            return;
        }

        let sandbox = self.sandbox.lock().take();
        self.invoker.revoke_all();
        if let Some(sandbox) = sandbox {
            drop(sandbox);
            tracing::info!(domain = %self.id, name = %self.name, "domain disposed");
        }
    }
}

/// An isolated execution context. Dropping it disposes it.
pub struct IsolationDomain {
    inner: Arc<DomainInner>,
}

impl IsolationDomain {
    pub(crate) fn new(
        id: DomainId,
        name: String,
        policy: CapabilityPolicy,
        engine: Engine,
        lease: LeaseConfig,
        scheduler: Handle,
        backend: Arc<dyn CompilerBackend>,
    ) -> Self {
        let invoker = Invoker::new(id, lease, scheduler);
        let loader = invoker.register(HandleKind::Loader);
        let compiler = DynamicCompiler::for_policy(&policy, backend);

        Self {
            inner: Arc::new(DomainInner {
                id,
                name,
                policy,
                engine,
                lease,
                state: Mutex::new(DomainState::Created),
                invoker,
                loader,
                compiler,
                sandbox: Mutex::new(None),
                dispose_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Builds the store and its resident loader: `Created -> Active`.
    pub(crate) fn activate(&self, scope: ModuleScope) -> Result<()> {
        if self.inner.state() != DomainState::Created {
            return Err(Error::InvalidState(format!("{} was already activated", self.inner.id)));
        }
        self.inner.activate(scope)
    }

    pub(crate) fn downgrade(&self) -> Weak<DomainInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> DomainId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn policy(&self) -> &CapabilityPolicy {
        &self.inner.policy
    }

    pub fn state(&self) -> DomainState {
        self.inner.state()
    }

    /// Loads a plugin module, path relative to the plugin directory.
    pub fn load(&self, module_path: &str) -> Result<PluginHandle> {
        let (id, entry) = self.inner.load(module_path)?;
        Ok(PluginHandle {
            remote: RemoteRef::new(&self.inner, id, entry),
        })
    }

    /// Compiles source text into a script object.
    ///
    /// Compiler errors are not a failure of this call: they come back as
    /// diagnostics next to an empty script. `Err` means the policy forbids
    /// compiling, the unit has no script entry, or the domain is unusable.
    pub fn compile(&self, source: &str) -> Result<Compilation> {
        self.inner.ensure_active()?;
        self.inner.compile(source)
    }

    /// `value + 1`, answered by the resident loader.
    pub fn ping(&self, value: i32) -> Result<i32> {
        self.inner.ping(value)
    }

    /// Tears the domain down. Safe to call more than once.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl std::fmt::Debug for IsolationDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationDomain")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl Drop for IsolationDomain {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

/// Outcome of a compile call.
pub struct Compilation {
    pub script: Option<ScriptHandle>,
    pub diagnostics: Diagnostics,
}

/// Non-owning reference to one object inside a domain.
#[derive(Clone)]
struct RemoteRef {
    domain: Weak<DomainInner>,
    id: HandleId,
    entry: String,
}

impl RemoteRef {
    fn new(domain: &Arc<DomainInner>, id: HandleId, entry: String) -> Self {
        Self {
            domain: Arc::downgrade(domain),
            id,
            entry,
        }
    }

    fn domain(&self) -> Result<Arc<DomainInner>> {
        self.domain.upgrade().ok_or(Error::HandleExpired(self.id))
    }

    fn call(&self, method: &str, args: &[Val]) -> Result<Vec<Value>> {
        self.domain()?.invoke(self.id, method, args)
    }

    fn call_i32(&self, method: &str, args: &[Val]) -> Result<i32> {
        let results = self.call(method, args)?;
        match results.as_slice() {
            [value] => value.as_i32().ok_or_else(|| {
                Error::Serialization(format!("{}.{} returned {:?}, expected i32", self.entry, method, value))
            }),
            other => Err(Error::Serialization(format!(
                "{}.{} returned {} values, expected one",
                self.entry,
                method,
                other.len()
            ))),
        }
    }

    fn export_host(&self, callback: &Arc<dyn HostCallback>) -> Result<i32> {
        self.domain()?.invoker.export_host(callback).to_guest()
    }

    fn renew(&self) -> Result<()> {
        self.domain()?.invoker.renew(self.id)
    }

    fn sponsor(&self, sponsor: Arc<dyn Sponsor>) -> Result<()> {
        self.domain()?.invoker.sponsor(self.id, sponsor)
    }

    fn release(&self) -> Result<()> {
        self.domain()?.invoker.release(self.id)
    }

    fn lease_remaining(&self) -> Result<Duration> {
        self.domain()?.invoker.lease_remaining(self.id)
    }
}

macro_rules! remote_handle_common {
    () => {
        pub fn id(&self) -> HandleId {
            self.remote.id
        }

        /// Name of the entry type behind this handle.
        pub fn entry(&self) -> &str {
            &self.remote.entry
        }

        /// Calls any exported method of the entry type. The object id is
        /// passed implicitly; `args` and results must be plain values.
        pub fn call(&self, method: &str, args: &[Val]) -> Result<Vec<Value>> {
            self.remote.call(method, args)
        }

        /// Heartbeat: renews the lease without calling the object.
        pub fn renew(&self) -> Result<()> {
            self.remote.renew()
        }

        /// Lets `sponsor` decide whether to extend the lease when it lapses.
        pub fn sponsor(&self, sponsor: Arc<dyn Sponsor>) -> Result<()> {
            self.remote.sponsor(sponsor)
        }

        /// Ends the handle now. The object and its store are dropped as soon
        /// as no call holds the domain.
        pub fn release(&self) -> Result<()> {
            self.remote.release()
        }

        pub fn lease_remaining(&self) -> Result<Duration> {
            self.remote.lease_remaining()
        }
    };
}

/// A plugin object living inside a domain.
#[derive(Clone)]
pub struct PluginHandle {
    remote: RemoteRef,
}

impl PluginHandle {
    remote_handle_common!();

    /// Gives the plugin a non-owning reference to `callback`.
    pub fn set_host_callback(&self, callback: &Arc<dyn HostCallback>) -> Result<()> {
        let host = self.remote.export_host(callback)?;
        self.remote.call("set_host", &[Val::I32(host)])?;
        Ok(())
    }

    pub fn test_round_trip(&self, arg: i32) -> Result<i32> {
        self.remote.call_i32("test_round_trip", &[Val::I32(arg)])
    }

    /// Compiles `source` with the domain's compiler on the plugin's behalf.
    pub fn compile_script(&self, source: &str) -> Result<Compilation> {
        let domain = self.remote.domain()?;
        if domain.state() != DomainState::Active {
            return Err(Error::HandleExpired(self.remote.id));
        }
        domain
            .invoker
            .dispatch(self.remote.id, &[], || domain.compile(source))
    }
}

/// A dynamically compiled object living inside a domain.
#[derive(Clone)]
pub struct ScriptHandle {
    remote: RemoteRef,
}

impl ScriptHandle {
    remote_handle_common!();

    pub fn invoke_round_trip(&self, callback: &Arc<dyn HostCallback>, arg: i32) -> Result<i32> {
        let host = self.remote.export_host(callback)?;
        self.remote
            .call_i32("test_script_round_trip", &[Val::I32(host), Val::I32(arg)])
    }
}
