//! # Runtime Registry
//!
//! Creates isolation domains and owns what they share: the wasmtime
//! `Engine`, the configuration, the compiler backend and the scheduler that
//! runs lease reapers. Keeps a registry of live domains.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use wasmtime::Engine;

use crate::compiler::CompilerBackend;
use crate::compiler::WatBackend;
use crate::domain::DomainInner;
use crate::domain::DomainState;
use crate::domain::IsolationDomain;
use crate::error::Error;
use crate::error::Result;
use crate::handles::DomainId;
use crate::lease::LeaseConfig;
use crate::policy::CapabilityPolicy;

/// Environment variable naming the plugin directory.
pub const ENV_PLUGIN_DIR: &str = "PLUGDOM_PLUGIN_DIR";
/// Environment variable overriding every lease duration, in seconds.
pub const ENV_LEASE_SECS: &str = "PLUGDOM_LEASE_SECS";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Directory module paths are resolved against.
    pub plugin_dir: PathBuf,
    pub lease: LeaseConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            lease: LeaseConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults, overridden by `PLUGDOM_PLUGIN_DIR` and `PLUGDOM_LEASE_SECS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(ENV_PLUGIN_DIR) {
            config.plugin_dir = PathBuf::from(dir);
        }

        if let Ok(secs) = std::env::var(ENV_LEASE_SECS) {
            config.lease = lease_from_secs(&secs)?;
        }

        Ok(config)
    }

    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dir = dir.into();
        self
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }
}

fn lease_from_secs(raw: &str) -> Result<LeaseConfig> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(LeaseConfig::uniform(Duration::from_secs(secs))),
        _ => Err(Error::Config(format!(
            "{} must be a positive whole number of seconds, got '{}'",
            ENV_LEASE_SECS, raw
        ))),
    }
}

/// Where lease reapers run.
enum Scheduler {
    /// The tokio runtime the `Runtime` was created in.
    Shared(Handle),
    /// A dedicated runtime for hosts that have none.
    Owned(Option<tokio::runtime::Runtime>, Handle),
}

impl Scheduler {
    fn new() -> Result<Self> {
        if let Ok(handle) = Handle::try_current() {
            return Ok(Self::Shared(handle));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("plugdom-lease")
            .enable_time()
            .build()
            .map_err(|e| Error::Config(format!("lease scheduler could not start: {}", e)))?;
        let handle = runtime.handle().clone();
        Ok(Self::Owned(Some(runtime), handle))
    }

    fn handle(&self) -> Handle {
        match self {
            Self::Shared(handle) | Self::Owned(_, handle) => handle.clone(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Self::Owned(runtime, _) = self {
            if let Some(runtime) = runtime.take() {
                runtime.shutdown_background();
            }
        }
    }
}

/// Factory and registry for isolation domains.
pub struct Runtime {
    engine: Engine,
    config: RuntimeConfig,
    backend: Arc<dyn CompilerBackend>,
    scheduler: Scheduler,
    domains: DashMap<DomainId, Weak<DomainInner>>,
    next_domain_id: AtomicU64,
}

impl Runtime {
    /// Creates a runtime with the default WebAssembly-text compiler backend.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_backend(config, Arc::new(WatBackend))
    }

    pub fn with_backend(config: RuntimeConfig, backend: Arc<dyn CompilerBackend>) -> Result<Self> {
        if config.lease.initial.is_zero() {
            return Err(Error::Config("handles need a non-zero initial lease".to_string()));
        }
        let engine = Engine::new(&wasmtime::Config::new())?;

        Ok(Self {
            engine,
            config,
            backend,
            scheduler: Scheduler::new()?,
            domains: DashMap::new(),
            next_domain_id: AtomicU64::new(1),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Creates a domain and brings it to `Active`.
    ///
    /// Fails with `PolicyViolation` if the policy names a module path
    /// outside the plugin directory.
    pub fn create_domain(&self, name: impl Into<String>, policy: CapabilityPolicy) -> Result<IsolationDomain> {
        let scope = policy.resolve(&self.config.plugin_dir)?;
        let id = DomainId(self.next_domain_id.fetch_add(1, Ordering::Relaxed));

        let domain = IsolationDomain::new(
            id,
            name.into(),
            policy,
            self.engine.clone(),
            self.config.lease,
            self.scheduler.handle(),
            self.backend.clone(),
        );
        domain.activate(scope)?;

        self.domains.retain(|_, inner| inner.strong_count() > 0);
        self.domains.insert(id, domain.downgrade());
        Ok(domain)
    }

    /// Runs `f` against a fresh domain and disposes it on every exit path.
    pub fn scoped<R, E, F>(&self, name: impl Into<String>, policy: CapabilityPolicy, f: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&IsolationDomain) -> std::result::Result<R, E>,
        E: From<Error>,
    {
        let domain = self.create_domain(name, policy)?;
        let result = f(&domain);
        domain.dispose();
        result
    }

    /// Number of domains currently `Active`.
    pub fn domain_count(&self) -> usize {
        self.domains
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .filter(|inner| inner.state() == DomainState::Active)
            .count()
    }
}
