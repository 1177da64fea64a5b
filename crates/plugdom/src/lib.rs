//! # Plugdom
//!
//! Hosts plugin modules and runtime-compiled scripts inside isolation
//! domains. Each domain is a WebAssembly sandbox with its own capability
//! policy; the host and the isolated code reach each other only through
//! leased remote handles carrying plain values.
//!
//! ```ignore
//! let runtime = Runtime::new(RuntimeConfig::from_env()?)?;
//! runtime.scoped("plugins", CapabilityPolicy::allow_dynamic(), |domain| {
//!     assert_eq!(domain.ping(41)?, 42);
//!     let plugin = domain.load("script_plugin.wat")?;
//!     plugin.set_host_callback(&host)?;
//!     println!("{}", plugin.test_round_trip(1)?);
//!     Ok::<_, plugdom::Error>(())
//! })?;
//! ```

mod compiler;
mod context;
mod contract;
mod diagnostics;
mod discovery;
mod domain;
mod error;
mod handles;
mod invoker;
mod lease;
mod loader;
mod payload;
mod policy;
mod runtime;

pub use compiler::CompileOutput;
pub use compiler::CompilerBackend;
pub use compiler::WatBackend;
pub use contract::Capability;
pub use contract::HostCallback;
pub use contract::Method;
pub use contract::PLUGIN;
pub use contract::REFERENCES;
pub use contract::Reference;
pub use contract::SCRIPT;
pub use diagnostics::Diagnostic;
pub use diagnostics::Diagnostics;
pub use diagnostics::Severity;
pub use discovery::EntryType;
pub use discovery::find_entry;
pub use discovery::registered_types;
pub use domain::Compilation;
pub use domain::DomainState;
pub use domain::IsolationDomain;
pub use domain::PluginHandle;
pub use domain::ScriptHandle;
pub use error::Error;
pub use error::Result;
pub use handles::DomainId;
pub use handles::HandleId;
pub use lease::LeaseConfig;
pub use lease::Sponsor;
pub use payload::Scalar;
pub use payload::Value;
pub use payload::check_wire_safe;
pub use policy::CapabilityPolicy;
pub use runtime::ENV_LEASE_SECS;
pub use runtime::ENV_PLUGIN_DIR;
pub use runtime::Runtime;
pub use runtime::RuntimeConfig;

pub use wasmtime::Val;
