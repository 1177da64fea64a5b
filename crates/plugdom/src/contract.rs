//! # Shared Capability Contract
//!
//! The definitions both sides of the boundary agree on: which host
//! functions a guest may import, and which exports make an entry type a
//! plugin or a script.
//!
//! An entry type `T` is declared by export names of the form `T.method`.
//! It is registered by exporting its factory `T.new`, a zero-argument
//! function returning the object id. Every method takes that object id as
//! its first parameter.
//!
//! ```text
//! plugin:  T.set_host(this, host)           T.test_round_trip(this, arg) -> i32
//! script:  T.test_script_round_trip(this, host, arg) -> i32
//! host:    host.do_something_nifty(host, arg) -> i32
//!          host.log(value)
//! ```

use wasmtime::Caller;
use wasmtime::Linker;

use crate::context::DomainCtx;
use crate::error::Result;
use crate::payload::Scalar;

/// Import module name of every host function.
pub const HOST_MODULE: &str = "host";

/// Method name of the factory that registers an entry type.
pub const FACTORY: &str = "new";

/// Operations a host object exposes to isolated code.
///
/// The domain only ever holds a non-owning reference to a callback; once
/// the host drops its last `Arc`, guest calls through the handle fail with
/// `HandleExpired`.
pub trait HostCallback: Send + Sync {
    fn do_something_nifty(&self, arg: i32) -> i32;
}

/// One method of a capability. `params` includes the leading object id.
#[derive(Debug)]
pub struct Method {
    pub name: &'static str,
    pub params: &'static [Scalar],
    pub results: &'static [Scalar],
}

impl Method {
    pub fn export_name(&self, entry: &str) -> String {
        format!("{}.{}", entry, self.name)
    }
}

/// A named set of methods an entry type must export.
#[derive(Debug)]
pub struct Capability {
    pub name: &'static str,
    pub methods: &'static [Method],
}

pub const PLUGIN: Capability = Capability {
    name: "plugin",
    methods: &[
        Method { name: "set_host", params: &[Scalar::I32, Scalar::I32], results: &[] },
        Method { name: "test_round_trip", params: &[Scalar::I32, Scalar::I32], results: &[Scalar::I32] },
    ],
};

pub const SCRIPT: Capability = Capability {
    name: "script",
    methods: &[Method {
        name: "test_script_round_trip",
        params: &[Scalar::I32, Scalar::I32, Scalar::I32],
        results: &[Scalar::I32],
    }],
};

/// A host function a guest may import.
#[derive(Debug)]
pub struct Reference {
    pub module: &'static str,
    pub name: &'static str,
    pub params: &'static [Scalar],
    pub results: &'static [Scalar],
}

/// The fixed reference set every module, loaded or compiled, links against.
pub const REFERENCES: &[Reference] = &[
    Reference {
        module: HOST_MODULE,
        name: "do_something_nifty",
        params: &[Scalar::I32, Scalar::I32],
        results: &[Scalar::I32],
    },
    Reference { module: HOST_MODULE, name: "log", params: &[Scalar::I32], results: &[] },
];

/// Installs the reference set into a domain's linker.
pub(crate) fn link_host(linker: &mut Linker<DomainCtx>) -> Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "do_something_nifty",
        |caller: Caller<'_, DomainCtx>, host: i32, arg: i32| -> wasmtime::Result<i32> {
            caller
                .data()
                .invoker()
                .call_host(host, arg)
                .map_err(wasmtime::Error::new)
        },
    )?;

    linker.func_wrap(HOST_MODULE, "log", |caller: Caller<'_, DomainCtx>, value: i32| {
        tracing::info!(domain = %caller.data().domain(), value, "guest log");
    })?;

    Ok(())
}
