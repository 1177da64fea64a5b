//! # Entry-Type Discovery
//!
//! Selects the concrete type in a module that implements a capability.
//!
//! A type takes part only if it is registered, i.e. the module exports its
//! factory `T.new`. Registered types are considered in export-section order
//! and the first one exporting every method of the capability, each with
//! exactly the contracted signature, wins. Further matches are ignored.

use wasmtime::ExternType;
use wasmtime::Instance;
use wasmtime::Linker;
use wasmtime::Module;
use wasmtime::Store;

use crate::context::DomainCtx;
use crate::contract::Capability;
use crate::contract::FACTORY;
use crate::error::Error;
use crate::error::Result;
use crate::payload::Scalar;

/// The type selected for a capability.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryType {
    pub name: String,
}

impl EntryType {
    pub fn factory(&self) -> String {
        format!("{}.{}", self.name, FACTORY)
    }
}

/// A freshly constructed entry object.
pub(crate) struct Constructed {
    pub instance: Instance,
    pub entry: EntryType,
    pub this: i32,
}

/// Registered types of `module`, in first-seen export order.
pub fn registered_types(module: &Module) -> Vec<String> {
    let suffix = format!(".{}", FACTORY);
    let mut types: Vec<String> = Vec::new();

    for export in module.exports() {
        if !matches!(export.ty(), ExternType::Func(_)) {
            continue;
        }
        if let Some(name) = export.name().strip_suffix(suffix.as_str()) {
            if !name.is_empty() && !types.iter().any(|t| t == name) {
                types.push(name.to_string());
            }
        }
    }

    types
}

fn implements(module: &Module, entry: &str, capability: &Capability) -> bool {
    capability.methods.iter().all(|method| {
        match module.get_export(&method.export_name(entry)) {
            Some(ExternType::Func(ty)) => {
                Scalar::matches(ty.params(), method.params)
                    && Scalar::matches(ty.results(), method.results)
            }
            _ => false,
        }
    })
}

/// Finds the first registered type implementing `capability`.
pub fn find_entry(module: &Module, capability: &Capability) -> Result<EntryType> {
    registered_types(module)
        .into_iter()
        .find(|name| implements(module, name, capability))
        .map(|name| EntryType { name })
        .ok_or(Error::NoEntryTypeFound { capability: capability.name })
}

/// Discovers the entry type, instantiates the module and runs the factory.
pub(crate) fn construct(
    store: &mut Store<DomainCtx>,
    linker: &Linker<DomainCtx>,
    module: &Module,
    capability: &Capability,
) -> Result<Constructed> {
    let entry = find_entry(module, capability)?;
    let factory = entry.factory();

    let usable = match module.get_export(&factory) {
        Some(ExternType::Func(ty)) => {
            Scalar::matches(ty.params(), &[]) && Scalar::matches(ty.results(), &[Scalar::I32])
        }
        _ => false,
    };
    if !usable {
        return Err(Error::ConstructionError {
            entry: entry.name,
            reason: format!("{} must take no arguments and return an object id", factory),
        });
    }

    let instance = linker.instantiate(&mut *store, module)?;
    let ctor = instance.get_typed_func::<(), i32>(&mut *store, &factory)?;
    let this = ctor.call(&mut *store, ()).map_err(|e| Error::ConstructionError {
        entry: entry.name.clone(),
        reason: Error::from_trap(e).to_string(),
    })?;

    tracing::debug!(entry = %entry.name, capability = capability.name, this, "entry constructed");
    Ok(Constructed { instance, entry, this })
}

#[cfg(test)]
mod tests {
    use super::*;

    use wasmtime::Engine;

    use crate::contract::PLUGIN;
    use crate::contract::SCRIPT;

    fn module(wat: &str) -> Module {
        Module::new(&Engine::default(), wat).unwrap()
    }

    const TWO_PLUGINS: &str = r#"
        (module
          (func (export "First.new") (result i32) i32.const 1)
          (func (export "First.set_host") (param i32 i32))
          (func (export "First.test_round_trip") (param i32 i32) (result i32) i32.const 1)
          (func (export "Second.new") (result i32) i32.const 2)
          (func (export "Second.set_host") (param i32 i32))
          (func (export "Second.test_round_trip") (param i32 i32) (result i32) i32.const 2))
    "#;

    #[test]
    fn test_first_registered_match_wins() {
        let m = module(TWO_PLUGINS);
        assert_eq!(registered_types(&m), ["First", "Second"]);
        assert_eq!(find_entry(&m, &PLUGIN).unwrap().name, "First");
    }

    #[test]
    fn test_unregistered_type_is_ignored() {
        let m = module(
            r#"(module
                 (func (export "Hidden.set_host") (param i32 i32))
                 (func (export "Hidden.test_round_trip") (param i32 i32) (result i32) i32.const 0))"#,
        );
        assert!(matches!(
            find_entry(&m, &PLUGIN),
            Err(Error::NoEntryTypeFound { capability: "plugin" })
        ));
    }

    #[test]
    fn test_signature_must_match_exactly() {
        let m = module(
            r#"(module
                 (func (export "Wide.new") (result i32) i32.const 1)
                 (func (export "Wide.test_script_round_trip") (param i32 i32 i64) (result i32) i32.const 0))"#,
        );
        assert!(matches!(find_entry(&m, &SCRIPT), Err(Error::NoEntryTypeFound { .. })));
    }

    #[test]
    fn test_capabilities_are_distinct() {
        let m = module(TWO_PLUGINS);
        assert!(matches!(
            find_entry(&m, &SCRIPT),
            Err(Error::NoEntryTypeFound { capability: "script" })
        ));
    }
}
