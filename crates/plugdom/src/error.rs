//! # Error Definitions
//!
//! The central ledger of every failure a domain, handle, loader or compiler
//! can report.
//!
//! Two families live here. Structural outcomes (`NoEntryTypeFound`,
//! `ConstructionError`) are ordinary, data-dependent results a caller is
//! expected to branch on; the domain stays usable after them. Everything
//! else is a fault: misuse of the API contract (`InvalidState`,
//! `Serialization`), a policy refusal, a dead remote reference, or an
//! unusable runtime configuration.
//!
//! Compiler errors are *not* represented here. They travel as
//! [`Diagnostic`](crate::diagnostics::Diagnostic) entries next to an empty
//! script handle.

use std::path::PathBuf;

use crate::handles::DomainId;
use crate::handles::HandleId;

#[derive(Debug)]
pub enum Error {
    /// The operation is disallowed by the domain's capability policy.
    PolicyViolation(String),
    /// No registered entry type in a module satisfies the capability.
    NoEntryTypeFound { capability: &'static str },
    /// The selected entry type has no usable zero-argument factory.
    ConstructionError { entry: String, reason: String },
    /// The handle's lease lapsed, it was released, or its domain is gone.
    HandleExpired(HandleId),
    /// A value that cannot cross the isolation boundary was supplied.
    Serialization(String),
    /// The domain is not in a state that permits the operation.
    InvalidState(String),
    /// The call was queued when the domain was torn down.
    DomainTornDown(DomainId),
    /// A plugin file could not be read.
    Io { path: PathBuf, source: std::io::Error },
    /// The runtime configuration is unusable.
    Config(String),
    /// Engine or instantiation failure outside the taxonomy above.
    Wasm(wasmtime::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PolicyViolation(msg) => write!(f, "Policy violation: {}", msg),
            Self::NoEntryTypeFound { capability } => {
                write!(f, "No entry type implementing the {} capability was found", capability)
            }
            Self::ConstructionError { entry, reason } => {
                write!(f, "Could not construct '{}': {}", entry, reason)
            }
            Self::HandleExpired(id) => write!(f, "Handle expired: {}", id),
            Self::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Self::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Self::DomainTornDown(id) => write!(f, "Domain torn down: {}", id),
            Self::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::Wasm(e) => write!(f, "Wasm error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<wasmtime::Error> for Error {
    fn from(e: wasmtime::Error) -> Self {
        Self::Wasm(e)
    }
}

impl Error {
    /// Recovers a plugdom error that was raised inside a host import and
    /// carried out of the guest as a trap.
    pub(crate) fn from_trap(e: wasmtime::Error) -> Self {
        match e.downcast::<Error>() {
            Ok(inner) => inner,
            Err(e) => Self::Wasm(e),
        }
    }

    /// Returns `true` for faults, `false` for structural outcomes that
    /// leave the domain usable.
    pub fn is_fault(&self) -> bool {
        !matches!(self, Self::NoEntryTypeFound { .. } | Self::ConstructionError { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_outcomes_are_not_faults() {
        assert!(!Error::NoEntryTypeFound { capability: "plugin" }.is_fault());
        assert!(!Error::ConstructionError { entry: "T".into(), reason: "x".into() }.is_fault());
        assert!(Error::HandleExpired(HandleId(3)).is_fault());
        assert!(Error::PolicyViolation("no".into()).is_fault());
    }

    #[test]
    fn test_trap_round_trips_plugdom_error() {
        let trap = wasmtime::Error::new(Error::HandleExpired(HandleId(9)));
        match Error::from_trap(trap) {
            Error::HandleExpired(id) => assert_eq!(id, HandleId(9)),
            other => panic!("Wrong error type: {}", other),
        }
    }

    #[test]
    fn test_foreign_trap_stays_wasm() {
        let trap = wasmtime::Error::msg("unreachable executed");
        assert!(matches!(Error::from_trap(trap), Error::Wasm(_)));
    }
}
