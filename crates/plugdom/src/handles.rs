//! Type-safe identifiers for domains and remote handles.
//!
//! A `HandleId` is the only thing that ever names an object on the other
//! side of the boundary. Guests see handles as plain `i32` values; the host
//! resolves them through the domain's invoker, so a forged or stale id is
//! refused instead of dereferenced.

use crate::error::Error;
use crate::error::Result;

/// Identifier of an isolation domain, unique within a `Runtime`.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DomainId(pub u64);

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "domain-{}", self.0)
    }
}

/// Identifier of a remote handle, unique within its domain.
///
/// Id 0 is never allocated; guests use it as the "no object" value.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl HandleId {
    pub const NULL: HandleId = HandleId(0);

    /// Lowers the id to the guest representation.
    pub fn to_guest(self) -> Result<i32> {
        i32::try_from(self.0)
            .map_err(|_| Error::Serialization(format!("{} does not fit a guest handle", self)))
    }

    /// Lifts a guest handle value. Non-positive values name no object.
    pub fn from_guest(raw: i32) -> Option<HandleId> {
        u64::try_from(raw).ok().filter(|v| *v != 0).map(HandleId)
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}
