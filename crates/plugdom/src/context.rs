//! Store context for a domain's sandbox.

use std::sync::Arc;

use crate::handles::DomainId;
use crate::invoker::Invoker;

/// Per-domain execution context stored in Wasmtime's Store.
///
/// Host imports reach the domain's handle table through it, so a guest can
/// only ever name host objects the domain has been given. Every store of a
/// domain carries a clone of the same context.
#[derive(Clone)]
pub struct DomainCtx {
    domain: DomainId,
    invoker: Arc<Invoker>,
}

impl DomainCtx {
    pub(crate) fn new(domain: DomainId, invoker: Arc<Invoker>) -> Self {
        Self { domain, invoker }
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    pub(crate) fn invoker(&self) -> &Invoker {
        &self.invoker
    }
}
