//! # Cross-Boundary Invoker
//!
//! The call-marshalling layer of one domain. It hands out remote handles,
//! keeps their leases, and is the only path a call takes across the
//! boundary, in either direction:
//!
//! - host -> guest: `dispatch` checks the payload, pins the handle's lease
//!   for the duration of the call and runs it.
//! - guest -> host: `call_host` resolves a handle id the guest passed back
//!   to a host callback and invokes it under the same discipline.
//!
//! Host callbacks are held as `Weak` references. The domain never keeps a
//! host object alive; once the host drops it, the handle is dead.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use wasmtime::Val;

use crate::contract::HostCallback;
use crate::error::Error;
use crate::error::Result;
use crate::handles::DomainId;
use crate::handles::HandleId;
use crate::lease::Lease;
use crate::lease::LeaseConfig;
use crate::lease::Sponsor;
use crate::payload;

/// What a handle refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HandleKind {
    Loader,
    Plugin,
    Script,
    Host,
}

pub(crate) struct Invoker {
    domain: DomainId,
    config: LeaseConfig,
    scheduler: Handle,
    leases: DashMap<HandleId, Arc<Lease>>,
    hosts: DashMap<HandleId, Weak<dyn HostCallback>>,
    /// Handles that died since the domain last reclaimed their objects.
    retired: Mutex<Vec<HandleId>>,
    on_retire: OnceLock<Box<dyn Fn() + Send + Sync>>,
    next_id: AtomicU64,
    this: Weak<Invoker>,
}

/// Keeps a handle's lease pinned while a call is in flight.
struct CallGuard {
    lease: Arc<Lease>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.lease.end_call();
    }
}

impl Invoker {
    pub(crate) fn new(domain: DomainId, config: LeaseConfig, scheduler: Handle) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            domain,
            config,
            scheduler,
            leases: DashMap::new(),
            hosts: DashMap::new(),
            retired: Mutex::new(Vec::new()),
            on_retire: OnceLock::new(),
            next_id: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    /// Allocates a handle and starts its lease.
    pub(crate) fn register(&self, kind: HandleKind) -> HandleId {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let lease = Arc::new(Lease::new(id, self.config));
        self.leases.insert(id, lease.clone());

        let invoker = self.this.clone();
        lease.watch(&self.scheduler, move |id| {
            if let Some(invoker) = invoker.upgrade() {
                invoker.forget(id);
            }
        });

        tracing::debug!(domain = %self.domain, handle = %id, ?kind, "handle registered");
        id
    }

    fn lease(&self, id: HandleId) -> Result<Arc<Lease>> {
        self.leases
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(Error::HandleExpired(id))
    }

    fn begin(&self, id: HandleId) -> Result<CallGuard> {
        let lease = self.lease(id)?;
        lease.begin_call()?;
        Ok(CallGuard { lease })
    }

    /// Runs one host -> guest call against `id`.
    ///
    /// The payload is checked before anything else, so a bad argument fails
    /// with `Serialization` even on a dead handle and never reaches the guest.
    pub(crate) fn dispatch<R, F>(&self, id: HandleId, args: &[Val], call: F) -> Result<R>
    where
        F: FnOnce() -> Result<R>,
    {
        payload::check_all(args)?;
        let _guard = self.begin(id)?;
        call()
    }

    /// Exposes a host callback to the guest. Exporting the same object twice
    /// yields the same handle while it is live.
    pub(crate) fn export_host(&self, callback: &Arc<dyn HostCallback>) -> HandleId {
        let weak = Arc::downgrade(callback);

        let existing = self
            .hosts
            .iter()
            .find(|entry| Weak::ptr_eq(entry.value(), &weak))
            .map(|entry| *entry.key());

        if let Some(id) = existing {
            if self.renew(id).is_ok() {
                return id;
            }
        }

        let id = self.register(HandleKind::Host);
        self.hosts.insert(id, weak);
        id
    }

    /// Runs one guest -> host call through the host handle `raw`.
    pub(crate) fn call_host(&self, raw: i32, arg: i32) -> Result<i32> {
        let id = HandleId::from_guest(raw).ok_or(Error::HandleExpired(HandleId::NULL))?;
        let weak = self
            .hosts
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(Error::HandleExpired(id))?;
        let _guard = self.begin(id)?;

        match weak.upgrade() {
            Some(callback) => Ok(callback.do_something_nifty(arg)),
            None => {
                self.forget(id);
                Err(Error::HandleExpired(id))
            }
        }
    }

    pub(crate) fn renew(&self, id: HandleId) -> Result<()> {
        self.lease(id)?.renew()
    }

    pub(crate) fn sponsor(&self, id: HandleId, sponsor: Arc<dyn Sponsor>) -> Result<()> {
        self.lease(id)?.set_sponsor(sponsor)
    }

    pub(crate) fn lease_remaining(&self, id: HandleId) -> Result<Duration> {
        self.lease(id)?.remaining().ok_or(Error::HandleExpired(id))
    }

    pub(crate) fn is_live(&self, id: HandleId) -> bool {
        self.leases
            .get(&id)
            .map(|entry| !entry.value().is_expired())
            .unwrap_or(false)
    }

    /// Ends a handle's life before its lease runs out.
    pub(crate) fn release(&self, id: HandleId) -> Result<()> {
        if !self.forget(id) {
            return Err(Error::HandleExpired(id));
        }
        tracing::debug!(domain = %self.domain, handle = %id, "handle released");
        Ok(())
    }

    /// Runs `hook` every time a handle dies. Set once, by the owning domain.
    pub(crate) fn on_retire(&self, hook: impl Fn() + Send + Sync + 'static) {
        let _ = self.on_retire.set(Box::new(hook));
    }

    /// Drains the handles that died since the last call.
    pub(crate) fn take_retired(&self) -> Vec<HandleId> {
        std::mem::take(&mut *self.retired.lock())
    }

    fn forget(&self, id: HandleId) -> bool {
        self.hosts.remove(&id);
        let Some((_, lease)) = self.leases.remove(&id) else {
            return false;
        };
        let expired = lease.expire();

        self.retired.lock().push(id);
        if let Some(hook) = self.on_retire.get() {
            hook();
        }
        expired
    }

    /// Expires every handle of the domain.
    pub(crate) fn revoke_all(&self) {
        let ids: Vec<HandleId> = self.leases.iter().map(|entry| *entry.key()).collect();
        for id in &ids {
            self.forget(*id);
        }
        if !ids.is_empty() {
            tracing::debug!(domain = %self.domain, count = ids.len(), "handles revoked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicI32;

    struct AddHundred;

    impl HostCallback for AddHundred {
        fn do_something_nifty(&self, arg: i32) -> i32 {
            arg + 100
        }
    }

    struct Counting(AtomicI32);

    impl HostCallback for Counting {
        fn do_something_nifty(&self, arg: i32) -> i32 {
            self.0.fetch_add(1, Ordering::SeqCst);
            arg
        }
    }

    fn invoker() -> Arc<Invoker> {
        Invoker::new(DomainId(1), LeaseConfig::default(), Handle::current())
    }

    #[tokio::test]
    async fn test_dispatch_checks_payload_first() {
        let invoker = invoker();
        let id = invoker.register(HandleKind::Plugin);

        let err = invoker
            .dispatch(id, &[Val::I32(1), Val::ExternRef(None)], || Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        let out = invoker.dispatch(id, &[Val::I32(1)], || Ok(5)).unwrap();
        assert_eq!(out, 5);
    }

    #[tokio::test]
    async fn test_released_handle_is_dead() {
        let invoker = invoker();
        let id = invoker.register(HandleKind::Script);
        assert!(invoker.is_live(id));

        invoker.release(id).unwrap();
        assert!(!invoker.is_live(id));
        assert!(matches!(invoker.release(id), Err(Error::HandleExpired(_))));
        assert!(matches!(invoker.dispatch(id, &[], || Ok(())), Err(Error::HandleExpired(_))));
    }

    #[tokio::test]
    async fn test_host_callback_round_trip() {
        let invoker = invoker();
        let callback: Arc<dyn HostCallback> = Arc::new(AddHundred);
        let id = invoker.export_host(&callback);

        let raw = id.to_guest().unwrap();
        assert_eq!(invoker.call_host(raw, 11).unwrap(), 111);
        assert_eq!(invoker.export_host(&callback), id);
    }

    #[tokio::test]
    async fn test_host_reference_is_non_owning() {
        let invoker = invoker();
        let callback: Arc<dyn HostCallback> = Arc::new(Counting(AtomicI32::new(0)));
        let raw = invoker.export_host(&callback).to_guest().unwrap();
        drop(callback);

        let err = invoker.call_host(raw, 1).unwrap_err();
        assert!(matches!(err, Error::HandleExpired(_)));
    }

    #[tokio::test]
    async fn test_forged_host_handle_is_refused() {
        let invoker = invoker();
        let plugin = invoker.register(HandleKind::Plugin);

        assert!(matches!(invoker.call_host(0, 1), Err(Error::HandleExpired(_))));
        assert!(matches!(invoker.call_host(-3, 1), Err(Error::HandleExpired(_))));
        // A live handle that is not a host callback is refused and left alone.
        let raw = plugin.to_guest().unwrap();
        assert!(matches!(invoker.call_host(raw, 1), Err(Error::HandleExpired(_))));
        assert!(invoker.is_live(plugin));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lease_lapsing_at_once_is_not_left_behind() {
        let invoker = Invoker::new(DomainId(1), LeaseConfig::uniform(Duration::ZERO), Handle::current());
        let id = invoker.register(HandleKind::Plugin);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!invoker.is_live(id));
        assert!(invoker.leases.is_empty());
        assert_eq!(invoker.take_retired(), vec![id]);
    }

    #[tokio::test]
    async fn test_retire_hook_runs_on_release() {
        let invoker = invoker();
        let fired = Arc::new(AtomicI32::new(0));
        let counter = fired.clone();
        invoker.on_retire(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let a = invoker.register(HandleKind::Plugin);
        let b = invoker.register(HandleKind::Script);
        invoker.release(a).unwrap();
        invoker.release(b).unwrap();
        assert!(invoker.release(a).is_err());

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(invoker.take_retired(), vec![a, b]);
        assert!(invoker.take_retired().is_empty());
    }

    #[tokio::test]
    async fn test_revoke_all() {
        let invoker = invoker();
        let a = invoker.register(HandleKind::Loader);
        let b = invoker.register(HandleKind::Plugin);
        invoker.revoke_all();
        assert!(!invoker.is_live(a));
        assert!(!invoker.is_live(b));
        assert!(matches!(invoker.lease_remaining(a), Err(Error::HandleExpired(_))));
    }
}
