//! # Handle Leases
//!
//! Every remote handle lives on a lease. Calls through the handle push its
//! deadline forward; a background reaper task sleeps until the deadline and
//! expires the handle once it lapses with nothing in flight.
//!
//! ```text
//! call start / call end / renew():  deadline = max(deadline, now + renew_on_call)
//! deadline passed, no calls in flight:
//!     sponsor?  -> ask it, wait at most sponsorship_timeout
//!                  Some(extra) -> deadline = now + extra
//!                  otherwise   -> expire
//!     none      -> expire
//! ```
//!
//! Expiry is terminal. An expired lease refuses every later call.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::Error;
use crate::error::Result;
use crate::handles::HandleId;

/// Lifetime parameters applied to every handle of a domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Lifetime granted when the handle is created.
    pub initial: Duration,
    /// How long a lapsed lease waits for its sponsor's decision.
    pub sponsorship_timeout: Duration,
    /// Minimum remaining lifetime after any call.
    pub renew_on_call: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5 * 60),
            sponsorship_timeout: Duration::from_secs(2 * 60),
            renew_on_call: Duration::from_secs(2 * 60),
        }
    }
}

impl LeaseConfig {
    /// Same duration for the initial lifetime and every renewal.
    pub fn uniform(ttl: Duration) -> Self {
        Self {
            initial: ttl,
            sponsorship_timeout: ttl,
            renew_on_call: ttl,
        }
    }
}

/// Decides whether a lapsed handle should be kept alive.
///
/// Asked from a blocking worker, never from a call thread. Returning `None`
/// (or a zero duration) lets the handle expire.
pub trait Sponsor: Send + Sync {
    fn renewal(&self, handle: HandleId) -> Option<Duration>;
}

pub(crate) struct Lease {
    id: HandleId,
    config: LeaseConfig,
    state: Mutex<State>,
}

struct State {
    deadline: Instant,
    in_flight: usize,
    expired: bool,
    sponsor: Option<Arc<dyn Sponsor>>,
    reaper: Option<JoinHandle<()>>,
}

enum Tick {
    Sleep(Instant),
    Lapsed(Option<Arc<dyn Sponsor>>),
    Done,
}

impl State {
    fn extend(&mut self, to: Instant) {
        if to > self.deadline {
            self.deadline = to;
        }
    }
}

impl Lease {
    pub(crate) fn new(id: HandleId, config: LeaseConfig) -> Self {
        Self {
            id,
            config,
            state: Mutex::new(State {
                deadline: Instant::now() + config.initial,
                in_flight: 0,
                expired: false,
                sponsor: None,
                reaper: None,
            }),
        }
    }

    /// Starts the background reaper. `on_expire` runs once, on the
    /// scheduler, when the lease lapses for good.
    pub(crate) fn watch<F>(self: &Arc<Self>, scheduler: &Handle, on_expire: F)
    where
        F: FnOnce(HandleId) + Send + 'static,
    {
        let task = scheduler.spawn(reap(Arc::downgrade(self), on_expire));
        let mut state = self.state.lock();
        if state.expired {
            task.abort();
        } else {
            state.reaper = Some(task);
        }
    }

    /// Registers a call in flight and renews.
    pub(crate) fn begin_call(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.expired {
            return Err(Error::HandleExpired(self.id));
        }
        state.in_flight += 1;
        state.extend(Instant::now() + self.config.renew_on_call);
        Ok(())
    }

    pub(crate) fn end_call(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.extend(Instant::now() + self.config.renew_on_call);
    }

    /// Explicit heartbeat.
    pub(crate) fn renew(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.expired {
            return Err(Error::HandleExpired(self.id));
        }
        state.extend(Instant::now() + self.config.renew_on_call);
        Ok(())
    }

    pub(crate) fn set_sponsor(&self, sponsor: Arc<dyn Sponsor>) -> Result<()> {
        let mut state = self.state.lock();
        if state.expired {
            return Err(Error::HandleExpired(self.id));
        }
        state.sponsor = Some(sponsor);
        Ok(())
    }

    pub(crate) fn remaining(&self) -> Option<Duration> {
        let state = self.state.lock();
        if state.expired {
            return None;
        }
        Some(state.deadline.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.state.lock().expired
    }

    /// Expires the lease unconditionally and stops its reaper. Returns
    /// `false` if it had already expired.
    pub(crate) fn expire(&self) -> bool {
        let mut state = self.state.lock();
        if state.expired {
            return false;
        }
        state.expired = true;
        state.sponsor = None;
        if let Some(reaper) = state.reaper.take() {
            reaper.abort();
        }
        true
    }

    fn tick(&self) -> Tick {
        let state = self.state.lock();
        if state.expired {
            return Tick::Done;
        }
        let now = Instant::now();
        if state.in_flight > 0 {
            // The call's end renews; look again no earlier than that.
            return Tick::Sleep(state.deadline.max(now + self.config.renew_on_call));
        }
        if now < state.deadline {
            return Tick::Sleep(state.deadline);
        }
        Tick::Lapsed(state.sponsor.clone())
    }

    /// Applies a sponsor's grant unless a call slipped in meanwhile.
    fn grant(&self, extra: Duration) -> bool {
        let mut state = self.state.lock();
        if state.expired {
            return false;
        }
        state.extend(Instant::now() + extra);
        true
    }

    /// Expires the lease only if it is still lapsed and idle.
    fn expire_if_lapsed(&self) -> bool {
        let mut state = self.state.lock();
        if state.expired || state.in_flight > 0 || Instant::now() < state.deadline {
            return false;
        }
        state.expired = true;
        state.sponsor = None;
        state.reaper = None;
        true
    }
}

async fn reap<F>(lease: Weak<Lease>, on_expire: F)
where
    F: FnOnce(HandleId) + Send + 'static,
{
    loop {
        let Some(current) = lease.upgrade() else {
            return;
        };

        match current.tick() {
            Tick::Done => return,
            Tick::Sleep(until) => {
                drop(current);
                tokio::time::sleep_until(until).await;
            }
            Tick::Lapsed(sponsor) => {
                if let Some(sponsor) = sponsor {
                    let wait = current.config.sponsorship_timeout;
                    if let Some(extra) = ask(sponsor, current.id, wait).await {
                        if current.grant(extra) {
                            tracing::debug!(handle = %current.id, ?extra, "lease sponsored");
                            continue;
                        }
                    }
                }

                if current.expire_if_lapsed() {
                    tracing::debug!(handle = %current.id, "lease expired");
                    on_expire(current.id);
                    return;
                }
            }
        }
    }
}

async fn ask(sponsor: Arc<dyn Sponsor>, id: HandleId, wait: Duration) -> Option<Duration> {
    let query = tokio::task::spawn_blocking(move || sponsor.renewal(id));
    match tokio::time::timeout(wait, query).await {
        Ok(Ok(grant)) => grant.filter(|extra| !extra.is_zero()),
        Ok(Err(e)) => {
            tracing::warn!(handle = %id, error = %e, "sponsor failed");
            None
        }
        Err(_) => {
            tracing::debug!(handle = %id, "sponsor did not answer in time");
            None
        }
    }
}
