//! Transactional multi-resource acquisition.
//!
//! Fault resolution takes several reservation locks (an object plus its
//! shadow share one, segments carry their own). Acquisition is ordered by
//! transaction age: an older transaction waits for a younger holder, a
//! younger requester backs off — it drops every lock it holds, waits on the
//! specific contended reservation, and restarts from the top. The age ticket
//! is assigned once per transaction, so the earlier party always wins
//! re-acquisition.

use crate::error::{MapError, MapResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

/// Restart bound. Real contention converges in a handful of rounds; hitting
/// the bound means a lock cycle bug, not load.
const MAX_RESTARTS: u32 = 64;

#[derive(Debug, Default)]
struct ResvState {
    owner: Option<u64>,
}

/// Shared reservation lock.
///
/// An object and its shadow hold the same instance, so locking either locks
/// both synchronization domains at once.
#[derive(Debug, Default)]
pub struct ResvLock {
    state: Mutex<ResvState>,
    released: Condvar,
}

impl ResvLock {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn acquire(self: &Arc<Self>, ticket: u64) -> MapResult<ResvGuard> {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(ticket);
                    return Ok(ResvGuard {
                        lock: Arc::clone(self),
                        owned: true,
                    });
                }
                // Already held by this transaction (object and shadow share
                // a reservation). The returned guard is a no-op on drop.
                Some(holder) if holder == ticket => {
                    return Ok(ResvGuard {
                        lock: Arc::clone(self),
                        owned: false,
                    });
                }
                // Holder is older: we lose, back off.
                Some(holder) if holder < ticket => return Err(MapError::Backoff),
                // Holder is younger: we are the earlier party, wait it out.
                Some(_) => state = self.released.wait(state).unwrap(),
            }
        }
    }

    fn wait_free(&self) {
        let mut state = self.state.lock().unwrap();
        while state.owner.is_some() {
            state = self.released.wait(state).unwrap();
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.owner = None;
        drop(state);
        self.released.notify_all();
    }
}

pub struct ResvGuard {
    lock: Arc<ResvLock>,
    owned: bool,
}

impl Drop for ResvGuard {
    fn drop(&mut self) {
        if self.owned {
            self.lock.release();
        }
    }
}

/// One multi-resource acquisition context, alive across restarts.
pub struct LockTxn {
    ticket: u64,
    contended: Mutex<Option<Arc<ResvLock>>>,
}

impl LockTxn {
    fn new() -> Self {
        Self {
            ticket: NEXT_TICKET.fetch_add(1, Ordering::Relaxed),
            contended: Mutex::new(None),
        }
    }

    /// Acquire a reservation under this transaction's age ticket.
    ///
    /// # Errors
    /// `MapError::Backoff` if an older transaction holds the lock; the
    /// caller must unwind back to `run`, which waits and restarts.
    pub fn lock(&self, resv: &Arc<ResvLock>) -> MapResult<ResvGuard> {
        match resv.acquire(self.ticket) {
            Err(MapError::Backoff) => {
                *self.contended.lock().unwrap() = Some(Arc::clone(resv));
                Err(MapError::Backoff)
            }
            other => other,
        }
    }

    fn backoff(&self) {
        if let Some(resv) = self.contended.lock().unwrap().take() {
            resv.wait_free();
        }
    }
}

/// Run `body` under a fresh transaction, restarting on backoff.
///
/// Every guard must live inside `body` so a backoff releases all held
/// resources before the wait.
///
/// # Errors
/// Propagates `body`'s error; `MapError::DeviceBusy` if the restart bound
/// is exceeded.
pub fn run<T>(mut body: impl FnMut(&LockTxn) -> MapResult<T>) -> MapResult<T> {
    let txn = LockTxn::new();
    let mut restarts = 0;
    loop {
        match body(&txn) {
            Err(MapError::Backoff) => {
                restarts += 1;
                if restarts > MAX_RESTARTS {
                    log::error!("lock transaction exceeded {MAX_RESTARTS} restarts");
                    return Err(MapError::DeviceBusy);
                }
                txn.backoff();
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn reacquire_within_transaction_is_a_noop() {
        let resv = ResvLock::new();
        run(|t| {
            let _a = t.lock(&resv)?;
            let b = t.lock(&resv)?;
            assert!(!b.owned);
            drop(b);
            // Still held after dropping the no-op guard.
            assert!(resv.state.lock().unwrap().owner.is_some());
            Ok(())
        })
        .unwrap();
        assert!(resv.state.lock().unwrap().owner.is_none());
    }

    #[test]
    fn younger_backs_off_and_wins_after_release() {
        let resv = ResvLock::new();

        // Older transaction takes the lock first.
        let older = LockTxn::new();
        let guard = older.lock(&resv).unwrap();

        let resv2 = Arc::clone(&resv);
        let younger = thread::spawn(move || {
            run(|t| {
                let _g = t.lock(&resv2)?;
                Ok(())
            })
        });

        thread::sleep(Duration::from_millis(20));
        drop(guard);
        younger.join().unwrap().unwrap();
    }

    #[test]
    fn crossed_acquisition_converges() {
        let a = ResvLock::new();
        let b = ResvLock::new();

        let (a1, b1) = (Arc::clone(&a), Arc::clone(&b));
        let t1 = thread::spawn(move || {
            run(|t| {
                let _ga = t.lock(&a1)?;
                thread::sleep(Duration::from_millis(5));
                let _gb = t.lock(&b1)?;
                Ok(())
            })
        });
        let (a2, b2) = (Arc::clone(&a), Arc::clone(&b));
        let t2 = thread::spawn(move || {
            run(|t| {
                let _gb = t.lock(&b2)?;
                thread::sleep(Duration::from_millis(5));
                let _ga = t.lock(&a2)?;
                Ok(())
            })
        });

        t1.join().unwrap().unwrap();
        t2.join().unwrap().unwrap();
    }
}
