//! Bypass Gate
//!
//! Acquires and caches the gateway bypass credential, coalescing concurrent
//! acquisition requests into a single outbound fetch (single-flight).
//!
//! # Design
//!
//! Gate state is one mutex-guarded enum: `Empty`, `Fetching` (with a FIFO
//! vector of waiters), or `Ready`. The first caller to find the gate empty
//! becomes the leader and performs the fetch without holding the lock;
//! everyone else parks on a oneshot and is drained in arrival order when the
//! fetch resolves. A failed fetch is delivered as a typed error to every
//! waiter and returns the gate to `Empty`, so a later call can retry.

use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};

use crate::application::ports::{BypassCredential, BypassError, BypassFetch};

type Waiter = oneshot::Sender<Result<BypassCredential, BypassError>>;

enum GateState {
    /// No credential cached and no fetch in flight.
    Empty,
    /// One fetch in flight; queued waiters in arrival order.
    Fetching(Vec<Waiter>),
    /// Valid credential cached.
    Ready(BypassCredential),
}

/// Single-flight cache for the gateway bypass credential.
pub struct BypassGate {
    fetcher: Arc<dyn BypassFetch>,
    state: Mutex<GateState>,
}

impl BypassGate {
    /// Create a gate over the given fetcher.
    #[must_use]
    pub fn new(fetcher: Arc<dyn BypassFetch>) -> Self {
        Self {
            fetcher,
            state: Mutex::new(GateState::Empty),
        }
    }

    /// Return the cached credential, joining or starting a fetch as needed.
    ///
    /// # Errors
    ///
    /// Returns [`BypassError`] when the underlying fetch fails; the failure
    /// is delivered to every caller that was coalesced onto the same fetch.
    pub async fn ensure(&self) -> Result<BypassCredential, BypassError> {
        enum Plan {
            Hit(BypassCredential),
            Wait(oneshot::Receiver<Result<BypassCredential, BypassError>>),
            Lead,
        }

        let plan = {
            let mut state = self.state.lock().await;
            match &mut *state {
                GateState::Ready(credential) => Plan::Hit(credential.clone()),
                GateState::Fetching(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Plan::Wait(rx)
                }
                GateState::Empty => {
                    *state = GateState::Fetching(Vec::new());
                    Plan::Lead
                }
            }
        };

        match plan {
            Plan::Hit(credential) => Ok(credential),
            Plan::Wait(rx) => rx.await.unwrap_or(Err(BypassError::Aborted)),
            Plan::Lead => self.lead_fetch().await,
        }
    }

    /// Drop the cached credential, forcing re-acquisition before the next
    /// handshake attempt. A fetch already in flight is left to complete.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if matches!(*state, GateState::Ready(_)) {
            tracing::info!("Bypass credential invalidated");
            *state = GateState::Empty;
        }
    }

    /// Whether a credential is currently cached.
    pub async fn is_ready(&self) -> bool {
        matches!(*self.state.lock().await, GateState::Ready(_))
    }

    /// Perform the fetch as the single leader, then drain waiters in FIFO
    /// order with the shared outcome.
    async fn lead_fetch(&self) -> Result<BypassCredential, BypassError> {
        let result = self.fetcher.fetch().await;

        let waiters = {
            let mut state = self.state.lock().await;
            let waiters = match std::mem::replace(&mut *state, GateState::Empty) {
                GateState::Fetching(waiters) => waiters,
                // Reset raced the fetch; nobody is waiting on this outcome.
                other => {
                    *state = other;
                    Vec::new()
                }
            };
            if let Ok(credential) = &result {
                tracing::info!("Bypass credential acquired");
                *state = GateState::Ready(credential.clone());
            }
            waiters
        };

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }
}

impl std::fmt::Debug for BypassGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BypassGate").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;

    struct CountingFetcher {
        calls: AtomicUsize,
        release: Notify,
        fail: bool,
    }

    impl CountingFetcher {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                release: Notify::new(),
                fail,
            }
        }
    }

    #[async_trait]
    impl BypassFetch for CountingFetcher {
        async fn fetch(&self) -> Result<BypassCredential, BypassError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            if self.fail {
                Err(BypassError::Fetch("challenge not solved".to_string()))
            } else {
                Ok(BypassCredential::new("agent", "cookie"))
            }
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let fetcher = Arc::new(CountingFetcher::new(false));
        let gate = Arc::new(BypassGate::new(Arc::clone(&fetcher) as Arc<dyn BypassFetch>));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            tasks.push(tokio::spawn(async move { gate.ensure().await }));
        }

        // Let every caller reach the gate before the fetch resolves.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        fetcher.release.notify_waiters();
        fetcher.release.notify_one();

        for task in tasks {
            let credential = task.await.unwrap().unwrap();
            assert_eq!(credential.user_agent(), "agent");
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_credential_skips_fetch() {
        let fetcher = Arc::new(CountingFetcher::new(false));
        let gate = BypassGate::new(Arc::clone(&fetcher) as Arc<dyn BypassFetch>);

        fetcher.release.notify_one();
        gate.ensure().await.unwrap();
        gate.ensure().await.unwrap();
        gate.ensure().await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(gate.is_ready().await);
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter_and_allows_retry() {
        let fetcher = Arc::new(CountingFetcher::new(true));
        let gate = Arc::new(BypassGate::new(Arc::clone(&fetcher) as Arc<dyn BypassFetch>));

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.ensure().await })
        };
        let leader = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.ensure().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        fetcher.release.notify_waiters();
        fetcher.release.notify_one();

        assert!(matches!(waiter.await.unwrap(), Err(BypassError::Fetch(_))));
        assert!(matches!(leader.await.unwrap(), Err(BypassError::Fetch(_))));

        // Gate is empty again: a retry triggers a second fetch.
        assert!(!gate.is_ready().await);
        let retry = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.ensure().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        fetcher.release.notify_one();
        let _ = retry.await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_reacquisition() {
        let fetcher = Arc::new(CountingFetcher::new(false));
        let gate = BypassGate::new(Arc::clone(&fetcher) as Arc<dyn BypassFetch>);

        fetcher.release.notify_one();
        gate.ensure().await.unwrap();
        gate.invalidate().await;
        assert!(!gate.is_ready().await);

        fetcher.release.notify_one();
        gate.ensure().await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
