//! Registry of outstanding calls awaiting a correlated response.
//!
//! Each registered call resolves exactly once: by the matching response, by
//! explicit cancellation, or by connection teardown ([`PendingCalls::cancel_all`]).
//! Whichever happens first wins; later resolutions for the same key are
//! no-ops. Dropping a [`PendingCall`] before it resolves deregisters it.

use std::{
    collections::HashMap,
    fmt::Debug,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::CallError;

/// Outcome delivered to a waiting caller
pub type CallOutcome = Result<Bytes, CallError>;

struct Entry {
    serial: u64,
    tx: oneshot::Sender<CallOutcome>,
}

struct State<K> {
    calls: HashMap<K, Entry>,
    next_serial: u64,
    closed: bool,
}

/// Outstanding calls of one connection, keyed by correlation id.
pub struct PendingCalls<K> {
    state: Arc<Mutex<State<K>>>,
}

impl<K> Clone for PendingCalls<K> {
    fn clone(&self) -> Self {
        Self { state: Arc::clone(&self.state) }
    }
}

impl<K> Default for PendingCalls<K> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State { calls: HashMap::new(), next_serial: 0, closed: false })),
        }
    }
}

impl<K> Debug for PendingCalls<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PendingCalls")
            .field("outstanding", &state.calls.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<K> PendingCalls<K>
where
    K: Eq + Hash + Copy + Debug + Send + 'static,
{
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call under `key`.
    ///
    /// Fails with [`CallError::Disconnected`] once the registry was torn down.
    /// Registering a key that is still outstanding cancels the older call.
    pub fn register(&self, key: K) -> Result<PendingCall<K>, CallError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.closed {
            return Err(CallError::Disconnected);
        }
        let serial = state.next_serial;
        state.next_serial += 1;
        if state.calls.insert(key, Entry { serial, tx }).is_some() {
            tracing::warn!(?key, "correlation id reused while still outstanding");
        }
        drop(state);

        Ok(PendingCall { key, serial, rx, registry: Arc::downgrade(&self.state) })
    }

    /// Resolve the call registered under `key`.
    ///
    /// Returns `false` if no such call is outstanding (already resolved,
    /// cancelled, abandoned, or never registered).
    pub fn resolve(&self, key: K, outcome: CallOutcome) -> bool {
        let entry = self.state.lock().calls.remove(&key);
        match entry {
            Some(entry) => entry.tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Cancel one call
    pub fn cancel(&self, key: K) -> bool {
        self.resolve(key, Err(CallError::Cancelled))
    }

    /// Cancel every outstanding call and refuse new registrations.
    ///
    /// Returns the number of calls cancelled.
    pub fn cancel_all(&self) -> usize {
        let calls = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.calls)
        };
        let count = calls.len();
        for (_, entry) in calls {
            let _ = entry.tx.send(Err(CallError::Cancelled));
        }
        count
    }

    /// Number of outstanding calls
    pub fn len(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Whether no calls are outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`cancel_all`](Self::cancel_all) has run
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// A registered call; resolves to the response payload.
#[must_use = "dropping a pending call abandons it"]
pub struct PendingCall<K>
where
    K: Eq + Hash,
{
    key: K,
    serial: u64,
    rx: oneshot::Receiver<CallOutcome>,
    registry: Weak<Mutex<State<K>>>,
}

impl<K: Eq + Hash + Copy> PendingCall<K> {
    /// Correlation id of this call
    pub fn key(&self) -> K {
        self.key
    }
}

impl<K: Eq + Hash + Unpin> Future for PendingCall<K> {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| received.unwrap_or(Err(CallError::Cancelled)))
    }
}

impl<K: Eq + Hash> Drop for PendingCall<K> {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else { return };
        let mut state = registry.lock();
        if state.calls.get(&self.key).is_some_and(|entry| entry.serial == self.serial) {
            state.calls.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_with_response() {
        let calls = PendingCalls::<i32>::new();
        let call = calls.register(1).unwrap();
        assert!(calls.resolve(1, Ok(Bytes::from_static(b"ok"))));
        assert_eq!(call.await.unwrap().as_ref(), b"ok");
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn resolves_at_most_once() {
        let calls = PendingCalls::<i32>::new();
        let call = calls.register(7).unwrap();

        assert!(calls.resolve(7, Ok(Bytes::from_static(b"first"))));
        assert!(!calls.resolve(7, Ok(Bytes::from_static(b"second"))));
        assert!(!calls.cancel(7));
        assert_eq!(calls.cancel_all(), 0);

        assert_eq!(call.await.unwrap().as_ref(), b"first");
    }

    #[tokio::test]
    async fn teardown_cancels_everything_and_refuses_new_calls() {
        let calls = PendingCalls::<i32>::new();
        let a = calls.register(1).unwrap();
        let b = calls.register(2).unwrap();

        assert_eq!(calls.cancel_all(), 2);
        assert_eq!(a.await, Err(CallError::Cancelled));
        assert_eq!(b.await, Err(CallError::Cancelled));
        assert!(matches!(calls.register(3), Err(CallError::Disconnected)));
        assert!(!calls.resolve(1, Ok(Bytes::new())));
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_the_right_caller() {
        let calls = PendingCalls::<i32>::new();
        let first = calls.register(1).unwrap();
        let second = calls.register(2).unwrap();

        calls.resolve(2, Ok(Bytes::from_static(b"two")));
        calls.resolve(1, Ok(Bytes::from_static(b"one")));

        assert_eq!(second.await.unwrap().as_ref(), b"two");
        assert_eq!(first.await.unwrap().as_ref(), b"one");
    }

    #[test]
    fn dropping_a_call_deregisters_it() {
        let calls = PendingCalls::<i32>::new();
        let call = calls.register(5).unwrap();
        assert_eq!(calls.len(), 1);
        drop(call);
        assert!(calls.is_empty());
        assert!(!calls.resolve(5, Ok(Bytes::new())));
    }

    #[test]
    fn stale_drop_does_not_remove_a_newer_registration() {
        let calls = PendingCalls::<i32>::new();
        let old = calls.register(5).unwrap();
        let _new = calls.register(5).unwrap();
        drop(old);
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn replaced_registration_is_cancelled() {
        let calls = PendingCalls::<i32>::new();
        let old = calls.register(5).unwrap();
        let _new = calls.register(5).unwrap();
        assert_eq!(old.await, Err(CallError::Cancelled));
    }
}
