//! This module provides a write-once, read-many completion cell.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::Future;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::task::panic_message;

type Subscriber<T> = Box<dyn FnOnce(&T) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PromiseError {
    /// The promise had already been resolved, the given value has been discarded.
    #[error("promise already resolved")]
    AlreadyResolved,
    /// Every handle on the promise has been dropped while it was still pending.
    #[error("promise abandoned before being resolved")]
    Abandoned,
    /// The promise was still pending when the waiting delay elapsed.
    #[error("promise still pending after waiting delay")]
    Elapsed,
}

/// A single-resolution, multi-subscriber completion cell.
///
/// A `Promise` is cheaply cloned: all clones share the same underlying cell, which is released once the last clone is dropped.
///
/// # Resolution
/// Only the first call to [`Promise::resolve()`] records a value, later calls are reported as [`PromiseError::AlreadyResolved`] and never
/// re-notify subscribers.
///
/// # Subscription
/// Subscribers registered with [`Promise::subscribe()`] while pending are notified in registration order on resolution, those registered
/// afterwards are notified immediately. Either way, each subscriber is notified exactly once.
///
/// A subscriber panicking on resolution does not prevent the following ones from being notified: the panic is logged and discarded.
///
/// # Example
/// ```
/// # use chunk_worker::promise::Promise;
/// let promise = Promise::new();
///
/// promise.subscribe(|msg: &&str| println!("first: {msg}"));
/// promise.resolve("Hello world!").unwrap();
/// promise.subscribe(|msg| println!("second: {msg}"));
///
/// assert!(promise.resolve("Goodbye!").is_err());
/// assert_eq!(promise.get(), Some("Hello world!"));
/// ```
/// ```text
/// first: Hello world!
/// second: Hello world!
/// ```
pub struct Promise<T> {
    inner: Arc<Mutex<State<T>>>,
}

struct State<T> {
    value: Option<T>,
    subscribers: Vec<Subscriber<T>>,
    /// Futures returned by [`Promise::wait()`], which may be dropped before resolution.
    waiters: Vec<oneshot::Sender<T>>,
}

impl<T> Promise<T> {
    /// Create a new pending `Promise`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                value: None,
                subscribers: vec![],
                waiters: vec![],
            })),
        }
    }

    /// Return `true` once a value has been recorded.
    pub fn is_resolved(&self) -> bool {
        self.state().value.is_some()
    }

    /// Return `true` if both handles share the same underlying cell.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State<T>> {
        // subscribers are never called while locked, a poisoned lock still holds a consistent state
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T: Clone> Promise<T> {
    /// Record `value` and notify every pending subscriber with it.
    ///
    /// Subscribers are called on the current thread, outside of the internal lock so that they may freely use the promise themselves.
    /// Pending [`Promise::wait()`] futures are completed afterwards.
    pub fn resolve(&self, value: T) -> Result<(), PromiseError> {
        let mut state = self.state();

        if state.value.is_some() {
            return Err(PromiseError::AlreadyResolved);
        }

        state.value = Some(value.clone());
        let subscribers = std::mem::take(&mut state.subscribers);
        let waiters = std::mem::take(&mut state.waiters);
        drop(state);

        for subscriber in subscribers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| subscriber(&value))) {
                tracing::error!("Promise subscriber panicked: {}", panic_message(payload));
            }
        }

        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }

        Ok(())
    }

    /// Register `callback` to be notified with the resolved value.
    ///
    /// If the promise is already resolved, `callback` is called right away on the current thread.
    pub fn subscribe(&self, callback: impl FnOnce(&T) + Send + 'static) {
        let mut state = self.state();

        match state.value.clone() {
            Some(value) => {
                drop(state);

                callback(&value);
            }
            None => state.subscribers.push(Box::new(callback)),
        }
    }

    /// Return a copy of the resolved value, if any.
    pub fn get(&self) -> Option<T> {
        self.state().value.clone()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Wait for the promise to be resolved.
    ///
    /// The returned future does not keep the promise alive: it completes with [`PromiseError::Abandoned`] as soon as every handle on a
    /// pending promise has been dropped.
    ///
    /// ```
    /// # tokio_test::block_on(async {
    /// # use chunk_worker::promise::{Promise, PromiseError};
    /// let promise = Promise::new();
    /// let resolved = promise.wait();
    ///
    /// promise.resolve(42).unwrap();
    /// assert_eq!(resolved.await, Ok(42));
    ///
    /// let abandoned = Promise::<u32>::new().wait();
    /// assert_eq!(abandoned.await, Err(PromiseError::Abandoned));
    /// # })
    /// ```
    pub fn wait(&self) -> impl Future<Output = Result<T, PromiseError>> + Send + 'static {
        let (sender, receiver) = oneshot::channel();

        {
            let mut state = self.state();

            match state.value.clone() {
                Some(value) => {
                    let _ = sender.send(value);
                }
                None => {
                    // waits that timed out or were dropped
                    state.waiters.retain(|waiter| !waiter.is_closed());
                    state.waiters.push(sender);
                }
            }
        }

        async move { receiver.await.map_err(|_| PromiseError::Abandoned) }
    }

    /// Wait for the promise to be resolved for at most `duration`.
    pub async fn wait_timeout(&self, duration: Duration) -> Result<T, PromiseError> {
        tokio::time::timeout(duration, self.wait())
            .await
            .unwrap_or(Err(PromiseError::Elapsed))
    }
}

impl<T> Clone for Promise<T> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Promise<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();

        f.debug_struct("Promise")
            .field("value", &state.value)
            .field("subscribers", &state.subscribers.len())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
