//! Single-flight run guard
//!
//! At most one pipeline run executes at a time. Entry is non-blocking:
//! a trigger that finds the flight taken is dropped, not queued.
//!
//! The guarded value is the state only a run may mutate (the baseline),
//! so holding a [`FlightGuard`] is the one way to reach it. Release is
//! tied to the guard's `Drop`, which runs on every exit path including
//! early returns, `?` and unwinding panics.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub struct SingleFlight<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for SingleFlight<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Proof that the caller owns the flight
///
/// Dropping it (or calling [`FlightGuard::exit`]) clears the in-flight state.
pub struct FlightGuard<T> {
    guard: OwnedMutexGuard<T>,
}

impl<T> SingleFlight<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Take the flight if nobody holds it; returns `None` immediately otherwise
    pub fn try_enter(&self) -> Option<FlightGuard<T>> {
        self.inner
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| FlightGuard { guard })
    }

    /// Wait for the current run to finish, then take the flight
    ///
    /// Only administrative operations (clear-all) use this; triggers never wait.
    pub async fn enter_blocking(&self) -> FlightGuard<T> {
        FlightGuard {
            guard: self.inner.clone().lock_owned().await,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl<T> FlightGuard<T> {
    /// Release the flight explicitly
    pub fn exit(self) {}
}

impl<T> Deref for FlightGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for FlightGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
