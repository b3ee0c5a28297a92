mod ensure_ran;

pub use ensure_ran::EnsureRan;

use parking_lot::Mutex;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::Waker;

const NOT_LOADED: u8 = 0;
const LOADING: u8 = 1;
const LOADED: u8 = 2;

/// The observable state of a [`Gate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    NotLoaded,
    Loading,
    Loaded,
}

/// Runs an action at most once and parks every concurrent caller until that single run settles.
///
/// A gate moves `NotLoaded -> Loading -> Loaded`. The `NotLoaded -> Loading` transition is a compare and swap,
/// so exactly one caller becomes the worker; everyone else registers a waker and is notified when the worker finishes.
///
/// If the action fails (or the worker is dropped or panics mid-load) the gate goes back to `NotLoaded`
/// and the waiting callers race again, one of them running its own action. Nothing is remembered about the failure.
#[derive(Debug, Default)]
pub struct Gate {
    state: AtomicU8,
    waiters: Mutex<Vec<Waker>>,
    refresh_claimed: AtomicBool,
}

impl Gate {
    pub fn new() -> Self {
        Gate::default()
    }

    pub fn state(&self) -> GateState {
        match self.state.load(Ordering::Acquire) {
            NOT_LOADED => GateState::NotLoaded,
            LOADING => GateState::Loading,
            _ => GateState::Loaded,
        }
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.state.load(Ordering::Acquire) == LOADED
    }

    /// Run `action` unless it has already completed successfully, waiting on any in flight run.
    ///
    /// Resolves to `Ok(())` once some caller's action has succeeded, or to the error of *this* caller's action
    /// if it was the one elected to run and it failed.
    pub fn ensure_ran<F, Fut, E>(&self, action: F) -> EnsureRan<'_, F, Fut>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        EnsureRan::Waiting {
            gate: self,
            action: Some(action),
        }
    }

    /// Claims the right to start the refresh chain guarded by this gate.
    ///
    /// Returns true exactly once over the lifetime of the gate.
    pub(crate) fn claim_refresh(&self) -> bool {
        if self.refresh_claimed.load(Ordering::Acquire) {
            return false;
        }

        self.refresh_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Either elect the caller as the worker (true) or register its waker (false).
    ///
    /// Returns `None` if the gate is already loaded.
    fn try_begin(&self, waker: &Waker) -> Option<bool> {
        // the waiters lock orders registration against `settle`, otherwise a waker could be pushed after the drain
        let mut waiters = self.waiters.lock();

        match self
            .state
            .compare_exchange(NOT_LOADED, LOADING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(true),
            Err(LOADED) => None,
            Err(_) => {
                if !waiters.iter().any(|w| w.will_wake(waker)) {
                    waiters.push(waker.clone());
                }

                Some(false)
            }
        }
    }

    fn settle(&self, loaded: bool) {
        let wakers = {
            let mut waiters = self.waiters.lock();
            let next = if loaded { LOADED } else { NOT_LOADED };
            self.state.store(next, Ordering::Release);

            std::mem::take(&mut *waiters)
        };

        for waker in wakers {
            waker.wake();
        }
    }
}

/// Proof that the holder won the `NotLoaded -> Loading` race.
///
/// Dropping it without calling [`LoadingGuard::complete`] puts the gate back to `NotLoaded`.
pub struct LoadingGuard<'a> {
    gate: &'a Gate,
    armed: bool,
}

impl<'a> LoadingGuard<'a> {
    fn new(gate: &'a Gate) -> Self {
        LoadingGuard { gate, armed: true }
    }

    fn complete(&mut self) {
        self.armed = false;
        self.gate.settle(true);
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::trace!("gate load abandoned, resetting");
            self.gate.settle(false);
        }
    }
}
