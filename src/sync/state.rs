//! One-way state machines and monotonic counters backed by atomics.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// A state enum that can be stored in an [`AtomicState`].
pub trait StateValue: Copy + Eq {
    fn to_raw(self) -> u8;
    fn from_raw(raw: u8) -> Self;
}

/// Lock-free state holder with compare-and-set transitions.
///
/// Transitions return `false` instead of failing so the caller can decide
/// whether a lost race is an error.
pub struct AtomicState<S: StateValue> {
    value: AtomicU8,
    _marker: PhantomData<S>,
}

impl<S: StateValue> AtomicState<S> {
    pub fn new(initial: S) -> Self {
        Self {
            value: AtomicU8::new(initial.to_raw()),
            _marker: PhantomData,
        }
    }

    pub fn get(&self) -> S {
        S::from_raw(self.value.load(Ordering::Acquire))
    }

    pub fn is(&self, state: S) -> bool {
        self.get() == state
    }

    /// Move from `from` to `to`. Fails if the current state is not `from`.
    pub fn try_change(&self, from: S, to: S) -> bool {
        self.value
            .compare_exchange(from.to_raw(), to.to_raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `to` from any other state. Fails if already there.
    pub fn try_change_to(&self, to: S) -> bool {
        self.value.swap(to.to_raw(), Ordering::AcqRel) != to.to_raw()
    }
}

impl<S: StateValue + std::fmt::Debug> std::fmt::Debug for AtomicState<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AtomicState").field(&self.get()).finish()
    }
}

/// Monotonically increasing generation number.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    value: AtomicU64,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Bump the generation and return the new value.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }
}
