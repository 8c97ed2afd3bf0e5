use std::sync::Arc;

use arc_swap::ArcSwap;

use super::ConfigSnapshot;

/// A single mutable cell holding the current, validated configuration
/// snapshot. Readers call [`ConfigHolder::current`] and get back a
/// consistent, fully-formed snapshot no matter how many swaps have raced
/// past them; a swap is never observed half-applied.
pub struct ConfigHolder {
    inner: ArcSwap<ConfigSnapshot>,
}

impl ConfigHolder {
    pub fn new(initial: ConfigSnapshot) -> Self {
        Self {
            inner: ArcSwap::from_pointee(initial),
        }
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    /// Atomically swap in a newly validated snapshot. Called only by the
    /// reload coordinator.
    pub fn swap(&self, next: ConfigSnapshot) -> Arc<ConfigSnapshot> {
        self.inner.swap(Arc::new(next))
    }
}
