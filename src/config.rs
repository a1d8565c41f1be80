//! Process-wide backward configuration.
//!
//! Mirrors the framework-level flag controlling gradient accumulation order:
//! when `sort_sum_gradient` is set, accumulators collect contributions and
//! fold them by ascending op id instead of adding eagerly, which makes the
//! floating-point result deterministic across runs. The flag is sampled once
//! per accumulator at construction time, and an [`crate::autograd::Engine`]
//! may override it per instance.

use std::sync::atomic::{AtomicBool, Ordering};

static SORT_SUM_GRADIENT: AtomicBool = AtomicBool::new(false);

/// Reads the global sorted-accumulation flag.
pub fn sort_sum_gradient() -> bool {
    SORT_SUM_GRADIENT.load(Ordering::Relaxed)
}

/// Sets the global sorted-accumulation flag.
///
/// Takes effect for accumulators created afterwards; accumulators already
/// provisioned keep the strategy they were built with.
pub fn set_sort_sum_gradient(enabled: bool) {
    SORT_SUM_GRADIENT.store(enabled, Ordering::Relaxed);
}
