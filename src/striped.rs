//! Contention-free running statistics for the metrics layer.
//!
//! A [`StripedStat`] keeps a sample count and a running total (for example
//! nanoseconds of latency) spread over cache-line aligned stripes. Each
//! thread is pinned to one stripe the first time it records, so tasks on
//! different worker threads never write the same line.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const MIN_STRIPES: usize = 4;
const MAX_STRIPES: usize = 64;

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SLOT: usize = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default)]
#[repr(align(64))]
struct Stripe {
    count: AtomicU64,
    total: AtomicU64,
}

/// Count and total of recorded samples.
///
/// Reads sum every stripe without a lock, so a reader racing writers can
/// see a count and total from slightly different instants.
#[derive(Debug)]
pub struct StripedStat {
    stripes: Box<[Stripe]>,
}

impl StripedStat {
    /// One stripe per available core, rounded up to a power of two.
    pub fn new() -> Self {
        let cores = std::thread::available_parallelism().map_or(MIN_STRIPES, |n| n.get());
        Self::with_stripes(cores)
    }

    pub fn with_stripes(stripes: usize) -> Self {
        let n = stripes.clamp(MIN_STRIPES, MAX_STRIPES).next_power_of_two();
        Self {
            stripes: (0..n).map(|_| Stripe::default()).collect(),
        }
    }

    #[inline]
    fn stripe(&self) -> &Stripe {
        let slot = SLOT.with(|slot| *slot);
        &self.stripes[slot & (self.stripes.len() - 1)]
    }

    /// Record one sample of `value`.
    #[inline]
    pub fn record(&self, value: u64) {
        let stripe = self.stripe();
        stripe.count.fetch_add(1, Ordering::Relaxed);
        stripe.total.fetch_add(value, Ordering::Relaxed);
    }

    /// Record one event that carries no value.
    #[inline]
    pub fn bump(&self) {
        self.stripe().count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.stripes
            .iter()
            .map(|s| s.count.load(Ordering::Relaxed))
            .fold(0, u64::wrapping_add)
    }

    pub fn total(&self) -> u64 {
        self.stripes
            .iter()
            .map(|s| s.total.load(Ordering::Relaxed))
            .fold(0, u64::wrapping_add)
    }

    /// Mean sample value, `None` before the first sample.
    pub fn mean(&self) -> Option<f64> {
        match self.count() {
            0 => None,
            count => Some(self.total() as f64 / count as f64),
        }
    }
}

impl Default for StripedStat {
    fn default() -> Self {
        Self::new()
    }
}
