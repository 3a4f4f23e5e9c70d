//! Adapters for the host RTOS primitives
//!
//! The transport pipeline leans on four primitive families — timed delay,
//! binary semaphore, priority-inheriting mutex, and fixed-depth queue —
//! and maps them onto whatever real-time kernel hosts the firmware. The
//! traits here are that seam: the integrator implements them over the
//! kernel's native objects, and the conversions below keep the timeout
//! and sizing contracts exact.
//!
//! Two conversions are load-bearing enough to centralize:
//!
//! - millisecond timeouts become kernel ticks by ceiling division, with
//!   the zero (non-blocking) and forever sentinels preserved exactly;
//! - queue item sizes become kernel-native word units by ceiling
//!   division, because an inexact conversion corrupts adjacent queue
//!   slots.

/// A bounded or sentinel wait, in milliseconds
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Timeout {
    /// Return immediately; never promoted to a blocking wait
    NoWait,
    /// Wait up to this many milliseconds
    Millis(u32),
    /// Wait until the operation completes
    Forever,
}

/// A wait converted to kernel ticks
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Ticks {
    /// The kernel's non-blocking sentinel
    NoWait,
    /// A bounded tick count, always at least one
    Count(u32),
    /// The kernel's wait-forever sentinel
    Forever,
}

/// The kernel tick frequency, in Hz
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TickRate(pub u32);

impl TickRate {
    /// Convert a millisecond timeout to kernel ticks
    ///
    /// Rounds up, so a bounded wait never undershoots the request. A
    /// nonzero request shorter than one tick becomes one tick — rounding
    /// it to zero would silently demote it to a non-blocking poll. The
    /// sentinels pass through untouched in both directions.
    pub const fn ticks(self, timeout: Timeout) -> Ticks {
        match timeout {
            Timeout::NoWait => Ticks::NoWait,
            Timeout::Forever => Ticks::Forever,
            Timeout::Millis(ms) => {
                let ticks = ((ms as u64 * self.0 as u64 + 999) / 1000) as u32;
                Ticks::Count(if ticks == 0 { 1 } else { ticks })
            }
        }
    }
}

/// Queue item size in kernel word units
///
/// Kernels that move queue items word-at-a-time need the item size in
/// words, rounded up; rounding down would overlap adjacent slots.
pub const fn item_size_words<T>() -> usize {
    (core::mem::size_of::<T>() + core::mem::size_of::<u32>() - 1) / core::mem::size_of::<u32>()
}

/// Timed delay of the current schedule unit
pub trait Delay {
    fn delay_ms(&mut self, ms: u32);
}

/// Binary semaphore
///
/// The interrupt-context post must be the kernel's non-blocking variant;
/// the task-context post may block.
pub trait Semaphore {
    fn post(&self) -> bool;
    fn post_from_isr(&self) -> bool;
    /// Returns `false` if the timeout elapsed first
    fn wait(&self, timeout: Timeout) -> bool;
}

/// Mutual exclusion with priority inheritance
///
/// Implementations must use the kernel's priority-inheriting flavor;
/// without it, a low-priority holder can starve the transport task.
pub trait Mutex {
    /// Returns `false` if the timeout elapsed first
    fn lock(&self, timeout: Timeout) -> bool;
    fn unlock(&self) -> bool;
}

/// Fixed-depth, fixed-item-size message queue
///
/// The interrupt-context send must be the kernel's non-blocking variant;
/// the task-context send may block forever.
pub trait Queue {
    type Item: Copy;

    fn send(&self, item: &Self::Item, timeout: Timeout) -> bool;
    fn send_from_isr(&self, item: &Self::Item) -> bool;
    fn receive(&self, timeout: Timeout) -> Option<Self::Item>;
}

#[cfg(test)]
mod test {
    use super::{item_size_words, TickRate, Ticks, Timeout};

    const RATE: TickRate = TickRate(100);

    #[test]
    fn sentinels_pass_through_exactly() {
        assert_eq!(RATE.ticks(Timeout::NoWait), Ticks::NoWait);
        assert_eq!(RATE.ticks(Timeout::Forever), Ticks::Forever);
    }

    #[test]
    fn sub_tick_waits_round_up_to_one() {
        // 1 ms is a tenth of a 100 Hz tick
        assert_eq!(RATE.ticks(Timeout::Millis(1)), Ticks::Count(1));
        assert_eq!(RATE.ticks(Timeout::Millis(9)), Ticks::Count(1));
    }

    #[test]
    fn whole_tick_waits_convert_by_ceiling() {
        assert_eq!(RATE.ticks(Timeout::Millis(10)), Ticks::Count(1));
        assert_eq!(RATE.ticks(Timeout::Millis(11)), Ticks::Count(2));
        assert_eq!(RATE.ticks(Timeout::Millis(1000)), Ticks::Count(100));
    }

    #[test]
    fn large_waits_do_not_overflow() {
        let rate = TickRate(1000);
        assert_eq!(
            rate.ticks(Timeout::Millis(u32::MAX - 1)),
            Ticks::Count(u32::MAX - 1)
        );
    }

    #[test]
    fn item_sizes_round_up_to_whole_words() {
        assert_eq!(item_size_words::<u8>(), 1);
        assert_eq!(item_size_words::<u32>(), 1);
        assert_eq!(item_size_words::<[u8; 5]>(), 2);
        assert_eq!(item_size_words::<[u8; 8]>(), 2);
        assert_eq!(item_size_words::<[u8; 9]>(), 3);
    }
}
