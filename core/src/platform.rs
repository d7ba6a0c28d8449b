//! Callback registry decoupling the scheduler from the driver crates.
//!
//! The timer driver lives above this crate in the dependency graph, so it
//! registers its tick counter and frequency here during boot; `sleep_ms`
//! and the disk busy-wait read them back without a dependency cycle.

use core::sync::atomic::{AtomicUsize, Ordering};

use basalt_lib::ports::PIT_DEFAULT_FREQUENCY_HZ;

pub type TimerTicksFn = fn() -> u64;
pub type TimerFrequencyFn = fn() -> u32;

static TIMER_TICKS: AtomicUsize = AtomicUsize::new(0);
static TIMER_FREQUENCY: AtomicUsize = AtomicUsize::new(0);

/// Called once by the timer driver after programming the PIT.
pub fn register_timer(ticks: TimerTicksFn, frequency: TimerFrequencyFn) {
    TIMER_TICKS.store(ticks as usize, Ordering::Release);
    TIMER_FREQUENCY.store(frequency as usize, Ordering::Release);
}

/// Monotonic tick count since boot; zero until the timer registers.
pub fn timer_ticks() -> u64 {
    let raw = TIMER_TICKS.load(Ordering::Acquire);
    if raw == 0 {
        return 0;
    }
    let ticks: TimerTicksFn = unsafe { core::mem::transmute(raw) };
    ticks()
}

/// Timer interrupt frequency in Hz.
pub fn timer_frequency() -> u32 {
    let raw = TIMER_FREQUENCY.load(Ordering::Acquire);
    if raw == 0 {
        return PIT_DEFAULT_FREQUENCY_HZ;
    }
    let frequency: TimerFrequencyFn = unsafe { core::mem::transmute(raw) };
    frequency()
}
