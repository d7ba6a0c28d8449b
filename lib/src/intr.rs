//! Scoped interrupt masking.

use crate::cpu;

/// Disables interrupts for the lifetime of the guard and restores the
/// previous interrupt flag on drop. Nesting is safe: an inner guard that
/// observes interrupts already disabled restores nothing.
///
/// ```ignore
/// {
///     let _guard = IntrGuard::new();
///     // interrupts are off here
/// }
/// // previous IF state restored
/// ```
pub struct IntrGuard {
    saved_flags: u32,
}

impl IntrGuard {
    #[inline]
    pub fn new() -> Self {
        Self {
            saved_flags: cpu::save_flags_cli(),
        }
    }

    /// Whether interrupts were enabled when the guard was taken.
    #[inline]
    pub fn was_enabled(&self) -> bool {
        self.saved_flags & cpu::EFLAGS_IF != 0
    }
}

impl Default for IntrGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IntrGuard {
    #[inline]
    fn drop(&mut self) {
        cpu::restore_flags(self.saved_flags);
    }
}
