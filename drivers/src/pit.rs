//! 8253/8254 interval timer: the scheduler's heartbeat.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use basalt_core::irq::{self, CLOCK_VECTOR, IntrFrame};
use basalt_core::{platform, scheduler_tick};
use basalt_lib::klog_info;
use basalt_lib::ports::{
    PIT_BASE_FREQUENCY_HZ, PIT_CHANNEL0, PIT_COMMAND, PIT_COMMAND_ACCESS_LOHI, PIT_COMMAND_BINARY,
    PIT_COMMAND_CHANNEL0, PIT_COMMAND_MODE_RATE, PIT_DEFAULT_FREQUENCY_HZ, PIT_IRQ_LINE,
};

use crate::pic::{pic_enable_irq, pic_send_eoi};

static TICKS: AtomicU64 = AtomicU64::new(0);
static CURRENT_FREQUENCY_HZ: AtomicU32 = AtomicU32::new(PIT_DEFAULT_FREQUENCY_HZ);

pub fn pit_ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

pub fn pit_frequency() -> u32 {
    CURRENT_FREQUENCY_HZ.load(Ordering::Relaxed)
}

fn pit_calculate_divisor(mut frequency_hz: u32) -> u16 {
    if frequency_hz == 0 {
        frequency_hz = PIT_DEFAULT_FREQUENCY_HZ;
    }
    if frequency_hz > PIT_BASE_FREQUENCY_HZ {
        frequency_hz = PIT_BASE_FREQUENCY_HZ;
    }

    let divisor = (PIT_BASE_FREQUENCY_HZ / frequency_hz).clamp(1, 0xFFFF);
    CURRENT_FREQUENCY_HZ.store(PIT_BASE_FREQUENCY_HZ / divisor, Ordering::Relaxed);
    divisor as u16
}

fn pit_set_frequency(frequency_hz: u32) {
    let divisor = pit_calculate_divisor(frequency_hz);
    unsafe {
        PIT_COMMAND.write(
            PIT_COMMAND_CHANNEL0
                | PIT_COMMAND_ACCESS_LOHI
                | PIT_COMMAND_MODE_RATE
                | PIT_COMMAND_BINARY,
        );
        PIT_CHANNEL0.write((divisor & 0xFF) as u8);
        PIT_CHANNEL0.write((divisor >> 8) as u8);
    }
}

/// Clock ISR: account the tick, acknowledge, then let the scheduler
/// decide whether the running thread's slice is spent.
fn timer_interrupt(_frame: &mut IntrFrame) {
    TICKS.fetch_add(1, Ordering::Release);
    pic_send_eoi(PIT_IRQ_LINE);
    scheduler_tick();
}

/// Program channel 0 and hook the clock vector.
pub fn pit_init(frequency_hz: u32) {
    pit_set_frequency(frequency_hz);
    irq::register_handler(CLOCK_VECTOR, timer_interrupt);
    platform::register_timer(pit_ticks, pit_frequency);
    pic_enable_irq(PIT_IRQ_LINE);
    klog_info!("PIT: {} Hz tick online", pit_frequency());
}
