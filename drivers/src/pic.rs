//! 8259A programmable interrupt controller pair.
//!
//! IRQs 0–7 arrive on the master (remapped to vectors 0x20–0x27), IRQs
//! 8–15 on the slave (0x28–0x2F). Lines start masked and drivers enable
//! their own as they come up. IRQ 7 and 15 can fire without a source; the
//! dispatcher drops those vectors when no driver claims them.

use basalt_core::irq::IRQ_BASE_VECTOR;
use basalt_lib::io::Port;
use basalt_lib::klog_info;

const PIC1_COMMAND: Port<u8> = Port::new(0x20);
const PIC1_DATA: Port<u8> = Port::new(0x21);
const PIC2_COMMAND: Port<u8> = Port::new(0xA0);
const PIC2_DATA: Port<u8> = Port::new(0xA1);

const ICW1_INIT: u8 = 0x11; // edge-triggered, cascade, expect ICW4
const ICW4_8086: u8 = 0x01;
const PIC_EOI: u8 = 0x20;

const CASCADE_IRQ: u8 = 2;

/// Remap both controllers behind the CPU exceptions and mask every line
/// except the cascade.
pub fn pic_init() {
    unsafe {
        PIC1_COMMAND.write(ICW1_INIT);
        PIC2_COMMAND.write(ICW1_INIT);

        PIC1_DATA.write(IRQ_BASE_VECTOR as u8);
        PIC2_DATA.write(IRQ_BASE_VECTOR as u8 + 8);

        PIC1_DATA.write(1 << CASCADE_IRQ);
        PIC2_DATA.write(CASCADE_IRQ);

        PIC1_DATA.write(ICW4_8086);
        PIC2_DATA.write(ICW4_8086);

        PIC1_DATA.write(!(1 << CASCADE_IRQ));
        PIC2_DATA.write(0xFF);
    }
    klog_info!("PIC remapped to vectors {:#x}..{:#x}", IRQ_BASE_VECTOR, IRQ_BASE_VECTOR + 15);
}

/// Unmask one IRQ line (0–15).
pub fn pic_enable_irq(irq: u8) {
    debug_assert!(irq < 16);
    unsafe {
        if irq < 8 {
            let mask = PIC1_DATA.read() & !(1 << irq);
            PIC1_DATA.write(mask);
        } else {
            let mask = PIC2_DATA.read() & !(1 << (irq - 8));
            PIC2_DATA.write(mask);
        }
    }
}

pub fn pic_disable_irq(irq: u8) {
    debug_assert!(irq < 16);
    unsafe {
        if irq < 8 {
            let mask = PIC1_DATA.read() | (1 << irq);
            PIC1_DATA.write(mask);
        } else {
            let mask = PIC2_DATA.read() | (1 << (irq - 8));
            PIC2_DATA.write(mask);
        }
    }
}

/// Acknowledge an IRQ; slave lines acknowledge both controllers.
pub fn pic_send_eoi(irq: u8) {
    unsafe {
        if irq >= 8 {
            PIC2_COMMAND.write(PIC_EOI);
        }
        PIC1_COMMAND.write(PIC_EOI);
    }
}
