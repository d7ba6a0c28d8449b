//! 16550 UART driver and klog backend.

use core::fmt;

use basalt_lib::ports::{
    COM1, UART_FCR_CLEAR_RX, UART_FCR_CLEAR_TX, UART_FCR_ENABLE_FIFO, UART_LCR_DLAB, UART_MCR_DTR,
    UART_MCR_RTS, UART_REG_FCR, UART_REG_IER, UART_REG_LCR, UART_REG_MCR, serial_write_bytes,
};
use basalt_lib::{IrqMutex, klog_register_backend};

static SERIAL_LOCK: IrqMutex<()> = IrqMutex::new(());

/// Klog backend: one lock acquisition per line keeps output unsheared.
fn klog_backend(args: fmt::Arguments<'_>) {
    struct SerialWriter;

    impl fmt::Write for SerialWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            unsafe { serial_write_bytes(COM1, s.as_bytes()) };
            Ok(())
        }
    }

    let _guard = SERIAL_LOCK.lock();
    let _ = fmt::write(&mut SerialWriter, args);
    unsafe { serial_write_bytes(COM1, b"\n") };
}

/// Console sink used by the standard output streams.
pub fn serial_write(data: &[u8]) -> usize {
    let _guard = SERIAL_LOCK.lock();
    unsafe { serial_write_bytes(COM1, data) };
    data.len()
}

/// Program COM1 (115200 8N1, FIFOs on) and take over kernel logging.
pub fn serial_init() {
    unsafe {
        COM1.offset(UART_REG_IER).write(0x00);
        COM1.offset(UART_REG_LCR).write(UART_LCR_DLAB);
        // Divisor 1: 115200 baud.
        COM1.offset(0).write(0x01);
        COM1.offset(UART_REG_IER).write(0x00);
        COM1.offset(UART_REG_LCR).write(0x03);
        COM1.offset(UART_REG_FCR)
            .write(UART_FCR_ENABLE_FIFO | UART_FCR_CLEAR_RX | UART_FCR_CLEAR_TX);
        COM1.offset(UART_REG_MCR).write(UART_MCR_DTR | UART_MCR_RTS);
    }

    klog_register_backend(klog_backend);
}
