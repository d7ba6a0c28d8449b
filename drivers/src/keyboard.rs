//! PS/2 keyboard: scan-code set 1 to ASCII, buffered through the bounded
//! blocking queue so readers sleep until a key arrives.

use basalt_core::irq::{self, IntrFrame, KEYBOARD_VECTOR};
use basalt_core::sync::BlockQueue;
use basalt_lib::IntrGuard;
use basalt_lib::klog_info;
use basalt_lib::ports::PS2_DATA;

use crate::pic::{pic_enable_irq, pic_send_eoi};

const KEYBOARD_IRQ_LINE: u8 = 1;
const RELEASE_BIT: u8 = 0x80;

const SCANCODE_LSHIFT: u8 = 0x2A;
const SCANCODE_RSHIFT: u8 = 0x36;

/// Plain and shifted ASCII for scan-code set 1, index = make code.
const KEYMAP: [[u8; 2]; 0x3B] = [
    [0, 0],
    [0x1B, 0x1B], // escape
    [b'1', b'!'],
    [b'2', b'@'],
    [b'3', b'#'],
    [b'4', b'$'],
    [b'5', b'%'],
    [b'6', b'^'],
    [b'7', b'&'],
    [b'8', b'*'],
    [b'9', b'('],
    [b'0', b')'],
    [b'-', b'_'],
    [b'=', b'+'],
    [0x08, 0x08], // backspace
    [b'\t', b'\t'],
    [b'q', b'Q'],
    [b'w', b'W'],
    [b'e', b'E'],
    [b'r', b'R'],
    [b't', b'T'],
    [b'y', b'Y'],
    [b'u', b'U'],
    [b'i', b'I'],
    [b'o', b'O'],
    [b'p', b'P'],
    [b'[', b'{'],
    [b']', b'}'],
    [b'\n', b'\n'],
    [0, 0], // left control
    [b'a', b'A'],
    [b's', b'S'],
    [b'd', b'D'],
    [b'f', b'F'],
    [b'g', b'G'],
    [b'h', b'H'],
    [b'j', b'J'],
    [b'k', b'K'],
    [b'l', b'L'],
    [b';', b':'],
    [b'\'', b'"'],
    [b'`', b'~'],
    [0, 0], // left shift
    [b'\\', b'|'],
    [b'z', b'Z'],
    [b'x', b'X'],
    [b'c', b'C'],
    [b'v', b'V'],
    [b'b', b'B'],
    [b'n', b'N'],
    [b'm', b'M'],
    [b',', b'<'],
    [b'.', b'>'],
    [b'/', b'?'],
    [0, 0], // right shift
    [b'*', b'*'],
    [0, 0], // left alt
    [b' ', b' '],
    [0, 0], // caps lock
];

static KEY_QUEUE: BlockQueue<u8, 64> = BlockQueue::new(0);

static mut SHIFT_HELD: bool = false;

/// Keyboard ISR: decode the scan code and enqueue printable bytes. The
/// queue never blocks here; input is dropped when no one drains it.
fn keyboard_interrupt(_frame: &mut IntrFrame) {
    let scancode = unsafe { PS2_DATA.read() };
    pic_send_eoi(KEYBOARD_IRQ_LINE);

    let released = scancode & RELEASE_BIT != 0;
    let make = scancode & !RELEASE_BIT;

    if make == SCANCODE_LSHIFT || make == SCANCODE_RSHIFT {
        unsafe { SHIFT_HELD = !released };
        return;
    }
    if released || make as usize >= KEYMAP.len() {
        return;
    }

    let shifted = unsafe { SHIFT_HELD };
    let byte = KEYMAP[make as usize][shifted as usize];
    if byte != 0 {
        KEY_QUEUE.try_push(byte);
    }
}

/// Console source for the standard input stream: blocks for the first
/// byte, then drains whatever else is pending.
pub fn keyboard_read(buf: &mut [u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    let _guard = IntrGuard::new();
    buf[0] = KEY_QUEUE.pop();
    let mut read = 1;
    while read < buf.len() {
        match KEY_QUEUE.try_pop() {
            Some(byte) => {
                buf[read] = byte;
                read += 1;
            }
            None => break,
        }
    }
    read
}

pub fn keyboard_init() {
    irq::register_handler(KEYBOARD_VECTOR, keyboard_interrupt);
    pic_enable_irq(KEYBOARD_IRQ_LINE);
    klog_info!("PS/2 keyboard online");
}
