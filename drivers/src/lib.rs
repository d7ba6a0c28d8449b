//! Hardware drivers: 8259 PIC, 8253 PIT, 16550 serial, PS/2 keyboard and
//! the IDE disk stack with its partition scan.

#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod ide;
pub mod keyboard;
pub mod part;
pub mod pic;
pub mod pit;
pub mod serial;
