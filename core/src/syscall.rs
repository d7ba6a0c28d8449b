//! The syscall table and its dispatch entry.
//!
//! User code raises `int 0x30` with the call number in `eax` and a pointer
//! to (or the value of) the argument block in `ebx`; the result comes back
//! in the frame's `eax` slot, which the interrupt exit restores into the
//! user's register. Handlers live in a fixed function-pointer table
//! indexed by the `abi` syscall numbers.

use core::fmt::Write;

use basalt_abi::fs::MAX_PATH_LEN;
use basalt_abi::fs::{INVALID_FD, SeekOrigin};
use basalt_abi::syscall::{
    OpenFileArgs, ReadFileArgs, SYSCALL_COUNT, SYSCALL_VECTOR, SeekFileArgs, WriteFileArgs,
};
use basalt_abi::task::KERNEL_PID;
use basalt_fs::fileio;
use basalt_lib::{klog_info, string};
use basalt_mm::{PoolKind, sys_alloc, sys_free};

use crate::irq::{self, IntrFrame};
use crate::process;
use crate::scheduler::current_thread;

type SyscallHandler = fn(u32) -> u32;

/// Handlers in syscall-number order; see `basalt_abi::syscall`.
static SYSCALL_TABLE: [SyscallHandler; SYSCALL_COUNT] = [
    sys_get_curr_pid,
    sys_print_char,
    sys_print_hex,
    sys_print_str,
    sys_mem_alloc,
    sys_mem_free,
    sys_open_file,
    sys_close_file,
    sys_write_file,
    sys_read_file,
    sys_seek_file,
    sys_delete_file,
    sys_create_dir,
    sys_fork,
];

/// Install the syscall trap handler.
pub fn syscall_init() {
    irq::register_handler(SYSCALL_VECTOR, syscall_dispatch);
    klog_info!("syscall table installed at vector {SYSCALL_VECTOR:#x}");
}

fn syscall_dispatch(frame: &mut IntrFrame) {
    let number = frame.eax as usize;
    frame.eax = if number < SYSCALL_TABLE.len() {
        SYSCALL_TABLE[number](frame.ebx)
    } else {
        klog_info!("syscall: unknown number {number}");
        u32::MAX
    };
}

fn caller_pid() -> u32 {
    unsafe { (*current_thread()).pid }
}

/// View a NUL-terminated user string, bounded by the path limit.
unsafe fn cstr_arg<'a>(ptr: *const u8) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    let len = string::cstr_len(ptr, MAX_PATH_LEN);
    core::str::from_utf8(core::slice::from_raw_parts(ptr, len)).ok()
}

struct FixedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let take = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn sys_get_curr_pid(_arg: u32) -> u32 {
    caller_pid()
}

fn sys_print_char(arg: u32) -> u32 {
    fileio::console_out(&[arg as u8]);
    0
}

fn sys_print_hex(arg: u32) -> u32 {
    let mut buf = [0u8; 16];
    let mut writer = FixedWriter {
        buf: &mut buf,
        len: 0,
    };
    let _ = write!(writer, "{arg:#x}");
    let len = writer.len;
    fileio::console_out(&buf[..len]);
    0
}

fn sys_print_str(arg: u32) -> u32 {
    match unsafe { cstr_arg(arg as *const u8) } {
        Some(text) => fileio::console_out(text.as_bytes()) as u32,
        None => 0,
    }
}

/// Byte-granularity allocation from the caller's heap: kernel threads use
/// the kernel pool, processes their own.
fn sys_mem_alloc(size: u32) -> u32 {
    let kind = if caller_pid() == KERNEL_PID {
        PoolKind::Kernel
    } else {
        PoolKind::User
    };
    sys_alloc(kind, size as usize) as u32
}

fn sys_mem_free(vaddr: u32) -> u32 {
    sys_free(vaddr as *mut u8);
    0
}

fn sys_open_file(arg: u32) -> u32 {
    let args = unsafe { &*(arg as *const OpenFileArgs) };
    match unsafe { cstr_arg(args.path) } {
        Some(path) => fileio::fileio_open(caller_pid(), path, args.flags) as u32,
        None => INVALID_FD as u32,
    }
}

fn sys_close_file(desc: u32) -> u32 {
    fileio::fileio_close(caller_pid(), desc as usize) as u32
}

fn sys_write_file(arg: u32) -> u32 {
    let args = unsafe { &*(arg as *const WriteFileArgs) };
    if args.data.is_null() {
        return 0;
    }
    let data = unsafe { core::slice::from_raw_parts(args.data, args.size as usize) };
    fileio::fileio_write(caller_pid(), args.desc as usize, data) as u32
}

fn sys_read_file(arg: u32) -> u32 {
    let args = unsafe { &*(arg as *const ReadFileArgs) };
    if args.buf.is_null() {
        return 0;
    }
    let buf = unsafe { core::slice::from_raw_parts_mut(args.buf, args.size as usize) };
    fileio::fileio_read(caller_pid(), args.desc as usize, buf) as u32
}

fn sys_seek_file(arg: u32) -> u32 {
    let args = unsafe { &*(arg as *const SeekFileArgs) };
    match SeekOrigin::from_u32(args.origin) {
        Some(origin) => fileio::fileio_seek(caller_pid(), args.desc as usize, args.offset, origin),
        None => u32::MAX,
    }
}

fn sys_delete_file(arg: u32) -> u32 {
    match unsafe { cstr_arg(arg as *const u8) } {
        Some(path) => fileio::fileio_unlink(path) as u32,
        None => 0,
    }
}

fn sys_create_dir(arg: u32) -> u32 {
    match unsafe { cstr_arg(arg as *const u8) } {
        Some(path) => fileio::fileio_mkdir(path) as u32,
        None => 0,
    }
}

fn sys_fork(_arg: u32) -> u32 {
    process::fork_current()
}
