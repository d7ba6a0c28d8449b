//! Descriptor tables: the kernel-wide open-file table plus the 8-slot
//! local tables owned by the kernel and by each process.
//!
//! Local descriptors 0–2 are pre-wired to the standard streams, which route
//! to the registered console callbacks instead of the volume. Everything
//! else maps through a global slot holding the open inode, the access
//! position and the open flags.

use core::sync::atomic::{AtomicUsize, Ordering};

use basalt_abi::fs::{
    INVALID_FD, MAX_OPEN_FILES, O_WRONLY, PROC_FD_COUNT, STD_STREAM_COUNT, SeekOrigin, wants_create,
    wants_write,
};
use basalt_abi::task::{INVALID_PID, KERNEL_PID, MAX_PROCESSES};
use basalt_lib::{IntrGuard, IrqMutex, klog_info};

use crate::blockdev::BlockDevice;
use crate::path;
use crate::volume::{FsError, FsResult, MemInode, Volume};

// ---------------------------------------------------------------------------
// Console plumbing for the standard streams
// ---------------------------------------------------------------------------

pub type ConsoleWriteFn = fn(&[u8]) -> usize;
pub type ConsoleReadFn = fn(&mut [u8]) -> usize;

static CONSOLE_WRITE: AtomicUsize = AtomicUsize::new(0);
static CONSOLE_READ: AtomicUsize = AtomicUsize::new(0);

/// Wire the standard streams to a console sink/source (the serial console
/// and the keyboard queue in practice).
pub fn register_console(write: ConsoleWriteFn, read: ConsoleReadFn) {
    CONSOLE_WRITE.store(write as usize, Ordering::Release);
    CONSOLE_READ.store(read as usize, Ordering::Release);
}

fn console_write(data: &[u8]) -> usize {
    let raw = CONSOLE_WRITE.load(Ordering::Acquire);
    if raw == 0 {
        return 0;
    }
    let write: ConsoleWriteFn = unsafe { core::mem::transmute(raw) };
    write(data)
}

/// Direct console sink access for the kernel's print syscalls.
pub fn console_out(data: &[u8]) -> usize {
    console_write(data)
}

fn console_read(buf: &mut [u8]) -> usize {
    let raw = CONSOLE_READ.load(Ordering::Acquire);
    if raw == 0 {
        return 0;
    }
    let read: ConsoleReadFn = unsafe { core::mem::transmute(raw) };
    read(buf)
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct GlobalFile {
    inode: *mut MemInode,
    pos: u32,
    flags: u32,
    in_use: bool,
}

impl GlobalFile {
    const fn free() -> Self {
        Self {
            inode: core::ptr::null_mut(),
            pos: 0,
            flags: 0,
            in_use: false,
        }
    }

    /// The reserved console slots carry no inode.
    const fn std_stream() -> Self {
        Self {
            inode: core::ptr::null_mut(),
            pos: 0,
            flags: 0,
            in_use: true,
        }
    }
}

/// Maps local descriptors to global table indices.
#[derive(Clone, Copy)]
struct LocalTable {
    fds: [usize; PROC_FD_COUNT],
}

impl LocalTable {
    const fn new() -> Self {
        let mut fds = [INVALID_FD; PROC_FD_COUNT];
        fds[0] = 0;
        fds[1] = 1;
        fds[2] = 2;
        Self { fds }
    }

    fn install(&mut self, global_idx: usize) -> usize {
        for (local, slot) in self.fds.iter_mut().enumerate().skip(STD_STREAM_COUNT) {
            if *slot == INVALID_FD {
                *slot = global_idx;
                return local;
            }
        }
        INVALID_FD
    }

    fn global_of(&self, local: usize) -> usize {
        if local >= PROC_FD_COUNT {
            return INVALID_FD;
        }
        self.fds[local]
    }

    fn reset(&mut self, local: usize) {
        if local >= STD_STREAM_COUNT && local < PROC_FD_COUNT {
            self.fds[local] = INVALID_FD;
        }
    }
}

#[derive(Clone, Copy)]
struct ProcSlot {
    pid: u32,
    table: LocalTable,
}

impl ProcSlot {
    const fn free() -> Self {
        Self {
            pid: INVALID_PID,
            table: LocalTable::new(),
        }
    }
}

struct FileioState {
    volume: Option<Volume<'static>>,
    global: [GlobalFile; MAX_OPEN_FILES],
    kernel_fds: LocalTable,
    procs: [ProcSlot; MAX_PROCESSES],
}

impl FileioState {
    const fn new() -> Self {
        let mut global = [GlobalFile::free(); MAX_OPEN_FILES];
        global[0] = GlobalFile::std_stream();
        global[1] = GlobalFile::std_stream();
        global[2] = GlobalFile::std_stream();
        Self {
            volume: None,
            global,
            kernel_fds: LocalTable::new(),
            procs: [ProcSlot::free(); MAX_PROCESSES],
        }
    }

    fn table_mut(&mut self, pid: u32) -> Option<&mut LocalTable> {
        if pid == KERNEL_PID {
            return Some(&mut self.kernel_fds);
        }
        self.procs
            .iter_mut()
            .find(|slot| slot.pid == pid)
            .map(|slot| &mut slot.table)
    }

    fn free_global_slot(&self) -> Option<usize> {
        (STD_STREAM_COUNT..MAX_OPEN_FILES).find(|&idx| !self.global[idx].in_use)
    }

    fn inode_is_open(&self, inode_idx: u32) -> bool {
        self.global.iter().any(|file| {
            file.in_use
                && !file.inode.is_null()
                && unsafe { (*file.inode).idx } == inode_idx
        })
    }
}

// SAFETY: all access is serialised by the FILEIO mutex.
unsafe impl Send for FileioState {}

static FILEIO: IrqMutex<FileioState> = IrqMutex::new(FileioState::new());

// ---------------------------------------------------------------------------
// Mounting and per-process lifecycle
// ---------------------------------------------------------------------------

/// Mount the default partition. The device must live for the rest of the
/// kernel's life (the IDE layer hands in a leaked partition handle).
pub fn fileio_mount(device: &'static mut dyn BlockDevice, part_start_lba: u32) -> FsResult<()> {
    let volume = Volume::mount(device, part_start_lba)?;
    klog_info!("fs: mounted partition at LBA {part_start_lba}");
    FILEIO.lock().volume = Some(volume);
    Ok(())
}

pub fn fileio_is_mounted() -> bool {
    FILEIO.lock().volume.is_some()
}

/// Give `pid` a fresh descriptor table.
pub fn fileio_create_table(pid: u32) -> bool {
    let mut state = FILEIO.lock();
    if state.procs.iter().any(|slot| slot.pid == pid) {
        return true;
    }
    for slot in state.procs.iter_mut() {
        if slot.pid == INVALID_PID {
            slot.pid = pid;
            slot.table = LocalTable::new();
            return true;
        }
    }
    klog_info!("fileio: no descriptor-table slot for pid {pid}");
    false
}

/// Copy the parent's descriptor table to a fork child, taking one extra
/// reference on every inode the child now sees.
pub fn fileio_fork_table(parent_pid: u32, child_pid: u32) -> bool {
    let mut state = FILEIO.lock();

    let parent_table = match state.table_mut(parent_pid) {
        Some(table) => *table,
        None => return false,
    };

    let mut installed = false;
    for slot in state.procs.iter_mut() {
        if slot.pid == INVALID_PID {
            slot.pid = child_pid;
            slot.table = parent_table;
            installed = true;
            break;
        }
    }
    if !installed {
        klog_info!("fileio: no descriptor-table slot for forked pid {child_pid}");
        return false;
    }

    let _guard = IntrGuard::new();
    for &global_idx in parent_table.fds.iter() {
        if global_idx == INVALID_FD || global_idx < STD_STREAM_COUNT {
            continue;
        }
        let inode = state.global[global_idx].inode;
        if !inode.is_null() {
            unsafe { (*inode).open_times += 1 };
        }
    }
    true
}

/// Tear down a process table, closing whatever it still holds open.
pub fn fileio_destroy_table(pid: u32) {
    if pid == KERNEL_PID {
        return;
    }
    for local in STD_STREAM_COUNT..PROC_FD_COUNT {
        let _ = fileio_close(pid, local);
    }
    let mut state = FILEIO.lock();
    if let Some(slot) = state.procs.iter_mut().find(|slot| slot.pid == pid) {
        slot.pid = INVALID_PID;
        slot.table = LocalTable::new();
    }
}

// ---------------------------------------------------------------------------
// File operations
// ---------------------------------------------------------------------------

/// Open (or with `O_CREAT`, create) the file at `p` for `pid`. Returns the
/// local descriptor or [`INVALID_FD`].
pub fn fileio_open(pid: u32, p: &str, flags: u32) -> usize {
    if path::is_dir(p) {
        klog_info!("open: '{p}' is a directory path");
        return INVALID_FD;
    }

    let mut state = FILEIO.lock();
    let FileioState {
        volume,
        global,
        kernel_fds,
        procs,
    } = &mut *state;
    let Some(volume) = volume.as_mut() else {
        klog_info!("open: no mounted partition");
        return INVALID_FD;
    };

    let Ok(record) = volume.search_path(p) else {
        return INVALID_FD;
    };
    let parent = record.parent;

    let result = (|| -> FsResult<usize> {
        if record.found() && record.ftype == basalt_abi::fs::FileType::Directory {
            klog_info!("open: '{p}' is a directory");
            return Err(FsError::IsDirectory);
        }
        if record.searched.depth() != path::depth(p) {
            klog_info!("open: path '{}' does not exist", record.searched.as_str());
            return Err(FsError::NotFound);
        }
        if !record.found() && !wants_create(flags) {
            klog_info!("open: file '{p}' does not exist");
            return Err(FsError::NotFound);
        }
        if record.found() && wants_create(flags) {
            klog_info!("open: file '{p}' already exists");
            return Err(FsError::Exists);
        }

        let global_idx = state_free_slot(global)?;

        let inode = if record.found() {
            volume.open_file_node(record.inode_idx, wants_write(flags))?
        } else {
            let name = path::components(p).last().ok_or(FsError::BadPath)?;
            let inode = volume.create_file(&parent, name)?;
            if wants_write(flags) {
                unsafe { (*inode).write_deny = true };
            }
            inode
        };

        let table = match table_for(kernel_fds, procs, pid) {
            Some(table) => table,
            None => {
                volume.close_file_node(inode, wants_write(flags));
                return Err(FsError::NotFound);
            }
        };

        let local = table.install(global_idx);
        if local == INVALID_FD {
            klog_info!("open: process descriptor table is full");
            volume.close_file_node(inode, wants_write(flags));
            return Err(FsError::DirFull);
        }

        global[global_idx] = GlobalFile {
            inode,
            pos: 0,
            flags,
            in_use: true,
        };
        Ok(local)
    })();

    volume.close_dir(parent);
    result.unwrap_or(INVALID_FD)
}

fn state_free_slot(global: &[GlobalFile; MAX_OPEN_FILES]) -> FsResult<usize> {
    for idx in STD_STREAM_COUNT..MAX_OPEN_FILES {
        if !global[idx].in_use {
            return Ok(idx);
        }
    }
    klog_info!("open: the open-file table is full");
    Err(FsError::DirFull)
}

fn table_for<'t>(
    kernel: &'t mut LocalTable,
    procs: &'t mut [ProcSlot; MAX_PROCESSES],
    pid: u32,
) -> Option<&'t mut LocalTable> {
    if pid == KERNEL_PID {
        return Some(kernel);
    }
    procs
        .iter_mut()
        .find(|slot| slot.pid == pid)
        .map(|slot| &mut slot.table)
}

/// Close a local descriptor. Closing the standard streams is a no-op.
pub fn fileio_close(pid: u32, fd: usize) -> i32 {
    let mut state = FILEIO.lock();
    let state = &mut *state;

    let Some(table) = table_for(&mut state.kernel_fds, &mut state.procs, pid) else {
        return -1;
    };
    let global_idx = table.global_of(fd);
    if global_idx == INVALID_FD {
        return -1;
    }
    if global_idx < STD_STREAM_COUNT {
        return 0;
    }

    table.reset(fd);
    let file = state.global[global_idx];
    state.global[global_idx] = GlobalFile::free();

    if let Some(volume) = state.volume.as_mut() {
        if !file.inode.is_null() {
            volume.close_file_node(file.inode, wants_write(file.flags));
        }
    }
    0
}

/// Write through a local descriptor; the standard output streams go to the
/// console. Returns the number of bytes written.
pub fn fileio_write(pid: u32, fd: usize, data: &[u8]) -> usize {
    let mut state = FILEIO.lock();
    let state = &mut *state;

    let Some(table) = table_for(&mut state.kernel_fds, &mut state.procs, pid) else {
        return 0;
    };
    let global_idx = table.global_of(fd);
    if global_idx == INVALID_FD {
        return 0;
    }
    if global_idx < STD_STREAM_COUNT {
        return console_write(data);
    }

    let file = &mut state.global[global_idx];
    if !file.in_use || file.inode.is_null() {
        return 0;
    }
    if !wants_write(file.flags) {
        klog_info!("write: descriptor {fd} is read-only");
        return 0;
    }

    let Some(volume) = state.volume.as_mut() else {
        return 0;
    };
    match volume.write_file(file.inode, data) {
        Ok(written) => {
            file.pos = unsafe { (*file.inode).size };
            written
        }
        Err(_) => 0,
    }
}

/// Read through a local descriptor; standard input drains the console
/// source. Returns the number of bytes read.
pub fn fileio_read(pid: u32, fd: usize, buf: &mut [u8]) -> usize {
    let mut state = FILEIO.lock();
    let state = &mut *state;

    let Some(table) = table_for(&mut state.kernel_fds, &mut state.procs, pid) else {
        return 0;
    };
    let global_idx = table.global_of(fd);
    if global_idx == INVALID_FD {
        return 0;
    }
    if global_idx < STD_STREAM_COUNT {
        return console_read(buf);
    }

    let file = &mut state.global[global_idx];
    if !file.in_use || file.inode.is_null() {
        return 0;
    }
    if file.flags & O_WRONLY != 0 {
        klog_info!("read: descriptor {fd} is write-only");
        return 0;
    }

    let Some(volume) = state.volume.as_mut() else {
        return 0;
    };
    volume.read_file(file.inode, &mut file.pos, buf).unwrap_or(0)
}

/// Reposition a descriptor. The new position is clamped into
/// `[0, file size]` regardless of origin. Returns the new position, or
/// `u32::MAX` for an invalid descriptor.
pub fn fileio_seek(pid: u32, fd: usize, offset: i32, origin: SeekOrigin) -> u32 {
    let mut state = FILEIO.lock();
    let state = &mut *state;

    let Some(table) = table_for(&mut state.kernel_fds, &mut state.procs, pid) else {
        return u32::MAX;
    };
    let global_idx = table.global_of(fd);
    if global_idx == INVALID_FD || global_idx < STD_STREAM_COUNT {
        return u32::MAX;
    }

    let file = &mut state.global[global_idx];
    if !file.in_use || file.inode.is_null() {
        return u32::MAX;
    }

    let size = unsafe { (*file.inode).size } as i64;
    let base = match origin {
        SeekOrigin::Begin => 0,
        SeekOrigin::Curr => file.pos as i64,
        SeekOrigin::End => size,
    };
    let target = base + offset as i64;
    file.pos = target.clamp(0, size) as u32;
    file.pos
}

/// Delete the file at `p`. Fails while any descriptor still references it.
pub fn fileio_unlink(p: &str) -> bool {
    let mut state = FILEIO.lock();
    let state = &mut *state;

    let Some(volume) = state.volume.as_mut() else {
        return false;
    };
    let global = &state.global;
    volume
        .delete_file(p, |inode_idx| {
            global.iter().any(|file| {
                file.in_use
                    && !file.inode.is_null()
                    && unsafe { (*file.inode).idx } == inode_idx
            })
        })
        .is_ok()
}

/// Create the directory at `p`.
pub fn fileio_mkdir(p: &str) -> bool {
    let mut state = FILEIO.lock();
    match state.volume.as_mut() {
        Some(volume) => volume.create_dir(p).is_ok(),
        None => false,
    }
}

/// Remove the empty directory at `p`.
pub fn fileio_rmdir(p: &str) -> bool {
    let mut state = FILEIO.lock();
    match state.volume.as_mut() {
        Some(volume) => volume.delete_dir(p).is_ok(),
        None => false,
    }
}

/// Whether any descriptor currently references `inode_idx` (self-tests).
pub fn fileio_inode_is_open(inode_idx: u32) -> bool {
    FILEIO.lock().inode_is_open(inode_idx)
}
