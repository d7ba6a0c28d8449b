//! IDE/ATA disks in LBA28 PIO mode.
//!
//! Two channels, two disks each. A transfer takes the channel mutex,
//! programs the taskfile, issues the command and parks the thread on the
//! channel's binary semaphore; the IDE interrupt releases it once the
//! device has finished. Reads block before the data burst, writes after —
//! a write completes with an IRQ only once the device drains its buffer.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use basalt_core::irq::{self, IntrFrame, PRIMARY_IDE_VECTOR, SECONDARY_IDE_VECTOR};
use basalt_core::sleep_ms;
use basalt_core::sync::{Mutex, Semaphore};
use basalt_lib::io::{Port, read_words, write_words};
use basalt_lib::{klog_info, string};

use crate::part;
use crate::pic::{pic_enable_irq, pic_send_eoi};

pub const SECTOR_SIZE: usize = basalt_abi::fs::SECTOR_SIZE;

/// The largest disk the driver accepts: 80 MiB.
pub const MAX_DISK_SIZE: u32 = 80 * 1024 * 1024;
pub const MAX_LBA: u32 = MAX_DISK_SIZE / SECTOR_SIZE as u32 - 1;

/// One command moves at most 256 sectors; a zero in the 8-bit count
/// register means 256.
const MAX_SECTORS_PER_CMD: u32 = 256;

const REG_DATA: u16 = 0;
const REG_SECTOR_COUNT: u16 = 2;
const REG_LBA_LOW: u16 = 3;
const REG_LBA_MID: u16 = 4;
const REG_LBA_HIGH: u16 = 5;
const REG_DEVICE: u16 = 6;
const REG_STATUS: u16 = 7;
const REG_CMD: u16 = 7;
const REG_ALT_STATUS: u16 = 0x206;

const STATUS_BSY: u8 = 0x80;
const STATUS_DRQ: u8 = 0x08;

const DEVICE_BASE: u8 = 0xA0;
const DEVICE_LBA: u8 = 0x40;
const DEVICE_SLAVE: u8 = 0x10;

const CMD_IDENTIFY: u8 = 0xEC;
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;

/// How long a busy device may stall before the kernel gives up.
const BUSY_WAIT_LIMIT_MS: u32 = 30_000;
const BUSY_WAIT_STEP_MS: u32 = 10;

pub const MAX_CHANNELS: usize = 2;
pub const DISKS_PER_CHANNEL: usize = 2;
pub const MAX_DISKS: usize = MAX_CHANNELS * DISKS_PER_CHANNEL;

/// The loader's BIOS handoff records the disk count at physical `0x475`.
const BOOT_DISK_COUNT_ADDR: u32 = 0xC000_0475;

/// Disk 0 carries the boot image and is never scanned for partitions.
pub const BOOT_DISK: usize = 0;

pub struct IdeChannel {
    name: &'static str,
    base_port: u16,
    irq_line: u8,
    /// Serialises whole multi-command transfers on this cable.
    lock: Mutex,
    /// Set right before a command is issued; the ISR only signals when a
    /// command is actually outstanding.
    waiting_intr: AtomicBool,
    /// Released by the ISR when the device raises its interrupt.
    disk_done: Semaphore,
}

impl IdeChannel {
    const fn new(name: &'static str, base_port: u16, irq_line: u8) -> Self {
        Self {
            name,
            base_port,
            irq_line,
            lock: Mutex::new(),
            waiting_intr: AtomicBool::new(false),
            disk_done: Semaphore::binary(),
        }
    }

    fn port(&self, offset: u16) -> Port<u8> {
        Port::new(self.base_port + offset)
    }

    fn data_port(&self) -> u16 {
        self.base_port + REG_DATA
    }
}

static CHANNELS: [IdeChannel; MAX_CHANNELS] = [
    IdeChannel::new("ide0", 0x1F0, 14),
    IdeChannel::new("ide1", 0x170, 15),
];

#[derive(Clone, Copy)]
pub struct Disk {
    pub name: [u8; 8],
    pub sector_count: u32,
    pub present: bool,
}

impl Disk {
    const fn empty() -> Self {
        Self {
            name: [0; 8],
            sector_count: 0,
            present: false,
        }
    }
}

struct DiskCell(core::cell::UnsafeCell<[Disk; MAX_DISKS]>);

// SAFETY: written during single-threaded bring-up, read-only afterwards.
unsafe impl Sync for DiskCell {}

static DISKS: DiskCell = DiskCell(core::cell::UnsafeCell::new([Disk::empty(); MAX_DISKS]));
static DISK_COUNT: AtomicUsize = AtomicUsize::new(0);

pub fn disk_count() -> usize {
    DISK_COUNT.load(Ordering::Acquire)
}

pub fn disk(idx: usize) -> Disk {
    debug_assert!(idx < MAX_DISKS);
    unsafe { (*DISKS.0.get())[idx] }
}

#[inline]
fn channel_of(disk: usize) -> &'static IdeChannel {
    &CHANNELS[disk / DISKS_PER_CHANNEL]
}

#[inline]
fn is_slave(disk: usize) -> bool {
    disk % DISKS_PER_CHANNEL != 0
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

fn select(channel: &IdeChannel, slave: bool) {
    let mut device = DEVICE_BASE | DEVICE_LBA;
    if slave {
        device |= DEVICE_SLAVE;
    }
    unsafe { channel.port(REG_DEVICE).write(device) };
}

/// Program the taskfile for `count` sectors at `lba` (LBA28: the address
/// high nibble rides in the device register).
fn set_sectors(channel: &IdeChannel, slave: bool, lba: u32, count: u32) {
    debug_assert!(0 < count && count <= MAX_SECTORS_PER_CMD);
    debug_assert!(lba + count <= MAX_LBA + 1);

    let adjusted = if count == MAX_SECTORS_PER_CMD { 0 } else { count as u8 };
    let mut device = DEVICE_BASE | DEVICE_LBA | ((lba >> 24) & 0xF) as u8;
    if slave {
        device |= DEVICE_SLAVE;
    }

    unsafe {
        channel.port(REG_SECTOR_COUNT).write(adjusted);
        channel.port(REG_LBA_LOW).write(lba as u8);
        channel.port(REG_LBA_MID).write((lba >> 8) as u8);
        channel.port(REG_LBA_HIGH).write((lba >> 16) as u8);
        channel.port(REG_DEVICE).write(device);
    }
}

/// Mark the channel as expecting an interrupt and issue `cmd`.
fn send_cmd(channel: &IdeChannel, cmd: u8) {
    channel.waiting_intr.store(true, Ordering::Release);
    unsafe { channel.port(REG_CMD).write(cmd) };
}

/// Poll the alternate status register until the device leaves BUSY, then
/// report whether data is ready. Gives up after thirty seconds.
fn busy_wait(channel: &IdeChannel) -> bool {
    let mut waited = 0u32;
    while waited < BUSY_WAIT_LIMIT_MS {
        let status = unsafe { channel.port(REG_ALT_STATUS).read() };
        if status & STATUS_BSY != 0 {
            sleep_ms(BUSY_WAIT_STEP_MS);
            waited += BUSY_WAIT_STEP_MS;
        } else {
            return status & STATUS_DRQ != 0;
        }
    }
    false
}

/// Read `buf.len() / 512` sectors starting at `lba`.
///
/// The transfer is chunked at 256 sectors; each chunk blocks on the
/// channel semaphore until the device interrupt, then checks readiness
/// before draining the data register. A device that never becomes ready
/// is a fatal condition.
pub fn read_sectors(disk: usize, lba: u32, buf: &mut [u8]) {
    assert!(!buf.is_empty() && buf.len() % SECTOR_SIZE == 0);
    let count = (buf.len() / SECTOR_SIZE) as u32;
    assert!(lba + count <= MAX_LBA + 1);

    let channel = channel_of(disk);
    let slave = is_slave(disk);
    let _guard = channel.lock.guard();

    select(channel, slave);
    let mut done = 0u32;
    while done < count {
        let chunk = (count - done).min(MAX_SECTORS_PER_CMD);
        set_sectors(channel, slave, lba + done, chunk);
        send_cmd(channel, CMD_READ_SECTORS);

        // The device works; this thread sleeps until its IRQ.
        channel.disk_done.decrease();

        if !busy_wait(channel) {
            panic!(
                "ide: read failure on {} at LBA {}",
                channel.name,
                lba + done
            );
        }

        let offset = done as usize * SECTOR_SIZE;
        unsafe {
            read_words(
                channel.data_port(),
                buf[offset..].as_mut_ptr() as *mut u16,
                chunk as usize * SECTOR_SIZE / 2,
            );
        }
        done += chunk;
    }
}

/// Write `data.len() / 512` sectors starting at `lba`. Unlike reads, the
/// interrupt arrives after the data burst, once the device has drained it.
pub fn write_sectors(disk: usize, lba: u32, data: &[u8]) {
    assert!(!data.is_empty() && data.len() % SECTOR_SIZE == 0);
    let count = (data.len() / SECTOR_SIZE) as u32;
    assert!(lba + count <= MAX_LBA + 1);

    let channel = channel_of(disk);
    let slave = is_slave(disk);
    let _guard = channel.lock.guard();

    select(channel, slave);
    let mut done = 0u32;
    while done < count {
        let chunk = (count - done).min(MAX_SECTORS_PER_CMD);
        set_sectors(channel, slave, lba + done, chunk);
        send_cmd(channel, CMD_WRITE_SECTORS);

        if !busy_wait(channel) {
            panic!(
                "ide: write failure on {} at LBA {}",
                channel.name,
                lba + done
            );
        }

        let offset = done as usize * SECTOR_SIZE;
        unsafe {
            write_words(
                channel.data_port(),
                data[offset..].as_ptr() as *const u16,
                chunk as usize * SECTOR_SIZE / 2,
            );
        }

        channel.disk_done.decrease();
        done += chunk;
    }
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

fn ide_interrupt(channel_idx: usize) {
    let channel = &CHANNELS[channel_idx];
    pic_send_eoi(channel.irq_line);

    // The channel is locked for the whole transfer, so an interrupt can
    // only belong to the one outstanding command.
    if channel.waiting_intr.swap(false, Ordering::AcqRel) {
        channel.disk_done.increase();
        // Reading the status register lets the device drop the line.
        unsafe { channel.port(REG_STATUS).read() };
    }
}

fn primary_ide_interrupt(_frame: &mut IntrFrame) {
    ide_interrupt(0);
}

fn secondary_ide_interrupt(_frame: &mut IntrFrame) {
    ide_interrupt(1);
}

// ---------------------------------------------------------------------------
// Identification and bring-up
// ---------------------------------------------------------------------------

/// Swap each byte pair of an IDENTIFY string field into readable order.
fn swapped_string(words: &[u8], out: &mut [u8]) {
    for (i, pair) in words.chunks_exact(2).enumerate() {
        if i * 2 + 1 >= out.len() {
            break;
        }
        out[i * 2] = pair[1];
        out[i * 2 + 1] = pair[0];
    }
}

struct IdentifyInfo {
    sector_count: u32,
    serial: [u8; 20],
    model: [u8; 40],
}

fn identify(disk_idx: usize) -> Option<IdentifyInfo> {
    let channel = channel_of(disk_idx);
    let slave = is_slave(disk_idx);
    let _guard = channel.lock.guard();

    select(channel, slave);
    send_cmd(channel, CMD_IDENTIFY);
    channel.disk_done.decrease();
    if !busy_wait(channel) {
        return None;
    }

    let mut raw = [0u8; SECTOR_SIZE];
    unsafe { read_words(channel.data_port(), raw.as_mut_ptr() as *mut u16, SECTOR_SIZE / 2) };

    // Words 10..19 hold the serial, 27..46 the model (both with byte
    // pairs swapped), words 60/61 the LBA28 sector count.
    let mut serial = [b' '; 20];
    swapped_string(&raw[10 * 2..20 * 2], &mut serial);
    let mut model = [b' '; 40];
    swapped_string(&raw[27 * 2..47 * 2], &mut model);
    let sector_count = u32::from_le_bytes([
        raw[60 * 2],
        raw[60 * 2 + 1],
        raw[61 * 2],
        raw[61 * 2 + 1],
    ]);
    Some(IdentifyInfo {
        sector_count,
        serial,
        model,
    })
}

fn boot_disk_count() -> usize {
    #[cfg(target_arch = "x86")]
    {
        let count = unsafe { core::ptr::read_volatile(BOOT_DISK_COUNT_ADDR as *const u8) };
        count as usize
    }
    #[cfg(not(target_arch = "x86"))]
    {
        0
    }
}

/// Probe the channels, identify every disk and scan the non-boot disks
/// for partitions.
pub fn ide_init() {
    irq::register_handler(PRIMARY_IDE_VECTOR, primary_ide_interrupt);
    irq::register_handler(SECONDARY_IDE_VECTOR, secondary_ide_interrupt);
    pic_enable_irq(CHANNELS[0].irq_line);
    pic_enable_irq(CHANNELS[1].irq_line);

    let count = boot_disk_count().min(MAX_DISKS);
    DISK_COUNT.store(count, Ordering::Release);
    klog_info!("ide: {count} disk(s) reported by the loader");

    for idx in 0..count {
        let disks = unsafe { &mut *DISKS.0.get() };
        let disk = &mut disks[idx];
        // sda, sdb, ... in probe order.
        let mut name = *b"sd\0\0\0\0\0\0";
        name[2] = b'a' + idx as u8;
        disk.name = name;

        match identify(idx) {
            Some(info) => {
                disk.present = true;
                disk.sector_count = info.sector_count;
                klog_info!(
                    "ide: {} {} sectors, serial {}, model {}",
                    string::name_str(&disk.name),
                    info.sector_count,
                    string::name_str(&info.serial),
                    string::name_str(&info.model)
                );
            }
            None => {
                klog_info!("ide: disk {idx} did not identify");
                continue;
            }
        }

        if idx != BOOT_DISK {
            part::scan_disk(idx);
        }
    }
}
