//! The volume engine: format, mount, the open-inode cache, directory
//! maintenance and file data paths.
//!
//! A [`Volume`] borrows a [`BlockDevice`] covering one partition and keeps
//! the two allocation bitmaps plus the list of open inodes in memory. All
//! fallible operations return [`FsResult`]; the descriptor layer converts
//! errors into the syscall sentinels.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use basalt_abi::NPOS;
use basalt_abi::fs::{FileType, SECTOR_SIZE};
use basalt_lib::{Bitmap, IntrGuard, ListTag, TagList, container_of, klog_info};

use crate::blockdev::BlockDevice;
use crate::layout::{
    BITS_PER_SECTOR, BLOCKS_PER_INODE, DIR_ENTRIES_PER_SECTOR, DIR_ENTRY_DISK_SIZE,
    DIRECT_BLOCK_COUNT, DirEntry, DiskInode, INODE_DISK_SIZE, InodePos, MAX_FILE_SIZE,
    MAX_FILES_PER_PART, MIN_DIR_ENTRY_COUNT, ROOT_INODE_IDX, SUPER_BLOCK_LBA,
    SUPER_BLOCK_SECTORS, SuperBlock, read_le_u32, write_le_u32,
};
use crate::path::{self, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    Exists,
    IsDirectory,
    NotDirectory,
    NotEmpty,
    NoFreeInode,
    NoFreeBlock,
    DirFull,
    TooLarge,
    InUse,
    WriteLocked,
    BadPath,
    Device,
}

pub type FsResult<T> = Result<T, FsError>;

/// The in-memory face of an inode. Lives on the kernel heap while
/// `open_times > 0` and sits on the volume's open-inode list.
pub struct MemInode {
    tag: ListTag,
    pub idx: u32,
    pub size: u32,
    pub open_times: u32,
    pub write_deny: bool,
    pub direct: [u32; DIRECT_BLOCK_COUNT],
    pub indirect_lba: u32,
}

impl MemInode {
    fn from_disk(disk: &DiskInode) -> Self {
        Self {
            tag: ListTag::new(),
            idx: disk.idx,
            size: disk.size,
            open_times: 0,
            write_deny: false,
            direct: disk.direct,
            indirect_lba: disk.indirect_lba,
        }
    }

    pub fn to_disk(&self) -> DiskInode {
        DiskInode {
            idx: self.idx,
            size: self.size,
            direct: self.direct,
            indirect_lba: self.indirect_lba,
        }
    }
}

/// A handle on an open directory: the cached inode plus a byte offset used
/// for lazy enumeration.
#[derive(Clone, Copy)]
pub struct Directory {
    pub inode: *mut MemInode,
    pub pos: u32,
}

impl Directory {
    pub fn inode_idx(&self) -> u32 {
        unsafe { (*self.inode).idx }
    }

    pub fn size(&self) -> u32 {
        unsafe { (*self.inode).size }
    }
}

/// Outcome of a path walk. `parent` is open and must be closed by the
/// caller via [`Volume::close_dir`].
pub struct SearchRecord {
    /// The prefix of the path that was actually walked.
    pub searched: PathBuf,
    /// The directory holding the last component that was examined.
    pub parent: Directory,
    /// Type of the last component found, [`FileType::Unknown`] if absent.
    pub ftype: FileType,
    /// Inode of the last component when found.
    pub inode_idx: u32,
}

impl SearchRecord {
    pub fn found(&self) -> bool {
        self.ftype != FileType::Unknown
    }
}

pub struct Volume<'a> {
    device: &'a mut dyn BlockDevice,
    sb: SuperBlock,
    block_bitmap: Vec<u8>,
    inode_bitmap: Vec<u8>,
    open_inodes: TagList,
    root_dir: Directory,
}

// SAFETY: volumes are driven from one thread at a time behind the fileio
// lock; the raw inode pointers never leave that regime.
unsafe impl Send for Volume<'_> {}

impl<'a> Volume<'a> {
    // -----------------------------------------------------------------------
    // Device access (the super block stores absolute LBAs; the device is
    // partition-relative)
    // -----------------------------------------------------------------------

    fn dev_lba(&self, abs_lba: u32) -> u32 {
        debug_assert!(abs_lba >= self.sb.part_start_lba);
        abs_lba - self.sb.part_start_lba
    }

    fn read_sectors(&mut self, abs_lba: u32, buf: &mut [u8]) -> FsResult<()> {
        let lba = self.dev_lba(abs_lba);
        self.device.read_sectors(lba, buf).map_err(|_| {
            klog_info!("fs: read failure at LBA {abs_lba}");
            FsError::Device
        })
    }

    fn write_sectors(&mut self, abs_lba: u32, data: &[u8]) -> FsResult<()> {
        let lba = self.dev_lba(abs_lba);
        self.device.write_sectors(lba, data).map_err(|_| {
            klog_info!("fs: write failure at LBA {abs_lba}");
            FsError::Device
        })
    }

    // -----------------------------------------------------------------------
    // Format and mount
    // -----------------------------------------------------------------------

    /// Lay down a fresh file system on the partition behind `device`.
    /// `part_start_lba` is where the partition sits on its disk; it becomes
    /// the base of every absolute LBA in the super block.
    pub fn format(device: &mut dyn BlockDevice, part_start_lba: u32) -> FsResult<()> {
        let part_sectors = device.sector_count();

        let inode_bitmap_sectors = (MAX_FILES_PER_PART / BITS_PER_SECTOR) as u32;
        debug_assert!(MAX_FILES_PER_PART % BITS_PER_SECTOR == 0);
        let inodes_sectors =
            (MAX_FILES_PER_PART * INODE_DISK_SIZE).div_ceil(SECTOR_SIZE) as u32;

        let used = SUPER_BLOCK_LBA + SUPER_BLOCK_SECTORS + inode_bitmap_sectors + inodes_sectors;
        if part_sectors <= used {
            return Err(FsError::NoFreeBlock);
        }
        let free_sectors = part_sectors - used;

        // One-pass approximation: the bitmap itself consumes blocks, so
        // reserve its sectors first and track only the remainder.
        let block_bitmap_sectors = free_sectors.div_ceil(BITS_PER_SECTOR as u32);
        let block_bitmap_bit_len = free_sectors - block_bitmap_sectors;

        let sb = SuperBlock {
            magic: crate::layout::FS_MAGIC,
            part_start_lba,
            part_sector_count: part_sectors,
            inode_count: MAX_FILES_PER_PART as u32,
            block_bitmap_start_lba: part_start_lba + SUPER_BLOCK_LBA + SUPER_BLOCK_SECTORS,
            block_bitmap_sectors,
            inode_bitmap_start_lba: part_start_lba
                + SUPER_BLOCK_LBA
                + SUPER_BLOCK_SECTORS
                + block_bitmap_sectors,
            inode_bitmap_sectors,
            inodes_start_lba: part_start_lba
                + SUPER_BLOCK_LBA
                + SUPER_BLOCK_SECTORS
                + block_bitmap_sectors
                + inode_bitmap_sectors,
            inodes_sectors,
            data_start_lba: part_start_lba
                + SUPER_BLOCK_LBA
                + SUPER_BLOCK_SECTORS
                + block_bitmap_sectors
                + inode_bitmap_sectors
                + inodes_sectors,
            root_inode_idx: ROOT_INODE_IDX,
        };

        let mut sector = [0u8; SECTOR_SIZE];
        sb.encode(&mut sector);
        device
            .write_sectors(SUPER_BLOCK_LBA, &sector)
            .map_err(|_| FsError::Device)?;

        // Block bitmap: bit 0 is the root directory's data block; the tail
        // beyond the usable bit length is permanently reserved.
        let mut block_bitmap = vec![0u8; block_bitmap_sectors as usize * SECTOR_SIZE];
        block_bitmap[0] |= 1;
        let capacity = block_bitmap.len() * 8;
        for bit in block_bitmap_bit_len as usize..capacity {
            block_bitmap[bit / 8] |= 1 << (bit % 8);
        }
        device
            .write_sectors(sb.block_bitmap_start_lba - part_start_lba, &block_bitmap)
            .map_err(|_| FsError::Device)?;

        // Inode bitmap: bit 0 is the root inode.
        let mut inode_bitmap = vec![0u8; inode_bitmap_sectors as usize * SECTOR_SIZE];
        inode_bitmap[0] |= 1;
        device
            .write_sectors(sb.inode_bitmap_start_lba - part_start_lba, &inode_bitmap)
            .map_err(|_| FsError::Device)?;

        // Root inode: two entries, stored in the first data block.
        let root = DiskInode {
            idx: ROOT_INODE_IDX,
            size: (MIN_DIR_ENTRY_COUNT * DIR_ENTRY_DISK_SIZE) as u32,
            direct: {
                let mut direct = [0u32; DIRECT_BLOCK_COUNT];
                direct[0] = sb.data_start_lba;
                direct
            },
            indirect_lba: 0,
        };
        let mut inode_sector = [0u8; SECTOR_SIZE];
        root.encode(&mut inode_sector[..INODE_DISK_SIZE]);
        device
            .write_sectors(sb.inodes_start_lba - part_start_lba, &inode_sector)
            .map_err(|_| FsError::Device)?;

        // `.` and `..` both refer back to the root inode.
        let mut dir_sector = [0u8; SECTOR_SIZE];
        DirEntry::new(FileType::Directory, path::CURR_DIR_NAME, ROOT_INODE_IDX)
            .encode(&mut dir_sector[..DIR_ENTRY_DISK_SIZE]);
        DirEntry::new(FileType::Directory, path::PARENT_DIR_NAME, ROOT_INODE_IDX)
            .encode(&mut dir_sector[DIR_ENTRY_DISK_SIZE..2 * DIR_ENTRY_DISK_SIZE]);
        device
            .write_sectors(sb.data_start_lba - part_start_lba, &dir_sector)
            .map_err(|_| FsError::Device)?;

        klog_info!(
            "fs: formatted partition at LBA {} ({} data blocks)",
            part_start_lba,
            block_bitmap_bit_len
        );
        Ok(())
    }

    /// Mount the partition, formatting it first when the super block does
    /// not carry the magic. Loads both bitmaps and opens the root inode.
    pub fn mount(device: &'a mut dyn BlockDevice, part_start_lba: u32) -> FsResult<Self> {
        let mut sector = [0u8; SECTOR_SIZE];
        device
            .read_sectors(SUPER_BLOCK_LBA, &mut sector)
            .map_err(|_| FsError::Device)?;
        let mut sb = SuperBlock::decode(&sector);

        if !sb.is_valid() {
            Self::format(device, part_start_lba)?;
            device
                .read_sectors(SUPER_BLOCK_LBA, &mut sector)
                .map_err(|_| FsError::Device)?;
            sb = SuperBlock::decode(&sector);
            debug_assert!(sb.is_valid());
        }

        let mut block_bitmap = vec![0u8; sb.block_bitmap_sectors as usize * SECTOR_SIZE];
        device
            .read_sectors(sb.block_bitmap_start_lba - sb.part_start_lba, &mut block_bitmap)
            .map_err(|_| FsError::Device)?;

        let mut inode_bitmap = vec![0u8; sb.inode_bitmap_sectors as usize * SECTOR_SIZE];
        device
            .read_sectors(sb.inode_bitmap_start_lba - sb.part_start_lba, &mut inode_bitmap)
            .map_err(|_| FsError::Device)?;

        let mut volume = Self {
            device,
            sb,
            block_bitmap,
            inode_bitmap,
            open_inodes: TagList::new(),
            root_dir: Directory {
                inode: core::ptr::null_mut(),
                pos: 0,
            },
        };
        volume.root_dir.inode = volume.open_node(volume.sb.root_inode_idx);
        Ok(volume)
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn root_dir(&self) -> Directory {
        Directory {
            inode: self.root_dir.inode,
            pos: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Bitmap bookkeeping
    // -----------------------------------------------------------------------

    fn block_bitmap(&mut self) -> Bitmap {
        unsafe { Bitmap::new(self.block_bitmap.as_mut_ptr(), self.block_bitmap.len(), false) }
    }

    fn inode_bitmap(&mut self) -> Bitmap {
        unsafe { Bitmap::new(self.inode_bitmap.as_mut_ptr(), self.inode_bitmap.len(), false) }
    }

    fn alloc_inode(&mut self) -> FsResult<u32> {
        let idx = self.inode_bitmap().alloc(1);
        if idx == NPOS {
            klog_info!("fs: no free inode");
            return Err(FsError::NoFreeInode);
        }
        Ok(idx as u32)
    }

    fn free_inode(&mut self, idx: u32) {
        self.inode_bitmap().free(idx as usize, 1);
    }

    fn alloc_block(&mut self) -> FsResult<u32> {
        let bit = self.block_bitmap().alloc(1);
        if bit == NPOS {
            klog_info!("fs: no free data block");
            return Err(FsError::NoFreeBlock);
        }
        Ok(self.sb.data_start_lba + bit as u32)
    }

    fn free_block(&mut self, lba: u32) {
        debug_assert!(lba >= self.sb.data_start_lba);
        let bit = (lba - self.sb.data_start_lba) as usize;
        self.block_bitmap().free(bit, 1);
    }

    /// Flush the bitmap sector containing `bit` to disk.
    fn sync_bitmap_sector(&mut self, bitmap_start_lba: u32, bit: usize, which: Which) -> FsResult<()> {
        let sector = bit / BITS_PER_SECTOR;
        let offset = sector * SECTOR_SIZE;
        let mut buf = [0u8; SECTOR_SIZE];
        {
            let bytes = match which {
                Which::Block => &self.block_bitmap,
                Which::Inode => &self.inode_bitmap,
            };
            buf.copy_from_slice(&bytes[offset..offset + SECTOR_SIZE]);
        }
        self.write_sectors(bitmap_start_lba + sector as u32, &buf)
    }

    fn sync_block_bitmap(&mut self, lba: u32) -> FsResult<()> {
        let bit = (lba - self.sb.data_start_lba) as usize;
        self.sync_bitmap_sector(self.sb.block_bitmap_start_lba, bit, Which::Block)
    }

    fn sync_inode_bitmap(&mut self, idx: u32) -> FsResult<()> {
        self.sync_bitmap_sector(self.sb.inode_bitmap_start_lba, idx as usize, Which::Inode)
    }

    pub fn block_bit_is_set(&self, bit: usize) -> bool {
        self.block_bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }

    pub fn inode_bit_is_set(&self, bit: usize) -> bool {
        self.inode_bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }

    // -----------------------------------------------------------------------
    // Open-inode cache
    // -----------------------------------------------------------------------

    /// Fetch inode `idx`, reusing the cached copy when some task already
    /// holds it open.
    pub fn open_node(&mut self, idx: u32) -> *mut MemInode {
        debug_assert!((idx as usize) < MAX_FILES_PER_PART);

        if let Some(tag) = self.open_inodes.find(|tag| {
            let inode = unsafe { &*container_of!(tag, MemInode, tag) };
            inode.idx == idx
        }) {
            let inode = container_of!(tag, MemInode, tag);
            unsafe { (*inode).open_times += 1 };
            return inode;
        }

        // Not cached: read the containing sector(s) and build a new node.
        let pos = InodePos::of(&self.sb, idx);
        let mut buf = [0u8; 2 * SECTOR_SIZE];
        let span = if pos.spans_two_sectors { 2 } else { 1 };
        if self
            .read_sectors(pos.lba, &mut buf[..span * SECTOR_SIZE])
            .is_err()
        {
            // Fatal: metadata reads failing mid-operation leave nothing to
            // roll back to.
            panic!("fs: cannot read inode {idx}");
        }
        let disk =
            DiskInode::decode(&buf[pos.offset_in_sector..pos.offset_in_sector + INODE_DISK_SIZE]);

        let mut inode = Box::new(MemInode::from_disk(&disk));
        inode.idx = idx;
        inode.open_times = 1;
        let inode = Box::into_raw(inode);
        self.open_inodes.push_back(unsafe { &mut (*inode).tag });
        inode
    }

    /// Drop one reference; at zero the node leaves the list and its memory
    /// is returned to the heap.
    pub fn close_node(&mut self, inode: *mut MemInode) {
        let _guard = IntrGuard::new();
        unsafe {
            debug_assert!((*inode).open_times > 0);
            (*inode).open_times -= 1;
            if (*inode).open_times == 0 {
                TagList::remove(&mut (*inode).tag);
                drop(Box::from_raw(inode));
            }
        }
    }

    pub fn open_inode_count(&mut self) -> usize {
        self.open_inodes.len()
    }

    /// Persist the durable fields of `inode` into the packed inode array.
    fn sync_node(&mut self, disk: &DiskInode) -> FsResult<()> {
        let pos = InodePos::of(&self.sb, disk.idx);
        let span = if pos.spans_two_sectors { 2 } else { 1 };
        let mut buf = [0u8; 2 * SECTOR_SIZE];
        self.read_sectors(pos.lba, &mut buf[..span * SECTOR_SIZE])?;
        disk.encode(&mut buf[pos.offset_in_sector..pos.offset_in_sector + INODE_DISK_SIZE]);
        self.write_sectors(pos.lba, &buf[..span * SECTOR_SIZE])
    }

    /// Zero the on-disk slot of a deleted inode.
    fn zero_fill_node(&mut self, idx: u32) -> FsResult<()> {
        let pos = InodePos::of(&self.sb, idx);
        let span = if pos.spans_two_sectors { 2 } else { 1 };
        let mut buf = [0u8; 2 * SECTOR_SIZE];
        self.read_sectors(pos.lba, &mut buf[..span * SECTOR_SIZE])?;
        buf[pos.offset_in_sector..pos.offset_in_sector + INODE_DISK_SIZE].fill(0);
        self.write_sectors(pos.lba, &buf[..span * SECTOR_SIZE])
    }

    /// Assemble the full 140-slot block list: the 12 direct LBAs plus, when
    /// present, the single-indirect table.
    fn load_node_lbas(&mut self, inode: *mut MemInode) -> [u32; BLOCKS_PER_INODE] {
        let mut lbas = [0u32; BLOCKS_PER_INODE];
        unsafe {
            lbas[..DIRECT_BLOCK_COUNT].copy_from_slice(&(*inode).direct);
            let indirect = (*inode).indirect_lba;
            if indirect != 0 {
                let mut sector = [0u8; SECTOR_SIZE];
                if self.read_sectors(indirect, &mut sector).is_ok() {
                    for (i, slot) in lbas[DIRECT_BLOCK_COUNT..].iter_mut().enumerate() {
                        *slot = read_le_u32(&sector[i * 4..]);
                    }
                }
            }
        }
        lbas
    }

    fn write_indirect_table(&mut self, inode: *mut MemInode, lbas: &[u32; BLOCKS_PER_INODE]) -> FsResult<()> {
        let indirect = unsafe { (*inode).indirect_lba };
        debug_assert!(indirect != 0);
        let mut sector = [0u8; SECTOR_SIZE];
        for (i, lba) in lbas[DIRECT_BLOCK_COUNT..].iter().enumerate() {
            write_le_u32(&mut sector[i * 4..], *lba);
        }
        self.write_sectors(indirect, &sector)
    }

    // -----------------------------------------------------------------------
    // Directories
    // -----------------------------------------------------------------------

    /// Open a directory by inode index. The root directory stays cached and
    /// is handed out without an extra reference.
    pub fn open_dir(&mut self, inode_idx: u32) -> Directory {
        if inode_idx == self.sb.root_inode_idx {
            return self.root_dir();
        }
        Directory {
            inode: self.open_node(inode_idx),
            pos: 0,
        }
    }

    pub fn close_dir(&mut self, dir: Directory) {
        if dir.inode == self.root_dir.inode {
            return;
        }
        self.close_node(dir.inode);
    }

    /// Lazily enumerate the next used entry, advancing `dir.pos`.
    pub fn read_dir(&mut self, dir: &mut Directory) -> Option<DirEntry> {
        if dir.pos >= dir.size() {
            return None;
        }

        let lbas = self.load_node_lbas(dir.inode);
        let mut pos = 0u32;
        let mut sector = [0u8; SECTOR_SIZE];
        for lba in lbas {
            if lba == 0 {
                continue;
            }
            if self.read_sectors(lba, &mut sector).is_err() {
                return None;
            }
            for slot in 0..DIR_ENTRIES_PER_SECTOR {
                let entry = DirEntry::decode(&sector[slot * DIR_ENTRY_DISK_SIZE..]);
                if !entry.is_used() {
                    continue;
                }
                if pos < dir.pos {
                    pos += DIR_ENTRY_DISK_SIZE as u32;
                } else {
                    dir.pos += DIR_ENTRY_DISK_SIZE as u32;
                    return Some(entry);
                }
            }
        }
        None
    }

    /// Linear scan for `name` across every block of `dir`.
    pub fn search_dir_entry(&mut self, dir: &Directory, name: &str) -> Option<DirEntry> {
        let lbas = self.load_node_lbas(dir.inode);
        let mut sector = [0u8; SECTOR_SIZE];
        for lba in lbas {
            if lba == 0 {
                continue;
            }
            if self.read_sectors(lba, &mut sector).is_err() {
                return None;
            }
            for slot in 0..DIR_ENTRIES_PER_SECTOR {
                let entry = DirEntry::decode(&sector[slot * DIR_ENTRY_DISK_SIZE..]);
                if entry.is_used() && entry.name_str() == name {
                    return Some(entry);
                }
            }
        }
        None
    }

    /// Walk `path` from the root. The returned record's `parent` is the
    /// directory that holds (or would hold) the final component.
    pub fn search_path(&mut self, p: &str) -> FsResult<SearchRecord> {
        if !path::is_absolute(p) {
            return Err(FsError::BadPath);
        }

        if path::is_root_dir(p) {
            return Ok(SearchRecord {
                searched: PathBuf::new(),
                parent: self.root_dir(),
                ftype: FileType::Directory,
                inode_idx: self.sb.root_inode_idx,
            });
        }

        let mut searched = PathBuf::new();
        let mut parent = self.root_dir();
        let mut prev_parent_idx = self.sb.root_inode_idx;
        let mut ftype = FileType::Unknown;
        let mut inode_idx = u32::MAX;

        for name in path::components(p) {
            if searched.as_str().is_empty() {
                searched.join("/");
            }
            searched.join(name);

            match self.search_dir_entry(&parent, name) {
                Some(entry) if entry.ftype == FileType::Directory => {
                    prev_parent_idx = parent.inode_idx();
                    self.close_dir(parent);
                    parent = self.open_dir(entry.inode_idx);
                    ftype = FileType::Directory;
                    inode_idx = entry.inode_idx;
                }
                Some(entry) => {
                    // A file ends the walk, whether or not the path
                    // continues past it.
                    ftype = FileType::Regular;
                    inode_idx = entry.inode_idx;
                    break;
                }
                None => {
                    ftype = FileType::Unknown;
                    break;
                }
            }
        }

        if ftype == FileType::Directory {
            // The walk left `parent` at the target itself; reopen the
            // actual parent for the caller.
            self.close_dir(parent);
            parent = self.open_dir(prev_parent_idx);
        }

        Ok(SearchRecord {
            searched,
            parent,
            ftype,
            inode_idx,
        })
    }

    /// Install `entry` in the first free slot of `dir`, allocating a fresh
    /// block (and, past the direct slots, the indirect table) when every
    /// existing block is fully populated.
    fn sync_dir_entry(&mut self, dir: &Directory, entry: &DirEntry) -> FsResult<()> {
        debug_assert!(dir.size() as usize % DIR_ENTRY_DISK_SIZE == 0);
        let mut lbas = self.load_node_lbas(dir.inode);
        let mut sector = [0u8; SECTOR_SIZE];

        for i in 0..BLOCKS_PER_INODE {
            if lbas[i] == 0 {
                let new_lba = self.alloc_block()?;
                lbas[i] = new_lba;
                self.sync_block_bitmap(new_lba)?;

                if i < DIRECT_BLOCK_COUNT {
                    unsafe { (*dir.inode).direct[i] = new_lba };
                } else {
                    if unsafe { (*dir.inode).indirect_lba } == 0 {
                        match self.alloc_block() {
                            Ok(table_lba) => {
                                unsafe { (*dir.inode).indirect_lba = table_lba };
                                self.sync_block_bitmap(table_lba)?;
                            }
                            Err(err) => {
                                self.free_block(new_lba);
                                self.sync_block_bitmap(new_lba)?;
                                return Err(err);
                            }
                        }
                    }
                    self.write_indirect_table(dir.inode, &lbas)?;
                }

                sector.fill(0);
                entry.encode(&mut sector[..DIR_ENTRY_DISK_SIZE]);
                self.write_sectors(new_lba, &sector)?;
                unsafe { (*dir.inode).size += DIR_ENTRY_DISK_SIZE as u32 };
                return Ok(());
            }

            self.read_sectors(lbas[i], &mut sector)?;
            for slot in 0..DIR_ENTRIES_PER_SECTOR {
                let offset = slot * DIR_ENTRY_DISK_SIZE;
                let existing = DirEntry::decode(&sector[offset..]);
                if !existing.is_used() {
                    entry.encode(&mut sector[offset..offset + DIR_ENTRY_DISK_SIZE]);
                    self.write_sectors(lbas[i], &sector)?;
                    unsafe { (*dir.inode).size += DIR_ENTRY_DISK_SIZE as u32 };
                    return Ok(());
                }
            }
        }

        klog_info!("fs: directory is full");
        Err(FsError::DirFull)
    }

    /// Remove the entry referring to `inode_idx` from `dir` (`.` and `..`
    /// never match). A non-first block left empty is freed, together with
    /// the indirect table once it holds no more blocks.
    fn delete_dir_entry(&mut self, dir: &Directory, inode_idx: u32) -> FsResult<()> {
        let mut lbas = self.load_node_lbas(dir.inode);
        let mut sector = [0u8; SECTOR_SIZE];

        for i in 0..BLOCKS_PER_INODE {
            if lbas[i] == 0 {
                continue;
            }
            self.read_sectors(lbas[i], &mut sector)?;

            let mut found_slot = None;
            let mut live_entries = 0usize;
            for slot in 0..DIR_ENTRIES_PER_SECTOR {
                let entry = DirEntry::decode(&sector[slot * DIR_ENTRY_DISK_SIZE..]);
                if !entry.is_used() {
                    continue;
                }
                live_entries += 1;
                let name = entry.name_str();
                if name != path::CURR_DIR_NAME
                    && name != path::PARENT_DIR_NAME
                    && entry.inode_idx == inode_idx
                {
                    debug_assert!(found_slot.is_none());
                    found_slot = Some(slot);
                }
            }

            let Some(slot) = found_slot else {
                continue;
            };

            if live_entries == 1 && i > 0 {
                // The target was the only entry in a secondary block; the
                // block itself goes back to the pool.
                self.free_block(lbas[i]);
                self.sync_block_bitmap(lbas[i])?;

                if i < DIRECT_BLOCK_COUNT {
                    unsafe { (*dir.inode).direct[i] = 0 };
                } else {
                    let remaining = lbas[DIRECT_BLOCK_COUNT..]
                        .iter()
                        .filter(|&&lba| lba != 0)
                        .count();
                    let table_lba = unsafe { (*dir.inode).indirect_lba };
                    if remaining > 1 {
                        lbas[i] = 0;
                        self.write_indirect_table(dir.inode, &lbas)?;
                    } else {
                        // Last indirect block gone: retire the table too.
                        self.free_block(table_lba);
                        self.sync_block_bitmap(table_lba)?;
                        unsafe { (*dir.inode).indirect_lba = 0 };
                    }
                }
            } else {
                let offset = slot * DIR_ENTRY_DISK_SIZE;
                sector[offset..offset + DIR_ENTRY_DISK_SIZE].fill(0);
                self.write_sectors(lbas[i], &sector)?;
            }

            unsafe { (*dir.inode).size -= DIR_ENTRY_DISK_SIZE as u32 };
            let disk = unsafe { (*dir.inode).to_disk() };
            self.sync_node(&disk)?;
            return Ok(());
        }

        Err(FsError::NotFound)
    }

    // -----------------------------------------------------------------------
    // Files and directories, by path
    // -----------------------------------------------------------------------

    /// Create an empty regular file named `name` inside `dir`. Returns the
    /// open in-memory inode with one reference held for the caller.
    pub fn create_file(&mut self, dir: &Directory, name: &str) -> FsResult<*mut MemInode> {
        let inode_idx = self.alloc_inode()?;

        let entry = DirEntry::new(FileType::Regular, name, inode_idx);
        if let Err(err) = self.sync_dir_entry(dir, &entry) {
            self.free_inode(inode_idx);
            return Err(err);
        }
        let parent_disk = unsafe { (*dir.inode).to_disk() };
        self.sync_node(&parent_disk)?;

        let disk = DiskInode {
            idx: inode_idx,
            size: 0,
            direct: [0; DIRECT_BLOCK_COUNT],
            indirect_lba: 0,
        };
        self.sync_node(&disk)?;
        self.sync_inode_bitmap(inode_idx)?;

        let mut inode = Box::new(MemInode::from_disk(&disk));
        inode.open_times = 1;
        let inode = Box::into_raw(inode);
        self.open_inodes.push_back(unsafe { &mut (*inode).tag });
        Ok(inode)
    }

    /// Open an existing file node, honouring the single-writer rule: a
    /// write-mode open atomically claims `write_deny` and fails when some
    /// other descriptor already holds it.
    pub fn open_file_node(&mut self, inode_idx: u32, write: bool) -> FsResult<*mut MemInode> {
        let inode = self.open_node(inode_idx);
        if write {
            let _guard = IntrGuard::new();
            unsafe {
                if (*inode).write_deny {
                    drop(_guard);
                    self.close_node(inode);
                    klog_info!("fs: file is already open for writing");
                    return Err(FsError::WriteLocked);
                }
                (*inode).write_deny = true;
            }
        }
        Ok(inode)
    }

    /// Close a node opened by [`Self::open_file_node`].
    pub fn close_file_node(&mut self, inode: *mut MemInode, had_write: bool) {
        if had_write {
            let _guard = IntrGuard::new();
            unsafe { (*inode).write_deny = false };
        }
        self.close_node(inode);
    }

    /// Create the directory named by the absolute path `p`; the parent must
    /// exist and the leaf must not.
    pub fn create_dir(&mut self, p: &str) -> FsResult<()> {
        let record = self.search_path(p)?;
        let parent = record.parent;

        let result = (|| {
            if record.found() {
                klog_info!("fs: '{p}' already exists");
                return Err(FsError::Exists);
            }
            if record.searched.depth() != path::depth(p) {
                klog_info!("fs: path '{}' does not exist", record.searched.as_str());
                return Err(FsError::NotFound);
            }

            let name = path::components(p).last().ok_or(FsError::BadPath)?;
            let inode_idx = self.alloc_inode()?;
            let block_lba = match self.alloc_block() {
                Ok(lba) => lba,
                Err(err) => {
                    self.free_inode(inode_idx);
                    return Err(err);
                }
            };

            let entry = DirEntry::new(FileType::Directory, name, inode_idx);
            if let Err(err) = self.sync_dir_entry(&parent, &entry) {
                self.free_inode(inode_idx);
                self.free_block(block_lba);
                return Err(err);
            }
            let parent_disk = unsafe { (*parent.inode).to_disk() };
            self.sync_node(&parent_disk)?;

            // The fresh directory starts with `.` and `..`.
            let mut sector = [0u8; SECTOR_SIZE];
            DirEntry::new(FileType::Directory, path::CURR_DIR_NAME, inode_idx)
                .encode(&mut sector[..DIR_ENTRY_DISK_SIZE]);
            DirEntry::new(FileType::Directory, path::PARENT_DIR_NAME, parent.inode_idx())
                .encode(&mut sector[DIR_ENTRY_DISK_SIZE..2 * DIR_ENTRY_DISK_SIZE]);
            self.write_sectors(block_lba, &sector)?;
            self.sync_block_bitmap(block_lba)?;

            let disk = DiskInode {
                idx: inode_idx,
                size: (MIN_DIR_ENTRY_COUNT * DIR_ENTRY_DISK_SIZE) as u32,
                direct: {
                    let mut direct = [0u32; DIRECT_BLOCK_COUNT];
                    direct[0] = block_lba;
                    direct
                },
                indirect_lba: 0,
            };
            self.sync_node(&disk)?;
            self.sync_inode_bitmap(inode_idx)?;
            Ok(())
        })();

        self.close_dir(parent);
        result
    }

    /// Remove an empty, non-root directory.
    pub fn delete_dir(&mut self, p: &str) -> FsResult<()> {
        if path::is_root_dir(p) {
            return Err(FsError::InUse);
        }

        let record = self.search_path(p)?;
        let parent = record.parent;

        let result = (|| {
            if !record.found() || record.searched.depth() != path::depth(p) {
                return Err(FsError::NotFound);
            }
            if record.ftype != FileType::Directory {
                return Err(FsError::NotDirectory);
            }

            let child = self.open_dir(record.inode_idx);
            let empty = child.size() as usize == MIN_DIR_ENTRY_COUNT * DIR_ENTRY_DISK_SIZE;
            self.close_dir(child);
            if !empty {
                klog_info!("fs: directory '{p}' is not empty");
                return Err(FsError::NotEmpty);
            }

            self.delete_dir_entry(&parent, record.inode_idx)?;
            self.delete_node(record.inode_idx)
        })();

        self.close_dir(parent);
        result
    }

    /// Remove the file at `p`. `is_open` reports whether some descriptor in
    /// the open-file table still references an inode index.
    pub fn delete_file(&mut self, p: &str, is_open: impl Fn(u32) -> bool) -> FsResult<()> {
        if path::is_dir(p) {
            return Err(FsError::IsDirectory);
        }

        let record = self.search_path(p)?;
        let parent = record.parent;

        let result = (|| {
            if !record.found() {
                klog_info!("fs: file '{p}' does not exist");
                return Err(FsError::NotFound);
            }
            if record.ftype == FileType::Directory {
                klog_info!("fs: '{p}' is a directory");
                return Err(FsError::IsDirectory);
            }
            if is_open(record.inode_idx) {
                klog_info!("fs: file '{p}' is in use");
                return Err(FsError::InUse);
            }

            self.delete_dir_entry(&parent, record.inode_idx)?;
            self.delete_node(record.inode_idx)
        })();

        self.close_dir(parent);
        result
    }

    /// Release every block of inode `idx`, clear its bitmap bit and wipe the
    /// on-disk slot.
    fn delete_node(&mut self, idx: u32) -> FsResult<()> {
        let inode = self.open_node(idx);

        let lbas = self.load_node_lbas(inode);
        for lba in lbas {
            if lba != 0 {
                self.free_block(lba);
                self.sync_block_bitmap(lba)?;
            }
        }
        let indirect = unsafe { (*inode).indirect_lba };
        if indirect != 0 {
            self.free_block(indirect);
            self.sync_block_bitmap(indirect)?;
        }

        self.free_inode(idx);
        self.sync_inode_bitmap(idx)?;
        self.zero_fill_node(idx)?;
        self.close_node(inode);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // File data
    // -----------------------------------------------------------------------

    /// Append `data` to the file behind `inode`. Fails with no state change
    /// when the result would exceed the 140-block ceiling; on block
    /// exhaustion every block allocated for this write is rolled back.
    pub fn write_file(&mut self, inode: *mut MemInode, data: &[u8]) -> FsResult<usize> {
        let old_size = unsafe { (*inode).size } as usize;
        let new_size = old_size + data.len();
        if new_size > MAX_FILE_SIZE {
            klog_info!("fs: write would exceed the maximum file size");
            return Err(FsError::TooLarge);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let old_sectors = old_size.div_ceil(SECTOR_SIZE);
        let new_sectors = new_size.div_ceil(SECTOR_SIZE);
        let mut lbas = self.load_node_lbas(inode);

        // Wire up the blocks the write grows into.
        let mut allocated = [0u32; BLOCKS_PER_INODE];
        let mut allocated_count = 0usize;
        let mut created_indirect = false;

        for i in old_sectors..new_sectors {
            let result = (|| -> FsResult<()> {
                if i >= DIRECT_BLOCK_COUNT && unsafe { (*inode).indirect_lba } == 0 {
                    let table_lba = self.alloc_block()?;
                    unsafe { (*inode).indirect_lba = table_lba };
                    created_indirect = true;
                    self.sync_block_bitmap(table_lba)?;
                }
                let lba = self.alloc_block()?;
                lbas[i] = lba;
                if i < DIRECT_BLOCK_COUNT {
                    unsafe { (*inode).direct[i] = lba };
                }
                allocated[allocated_count] = lba;
                allocated_count += 1;
                self.sync_block_bitmap(lba)
            })();

            if result.is_err() {
                for &lba in &allocated[..allocated_count] {
                    self.free_block(lba);
                    let _ = self.sync_block_bitmap(lba);
                }
                for slot in unsafe { (*inode).direct.iter_mut() } {
                    if allocated[..allocated_count].contains(slot) {
                        *slot = 0;
                    }
                }
                if created_indirect {
                    let table_lba = unsafe { (*inode).indirect_lba };
                    unsafe { (*inode).indirect_lba = 0 };
                    self.free_block(table_lba);
                    let _ = self.sync_block_bitmap(table_lba);
                }
                return result.map(|_| 0);
            }
        }

        if new_sectors > DIRECT_BLOCK_COUNT && new_sectors > old_sectors {
            self.write_indirect_table(inode, &lbas)?;
        }

        // Blit the payload sector by sector; the first sector keeps its
        // existing prefix.
        let mut written = 0usize;
        let mut io = [0u8; SECTOR_SIZE];
        let mut first = true;
        while written < data.len() {
            let pos = unsafe { (*inode).size } as usize;
            let sector_idx = pos / SECTOR_SIZE;
            let offset = pos % SECTOR_SIZE;
            let chunk = (data.len() - written).min(SECTOR_SIZE - offset);

            io.fill(0);
            if first && offset != 0 {
                self.read_sectors(lbas[sector_idx], &mut io)?;
            }
            first = false;

            io[offset..offset + chunk].copy_from_slice(&data[written..written + chunk]);
            self.write_sectors(lbas[sector_idx], &io)?;

            written += chunk;
            unsafe { (*inode).size += chunk as u32 };
        }

        let disk = unsafe { (*inode).to_disk() };
        self.sync_node(&disk)?;
        Ok(written)
    }

    /// Read from `*pos`, clamped to the file size. Advances `*pos` by the
    /// number of bytes produced.
    pub fn read_file(&mut self, inode: *mut MemInode, pos: &mut u32, buf: &mut [u8]) -> FsResult<usize> {
        let size = unsafe { (*inode).size };
        if *pos >= size || buf.is_empty() {
            return Ok(0);
        }
        let take = buf.len().min((size - *pos) as usize);

        let lbas = self.load_node_lbas(inode);
        let mut read = 0usize;
        let mut io = [0u8; SECTOR_SIZE];
        while read < take {
            let sector_idx = (*pos as usize) / SECTOR_SIZE;
            let offset = (*pos as usize) % SECTOR_SIZE;
            let chunk = (take - read).min(SECTOR_SIZE - offset);

            debug_assert!(lbas[sector_idx] != 0);
            self.read_sectors(lbas[sector_idx], &mut io)?;
            buf[read..read + chunk].copy_from_slice(&io[offset..offset + chunk]);

            read += chunk;
            *pos += chunk as u32;
        }
        Ok(read)
    }
}

enum Which {
    Block,
    Inode,
}
