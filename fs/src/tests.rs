//! File-system self-tests.
//!
//! Each volume-level test builds its own RAM-backed partition, so the same
//! functions run under `cargo test` on the host and from the in-kernel
//! harness (`builtin-tests`). The descriptor-table test drives the shared
//! `fileio` state and therefore runs as one sequential scenario.

use basalt_abi::fs::{
    FileType, INVALID_FD, O_CREAT, O_RDONLY, O_RDWR, SECTOR_SIZE, SeekOrigin,
};
use basalt_abi::task::KERNEL_PID;
use basalt_lib::testing::TestResult;
use basalt_lib::{assert_eq_test, assert_test, pass};

use crate::blockdev::MemoryBlockDevice;
use crate::fileio;
use crate::layout::{
    DIR_ENTRY_DISK_SIZE, FS_MAGIC, MAX_FILE_SIZE, MIN_DIR_ENTRY_COUNT, ROOT_INODE_IDX,
};
use crate::volume::{FsError, Volume};

/// 8 MiB partition starting at LBA 2048 of its disk.
const TEST_PART_SECTORS: u32 = 8 * 1024 * 1024 / SECTOR_SIZE as u32;
const TEST_PART_START: u32 = 2048;

fn fresh_volume(device: &mut MemoryBlockDevice) -> Volume<'_> {
    Volume::mount(device, TEST_PART_START).expect("mount failed")
}

pub fn test_format_mount_geometry() -> TestResult {
    let mut device = MemoryBlockDevice::new(TEST_PART_SECTORS);
    let volume = fresh_volume(&mut device);
    let sb = volume.super_block();

    assert_eq_test!(sb.magic, FS_MAGIC);
    assert_eq_test!(sb.part_start_lba, TEST_PART_START);
    assert_eq_test!(sb.part_sector_count, TEST_PART_SECTORS);
    assert_eq_test!(sb.root_inode_idx, ROOT_INODE_IDX);
    assert_test!(sb.block_bitmap_start_lba > sb.part_start_lba);
    assert_test!(sb.inode_bitmap_start_lba > sb.block_bitmap_start_lba);
    assert_test!(sb.inodes_start_lba > sb.inode_bitmap_start_lba);
    assert_test!(sb.data_start_lba > sb.inodes_start_lba);

    // The root directory's data block and inode are reserved.
    assert_test!(volume.block_bit_is_set(0));
    assert_test!(volume.inode_bit_is_set(0));
    assert_test!(!volume.inode_bit_is_set(1));
    pass!()
}

pub fn test_mount_preserves_existing_fs() -> TestResult {
    let mut device = MemoryBlockDevice::new(TEST_PART_SECTORS);
    {
        let mut volume = fresh_volume(&mut device);
        assert_test!(volume.create_dir("/persisted").is_ok());
    }
    // A second mount must find the directory rather than reformat.
    let mut volume = fresh_volume(&mut device);
    let record = volume.search_path("/persisted").expect("search failed");
    let parent = record.parent;
    let found = record.found() && record.ftype == FileType::Directory;
    volume.close_dir(parent);
    assert_test!(found, "existing file system was clobbered by mount");
    pass!()
}

pub fn test_root_lists_dot_entries() -> TestResult {
    let mut device = MemoryBlockDevice::new(TEST_PART_SECTORS);
    let mut volume = fresh_volume(&mut device);

    let mut root = volume.root_dir();
    let first = volume.read_dir(&mut root).expect("missing '.'");
    let second = volume.read_dir(&mut root).expect("missing '..'");
    assert_eq_test!(first.name_str(), ".");
    assert_eq_test!(second.name_str(), "..");
    assert_eq_test!(first.inode_idx, ROOT_INODE_IDX);
    assert_eq_test!(second.inode_idx, ROOT_INODE_IDX);
    assert_test!(volume.read_dir(&mut root).is_none(), "root has extra entries");
    pass!()
}

pub fn test_create_dir_tree() -> TestResult {
    let mut device = MemoryBlockDevice::new(TEST_PART_SECTORS);
    let mut volume = fresh_volume(&mut device);

    assert_test!(volume.create_dir("/a").is_ok());
    assert_test!(volume.create_dir("/a/b").is_ok());
    assert_eq_test!(volume.create_dir("/a"), Err(FsError::Exists));
    assert_eq_test!(volume.create_dir("/missing/c"), Err(FsError::NotFound));

    let record = volume.search_path("/a/b").expect("search failed");
    let parent = record.parent;
    assert_test!(record.found());
    assert_eq_test!(record.ftype, FileType::Directory);
    let a_idx = parent.inode_idx();
    let b_idx = record.inode_idx;
    volume.close_dir(parent);

    // A fresh directory holds exactly `.` (itself) and `..` (its parent).
    let mut b = volume.open_dir(b_idx);
    let dot = volume.read_dir(&mut b).expect("missing '.'");
    let dotdot = volume.read_dir(&mut b).expect("missing '..'");
    assert_eq_test!(dot.inode_idx, b_idx);
    assert_eq_test!(dotdot.inode_idx, a_idx);
    assert_test!(volume.read_dir(&mut b).is_none());
    volume.close_dir(b);

    // Enumerating /a yields '.', '..' and 'b'.
    let mut a = volume.open_dir(a_idx);
    let mut names = [b'\0'; 3];
    let mut count = 0;
    while let Some(entry) = volume.read_dir(&mut a) {
        names[count] = entry.name_str().as_bytes()[0];
        count += 1;
    }
    volume.close_dir(a);
    assert_eq_test!(count, 3);
    assert_eq_test!(&names, b"..b");
    pass!()
}

pub fn test_file_write_read_roundtrip() -> TestResult {
    let mut device = MemoryBlockDevice::new(TEST_PART_SECTORS);
    let mut volume = fresh_volume(&mut device);

    let root = volume.root_dir();
    let inode = volume.create_file(&root, "data").expect("create failed");

    let written = volume.write_file(inode, b"hello").expect("write failed");
    assert_eq_test!(written, 5);

    let mut pos = 0u32;
    let mut buf = [0u8; 16];
    let read = volume.read_file(inode, &mut pos, &mut buf).expect("read failed");
    assert_eq_test!(read, 5);
    assert_eq_test!(&buf[..5], b"hello");
    assert_eq_test!(pos, 5);

    // A second write appends; a sector-crossing read sees both pieces.
    let tail = [0x5Au8; SECTOR_SIZE];
    assert_eq_test!(volume.write_file(inode, &tail).expect("append failed"), SECTOR_SIZE);
    let mut pos = 3u32;
    let mut buf = [0u8; SECTOR_SIZE + 2];
    let read = volume.read_file(inode, &mut pos, &mut buf).expect("read failed");
    assert_eq_test!(read, SECTOR_SIZE + 2);
    assert_eq_test!(&buf[..2], b"lo");
    assert_test!(buf[2..].iter().all(|&b| b == 0x5A));

    volume.close_node(inode);
    pass!()
}

pub fn test_write_crosses_into_indirect_blocks() -> TestResult {
    let mut device = MemoryBlockDevice::new(TEST_PART_SECTORS);
    let mut volume = fresh_volume(&mut device);

    let root = volume.root_dir();
    let inode = volume.create_file(&root, "big").expect("create failed");

    // Thirteen sectors: twelve direct blocks plus the first indirect one.
    let chunk = [0xC3u8; SECTOR_SIZE];
    for _ in 0..13 {
        assert_eq_test!(volume.write_file(inode, &chunk).expect("write failed"), SECTOR_SIZE);
    }
    unsafe {
        assert_eq_test!((*inode).size as usize, 13 * SECTOR_SIZE);
        assert_test!((*inode).indirect_lba != 0, "indirect table not allocated");
        assert_test!((*inode).direct.iter().all(|&lba| lba != 0));
    }

    // Read back across the direct/indirect boundary.
    let mut pos = (12 * SECTOR_SIZE - 7) as u32;
    let mut buf = [0u8; 14];
    let read = volume.read_file(inode, &mut pos, &mut buf).expect("read failed");
    assert_eq_test!(read, 14);
    assert_test!(buf.iter().all(|&b| b == 0xC3));

    volume.close_node(inode);
    pass!()
}

pub fn test_max_file_size_boundary() -> TestResult {
    let mut device = MemoryBlockDevice::new(TEST_PART_SECTORS);
    let mut volume = fresh_volume(&mut device);

    let root = volume.root_dir();
    let inode = volume.create_file(&root, "huge").expect("create failed");

    // Fill to exactly 140 × 512 bytes.
    let chunk = [0x11u8; 4 * SECTOR_SIZE];
    let mut total = 0usize;
    while total < MAX_FILE_SIZE {
        let take = chunk.len().min(MAX_FILE_SIZE - total);
        let written = volume.write_file(inode, &chunk[..take]).expect("write failed");
        assert_eq_test!(written, take);
        total += written;
    }
    unsafe { assert_eq_test!((*inode).size as usize, MAX_FILE_SIZE) };

    // One more byte must fail with no state change.
    assert_eq_test!(volume.write_file(inode, b"x"), Err(FsError::TooLarge));
    unsafe { assert_eq_test!((*inode).size as usize, MAX_FILE_SIZE) };

    let mut pos = (MAX_FILE_SIZE - 1) as u32;
    let mut buf = [0u8; 4];
    assert_eq_test!(volume.read_file(inode, &mut pos, &mut buf).expect("read failed"), 1);
    assert_eq_test!(buf[0], 0x11);

    volume.close_node(inode);
    pass!()
}

pub fn test_delete_file_releases_resources() -> TestResult {
    let mut device = MemoryBlockDevice::new(TEST_PART_SECTORS);
    let mut volume = fresh_volume(&mut device);

    let root = volume.root_dir();
    let inode = volume.create_file(&root, "victim").expect("create failed");
    let idx = unsafe { (*inode).idx };
    let data = [7u8; 2 * SECTOR_SIZE];
    volume.write_file(inode, &data).expect("write failed");
    let first_block = unsafe { (*inode).direct[0] };
    volume.close_node(inode);

    let data_start = volume.super_block().data_start_lba;
    assert_test!(volume.block_bit_is_set((first_block - data_start) as usize));
    assert_test!(volume.inode_bit_is_set(idx as usize));

    assert_test!(volume.delete_file("/victim", |_| false).is_ok());
    assert_test!(!volume.block_bit_is_set((first_block - data_start) as usize));
    assert_test!(!volume.inode_bit_is_set(idx as usize));

    // The path no longer resolves.
    let record = volume.search_path("/victim").expect("search failed");
    let parent = record.parent;
    let found = record.found();
    volume.close_dir(parent);
    assert_test!(!found, "deleted file still resolves");

    // Deleting a missing file reports the failure.
    assert_eq_test!(volume.delete_file("/victim", |_| false), Err(FsError::NotFound));
    pass!()
}

pub fn test_delete_dir_requires_empty() -> TestResult {
    let mut device = MemoryBlockDevice::new(TEST_PART_SECTORS);
    let mut volume = fresh_volume(&mut device);

    assert_test!(volume.create_dir("/d").is_ok());
    assert_test!(volume.create_dir("/d/sub").is_ok());

    assert_eq_test!(volume.delete_dir("/d"), Err(FsError::NotEmpty));
    assert_test!(volume.delete_dir("/d/sub").is_ok());
    assert_test!(volume.delete_dir("/d").is_ok());
    assert_eq_test!(volume.delete_dir("/d"), Err(FsError::NotFound));
    pass!()
}

pub fn test_directory_grows_past_one_sector() -> TestResult {
    let mut device = MemoryBlockDevice::new(TEST_PART_SECTORS);
    let mut volume = fresh_volume(&mut device);
    let root = volume.root_dir();

    // 20 entries fit in a sector; with `.` and `..` in place, adding 21
    // files forces a second directory block.
    let mut name = *b"f00";
    for i in 0..21u8 {
        name[1] = b'0' + i / 10;
        name[2] = b'0' + i % 10;
        let text = core::str::from_utf8(&name).unwrap();
        let inode = volume.create_file(&root, text).expect("create failed");
        volume.close_node(inode);
    }

    unsafe {
        let root_inode = root.inode;
        assert_eq_test!(
            (*root_inode).size as usize,
            (MIN_DIR_ENTRY_COUNT + 21) * DIR_ENTRY_DISK_SIZE
        );
        assert_test!((*root_inode).direct[1] != 0, "second directory block missing");
    }

    // Enumeration sees all 23 entries.
    let mut dir = volume.root_dir();
    let mut count = 0;
    while volume.read_dir(&mut dir).is_some() {
        count += 1;
    }
    assert_eq_test!(count, 23);

    // Dropping every file in the second block hands the block back.
    let second_block = unsafe { (*root.inode).direct[1] };
    let data_start = volume.super_block().data_start_lba;
    for i in 18..21u8 {
        name[1] = b'0' + i / 10;
        name[2] = b'0' + i % 10;
        let mut path = *b"/f00";
        path[2] = name[1];
        path[3] = name[2];
        let text = core::str::from_utf8(&path).unwrap();
        assert_test!(volume.delete_file(text, |_| false).is_ok());
    }
    assert_test!(!volume.block_bit_is_set((second_block - data_start) as usize));
    unsafe { assert_eq_test!((*root.inode).direct[1], 0) };
    pass!()
}

pub fn test_second_writer_is_rejected() -> TestResult {
    let mut device = MemoryBlockDevice::new(TEST_PART_SECTORS);
    let mut volume = fresh_volume(&mut device);

    let root = volume.root_dir();
    let inode = volume.create_file(&root, "locked").expect("create failed");
    let idx = unsafe { (*inode).idx };
    volume.close_node(inode);

    let writer = volume.open_file_node(idx, true).expect("first open failed");
    assert_eq_test!(volume.open_file_node(idx, true), Err(FsError::WriteLocked));

    // Readers are not affected by the write lock.
    let reader = volume.open_file_node(idx, false).expect("read open failed");
    volume.close_file_node(reader, false);

    volume.close_file_node(writer, true);
    let again = volume.open_file_node(idx, true).expect("reopen failed");
    volume.close_file_node(again, true);
    pass!()
}

pub fn test_open_cache_is_shared() -> TestResult {
    let mut device = MemoryBlockDevice::new(TEST_PART_SECTORS);
    let mut volume = fresh_volume(&mut device);

    let root = volume.root_dir();
    let inode = volume.create_file(&root, "cached").expect("create failed");
    let idx = unsafe { (*inode).idx };

    // Opening the same index again returns the same in-memory node.
    let second = volume.open_node(idx);
    assert_eq_test!(second, inode);
    unsafe { assert_eq_test!((*inode).open_times, 2) };

    let open_nodes = volume.open_inode_count();
    volume.close_node(second);
    volume.close_node(inode);
    // Only the root inode remains open.
    assert_eq_test!(volume.open_inode_count(), open_nodes - 1);
    pass!()
}

/// Sequential scenario over the shared descriptor tables: the hierarchical
/// create/list/write/read flow, the busy-delete rule and fork inheritance.
pub fn test_fileio_end_to_end() -> TestResult {
    let device = alloc::boxed::Box::leak(alloc::boxed::Box::new(MemoryBlockDevice::new(
        TEST_PART_SECTORS,
    )));
    assert_test!(fileio::fileio_mount(device, TEST_PART_START).is_ok());

    // Hierarchical create + write + read (S3).
    assert_test!(fileio::fileio_mkdir("/a"));
    assert_test!(fileio::fileio_mkdir("/a/b"));
    let fd = fileio::fileio_open(KERNEL_PID, "/a/b/f", O_CREAT | O_RDWR);
    assert_test!(fd != INVALID_FD);
    assert_eq_test!(fileio::fileio_write(KERNEL_PID, fd, b"hello"), 5);

    assert_eq_test!(fileio::fileio_seek(KERNEL_PID, fd, 0, SeekOrigin::Begin), 0);
    let mut buf = [0u8; 8];
    assert_eq_test!(fileio::fileio_read(KERNEL_PID, fd, &mut buf), 5);
    assert_eq_test!(&buf[..5], b"hello");

    // Seeks clamp into [0, size] for every origin.
    assert_eq_test!(fileio::fileio_seek(KERNEL_PID, fd, 99, SeekOrigin::End), 5);
    assert_eq_test!(fileio::fileio_seek(KERNEL_PID, fd, -99, SeekOrigin::Begin), 0);
    assert_eq_test!(fileio::fileio_seek(KERNEL_PID, fd, 2, SeekOrigin::Curr), 2);

    // A second write-mode open of a busy file fails; read-only works.
    assert_eq_test!(fileio::fileio_open(KERNEL_PID, "/a/b/f", O_RDWR), INVALID_FD);
    let ro = fileio::fileio_open(KERNEL_PID, "/a/b/f", O_RDONLY);
    assert_test!(ro != INVALID_FD);
    assert_eq_test!(fileio::fileio_close(KERNEL_PID, ro), 0);

    // Deleting an open file fails until every descriptor is gone (S4).
    assert_test!(!fileio::fileio_unlink("/a/b/f"));
    assert_eq_test!(fileio::fileio_close(KERNEL_PID, fd), 0);
    assert_test!(fileio::fileio_unlink("/a/b/f"));
    assert_eq_test!(fileio::fileio_open(KERNEL_PID, "/a/b/f", O_RDONLY), INVALID_FD);

    // Opening with O_CREAT on an existing file is refused.
    let fd = fileio::fileio_open(KERNEL_PID, "/a/b/g", O_CREAT | O_RDWR);
    assert_test!(fd != INVALID_FD);
    assert_eq_test!(
        fileio::fileio_open(KERNEL_PID, "/a/b/g", O_CREAT | O_RDWR),
        INVALID_FD
    );
    assert_eq_test!(fileio::fileio_close(KERNEL_PID, fd), 0);

    // Fork inheritance: the child table references the same global slots
    // and holds its own reference on each inode.
    assert_test!(fileio::fileio_create_table(1));
    let fd = fileio::fileio_open(1, "/a/b/g", O_RDWR);
    assert_test!(fd != INVALID_FD);
    assert_test!(fileio::fileio_fork_table(1, 2));

    assert_test!(!fileio::fileio_unlink("/a/b/g"));
    assert_eq_test!(fileio::fileio_close(1, fd), 0);
    // Fork shares global slots, so the parent's close released the slot
    // itself; tearing down both tables leaves the file deletable.
    fileio::fileio_destroy_table(2);
    fileio::fileio_destroy_table(1);
    assert_test!(fileio::fileio_unlink("/a/b/g"));
    pass!()
}

basalt_lib::define_test_suite!(fs, [
    test_format_mount_geometry,
    test_mount_preserves_existing_fs,
    test_root_lists_dot_entries,
    test_create_dir_tree,
    test_file_write_read_roundtrip,
    test_write_crosses_into_indirect_blocks,
    test_max_file_size_boundary,
    test_delete_file_releases_resources,
    test_delete_dir_requires_empty,
    test_directory_grows_past_one_sector,
    test_second_writer_is_rejected,
    test_open_cache_is_shared,
    test_fileio_end_to_end,
]);

#[cfg(test)]
mod host {
    use super::*;

    #[test]
    fn format_mount_geometry() {
        assert!(test_format_mount_geometry().is_pass());
    }

    #[test]
    fn mount_preserves_existing_fs() {
        assert!(test_mount_preserves_existing_fs().is_pass());
    }

    #[test]
    fn root_lists_dot_entries() {
        assert!(test_root_lists_dot_entries().is_pass());
    }

    #[test]
    fn create_dir_tree() {
        assert!(test_create_dir_tree().is_pass());
    }

    #[test]
    fn file_write_read_roundtrip() {
        assert!(test_file_write_read_roundtrip().is_pass());
    }

    #[test]
    fn write_crosses_into_indirect_blocks() {
        assert!(test_write_crosses_into_indirect_blocks().is_pass());
    }

    #[test]
    fn max_file_size_boundary() {
        assert!(test_max_file_size_boundary().is_pass());
    }

    #[test]
    fn delete_file_releases_resources() {
        assert!(test_delete_file_releases_resources().is_pass());
    }

    #[test]
    fn delete_dir_requires_empty() {
        assert!(test_delete_dir_requires_empty().is_pass());
    }

    #[test]
    fn directory_grows_past_one_sector() {
        assert!(test_directory_grows_past_one_sector().is_pass());
    }

    #[test]
    fn second_writer_is_rejected() {
        assert!(test_second_writer_is_rejected().is_pass());
    }

    #[test]
    fn open_cache_is_shared() {
        assert!(test_open_cache_is_shared().is_pass());
    }

    #[test]
    fn fileio_end_to_end() {
        assert!(test_fileio_end_to_end().is_pass());
    }
}
