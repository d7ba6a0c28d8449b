//! The on-disk file system and descriptor tables.
//!
//! A formatted partition carries a super block, a block bitmap, an inode
//! bitmap, a packed inode array and a data area of 512-byte blocks. Inodes
//! address 12 direct blocks plus one single-indirect table of 128, giving a
//! 71680-byte file ceiling. Directories are flat runs of fixed-size
//! entries inside ordinary inode blocks.
//!
//! [`volume`] implements the format/mount/lookup/file machinery against the
//! [`BlockDevice`] trait; the kernel hands it an IDE partition while tests
//! drive the identical code over a [`MemoryBlockDevice`].

#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod blockdev;
pub mod fileio;
pub mod layout;
pub mod path;
pub mod volume;

pub mod tests;

pub use blockdev::{BlockDevice, BlockDeviceError, MemoryBlockDevice};
pub use layout::{DIR_ENTRY_DISK_SIZE, FS_MAGIC, MAX_FILE_SIZE, SuperBlock};
pub use volume::{FsError, FsResult, Volume};
