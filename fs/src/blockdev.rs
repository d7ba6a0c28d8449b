//! Sector-addressed block devices.

use alloc::vec;
use alloc::vec::Vec;
use basalt_abi::fs::SECTOR_SIZE;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockDeviceError {
    OutOfRange,
    InvalidBuffer,
}

/// A device readable and writable in whole 512-byte sectors.
///
/// `lba` is the sector index relative to the start of the device (for a
/// partition, relative to the partition start). Buffer lengths must be a
/// multiple of the sector size.
pub trait BlockDevice {
    fn read_sectors(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), BlockDeviceError>;

    fn write_sectors(&mut self, lba: u32, data: &[u8]) -> Result<(), BlockDeviceError>;

    /// Total number of sectors.
    fn sector_count(&self) -> u32;
}

/// A RAM-backed device for tests and scratch volumes.
pub struct MemoryBlockDevice {
    data: Vec<u8>,
}

impl MemoryBlockDevice {
    pub fn new(sectors: u32) -> Self {
        Self {
            data: vec![0u8; sectors as usize * SECTOR_SIZE],
        }
    }

    fn check(&self, lba: u32, len: usize) -> Result<usize, BlockDeviceError> {
        if len == 0 || len % SECTOR_SIZE != 0 {
            return Err(BlockDeviceError::InvalidBuffer);
        }
        let offset = lba as usize * SECTOR_SIZE;
        if offset + len > self.data.len() {
            return Err(BlockDeviceError::OutOfRange);
        }
        Ok(offset)
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_sectors(&mut self, lba: u32, buf: &mut [u8]) -> Result<(), BlockDeviceError> {
        let offset = self.check(lba, buf.len())?;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_sectors(&mut self, lba: u32, data: &[u8]) -> Result<(), BlockDeviceError> {
        let offset = self.check(lba, data.len())?;
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        (self.data.len() / SECTOR_SIZE) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_sectors() {
        let mut dev = MemoryBlockDevice::new(8);
        let data = [0xABu8; SECTOR_SIZE * 2];
        dev.write_sectors(3, &data).unwrap();

        let mut buf = [0u8; SECTOR_SIZE * 2];
        dev.read_sectors(3, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn rejects_out_of_range() {
        let mut dev = MemoryBlockDevice::new(2);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(dev.read_sectors(2, &mut buf), Err(BlockDeviceError::OutOfRange));
        assert_eq!(
            dev.write_sectors(0, &[0u8; 100]),
            Err(BlockDeviceError::InvalidBuffer)
        );
    }
}
