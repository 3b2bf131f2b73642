/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod backend;
pub mod path;
pub use backend::{FileBlockDevice, MemoryBlockDevice};
pub use path::{DevicePath, PartitionFormat, PathNode};

use std::io::{Error, ErrorKind, Result};

/// Geometry and flags of a block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub media_id: u32,
    pub block_size: u32,
    pub last_block: u64,
    pub removable: bool,
    pub present: bool,
    pub logical_partition: bool,
    pub read_only: bool,
    pub write_caching: bool,
    pub io_align: u32,
}

impl MediaInfo {
    pub fn new(block_size: u32, last_block: u64) -> Self {
        Self {
            media_id: 0,
            block_size,
            last_block,
            removable: false,
            present: true,
            logical_partition: false,
            read_only: false,
            write_caching: false,
            io_align: 1,
        }
    }

    /// Device size in bytes, last block included.
    pub fn size(&self) -> u64 {
        (self.last_block + 1) * self.block_size as u64
    }
}

/// Byte and block addressed access to a disk.
///
/// Backends implement the byte granular calls; the block calls are layered
/// on top and refuse lengths that are not a whole number of blocks.
#[async_trait::async_trait]
pub trait BlockDevice: Send {
    fn media(&self) -> &MediaInfo;
    fn device_path(&self) -> &DevicePath;

    async fn read_disk(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    async fn write_disk(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;

    async fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        let offset = block_offset(self.media(), lba, buf.len())?;
        self.read_disk(offset, buf).await
    }

    async fn write_blocks(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        let offset = block_offset(self.media(), lba, data.len())?;
        self.write_disk(offset, data).await
    }
}

fn block_offset(media: &MediaInfo, lba: u64, len: usize) -> Result<u64> {
    let block_size = media.block_size as u64;
    if len as u64 % block_size != 0 {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("Transfer of {:#X} bytes is not a multiple of the block size", len),
        ));
    }
    if lba > media.last_block {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("LBA {:#X} is past the last block {:#X}", lba, media.last_block),
        ));
    }
    lba.checked_mul(block_size)
        .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "LBA overflow"))
}

/// Rejects transfers that would run past the end of the media.
pub fn check_range(media: &MediaInfo, offset: u64, len: usize) -> Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= media.size() => Ok(()),
        _ => Err(Error::new(
            ErrorKind::InvalidInput,
            format!(
                "Access of {:#X} bytes at {:#X} is beyond the end of the device ({:#X})",
                len,
                offset,
                media.size()
            ),
        )),
    }
}
