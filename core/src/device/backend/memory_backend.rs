/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::device::{BlockDevice, DevicePath, MediaInfo, check_range};
use std::io::{Error, ErrorKind, Result};
use std::ops::Range;

/// A disk held in memory.
///
/// Every write extent and flush is recorded, and reads or writes can be made
/// to fail, which is what the engine's tests use it for.
#[derive(Debug, Clone)]
pub struct MemoryBlockDevice {
    data: Vec<u8>,
    media: MediaInfo,
    path: DevicePath,
    writes: Vec<Range<u64>>,
    flushes: usize,
    writes_left: Option<usize>,
    fail_reads: bool,
}

impl MemoryBlockDevice {
    /// Creates a zeroed disk of `block_count` blocks.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero. Use [`MemoryBlockDevice::from_image`]
    /// for geometry that is not known to be valid.
    pub fn new(block_size: u32, block_count: u64) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        let data = vec![0u8; (block_size as u64 * block_count) as usize];
        Self::with_data(block_size, data)
    }

    /// Wraps an existing image. A trailing partial block is not addressable.
    pub fn from_image(block_size: u32, data: Vec<u8>) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Block size is zero"));
        }
        if (data.len() as u64) < block_size as u64 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Image is smaller than one block",
            ));
        }
        Ok(Self::with_data(block_size, data))
    }

    fn with_data(block_size: u32, data: Vec<u8>) -> Self {
        let blocks = data.len() as u64 / block_size as u64;
        Self {
            data,
            media: MediaInfo::new(block_size, blocks.saturating_sub(1)),
            path: DevicePath::from_device("MemoryDisk"),
            writes: Vec::new(),
            flushes: 0,
            writes_left: None,
            fail_reads: false,
        }
    }

    pub fn with_path(mut self, path: DevicePath) -> Self {
        self.path = path;
        self
    }

    /// Lets `count` more writes succeed, then fails every following one.
    pub fn fail_writes_after(mut self, count: usize) -> Self {
        self.writes_left = Some(count);
        self
    }

    pub fn fail_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    pub fn media_mut(&mut self) -> &mut MediaInfo {
        &mut self.media
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Byte ranges written so far, in order.
    pub fn write_log(&self) -> &[Range<u64>] {
        &self.writes
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn clear_log(&mut self) {
        self.writes.clear();
        self.flushes = 0;
    }
}

#[async_trait::async_trait]
impl BlockDevice for MemoryBlockDevice {
    fn media(&self) -> &MediaInfo {
        &self.media
    }

    fn device_path(&self) -> &DevicePath {
        &self.path
    }

    async fn read_disk(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.fail_reads {
            return Err(Error::other("Injected read failure"));
        }
        check_range(&self.media, offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    async fn write_disk(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.media.read_only {
            return Err(Error::new(ErrorKind::PermissionDenied, "Media is read-only"));
        }
        if let Some(left) = self.writes_left.as_mut() {
            if *left == 0 {
                return Err(Error::other("Injected write failure"));
            }
            *left -= 1;
        }
        check_range(&self.media, offset, data.len())?;
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        self.writes.push(offset..offset + data.len() as u64);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
