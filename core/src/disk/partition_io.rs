/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::device::BlockDevice;
use crate::disk::table::{Partition, PartitionTable};
use crate::disk::utilities::alloc_buffer;
use crate::error::{Error, Result};
use log::debug;

/// Bounds-checked byte access to named partitions.
///
/// Requests that do not fit inside the partition are refused with
/// [`Error::VolumeFull`] before the device is touched. Reads are never
/// truncated to fit.
pub struct PartitionIo<'a> {
    device: &'a mut dyn BlockDevice,
    table: &'a PartitionTable,
}

impl<'a> PartitionIo<'a> {
    pub fn new(device: &'a mut dyn BlockDevice, table: &'a PartitionTable) -> Self {
        Self { device, table }
    }

    pub fn block_size(&self) -> u32 {
        self.device.media().block_size
    }

    pub fn partition(&self, name: &str) -> Result<&'a Partition> {
        let table: &'a PartitionTable = self.table;
        table.find(name)
    }

    /// Size in bytes of `name`, last block included.
    pub fn partition_size(&self, name: &str) -> Result<u64> {
        Ok(self.partition(name)?.size(self.block_size()))
    }

    pub fn unique_guid(&self, name: &str) -> Result<String> {
        Ok(self.partition(name)?.unique_guid_string())
    }

    /// Resolves `name` and checks that `len` bytes at `offset` fit, returning
    /// the absolute device offset of the transfer.
    fn locate(&self, name: &str, offset: u64, len: u64) -> Result<u64> {
        let block_size = self.block_size();
        let partition = self.partition(name)?;
        let size = partition.size(block_size);

        if offset > size || len > size - offset {
            return Err(Error::VolumeFull { offset, len, size });
        }

        Ok(partition.byte_offset(block_size) + offset)
    }

    pub async fn read(&mut self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = self.locate(name, offset, len as u64)?;
        let mut buf = alloc_buffer(len)?;
        debug!("Reading {:#X} bytes from {} at {:#X}", len, name, offset);
        self.device.read_disk(start, &mut buf).await?;
        Ok(buf)
    }

    /// Reads `len` bytes starting `back` bytes before the end of the partition.
    pub async fn read_from_end(&mut self, name: &str, back: u64, len: usize) -> Result<Vec<u8>> {
        let size = self.partition_size(name)?;
        if back > size {
            return Err(Error::VolumeFull {
                offset: back,
                len: len as u64,
                size,
            });
        }
        self.read(name, size - back, len).await
    }

    /// Writes `data` at `offset` and flushes the device.
    pub async fn write(&mut self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        let start = self.locate(name, offset, data.len() as u64)?;
        debug!("Writing {:#X} bytes to {} at {:#X}", data.len(), name, offset);
        self.device.write_disk(start, data).await?;
        self.device.flush().await?;
        Ok(())
    }

    /// Writes whole blocks at a block aligned `offset` without flushing.
    pub(crate) async fn write_blocks(&mut self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        let block_size = self.block_size() as u64;
        let start = self.locate(name, offset, data.len() as u64)?;
        if start % block_size != 0 {
            return Err(Error::InvalidParameter(format!(
                "Offset {:#X} is not block aligned",
                offset
            )));
        }
        self.device.write_blocks(start / block_size, data).await?;
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        self.device.flush().await?;
        Ok(())
    }
}
