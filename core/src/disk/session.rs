/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::config::FlashConfig;
use crate::device::{BlockDevice, DevicePath, MediaInfo};
use crate::disk::gpt::read_partition_table;
use crate::disk::partition_io::PartitionIo;
use crate::disk::sparse;
use crate::disk::table::{Partition, PartitionTable};
use crate::disk::utilities::alloc_buffer;
use crate::error::{Error, Result};
use log::{debug, info, warn};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    DeviceLocated,
    PartitionTableBuilt,
    Ready,
}

/// One flashing session against one parent block device.
///
/// The partition table is built once after the device is located and stays
/// valid until the device is reset. Every operation is a one-shot
/// transaction: nothing is retried and a failure midway leaves whatever was
/// already written on the device.
pub struct Session<D: BlockDevice> {
    device: Option<D>,
    table: Option<PartitionTable>,
    config: FlashConfig,
    state: SessionState,
}

fn no_device() -> Error {
    Error::Device(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "No device located",
    ))
}

fn no_table() -> Error {
    Error::NoGpt("no partition table loaded".to_string())
}

impl<D: BlockDevice> Session<D> {
    pub fn new(config: FlashConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            device: None,
            table: None,
            config,
            state: SessionState::Uninitialized,
        })
    }

    /// Starts a session on a device that is already known to be the target.
    pub fn open(device: D, config: FlashConfig) -> Result<Self> {
        let mut session = Self::new(config)?;
        session.attach(device);
        Ok(session)
    }

    fn attach(&mut self, device: D) {
        info!("Using parent device {}", device.device_path());
        self.device = Some(device);
        self.table = None;
        self.state = SessionState::DeviceLocated;
    }

    /// Picks the boot device among `candidates`: the first whole, fixed disk
    /// that is not behind a USB controller.
    pub fn locate(&mut self, candidates: Vec<D>) -> Result<()> {
        for device in candidates {
            let media = device.media();
            if media.logical_partition || media.removable || device.device_path().is_usb() {
                debug!("Skipping candidate {}", device.device_path());
                continue;
            }
            self.attach(device);
            return Ok(());
        }

        Err(Error::Device(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Failed to find boot device",
        )))
    }

    /// Reads the GPT and builds the partition table from `handles`, or from
    /// handles synthesized off the GPT itself when none are given.
    ///
    /// A device without a valid GPT still becomes ready, but only whole-device
    /// operations will work on it.
    pub async fn init_partitions(&mut self, handles: Option<Vec<DevicePath>>) -> Result<()> {
        let device = self.device.as_mut().ok_or_else(no_device)?;

        match read_partition_table(device).await {
            Ok(gpt) => {
                let parent = device.device_path().clone();
                let handles =
                    handles.unwrap_or_else(|| PartitionTable::synthesize_handles(&parent, &gpt));
                let table = PartitionTable::build(&parent, &handles, &gpt)?;
                info!("Partition table built with {} partitions", table.len());
                self.table = Some(table);
                self.state = SessionState::PartitionTableBuilt;
            }
            Err(Error::NoGpt(reason)) => {
                warn!("Continuing without partition names: {}", reason);
                self.table = None;
            }
            Err(e) => return Err(e),
        }

        self.state = SessionState::Ready;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    pub fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    pub fn into_device(self) -> Option<D> {
        self.device
    }

    pub fn partitions(&self) -> Option<&PartitionTable> {
        self.table.as_ref()
    }

    fn device_mut(&mut self) -> Result<&mut D> {
        self.device.as_mut().ok_or_else(no_device)
    }

    fn partition_io(&mut self) -> Result<(PartitionIo<'_>, &FlashConfig)> {
        let device = self.device.as_mut().ok_or_else(no_device)?;
        let table = self.table.as_ref().ok_or_else(no_table)?;
        Ok((PartitionIo::new(device, table), &self.config))
    }

    pub async fn flash(
        &mut self,
        name: &str,
        image: &[u8],
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let (mut io, config) = self.partition_io()?;
        sparse::flash(&mut io, name, image, config, progress).await
    }

    /// Zeroes the whole extent of `name` with block writes and a single
    /// flush at the end.
    pub async fn erase(
        &mut self,
        name: &str,
        progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<()> {
        let (mut io, config) = self.partition_io()?;
        let block_size = io.block_size() as u64;
        let size = io.partition_size(name)?;

        let cap = (config.erase_buffer_size as u64 / block_size).max(1) * block_size;
        let zeros = alloc_buffer(cap.min(size) as usize)?;
        info!("Erasing {} ({:#X} bytes)", name, size);

        let mut offset = 0u64;
        while offset < size {
            let n = (size - offset).min(zeros.len() as u64) as usize;
            io.write_blocks(name, offset, &zeros[..n]).await?;
            offset += n as u64;
            progress(offset as usize, size as usize);
        }

        io.flush().await
    }

    /// Zeroes the protective MBR, the primary GPT header and the entry array.
    ///
    /// The partition table no longer describes the device afterwards, so it
    /// is dropped and the session falls back to [`SessionState::DeviceLocated`].
    pub async fn reset(&mut self) -> Result<()> {
        let entries = self
            .config
            .max_gpt_entries
            .checked_mul(self.config.gpt_entry_size);
        let device = self.device.as_mut().ok_or_else(no_device)?;
        let media = device.media().clone();

        let len = entries
            .and_then(|e| e.checked_add(2 * media.block_size as usize))
            .ok_or_else(|| Error::InvalidParameter("GPT wipe size overflows".to_string()))?;
        if len as u64 > media.size() {
            return Err(Error::VolumeFull {
                offset: 0,
                len: len as u64,
                size: media.size(),
            });
        }

        let zeros = alloc_buffer(len)?;
        info!("Wiping GPT ({:#X} bytes)", len);
        device.write_disk(0, &zeros).await?;
        device.flush().await?;

        self.table = None;
        self.state = SessionState::DeviceLocated;
        Ok(())
    }

    pub async fn read_partition(&mut self, name: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
        let (mut io, _) = self.partition_io()?;
        io.read(name, offset, size).await
    }

    /// Reads `size` bytes located `back` bytes before the end of `name`.
    pub async fn read_partition_end(&mut self, name: &str, back: u64, size: usize) -> Result<Vec<u8>> {
        let (mut io, _) = self.partition_io()?;
        io.read_from_end(name, back, size).await
    }

    pub async fn write_partition(&mut self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        let (mut io, _) = self.partition_io()?;
        io.write(name, offset, data).await
    }

    fn lookup(&self, name: &str) -> Result<(&Partition, u32)> {
        let device = self.device.as_ref().ok_or_else(no_device)?;
        let table = self.table.as_ref().ok_or_else(no_table)?;
        Ok((table.find(name)?, device.media().block_size))
    }

    /// Size in bytes of `name`, last block included.
    pub fn partition_size(&self, name: &str) -> Result<u64> {
        let (partition, block_size) = self.lookup(name)?;
        Ok(partition.size(block_size))
    }

    pub fn unique_guid(&self, name: &str) -> Result<String> {
        Ok(self.lookup(name)?.0.unique_guid_string())
    }

    /// Reads `size` bytes at a raw device offset.
    pub async fn save(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let device = self.device_mut()?;
        check_device_range(device.media(), offset, size as u64)?;
        let mut buf = alloc_buffer(size)?;
        device.read_disk(offset, &mut buf).await?;
        Ok(buf)
    }

    /// Writes the first `size` bytes of `data` at a raw device offset. A size
    /// of 0 writes all of `data`.
    pub async fn write_raw(&mut self, offset: u64, size: usize, data: &[u8]) -> Result<()> {
        let size = if size == 0 { data.len() } else { size };
        if size > data.len() {
            return Err(Error::InvalidParameter(format!(
                "size {:#X} is larger than the {:#X} bytes provided",
                size,
                data.len()
            )));
        }

        let device = self.device_mut()?;
        check_device_range(device.media(), offset, size as u64)?;
        debug!("Writing {:#X} bytes at device offset {:#X}", size, offset);
        device.write_disk(offset, &data[..size]).await?;
        device.flush().await?;
        Ok(())
    }

    pub fn dump(&self) -> Result<DeviceReport> {
        let device = self.device.as_ref().ok_or_else(no_device)?;
        let block_size = device.media().block_size;
        let partitions = self
            .table
            .iter()
            .flat_map(|table| table.iter())
            .map(|p| PartitionSummary {
                number: p.number,
                name: p.name(),
                first_lba: p.first_lba,
                last_lba: p.last_lba,
                size: p.size(block_size),
                unique_guid: p.unique_guid_string(),
                path: p.path.to_string(),
            })
            .collect();

        Ok(DeviceReport {
            path: device.device_path().to_string(),
            media: device.media().clone(),
            partitions,
        })
    }
}

fn check_device_range(media: &MediaInfo, offset: u64, len: u64) -> Result<()> {
    let size = media.size();
    if offset > size || len > size - offset {
        return Err(Error::VolumeFull { offset, len, size });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSummary {
    pub number: u32,
    pub name: String,
    pub first_lba: u64,
    pub last_lba: u64,
    pub size: u64,
    pub unique_guid: String,
    pub path: String,
}

/// Snapshot of the parent device for the `-d` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub path: String,
    pub media: MediaInfo,
    pub partitions: Vec<PartitionSummary>,
}

impl fmt::Display for DeviceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.partitions {
            writeln!(f, "PartitionName: {}", part.name)?;
            writeln!(
                f,
                "  #{} LBA {:#X}..={:#X} ({:#X} bytes) {}",
                part.number, part.first_lba, part.last_lba, part.size, part.unique_guid
            )?;
            writeln!(f, "{}", part.path)?;
            writeln!(f)?;
        }

        let m = &self.media;
        writeln!(f, "{}", self.path)?;
        writeln!(f, "MediaId         : {}", m.media_id)?;
        writeln!(f, "RemovableMedia  : {}", m.removable as u8)?;
        writeln!(f, "MediaPresent    : {}", m.present as u8)?;
        writeln!(f, "LogicalPartition: {}", m.logical_partition as u8)?;
        writeln!(f, "ReadOnly        : {}", m.read_only as u8)?;
        writeln!(f, "WriteCaching    : {}", m.write_caching as u8)?;
        writeln!(f, "BlockSize       : {:#x}", m.block_size)?;
        writeln!(f, "IoAlign         : {:#x}", m.io_align)?;
        writeln!(f, "LastBlock       : {:#x}", m.last_block)
    }
}
