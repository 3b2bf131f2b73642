/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::device::BlockDevice;
use crate::disk::utilities::{align_up, alloc_buffer, decode_name, le_u32, le_u64, trim_name};
use crate::error::{Error, Result};
use log::{debug, info, warn};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_REVISION: u32 = 0x0001_0000;
pub const GPT_HEADER_LBA: u64 = 1;
pub const GPT_ENTRIES_LBA: u64 = 2;
pub const PARTITION_NAME_UNITS: usize = 36;

/// Primary GPT header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub entry_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

impl GptHeader {
    /// Size of the defined fields; anything up to `header_size` is reserved.
    pub const SIZE: usize = 92;

    /// Parses and validates the header found in the block at LBA 1.
    ///
    /// Every validation failure is reported as [`Error::NoGpt`].
    pub fn parse(block: &[u8]) -> Result<Self> {
        if block.len() < Self::SIZE {
            return Err(Error::NoGpt(format!("block of {} bytes is too small", block.len())));
        }
        if &block[0..8] != GPT_SIGNATURE {
            return Err(Error::NoGpt("signature mismatch".to_string()));
        }

        let header = GptHeader {
            revision: le_u32(block, 8),
            header_size: le_u32(block, 12),
            header_crc32: le_u32(block, 16),
            my_lba: le_u64(block, 24),
            alternate_lba: le_u64(block, 32),
            first_usable_lba: le_u64(block, 40),
            last_usable_lba: le_u64(block, 48),
            disk_guid: block[56..72].try_into().unwrap_or_default(),
            entry_lba: le_u64(block, 72),
            entry_count: le_u32(block, 80),
            entry_size: le_u32(block, 84),
            entries_crc32: le_u32(block, 88),
        };

        if header.revision != GPT_REVISION {
            return Err(Error::NoGpt(format!("unknown revision {:#010X}", header.revision)));
        }
        let header_size = header.header_size as usize;
        if header_size < Self::SIZE || header_size > block.len() {
            return Err(Error::NoGpt(format!("bad header size {}", header.header_size)));
        }
        if header.my_lba != GPT_HEADER_LBA {
            return Err(Error::NoGpt(format!("header claims LBA {}", header.my_lba)));
        }

        let computed = header_crc(&block[..header_size]);
        if computed != header.header_crc32 {
            return Err(Error::NoGpt(format!(
                "header CRC32 {:#010X} does not match {:#010X}",
                computed, header.header_crc32
            )));
        }

        // 128 bytes is the smallest entry UEFI allows
        if header.entry_size < PartitionEntry::SIZE as u32 || header.entry_count == 0 {
            return Err(Error::NoGpt(format!(
                "unusable entry geometry {} x {}",
                header.entry_count, header.entry_size
            )));
        }

        Ok(header)
    }

    /// Serializes the header with a freshly computed CRC32, zero padded to
    /// `header_size`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = vec![0u8; (self.header_size as usize).max(Self::SIZE)];
        raw[0..8].copy_from_slice(GPT_SIGNATURE);
        raw[8..12].copy_from_slice(&self.revision.to_le_bytes());
        raw[12..16].copy_from_slice(&self.header_size.to_le_bytes());
        raw[24..32].copy_from_slice(&self.my_lba.to_le_bytes());
        raw[32..40].copy_from_slice(&self.alternate_lba.to_le_bytes());
        raw[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
        raw[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
        raw[56..72].copy_from_slice(&self.disk_guid);
        raw[72..80].copy_from_slice(&self.entry_lba.to_le_bytes());
        raw[80..84].copy_from_slice(&self.entry_count.to_le_bytes());
        raw[84..88].copy_from_slice(&self.entry_size.to_le_bytes());
        raw[88..92].copy_from_slice(&self.entries_crc32.to_le_bytes());
        let crc = header_crc(&raw);
        raw[16..20].copy_from_slice(&crc.to_le_bytes());
        raw
    }

    /// Bytes covered by the entries CRC32.
    pub fn entries_len(&self) -> u64 {
        self.entry_count as u64 * self.entry_size as u64
    }
}

/// CRC32 of a header with its own CRC field taken as zero.
fn header_crc(raw: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&raw[..16]);
    hasher.update(&[0u8; 4]);
    hasher.update(&raw[20..]);
    hasher.finalize()
}

/// One slot of the partition entry array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name: [u16; PARTITION_NAME_UNITS],
}

impl PartitionEntry {
    pub const SIZE: usize = 128;

    pub fn new(name: &str, type_guid: [u8; 16], unique_guid: [u8; 16], first_lba: u64, last_lba: u64) -> Self {
        let mut fixed = [0u16; PARTITION_NAME_UNITS];
        for (slot, unit) in fixed.iter_mut().zip(name.encode_utf16()) {
            *slot = unit;
        }
        Self {
            type_guid,
            unique_guid,
            first_lba,
            last_lba,
            attributes: 0,
            name: fixed,
        }
    }

    pub fn parse(raw: &[u8]) -> Self {
        let mut name = [0u16; PARTITION_NAME_UNITS];
        for (i, unit) in name.iter_mut().enumerate() {
            *unit = u16::from_le_bytes([raw[56 + i * 2], raw[57 + i * 2]]);
        }
        Self {
            type_guid: raw[0..16].try_into().unwrap_or_default(),
            unique_guid: raw[16..32].try_into().unwrap_or_default(),
            first_lba: le_u64(raw, 32),
            last_lba: le_u64(raw, 40),
            attributes: le_u64(raw, 48),
            name,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        raw[0..16].copy_from_slice(&self.type_guid);
        raw[16..32].copy_from_slice(&self.unique_guid);
        raw[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
        raw[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
        raw[48..56].copy_from_slice(&self.attributes.to_le_bytes());
        for (i, unit) in self.name.iter().enumerate() {
            raw[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        raw
    }

    pub fn is_empty(&self) -> bool {
        self.type_guid == [0u8; 16]
    }

    /// Name units up to the first NUL.
    pub fn name_units(&self) -> &[u16] {
        trim_name(&self.name)
    }

    pub fn name(&self) -> String {
        decode_name(&self.name)
    }

    pub fn block_count(&self) -> u64 {
        if self.last_lba >= self.first_lba {
            self.last_lba - self.first_lba + 1
        } else {
            0
        }
    }

    pub fn size(&self, block_size: u32) -> u64 {
        self.block_count() * block_size as u64
    }
}

/// Header plus the whole entry array, empty slots included so that entry
/// `n` is partition number `n + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpt {
    pub header: GptHeader,
    pub entries: Vec<PartitionEntry>,
}

impl Gpt {
    /// Entry of a 1-based partition number.
    pub fn entry(&self, number: u32) -> Option<&PartitionEntry> {
        let index = (number as usize).checked_sub(1)?;
        self.entries.get(index)
    }

    pub fn used_entries(&self) -> impl Iterator<Item = (u32, &PartitionEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_empty())
            .map(|(i, e)| (i as u32 + 1, e))
    }
}

/// Serializes an entry array padded to `entry_size` per slot.
pub fn encode_entries(entries: &[PartitionEntry], entry_size: usize) -> Vec<u8> {
    let mut raw = vec![0u8; entries.len() * entry_size];
    for (i, entry) in entries.iter().enumerate() {
        raw[i * entry_size..i * entry_size + PartitionEntry::SIZE].copy_from_slice(&entry.to_bytes());
    }
    raw
}

/// Reads and validates the primary GPT of `device`.
///
/// Returns [`Error::NoGpt`] when the device carries no usable table, which
/// callers are expected to treat as "no partition names" rather than a
/// failure.
pub async fn read_partition_table(device: &mut dyn BlockDevice) -> Result<Gpt> {
    let block_size = device.media().block_size as usize;

    let mut block = alloc_buffer(block_size)?;
    device.read_blocks(GPT_HEADER_LBA, &mut block).await?;
    let header = match GptHeader::parse(&block) {
        Ok(header) => header,
        Err(e) => {
            warn!("No GPT on device, MBR is not supported");
            return Err(e);
        }
    };
    drop(block);

    debug!(
        "GPT: {} entries of {} bytes at LBA {}",
        header.entry_count, header.entry_size, header.entry_lba
    );
    if header.entry_lba != GPT_ENTRIES_LBA {
        warn!(
            "GPT header places entries at LBA {}, reading LBA {}",
            header.entry_lba, GPT_ENTRIES_LBA
        );
    }

    let entries_len = header.entries_len();
    let room = device
        .media()
        .size()
        .saturating_sub(GPT_ENTRIES_LBA * block_size as u64);
    if entries_len > room {
        return Err(Error::NoGpt(format!(
            "entry array of {:#X} bytes does not fit the {:#X} bytes after LBA {}",
            entries_len, room, GPT_ENTRIES_LBA
        )));
    }
    let buffer_size = align_up(entries_len, block_size as u64)
        .and_then(|size| usize::try_from(size).ok())
        .ok_or_else(|| Error::NoGpt(format!("entry array of {:#X} bytes", entries_len)))?;

    let mut raw = alloc_buffer(buffer_size)?;
    device.read_blocks(GPT_ENTRIES_LBA, &mut raw).await?;

    let computed = crc32fast::hash(&raw[..entries_len as usize]);
    if computed != header.entries_crc32 {
        return Err(Error::NoGpt(format!(
            "entry array CRC32 {:#010X} does not match {:#010X}",
            computed, header.entries_crc32
        )));
    }

    let entry_size = header.entry_size as usize;
    let mut entries = Vec::new();
    entries
        .try_reserve_exact(header.entry_count as usize)
        .map_err(|_| Error::OutOfMemory(header.entry_count as usize * std::mem::size_of::<PartitionEntry>()))?;
    for i in 0..header.entry_count as usize {
        let start = i * entry_size;
        entries.push(PartitionEntry::parse(&raw[start..start + PartitionEntry::SIZE]));
    }

    info!(
        "Found GPT with {} partitions",
        entries.iter().filter(|e| !e.is_empty()).count()
    );
    Ok(Gpt { header, entries })
}
