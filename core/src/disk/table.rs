/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::device::{DevicePath, PartitionFormat, PathNode};
use crate::disk::gpt::Gpt;
use crate::disk::utilities::{decode_name, encode_name, format_guid};
use crate::error::{Error, Result};
use log::{debug, warn};

/// A named partition of the parent device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub number: u32,
    name: Vec<u16>,
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub path: DevicePath,
}

impl Partition {
    pub fn name(&self) -> String {
        decode_name(&self.name)
    }

    pub fn name_units(&self) -> &[u16] {
        &self.name
    }

    pub fn block_count(&self) -> u64 {
        if self.last_lba >= self.first_lba {
            self.last_lba - self.first_lba + 1
        } else {
            0
        }
    }

    /// Size in bytes, last block included.
    pub fn size(&self, block_size: u32) -> u64 {
        self.block_count() * block_size as u64
    }

    /// Byte offset of the partition start on the parent device.
    pub fn byte_offset(&self, block_size: u32) -> u64 {
        self.first_lba * block_size as u64
    }

    pub fn unique_guid_string(&self) -> String {
        format_guid(&self.unique_guid)
    }
}

/// Partitions of one parent device, in handle order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Builds the directory from the block handles that are partitions of
    /// `parent`, naming each one from its GPT entry.
    ///
    /// Handles that are not strict children of `parent`, carry no hard drive
    /// node, are partition 0 or point outside the entry array are skipped.
    pub fn build(parent: &DevicePath, handles: &[DevicePath], gpt: &Gpt) -> Result<Self> {
        let mut partitions: Vec<Partition> = Vec::new();

        for path in handles {
            let Some(nodes) = path.child_nodes(parent) else {
                continue;
            };
            let Some((number, format)) = nodes.iter().find_map(|node| match node {
                PathNode::HardDrive { number, format, .. } => Some((*number, *format)),
                _ => None,
            }) else {
                continue;
            };

            if format != PartitionFormat::Gpt {
                warn!("Skipping non-GPT partition {} at {}", number, path);
                continue;
            }
            // Firmware may expose the whole device as partition 0
            if number == 0 {
                continue;
            }
            let Some(entry) = gpt.entry(number) else {
                debug!("Partition {} is outside the entry array, skipping", number);
                continue;
            };

            let name = entry.name_units();
            let mut owned = Vec::new();
            owned
                .try_reserve_exact(name.len())
                .map_err(|_| Error::OutOfMemory(name.len() * 2))?;
            owned.extend_from_slice(name);
            partitions
                .try_reserve(1)
                .map_err(|_| Error::OutOfMemory(std::mem::size_of::<Partition>()))?;

            if !owned
                .first()
                .and_then(|&c| char::from_u32(c as u32))
                .is_some_and(|c| c.is_ascii_alphabetic())
            {
                warn!(
                    "Partition {} doesn't seem to have a GPT partition label. You won't be able to flash it.",
                    number
                );
            }

            partitions.push(Partition {
                number,
                name: owned,
                type_guid: entry.type_guid,
                unique_guid: entry.unique_guid,
                first_lba: entry.first_lba,
                last_lba: entry.last_lba,
                attributes: entry.attributes,
                path: path.clone(),
            });
        }

        debug!("Partition table holds {} partitions", partitions.len());
        Ok(Self { partitions })
    }

    /// Block handles a firmware partition driver would install for `gpt`:
    /// the whole device as partition 0, then one per used entry.
    pub fn synthesize_handles(parent: &DevicePath, gpt: &Gpt) -> Vec<DevicePath> {
        let whole = parent.join(PathNode::HardDrive {
            number: 0,
            start_lba: 0,
            size_lba: 0,
            signature: [0u8; 16],
            format: PartitionFormat::Gpt,
        });
        std::iter::once(whole)
            .chain(gpt.used_entries().map(|(number, entry)| {
                parent.join(PathNode::HardDrive {
                    number,
                    start_lba: entry.first_lba,
                    size_lba: entry.block_count(),
                    signature: entry.unique_guid,
                    format: PartitionFormat::Gpt,
                })
            }))
            .collect()
    }

    /// Finds a partition by its exact, case-sensitive name.
    pub fn find(&self, name: &str) -> Result<&Partition> {
        let wanted = encode_name(name);
        self.partitions
            .iter()
            .find(|p| p.name == wanted)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}
