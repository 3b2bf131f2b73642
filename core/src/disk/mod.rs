/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod gpt;
pub mod partition_io;
pub mod session;
pub mod sparse;
pub mod table;
pub mod utilities;

pub use gpt::{Gpt, GptHeader, PartitionEntry, read_partition_table};
pub use partition_io::PartitionIo;
pub use session::{DeviceReport, Session, SessionState};
pub use sparse::{ChunkHeader, ChunkType, SparseHeader, SparseImage};
pub use table::{Partition, PartitionTable};

#[cfg(test)]
pub(crate) mod testutil {
    use crate::device::MemoryBlockDevice;
    use crate::disk::gpt::{GPT_REVISION, GptHeader, PartitionEntry, encode_entries};

    pub const BLOCK_SIZE: u32 = 512;
    pub const BLOCK_COUNT: u64 = 256;
    pub const BASIC_DATA: [u8; 16] = [
        0xa2, 0xa0, 0xd0, 0xeb, 0xe5, 0xb9, 0x33, 0x44, 0x87, 0xc0, 0x68, 0xb6, 0xb7, 0x26, 0x99,
        0xc7,
    ];

    pub fn guid(seed: u8) -> [u8; 16] {
        let mut guid = [0u8; 16];
        for (i, b) in guid.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        guid
    }

    /// boot: 8 blocks, system: 64 blocks, userdata: 96 blocks.
    pub fn test_entries() -> Vec<PartitionEntry> {
        vec![
            PartitionEntry::new("boot", BASIC_DATA, guid(0x10), 40, 47),
            PartitionEntry::new("system", BASIC_DATA, guid(0x20), 48, 111),
            PartitionEntry::new("userdata", BASIC_DATA, guid(0x30), 112, 207),
        ]
    }

    pub fn gpt_image(block_size: u32, blocks: u64, used: &[PartitionEntry]) -> Vec<u8> {
        let bs = block_size as usize;
        let entry_count = 128usize.max(used.len());
        let mut entries = used.to_vec();
        entries.resize(entry_count, PartitionEntry::new("", [0; 16], [0; 16], 0, 0));
        let raw_entries = encode_entries(&entries, PartitionEntry::SIZE);
        let entry_blocks = raw_entries.len().div_ceil(bs) as u64;

        let header = GptHeader {
            revision: GPT_REVISION,
            header_size: GptHeader::SIZE as u32,
            header_crc32: 0,
            my_lba: 1,
            alternate_lba: blocks - 1,
            first_usable_lba: 2 + entry_blocks,
            last_usable_lba: blocks - 2 - entry_blocks,
            disk_guid: guid(0xD0),
            entry_lba: 2,
            entry_count: entry_count as u32,
            entry_size: PartitionEntry::SIZE as u32,
            entries_crc32: crc32fast::hash(&raw_entries),
        };

        let mut image = vec![0u8; bs * blocks as usize];
        let raw_header = header.to_bytes();
        image[bs..bs + raw_header.len()].copy_from_slice(&raw_header);
        image[2 * bs..2 * bs + raw_entries.len()].copy_from_slice(&raw_entries);
        image
    }

    pub fn gpt_disk(used: &[PartitionEntry]) -> MemoryBlockDevice {
        let image = gpt_image(BLOCK_SIZE, BLOCK_COUNT, used);
        MemoryBlockDevice::from_image(BLOCK_SIZE, image).expect("test image")
    }
}
