/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::error::{Error, Result};

pub const SIZE_16MB: usize = 16 * 1024 * 1024;
pub const SIZE_64MB: usize = 64 * 1024 * 1024;
pub const MAX_GPT_ENTRIES: usize = 128;
pub const GPT_ENTRY_SIZE: usize = 128;

/// What a CRC32 chunk does to the write offset of a sparse image.
///
/// The checksum itself is never verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Crc32ChunkPolicy {
    /// Skip the chunk entirely, the write offset stays where it is.
    #[default]
    Inert,
    /// Advance the write offset by `chunk_size * block_size`, like DONT_CARE.
    Advance,
}

/// Working-set limits and format policies for a flashing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashConfig {
    /// Upper bound of the buffer synthesized for FILL chunks.
    pub fill_buffer_size: usize,
    /// Upper bound of the zero buffer used by erase.
    pub erase_buffer_size: usize,
    /// Entry count assumed when wiping the GPT.
    pub max_gpt_entries: usize,
    /// Entry size assumed when wiping the GPT.
    pub gpt_entry_size: usize,
    pub crc32_policy: Crc32ChunkPolicy,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            fill_buffer_size: SIZE_16MB,
            erase_buffer_size: SIZE_64MB,
            max_gpt_entries: MAX_GPT_ENTRIES,
            gpt_entry_size: GPT_ENTRY_SIZE,
            crc32_policy: Crc32ChunkPolicy::default(),
        }
    }
}

impl FlashConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_crc32_policy(mut self, policy: Crc32ChunkPolicy) -> Self {
        self.crc32_policy = policy;
        self
    }

    pub fn with_fill_buffer_size(mut self, size: usize) -> Self {
        self.fill_buffer_size = size;
        self
    }

    pub fn with_erase_buffer_size(mut self, size: usize) -> Self {
        self.erase_buffer_size = size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.fill_buffer_size == 0 || self.fill_buffer_size % 4 != 0 {
            return Err(Error::InvalidParameter(format!(
                "fill buffer size {:#X} must be a non-zero multiple of 4",
                self.fill_buffer_size
            )));
        }
        if self.erase_buffer_size == 0 {
            return Err(Error::InvalidParameter(
                "erase buffer size must not be zero".to_string(),
            ));
        }
        if self.max_gpt_entries == 0 || self.gpt_entry_size == 0 {
            return Err(Error::InvalidParameter(
                "GPT wipe geometry must not be zero".to_string(),
            ));
        }
        Ok(())
    }
}
