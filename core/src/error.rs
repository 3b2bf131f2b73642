/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the flashing engine.
///
/// Nothing is retried internally. A failure in the middle of a multi-chunk
/// flash or an erase leaves the partition partially written.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Device error: {0}")]
    Device(#[from] io::Error),
    #[error("No valid GPT on device: {0}")]
    NoGpt(String),
    #[error("Partition '{0}' not found")]
    NotFound(String),
    #[error("Request of {len:#X} bytes at offset {offset:#X} does not fit in {size:#X} bytes")]
    VolumeFull { offset: u64, len: u64, size: u64 },
    #[error("Failed to allocate {0:#X} bytes")]
    OutOfMemory(usize),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl Error {
    /// Process exit status for this error, numbered like the matching UEFI
    /// status code.
    pub fn status_code(&self) -> u8 {
        match self {
            Error::InvalidParameter(_) => 2,
            Error::UnsupportedFormat(_) => 3,
            Error::Device(_) | Error::NoGpt(_) => 7,
            Error::OutOfMemory(_) => 9,
            Error::VolumeFull { .. } => 11,
            Error::NotFound(_) => 14,
        }
    }
}
