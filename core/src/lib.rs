/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod config;
pub mod device;
pub mod disk;
pub mod error;

pub use config::{Crc32ChunkPolicy, FlashConfig};
pub use device::{BlockDevice, FileBlockDevice, MemoryBlockDevice};
pub use disk::{DeviceReport, Session, SessionState};
pub use error::{Error, Result};
