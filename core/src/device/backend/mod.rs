/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod file_backend;
pub mod memory_backend;
pub use file_backend::FileBlockDevice;
pub use memory_backend::MemoryBlockDevice;
