/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::error::{Error, Result};
use std::fmt::Write;

pub fn align_up(value: u64, align: u64) -> Option<u64> {
    if align == 0 {
        return Some(value);
    }
    value.div_ceil(align).checked_mul(align)
}

/// Allocates a zeroed working buffer, reporting exhaustion instead of aborting.
pub fn alloc_buffer(size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|_| Error::OutOfMemory(size))?;
    buf.resize(size, 0);
    Ok(buf)
}

pub fn le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

pub fn le_u32(data: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

pub fn le_u64(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

/// Fixed-width UCS-2 name cut at its first NUL.
pub fn trim_name(units: &[u16]) -> &[u16] {
    let len = units.iter().position(|&c| c == 0).unwrap_or(units.len());
    &units[..len]
}

pub fn encode_name(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}

pub fn decode_name(units: &[u16]) -> String {
    String::from_utf16_lossy(trim_name(units))
}

/// Text form of a GUID stored in the mixed-endian on-disk layout.
pub fn format_guid(guid: &[u8; 16]) -> String {
    let data1 = u32::from_le_bytes([guid[0], guid[1], guid[2], guid[3]]);
    let data2 = u16::from_le_bytes([guid[4], guid[5]]);
    let data3 = u16::from_le_bytes([guid[6], guid[7]]);
    format!(
        "{:08X}-{:04X}-{:04X}-{}-{}",
        data1,
        data2,
        data3,
        hex::encode_upper(&guid[8..10]),
        hex::encode_upper(&guid[10..16])
    )
}

/// Classic 16 bytes per line dump with an ASCII column.
pub fn hexdump(indent: usize, offset: usize, data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(16).enumerate() {
        let mut val = String::with_capacity(48);
        let mut text = String::with_capacity(16);
        for (i, &byte) in chunk.iter().enumerate() {
            let _ = write!(val, "{:02X}{}", byte, if i == 7 { '-' } else { ' ' });
            text.push(if (b' '..=b'~').contains(&byte) {
                byte as char
            } else {
                '.'
            });
        }
        let _ = writeln!(
            out,
            "{:indent$}{:08X}: {:<48} *{}*",
            "",
            offset + line * 16,
            val,
            text,
            indent = indent
        );
    }
    out
}
