/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::device::{BlockDevice, DevicePath, MediaInfo, check_range};
use log::{debug, info, warn};
use std::io::{Error, ErrorKind, Result, SeekFrom};
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// A disk image file or raw block node on the host.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: Option<File>,
    path: PathBuf,
    media: MediaInfo,
    device_path: DevicePath,
    is_open: bool,
}

impl FileBlockDevice {
    pub fn new(path: impl Into<PathBuf>, block_size: u32) -> Self {
        let path = path.into();
        let device_path = DevicePath::from_device(&path.display().to_string());
        Self {
            file: None,
            path,
            media: MediaInfo::new(block_size, 0),
            device_path,
            is_open: false,
        }
    }

    /// Opens the file read-write, falling back to read-only when writing is
    /// not permitted, and sizes the media from its length.
    pub async fn open(&mut self) -> Result<()> {
        if self.is_open {
            return Ok(());
        }
        if self.media.block_size == 0 {
            return Err(Error::new(ErrorKind::InvalidInput, "Block size must not be zero"));
        }

        let (mut file, read_only) = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
        {
            Ok(file) => (file, false),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                warn!("{} is not writable, opening read-only", self.path.display());
                (File::open(&self.path).await?, true)
            }
            Err(e) => return Err(e),
        };

        // Block nodes report a zero length in their metadata, seeking works for both.
        let size = file.seek(SeekFrom::End(0)).await?;
        let blocks = size / self.media.block_size as u64;
        if blocks == 0 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("{} is smaller than one block", self.path.display()),
            ));
        }
        if size % self.media.block_size as u64 != 0 {
            debug!("Ignoring {} trailing bytes", size % self.media.block_size as u64);
        }

        self.media.last_block = blocks - 1;
        self.media.read_only = read_only;
        self.media.present = true;
        self.file = Some(file);
        self.is_open = true;
        info!(
            "Opened {} ({:#X} blocks of {} bytes)",
            self.path.display(),
            blocks,
            self.media.block_size
        );
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.is_open {
            if let Some(mut file) = self.file.take() {
                file.flush().await?;
            }
            self.is_open = false;
        }
        Ok(())
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "Device is not open"))
    }
}

#[async_trait::async_trait]
impl BlockDevice for FileBlockDevice {
    fn media(&self) -> &MediaInfo {
        &self.media
    }

    fn device_path(&self) -> &DevicePath {
        &self.device_path
    }

    async fn read_disk(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(&self.media, offset, buf.len())?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_disk(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.media.read_only {
            return Err(Error::new(ErrorKind::PermissionDenied, "Media is read-only"));
        }
        check_range(&self.media, offset, data.len())?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await
    }

    async fn flush(&mut self) -> Result<()> {
        let file = self.file()?;
        file.flush().await?;
        file.sync_data().await
    }
}
