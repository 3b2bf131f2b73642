/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::config::{Crc32ChunkPolicy, FlashConfig};
use crate::disk::partition_io::PartitionIo;
use crate::disk::utilities::{alloc_buffer, le_u16, le_u32};
use crate::error::{Error, Result};
use log::{debug, info, warn};

pub const SPARSE_HEADER_MAGIC: u32 = 0xED26_FF3A;
pub const SPARSE_MAJOR_VERSION: u16 = 1;

const CHUNK_TYPE_RAW: u16 = 0xCAC1;
const CHUNK_TYPE_FILL: u16 = 0xCAC2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Raw,
    Fill,
    DontCare,
    Crc32,
    Unknown(u16),
}

impl From<u16> for ChunkType {
    fn from(value: u16) -> Self {
        match value {
            CHUNK_TYPE_RAW => ChunkType::Raw,
            CHUNK_TYPE_FILL => ChunkType::Fill,
            CHUNK_TYPE_DONT_CARE => ChunkType::DontCare,
            CHUNK_TYPE_CRC32 => ChunkType::Crc32,
            other => ChunkType::Unknown(other),
        }
    }
}

impl From<ChunkType> for u16 {
    fn from(value: ChunkType) -> Self {
        match value {
            ChunkType::Raw => CHUNK_TYPE_RAW,
            ChunkType::Fill => CHUNK_TYPE_FILL,
            ChunkType::DontCare => CHUNK_TYPE_DONT_CARE,
            ChunkType::Crc32 => CHUNK_TYPE_CRC32,
            ChunkType::Unknown(other) => other,
        }
    }
}

/// Sparse image file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub file_header_size: u16,
    pub chunk_header_size: u16,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    /// Informational only, never verified.
    pub image_checksum: u32,
}

impl SparseHeader {
    pub const SIZE: usize = 28;

    pub fn is_sparse(image: &[u8]) -> bool {
        image.len() >= 4 && le_u32(image, 0) == SPARSE_HEADER_MAGIC
    }

    pub fn parse(image: &[u8]) -> Result<Self> {
        if !Self::is_sparse(image) {
            return Err(Error::UnsupportedFormat("missing sparse magic".to_string()));
        }
        if image.len() < Self::SIZE {
            return Err(Error::UnsupportedFormat(format!(
                "sparse header truncated at {} bytes",
                image.len()
            )));
        }

        let header = SparseHeader {
            major_version: le_u16(image, 4),
            minor_version: le_u16(image, 6),
            file_header_size: le_u16(image, 8),
            chunk_header_size: le_u16(image, 10),
            block_size: le_u32(image, 12),
            total_blocks: le_u32(image, 16),
            total_chunks: le_u32(image, 20),
            image_checksum: le_u32(image, 24),
        };

        if header.major_version != SPARSE_MAJOR_VERSION {
            return Err(Error::UnsupportedFormat(format!(
                "sparse major version {} (only {} is supported)",
                header.major_version, SPARSE_MAJOR_VERSION
            )));
        }
        if (header.file_header_size as usize) < Self::SIZE {
            return Err(Error::UnsupportedFormat(format!(
                "file header size {} < {}",
                header.file_header_size,
                Self::SIZE
            )));
        }
        if (header.chunk_header_size as usize) < ChunkHeader::SIZE {
            return Err(Error::UnsupportedFormat(format!(
                "chunk header size {} < {}",
                header.chunk_header_size,
                ChunkHeader::SIZE
            )));
        }
        if header.block_size == 0 || header.block_size % 4 != 0 {
            return Err(Error::UnsupportedFormat(format!(
                "block size {} is not a non-zero multiple of 4",
                header.block_size
            )));
        }

        Ok(header)
    }

    /// Bytes the image covers once expanded.
    pub fn expanded_size(&self) -> u64 {
        self.total_blocks as u64 * self.block_size as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: ChunkType,
    /// Target blocks covered by the chunk.
    pub chunk_size: u32,
    /// Container bytes, header included.
    pub total_size: u32,
}

impl ChunkHeader {
    pub const SIZE: usize = 12;

    pub fn parse(raw: &[u8]) -> Self {
        Self {
            chunk_type: ChunkType::from(le_u16(raw, 0)),
            chunk_size: le_u32(raw, 4),
            total_size: le_u32(raw, 8),
        }
    }

    /// Bytes of the target partition the chunk spans.
    pub fn output_len(&self, block_size: u32) -> u64 {
        self.chunk_size as u64 * block_size as u64
    }
}

#[derive(Debug, Clone)]
pub struct Chunk<'a> {
    pub header: ChunkHeader,
    pub payload: &'a [u8],
}

/// A parsed sparse container borrowing the image buffer.
#[derive(Debug, Clone)]
pub struct SparseImage<'a> {
    pub header: SparseHeader,
    data: &'a [u8],
}

impl<'a> SparseImage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = SparseHeader::parse(data)?;
        Ok(Self { header, data })
    }

    pub fn chunks(&self) -> Chunks<'a> {
        Chunks {
            data: self.data,
            header: self.header.clone(),
            cursor: self.header.file_header_size as usize,
            index: 0,
            failed: false,
        }
    }
}

/// Walks the chunk headers in container order. Stops after the first error.
pub struct Chunks<'a> {
    data: &'a [u8],
    header: SparseHeader,
    cursor: usize,
    index: u32,
    failed: bool,
}

impl<'a> Chunks<'a> {
    fn next_chunk(&mut self) -> Result<Chunk<'a>> {
        let index = self.index;
        let header_size = self.header.chunk_header_size as usize;

        let header_end = self
            .cursor
            .checked_add(header_size)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::UnsupportedFormat(format!("chunk #{} header is truncated", index))
            })?;
        let header = ChunkHeader::parse(&self.data[self.cursor..header_end]);

        let payload_len = match header.chunk_type {
            ChunkType::Raw => usize::try_from(header.output_len(self.header.block_size))
                .map_err(|_| {
                    Error::UnsupportedFormat(format!("chunk #{} is too large", index))
                })?,
            ChunkType::Fill => 4,
            ChunkType::DontCare => 0,
            ChunkType::Crc32 | ChunkType::Unknown(_) => {
                (header.total_size as usize).checked_sub(header_size).ok_or_else(|| {
                    Error::UnsupportedFormat(format!(
                        "chunk #{} total size {} is smaller than its header",
                        index, header.total_size
                    ))
                })?
            }
        };

        let payload_end = header_end
            .checked_add(payload_len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::UnsupportedFormat(format!("chunk #{} payload is truncated", index))
            })?;

        let payload = &self.data[header_end..payload_end];
        self.cursor = payload_end;
        self.index += 1;
        Ok(Chunk { header, payload })
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Result<Chunk<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.index >= self.header.total_chunks {
            return None;
        }
        let chunk = self.next_chunk();
        self.failed = chunk.is_err();
        Some(chunk)
    }
}

/// Writes `image` to partition `name`, expanding it when it is a sparse image
/// and writing it verbatim at offset 0 otherwise.
///
/// A failure leaves the chunks written before it in place.
pub async fn flash(
    io: &mut PartitionIo<'_>,
    name: &str,
    image: &[u8],
    config: &FlashConfig,
    progress: &mut (dyn FnMut(usize, usize) + Send),
) -> Result<()> {
    let partition_size = io.partition_size(name)?;

    if !SparseHeader::is_sparse(image) {
        info!("Flashing raw image of {:#X} bytes to {}", image.len(), name);
        io.write(name, 0, image).await?;
        progress(image.len(), image.len());
        return Ok(());
    }

    let sparse = SparseImage::parse(image)?;
    let header = &sparse.header;
    let total = header.expanded_size();
    info!(
        "Flashing sparse image to {}: {} chunks, {:#X} bytes expanded",
        name, header.total_chunks, total
    );
    if total > partition_size {
        return Err(Error::VolumeFull {
            offset: 0,
            len: total,
            size: partition_size,
        });
    }

    let fill_len = (config.fill_buffer_size as u64).min(total).max(4) as usize & !3;
    let mut fill = alloc_buffer(fill_len)?;

    let total_blocks = header.total_blocks as u64;
    let mut blocks: u64 = 0;
    let mut offset: u64 = 0;
    for (index, chunk) in sparse.chunks().enumerate() {
        let chunk = chunk?;
        let len = chunk.header.output_len(header.block_size);

        let advances = match chunk.header.chunk_type {
            ChunkType::Raw | ChunkType::Fill | ChunkType::DontCare => true,
            ChunkType::Crc32 => config.crc32_policy == Crc32ChunkPolicy::Advance,
            ChunkType::Unknown(_) => false,
        };
        // Offsets stay below total_blocks * block_size, which fits the partition.
        if advances {
            blocks = blocks
                .checked_add(chunk.header.chunk_size as u64)
                .filter(|&b| b <= total_blocks)
                .ok_or_else(|| {
                    Error::UnsupportedFormat(format!(
                        "chunk #{} runs past the {} blocks the image declares",
                        index, total_blocks
                    ))
                })?;
        }

        match chunk.header.chunk_type {
            ChunkType::Raw => {
                debug!("Chunk #{}: RAW {:#X} bytes at {:#X}", index, len, offset);
                if !chunk.payload.is_empty() {
                    io.write(name, offset, chunk.payload).await?;
                }
                offset += len;
            }
            ChunkType::Fill => {
                debug!("Chunk #{}: FILL {:#X} bytes at {:#X}", index, len, offset);
                for word in fill.chunks_exact_mut(4) {
                    word.copy_from_slice(chunk.payload);
                }
                let mut left = len;
                while left > 0 {
                    let n = left.min(fill.len() as u64) as usize;
                    io.write(name, offset, &fill[..n]).await?;
                    offset += n as u64;
                    left -= n as u64;
                }
            }
            ChunkType::DontCare => {
                debug!("Chunk #{}: DONT_CARE {:#X} bytes at {:#X}", index, len, offset);
                offset += len;
            }
            ChunkType::Crc32 => {
                debug!("Chunk #{}: CRC32, skipping", index);
                if advances {
                    offset += len;
                }
            }
            ChunkType::Unknown(kind) => {
                warn!("Chunk #{}: unknown type {:#06X}, skipping", index, kind);
            }
        }

        progress(offset.min(total) as usize, total as usize);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, MemoryBlockDevice};
    use crate::disk::gpt::read_partition_table;
    use crate::disk::table::PartitionTable;
    use crate::disk::testutil::{gpt_disk, test_entries};

    const BOOT_START: usize = 40 * 512;

    /// Builds sparse containers chunk by chunk.
    struct SparseBuilder {
        block_size: u32,
        major: u16,
        chunks: Vec<u8>,
        count: u32,
        blocks: u32,
    }

    impl SparseBuilder {
        fn new(block_size: u32) -> Self {
            Self {
                block_size,
                major: 1,
                chunks: Vec::new(),
                count: 0,
                blocks: 0,
            }
        }

        fn chunk(mut self, kind: u16, blocks: u32, payload: &[u8]) -> Self {
            self.chunks.extend_from_slice(&kind.to_le_bytes());
            self.chunks.extend_from_slice(&0u16.to_le_bytes());
            self.chunks.extend_from_slice(&blocks.to_le_bytes());
            self.chunks
                .extend_from_slice(&(12 + payload.len() as u32).to_le_bytes());
            self.chunks.extend_from_slice(payload);
            self.count += 1;
            self.blocks = self.blocks.wrapping_add(blocks);
            self
        }

        fn raw(self, data: &[u8]) -> Self {
            let blocks = data.len() as u32 / self.block_size;
            self.chunk(CHUNK_TYPE_RAW, blocks, data)
        }

        fn fill(self, pattern: u32, blocks: u32) -> Self {
            self.chunk(CHUNK_TYPE_FILL, blocks, &pattern.to_le_bytes())
        }

        fn dont_care(self, blocks: u32) -> Self {
            self.chunk(CHUNK_TYPE_DONT_CARE, blocks, &[])
        }

        fn build(&self) -> Vec<u8> {
            let mut out = Vec::new();
            out.extend_from_slice(&SPARSE_HEADER_MAGIC.to_le_bytes());
            out.extend_from_slice(&self.major.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&28u16.to_le_bytes());
            out.extend_from_slice(&12u16.to_le_bytes());
            out.extend_from_slice(&self.block_size.to_le_bytes());
            out.extend_from_slice(&self.blocks.to_le_bytes());
            out.extend_from_slice(&self.count.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&self.chunks);
            out
        }
    }

    async fn setup(dev: &mut MemoryBlockDevice) -> PartitionTable {
        let gpt = read_partition_table(dev).await.unwrap();
        let parent = dev.device_path().clone();
        let handles = PartitionTable::synthesize_handles(&parent, &gpt);
        let table = PartitionTable::build(&parent, &handles, &gpt).unwrap();
        dev.data_mut()[BOOT_START..BOOT_START + 4096].fill(0x77);
        dev.clear_log();
        table
    }

    fn no_progress() -> impl FnMut(usize, usize) + Send {
        |_done: usize, _total: usize| {}
    }

    #[tokio::test]
    async fn expands_raw_fill_and_dont_care() {
        let mut dev = gpt_disk(&test_entries());
        let table = setup(&mut dev).await;
        let image = SparseBuilder::new(16)
            .raw(&[0xAA; 16])
            .fill(0xDEADBEEF, 4)
            .dont_care(2)
            .build();

        let mut io = PartitionIo::new(&mut dev, &table);
        flash(&mut io, "boot", &image, &FlashConfig::default(), &mut no_progress())
            .await
            .unwrap();

        let boot = &dev.data()[BOOT_START..BOOT_START + 4096];
        assert!(boot[..16].iter().all(|&b| b == 0xAA));
        for word in boot[16..80].chunks(4) {
            assert_eq!(word, [0xEF, 0xBE, 0xAD, 0xDE]);
        }
        assert!(boot[80..].iter().all(|&b| b == 0x77));
    }

    #[tokio::test]
    async fn raw_images_are_written_verbatim() {
        let mut dev = gpt_disk(&test_entries());
        let table = setup(&mut dev).await;
        let image: Vec<u8> = (0..100u8).collect();

        let mut io = PartitionIo::new(&mut dev, &table);
        flash(&mut io, "boot", &image, &FlashConfig::default(), &mut no_progress())
            .await
            .unwrap();

        assert_eq!(&dev.data()[BOOT_START..BOOT_START + 100], image.as_slice());
        let start = BOOT_START as u64;
        assert_eq!(dev.write_log(), &[start..start + 100]);
    }

    #[tokio::test]
    async fn other_major_versions_write_nothing() {
        let mut dev = gpt_disk(&test_entries());
        let table = setup(&mut dev).await;
        let mut builder = SparseBuilder::new(16).raw(&[0xAA; 16]);
        builder.major = 2;

        let mut io = PartitionIo::new(&mut dev, &table);
        let err = flash(&mut io, "boot", &builder.build(), &FlashConfig::default(), &mut no_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
        assert!(dev.write_log().is_empty());
    }

    #[tokio::test]
    async fn truncated_chunks_are_rejected_where_reached() {
        let mut dev = gpt_disk(&test_entries());
        let table = setup(&mut dev).await;
        let mut image = SparseBuilder::new(16).raw(&[0xAA; 16]).raw(&[0xBB; 32]).build();
        image.truncate(image.len() - 8);

        let mut io = PartitionIo::new(&mut dev, &table);
        let err = flash(&mut io, "boot", &image, &FlashConfig::default(), &mut no_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
        let start = BOOT_START as u64;
        assert_eq!(dev.write_log(), &[start..start + 16]);
    }

    #[tokio::test]
    async fn crc32_chunks_follow_policy() {
        let image = SparseBuilder::new(16)
            .chunk(CHUNK_TYPE_CRC32, 1, &0x1234_5678u32.to_le_bytes())
            .raw(&[0xAA; 16])
            .build();

        for (policy, raw_at) in [(Crc32ChunkPolicy::Inert, 0), (Crc32ChunkPolicy::Advance, 16)] {
            let mut dev = gpt_disk(&test_entries());
            let table = setup(&mut dev).await;
            let config = FlashConfig::default().with_crc32_policy(policy);

            let mut io = PartitionIo::new(&mut dev, &table);
            flash(&mut io, "boot", &image, &config, &mut no_progress())
                .await
                .unwrap();

            let start = (BOOT_START + raw_at) as u64;
            assert_eq!(dev.write_log(), &[start..start + 16], "{:?}", policy);
        }
    }

    #[tokio::test]
    async fn unknown_chunks_never_advance() {
        let mut dev = gpt_disk(&test_entries());
        let table = setup(&mut dev).await;
        let image = SparseBuilder::new(16)
            .chunk(0xCAFF, 3, &[1, 2, 3, 4, 5, 6, 7, 8])
            .raw(&[0xAA; 16])
            .build();

        let mut io = PartitionIo::new(&mut dev, &table);
        flash(&mut io, "boot", &image, &FlashConfig::default(), &mut no_progress())
            .await
            .unwrap();
        let start = BOOT_START as u64;
        assert_eq!(dev.write_log(), &[start..start + 16]);
    }

    #[tokio::test]
    async fn fill_is_split_by_buffer_cap() {
        let mut dev = gpt_disk(&test_entries());
        let table = setup(&mut dev).await;
        let image = SparseBuilder::new(16).fill(0x0102_0304, 4).build();
        let config = FlashConfig::default().with_fill_buffer_size(16);

        let mut seen = Vec::new();
        let mut progress = |done: usize, total: usize| seen.push((done, total));
        let mut io = PartitionIo::new(&mut dev, &table);
        flash(&mut io, "boot", &image, &config, &mut progress)
            .await
            .unwrap();

        let start = BOOT_START as u64;
        let expected: Vec<_> = (0..4).map(|i| start + i * 16..start + i * 16 + 16).collect();
        assert_eq!(dev.write_log(), expected.as_slice());
        assert_eq!(dev.flush_count(), 4);
        assert_eq!(seen, vec![(64, 64)]);
    }

    #[tokio::test]
    async fn failure_keeps_earlier_chunks() {
        let dev = gpt_disk(&test_entries());
        let mut dev = dev.fail_writes_after(1);
        let table = setup(&mut dev).await;
        let image = SparseBuilder::new(16).raw(&[0xAA; 16]).raw(&[0xBB; 16]).build();

        let mut io = PartitionIo::new(&mut dev, &table);
        let err = flash(&mut io, "boot", &image, &FlashConfig::default(), &mut no_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Device(_)));
        assert!(dev.data()[BOOT_START..BOOT_START + 16].iter().all(|&b| b == 0xAA));
        assert!(dev.data()[BOOT_START + 16..BOOT_START + 32].iter().all(|&b| b == 0x77));
    }

    #[tokio::test]
    async fn oversized_images_are_refused_up_front() {
        let mut dev = gpt_disk(&test_entries());
        let table = setup(&mut dev).await;
        let image = SparseBuilder::new(512).dont_care(9).build();

        let mut io = PartitionIo::new(&mut dev, &table);
        let err = flash(&mut io, "boot", &image, &FlashConfig::default(), &mut no_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VolumeFull { len: 4608, size: 4096, .. }));
    }

    #[tokio::test]
    async fn chunks_past_declared_blocks_are_refused() {
        let mut dev = gpt_disk(&test_entries());
        let table = setup(&mut dev).await;
        let mut builder = SparseBuilder::new(0xFFFF_FFFC)
            .dont_care(0xFFFF_FFFF)
            .dont_care(0xFFFF_FFFF)
            .dont_care(8);
        builder.blocks = 0;

        let mut io = PartitionIo::new(&mut dev, &table);
        let err = flash(&mut io, "boot", &builder.build(), &FlashConfig::default(), &mut no_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
        assert!(dev.write_log().is_empty());
    }

    #[tokio::test]
    async fn overrunning_chunk_is_refused_before_it_writes() {
        let mut dev = gpt_disk(&test_entries());
        let table = setup(&mut dev).await;
        let mut builder = SparseBuilder::new(16).raw(&[0xAA; 16]).raw(&[0xBB; 16]);
        builder.blocks = 1;

        let mut io = PartitionIo::new(&mut dev, &table);
        let err = flash(&mut io, "boot", &builder.build(), &FlashConfig::default(), &mut no_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
        let start = BOOT_START as u64;
        assert_eq!(dev.write_log(), &[start..start + 16]);
        assert!(dev.data()[BOOT_START + 16..BOOT_START + 32].iter().all(|&b| b == 0x77));
    }

    #[test]
    fn header_validation() {
        let image = SparseBuilder::new(16).dont_care(1).build();
        let header = SparseHeader::parse(&image).unwrap();
        assert_eq!(header.expanded_size(), 16);
        assert_eq!(header.total_chunks, 1);

        let mut bad = image.clone();
        bad[12..16].copy_from_slice(&6u32.to_le_bytes());
        assert!(matches!(SparseHeader::parse(&bad), Err(Error::UnsupportedFormat(_))));

        let mut bad = image.clone();
        bad[10..12].copy_from_slice(&8u16.to_le_bytes());
        assert!(matches!(SparseHeader::parse(&bad), Err(Error::UnsupportedFormat(_))));

        assert!(!SparseHeader::is_sparse(&image[..3]));
        assert!(matches!(SparseHeader::parse(&image[..20]), Err(Error::UnsupportedFormat(_))));
    }

    #[test]
    fn chunk_iterator_reports_types() {
        let image = SparseBuilder::new(16)
            .raw(&[1; 32])
            .fill(7, 1)
            .dont_care(3)
            .build();
        let sparse = SparseImage::parse(&image).unwrap();
        let kinds: Vec<(ChunkType, usize)> = sparse
            .chunks()
            .map(|c| c.map(|c| (c.header.chunk_type, c.payload.len())))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            kinds,
            vec![(ChunkType::Raw, 32), (ChunkType::Fill, 4), (ChunkType::DontCare, 0)]
        );
        assert_eq!(u16::from(ChunkType::Crc32), 0xCAC4);
    }
}
