//! Section writer — turns an ordered list of sections into a flat block stream.
//!
//! Block numbering is per section and global across all of a section's
//! sub-ranges: the first block of the first range is index 0 and the last
//! block of the last range is `block_total - 1` (placeholder sections aside,
//! see [`Section::declared_total`]). Short tails are zero-padded to 256 bytes.

use std::io::{self, Write};
use thiserror::Error;

use crate::block::{encode_block, BlockError, BlockHeader, PAYLOAD_SIZE};
use crate::section::Section;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Section {section} has no data to write")]
    EmptySection { section: usize },
    #[error("Section {section}: {len} bytes at {address:#010x} run past the 32-bit address space")]
    AddressOverflow { section: usize, address: u32, len: usize },
    #[error("Section {section} needs {blocks} blocks, more than a block index can count")]
    TooManyBlocks { section: usize, blocks: usize },
    #[error("Block encoding failed: {0}")]
    Block(#[from] BlockError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub struct Uf2Writer<W: Write> {
    writer:            W,
    sections_written:  usize,
    pub blocks_written: usize,
}

impl<W: Write> Uf2Writer<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, sections_written: 0, blocks_written: 0 }
    }

    /// Emit every block of `section`. Returns the number of blocks written.
    pub fn write_section(&mut self, section: &Section) -> Result<usize, WriteError> {
        let index = self.sections_written;
        if section.data.byte_len() == 0 {
            return Err(WriteError::EmptySection { section: index });
        }
        for (address, bytes) in section.data.ranges() {
            if address as u64 + bytes.len() as u64 > u32::MAX as u64 + 1 {
                return Err(WriteError::AddressOverflow { section: index, address, len: bytes.len() });
            }
        }
        let declared = section.declared_total();
        let block_total = u32::try_from(declared)
            .map_err(|_| WriteError::TooManyBlocks { section: index, blocks: declared })?;

        let mut block_index: u32 = 0;
        for (address, bytes) in section.data.ranges() {
            for (i, chunk) in bytes.chunks(PAYLOAD_SIZE).enumerate() {
                let target = address + (i * PAYLOAD_SIZE) as u32;
                let header = BlockHeader::new(section.flags, section.family_tag, target, block_index, block_total);
                self.writer.write_all(&encode_block(&header, chunk)?)?;
                block_index += 1;
            }
        }

        tracing::debug!(
            section = index,
            family = %section.family(),
            blocks = block_index,
            block_total,
            "wrote section"
        );
        self.sections_written += 1;
        self.blocks_written += block_index as usize;
        Ok(block_index as usize)
    }

    pub fn write_all(&mut self, sections: &[Section]) -> Result<usize, WriteError> {
        let mut blocks = 0;
        for section in sections {
            blocks += self.write_section(section)?;
        }
        Ok(blocks)
    }

    pub fn into_inner(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Serialize `sections` into an in-memory container.
pub fn write_sections(sections: &[Section]) -> Result<Vec<u8>, WriteError> {
    let mut writer = Uf2Writer::new(Vec::new());
    writer.write_all(sections)?;
    Ok(writer.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{decode_block, MagicCheck, BLOCK_SIZE};
    use crate::family::{TAG_ABSOLUTE, TAG_RP2040};
    use crate::section::Range;

    fn headers(buf: &[u8]) -> Vec<BlockHeader> {
        buf.chunks(BLOCK_SIZE)
            .map(|b| decode_block(b, MagicCheck::Strict).unwrap().0)
            .collect()
    }

    #[test]
    fn short_tail_is_zero_padded() {
        let section = Section::single(0x1000_0000, vec![0x11; 300], TAG_RP2040, 0x2000);
        let out = write_sections(&[section]).unwrap();
        assert_eq!(out.len(), 2 * BLOCK_SIZE);
        let (_, tail) = decode_block(&out[BLOCK_SIZE..], MagicCheck::Strict).unwrap();
        assert!(tail[..44].iter().all(|&b| b == 0x11));
        assert!(tail[44..].iter().all(|&b| b == 0));
    }

    #[test]
    fn indices_are_global_across_ranges() {
        let section = Section::multi(
            vec![Range::new(0x1000_0000, vec![1; 512]), Range::new(0x1010_0000, vec![2; 256])],
            TAG_RP2040,
            0x2000,
        );
        let out = write_sections(&[section]).unwrap();
        let hs = headers(&out);
        let idx: Vec<(u32, u32, u32)> = hs.iter().map(|h| (h.target_address, h.block_index, h.block_total)).collect();
        assert_eq!(idx, vec![
            (0x1000_0000, 0, 3),
            (0x1000_0100, 1, 3),
            (0x1010_0000, 2, 3),
        ]);
    }

    #[test]
    fn placeholder_total_exceeds_real_blocks() {
        let section = Section::single(0x10ff_ff00, vec![0xEF; 256], TAG_ABSOLUTE, 0x2000);
        let out = write_sections(&[section]).unwrap();
        let hs = headers(&out);
        assert_eq!(hs.len(), 1);
        assert_eq!(hs[0].block_index, 0);
        assert_eq!(hs[0].block_total, 2);
    }

    #[test]
    fn numbering_restarts_per_section() {
        let a = Section::single(0x1000_0000, vec![0; 512], TAG_RP2040, 0x2000);
        let b = Section::single(0x2000_0000, vec![0; 256], TAG_RP2040, 0x2000);
        let mut writer = Uf2Writer::new(Vec::new());
        assert_eq!(writer.write_all(&[a, b]).unwrap(), 3);
        assert_eq!(writer.blocks_written, 3);
        let hs = headers(&writer.into_inner().unwrap());
        assert_eq!(hs.iter().map(|h| h.block_index).collect::<Vec<_>>(), vec![0, 1, 0]);
    }

    #[test]
    fn empty_section_is_rejected() {
        let section = Section::single(0x1000_0000, Vec::new(), TAG_RP2040, 0x2000);
        assert!(matches!(write_sections(&[section]), Err(WriteError::EmptySection { section: 0 })));
    }

    #[test]
    fn address_overflow_is_rejected() {
        let section = Section::single(0xFFFF_FF00, vec![0; 512], TAG_RP2040, 0x2000);
        assert!(matches!(write_sections(&[section]), Err(WriteError::AddressOverflow { .. })));
    }
}
