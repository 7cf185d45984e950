//! Section scanner — splits a flat block stream into sections.
//!
//! A section starts at every block whose `block_index` is 0 and runs until
//! the next such block or the end of input. The boundary is positional: the
//! `block_total` a header declares is reported but never used to decide
//! where a section stops.
//!
//! Scanning is lazy and single-pass over a fully buffered container. Each
//! [`ScannedSection`] borrows its own blocks, so its payload iterator never
//! runs into the next section.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::block::{decode_block, BlockError, BlockHeader, MagicCheck, BLOCK_SIZE, HEADER_SIZE, PAYLOAD_SIZE};
use crate::section::{Range, Section};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Container length {len} is not a multiple of {BLOCK_SIZE} bytes")]
    Truncated { len: usize },
    #[error("Block at offset {offset} has index {block_index} but no section has started")]
    OrphanBlock { offset: usize, block_index: u32 },
    #[error("Bad block at offset {offset}: {source}")]
    Block {
        offset: usize,
        #[source]
        source: BlockError,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    pub magic_check: MagicCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// The next block must open a section (`block_index == 0`).
    AtBoundary,
    /// Inside a section; a `block_index == 0` closes it.
    ScanningSection,
}

#[derive(Debug, Clone)]
struct SectionStart {
    offset: usize,
    header: BlockHeader,
    next_index: u32,
}

pub struct SectionScanner<'a> {
    buf:     &'a [u8],
    pos:     usize,
    index:   usize,
    state:   ScanState,
    current: Option<SectionStart>,
    check:   MagicCheck,
}

impl<'a> SectionScanner<'a> {
    pub fn new(buf: &'a [u8], opts: &ScanOptions) -> Result<Self, ScanError> {
        if buf.len() % BLOCK_SIZE != 0 {
            return Err(ScanError::Truncated { len: buf.len() });
        }
        Ok(Self {
            buf,
            pos:     0,
            index:   0,
            state:   ScanState::AtBoundary,
            current: None,
            check:   opts.magic_check,
        })
    }

    fn header_at(&self, offset: usize) -> Result<BlockHeader, ScanError> {
        decode_block(&self.buf[offset..offset + BLOCK_SIZE], self.check)
            .map(|(header, _)| header)
            .map_err(|source| ScanError::Block { offset, source })
    }

    fn finish(&mut self, start: SectionStart, end: usize) -> ScannedSection<'a> {
        let buf = self.buf;
        let section = ScannedSection {
            index:        self.index,
            base_address: start.header.target_address,
            family_tag:   start.header.family_tag,
            flags:        start.header.flags,
            block_total:  start.header.block_total,
            raw:          &buf[start.offset..end],
        };
        self.index += 1;
        section
    }

    fn fail(&mut self, err: ScanError) -> Option<Result<ScannedSection<'a>, ScanError>> {
        self.pos = self.buf.len();
        self.current = None;
        Some(Err(err))
    }
}

impl<'a> Iterator for SectionScanner<'a> {
    type Item = Result<ScannedSection<'a>, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pos >= self.buf.len() {
                let start = self.current.take()?;
                self.state = ScanState::AtBoundary;
                return Some(Ok(self.finish(start, self.buf.len())));
            }
            let header = match self.header_at(self.pos) {
                Ok(h) => h,
                Err(e) => return self.fail(e),
            };
            match (self.state, header.block_index) {
                (ScanState::AtBoundary, 0) => {
                    self.current = Some(SectionStart { offset: self.pos, header, next_index: 1 });
                    self.state = ScanState::ScanningSection;
                    self.pos += BLOCK_SIZE;
                }
                (ScanState::AtBoundary, block_index) => {
                    let offset = self.pos;
                    return self.fail(ScanError::OrphanBlock { offset, block_index });
                }
                (ScanState::ScanningSection, 0) => {
                    // Leave `pos` on the boundary block; the next call opens it.
                    self.state = ScanState::AtBoundary;
                    let start = self.current.take()?;
                    return Some(Ok(self.finish(start, self.pos)));
                }
                (ScanState::ScanningSection, block_index) => {
                    if let Some(start) = self.current.as_mut() {
                        if block_index != start.next_index {
                            tracing::warn!(
                                section = self.index,
                                offset = self.pos,
                                "block index {block_index} where {} was expected",
                                start.next_index
                            );
                        }
                        start.next_index = block_index.wrapping_add(1);
                    }
                    self.pos += BLOCK_SIZE;
                }
            }
        }
    }
}

/// One section as found in the stream. Borrows its blocks from the buffer.
#[derive(Debug, Clone)]
pub struct ScannedSection<'a> {
    pub index:        usize,
    pub base_address: u32,
    pub family_tag:   u32,
    pub flags:        u32,
    /// `block_total` as declared by the first block. Advisory only.
    pub block_total:  u32,
    raw:              &'a [u8],
}

impl<'a> ScannedSection<'a> {
    pub fn block_len(&self) -> usize {
        self.raw.len() / BLOCK_SIZE
    }

    /// `(address, payload)` pairs of this section only, in stream order.
    pub fn blocks(&self) -> SectionBlocks<'a> {
        SectionBlocks { chunks: self.raw.chunks_exact(BLOCK_SIZE) }
    }

    /// Collect the payloads into a [`Section`], merging blocks whose
    /// addresses follow on from each other into one range.
    pub fn to_section(&self) -> Section {
        let mut ranges: Vec<Range> = Vec::new();
        for (address, payload) in self.blocks() {
            match ranges.last_mut() {
                Some(last) if last.address as u64 + last.bytes.len() as u64 == address as u64 => {
                    last.bytes.extend_from_slice(payload);
                }
                _ => ranges.push(Range::new(address, payload.to_vec())),
            }
        }
        if ranges.len() == 1 {
            let Range { address, bytes } = ranges.remove(0);
            Section::single(address, bytes, self.family_tag, self.flags)
        } else {
            Section::multi(ranges, self.family_tag, self.flags)
        }
    }
}

pub struct SectionBlocks<'a> {
    chunks: std::slice::ChunksExact<'a, u8>,
}

impl<'a> Iterator for SectionBlocks<'a> {
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        // Headers were validated when the section was scanned.
        let block = self.chunks.next()?;
        let address = LittleEndian::read_u32(&block[12..16]);
        Some((address, &block[HEADER_SIZE..HEADER_SIZE + PAYLOAD_SIZE]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

/// Scan and materialize every section in `buf`.
pub fn scan_sections(buf: &[u8], opts: &ScanOptions) -> Result<Vec<Section>, ScanError> {
    SectionScanner::new(buf, opts)?
        .map(|s| s.map(|s| s.to_section()))
        .collect()
}
