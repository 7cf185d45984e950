//! UF2 block codec.
//!
//! Every block is exactly [`BLOCK_SIZE`] bytes, little-endian:
//!
//! | Offset | Size | Field            |
//! |--------|------|------------------|
//! | 0      | 4    | magic start 0    |
//! | 4      | 4    | magic start 1    |
//! | 8      | 4    | flags            |
//! | 12     | 4    | target address   |
//! | 16     | 4    | payload size     |
//! | 20     | 4    | block index      |
//! | 24     | 4    | block total      |
//! | 28     | 4    | family tag       |
//! | 32     | 256  | payload          |
//! | 288    | 220  | zero padding     |
//! | 508    | 4    | magic end        |

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

pub const BLOCK_SIZE:   usize = 512;
pub const HEADER_SIZE:  usize = 32;
pub const PAYLOAD_SIZE: usize = 256;
const FOOTER_SIZE:      usize = 4;
const PADDING_SIZE:     usize = BLOCK_SIZE - HEADER_SIZE - PAYLOAD_SIZE - FOOTER_SIZE;
const FOOTER_START:     usize = BLOCK_SIZE - FOOTER_SIZE;

pub const MAGIC_START0: u32 = 0x0A32_4655; // "UF2\n"
pub const MAGIC_START1: u32 = 0x9E5D_5157;
pub const MAGIC_END:    u32 = 0x0AB1_6F30;

pub const FLAG_NOT_MAIN_FLASH:      u32 = 0x0000_0001;
pub const FLAG_FAMILY_ID_PRESENT:   u32 = 0x0000_2000;

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Invalid block size: {len} bytes (blocks are exactly {BLOCK_SIZE} bytes)")]
    InvalidBlockSize { len: usize },
    #[error("Malformed block: {field} is {found:#010x}, expected {expected:#010x}")]
    MalformedBlock { field: &'static str, expected: u32, found: u32 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// How strictly [`decode_block`] treats the framing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MagicCheck {
    /// Reject any block whose magics, payload size or index are off.
    #[default]
    Strict,
    /// Accept whatever is there, as older tooling did. Anomalies are logged.
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub flags:          u32,
    pub target_address: u32,
    pub payload_size:   u32,
    pub block_index:    u32,
    pub block_total:    u32,
    pub family_tag:     u32,
}

impl BlockHeader {
    pub fn new(flags: u32, family_tag: u32, target_address: u32, block_index: u32, block_total: u32) -> Self {
        Self {
            flags,
            target_address,
            payload_size: PAYLOAD_SIZE as u32,
            block_index,
            block_total,
            family_tag,
        }
    }

    pub fn has_family(&self) -> bool {
        self.flags & FLAG_FAMILY_ID_PRESENT != 0
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(MAGIC_START0)?;
        writer.write_u32::<LittleEndian>(MAGIC_START1)?;
        writer.write_u32::<LittleEndian>(self.flags)?;
        writer.write_u32::<LittleEndian>(self.target_address)?;
        writer.write_u32::<LittleEndian>(self.payload_size)?;
        writer.write_u32::<LittleEndian>(self.block_index)?;
        writer.write_u32::<LittleEndian>(self.block_total)?;
        writer.write_u32::<LittleEndian>(self.family_tag)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R, check: MagicCheck) -> Result<Self, BlockError> {
        let start0 = reader.read_u32::<LittleEndian>()?;
        expect(check, "magic_start0", MAGIC_START0, start0)?;
        let start1 = reader.read_u32::<LittleEndian>()?;
        expect(check, "magic_start1", MAGIC_START1, start1)?;
        let header = Self {
            flags:          reader.read_u32::<LittleEndian>()?,
            target_address: reader.read_u32::<LittleEndian>()?,
            payload_size:   reader.read_u32::<LittleEndian>()?,
            block_index:    reader.read_u32::<LittleEndian>()?,
            block_total:    reader.read_u32::<LittleEndian>()?,
            family_tag:     reader.read_u32::<LittleEndian>()?,
        };
        expect(check, "payload_size", PAYLOAD_SIZE as u32, header.payload_size)?;
        if header.block_index >= header.block_total {
            reject(check, "block_index", header.block_total.saturating_sub(1), header.block_index)?;
        }
        Ok(header)
    }
}

/// `found` is already known bad; with a zero `block_total` it can equal
/// `expected`.
fn reject(check: MagicCheck, field: &'static str, expected: u32, found: u32) -> Result<(), BlockError> {
    match check {
        MagicCheck::Strict => Err(BlockError::MalformedBlock { field, expected, found }),
        MagicCheck::Lenient => {
            tracing::warn!("accepting malformed block: {field} is {found:#010x}, expected {expected:#010x}");
            Ok(())
        }
    }
}

fn expect(check: MagicCheck, field: &'static str, expected: u32, found: u32) -> Result<(), BlockError> {
    if expected == found {
        return Ok(());
    }
    reject(check, field, expected, found)
}

/// Encode one block. `payload` is zero-padded on the right to 256 bytes.
pub fn encode_block(header: &BlockHeader, payload: &[u8]) -> Result<Vec<u8>, BlockError> {
    let mut out = Vec::with_capacity(BLOCK_SIZE);
    header.write(&mut out)?;
    out.write_all(payload)?;
    if payload.len() < PAYLOAD_SIZE {
        out.resize(out.len() + PAYLOAD_SIZE - payload.len(), 0);
    }
    out.write_all(&[0u8; PADDING_SIZE])?;
    out.write_u32::<LittleEndian>(MAGIC_END)?;
    if out.len() != BLOCK_SIZE {
        return Err(BlockError::InvalidBlockSize { len: out.len() });
    }
    Ok(out)
}

/// Decode one block, returning its header and the 256-byte payload slice.
pub fn decode_block(bytes: &[u8], check: MagicCheck) -> Result<(BlockHeader, &[u8]), BlockError> {
    if bytes.len() != BLOCK_SIZE {
        return Err(BlockError::InvalidBlockSize { len: bytes.len() });
    }
    let header = BlockHeader::read(Cursor::new(&bytes[..HEADER_SIZE]), check)?;
    let end = Cursor::new(&bytes[FOOTER_START..]).read_u32::<LittleEndian>()?;
    expect(check, "magic_end", MAGIC_END, end)?;
    Ok((header, &bytes[HEADER_SIZE..HEADER_SIZE + PAYLOAD_SIZE]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader::new(FLAG_FAMILY_ID_PRESENT, 0xe48b_ff56, 0x1000_0100, 1, 3)
    }

    #[test]
    fn encoded_block_layout() {
        let block = encode_block(&sample_header(), &[0xAB; 10]).unwrap();
        assert_eq!(block.len(), BLOCK_SIZE);
        assert_eq!(&block[0..4], &MAGIC_START0.to_le_bytes());
        assert_eq!(&block[4..8], &MAGIC_START1.to_le_bytes());
        assert_eq!(&block[8..12], &FLAG_FAMILY_ID_PRESENT.to_le_bytes());
        assert_eq!(&block[12..16], &0x1000_0100u32.to_le_bytes());
        assert_eq!(&block[16..20], &256u32.to_le_bytes());
        assert_eq!(&block[20..24], &1u32.to_le_bytes());
        assert_eq!(&block[24..28], &3u32.to_le_bytes());
        assert_eq!(&block[28..32], &0xe48b_ff56u32.to_le_bytes());
        assert_eq!(&block[32..42], &[0xAB; 10]);
        assert!(block[42..508].iter().all(|&b| b == 0));
        assert_eq!(&block[508..512], &MAGIC_END.to_le_bytes());
    }

    #[test]
    fn decode_returns_header_and_payload() {
        let payload: Vec<u8> = (0..=255).collect();
        let block = encode_block(&sample_header(), &payload).unwrap();
        let (header, data) = decode_block(&block, MagicCheck::Strict).unwrap();
        assert_eq!(header, sample_header());
        assert!(header.has_family());
        assert_eq!(data, payload.as_slice());
    }

    #[test]
    fn oversized_payload_is_invalid_block_size() {
        let err = encode_block(&sample_header(), &[0u8; PAYLOAD_SIZE + 1]).unwrap_err();
        assert!(matches!(err, BlockError::InvalidBlockSize { len: 513 }));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = decode_block(&[0u8; 100], MagicCheck::Strict).unwrap_err();
        assert!(matches!(err, BlockError::InvalidBlockSize { len: 100 }));
    }

    #[test]
    fn strict_rejects_bad_magics() {
        let mut block = encode_block(&sample_header(), &[]).unwrap();
        block[4] ^= 0xFF;
        let err = decode_block(&block, MagicCheck::Strict).unwrap_err();
        assert!(matches!(err, BlockError::MalformedBlock { field: "magic_start1", .. }));

        let mut block = encode_block(&sample_header(), &[]).unwrap();
        block[511] = 0;
        let err = decode_block(&block, MagicCheck::Strict).unwrap_err();
        assert!(matches!(err, BlockError::MalformedBlock { field: "magic_end", .. }));
    }

    #[test]
    fn lenient_accepts_bad_magics() {
        let mut block = encode_block(&sample_header(), &[7u8; 256]).unwrap();
        block[0..4].copy_from_slice(&[0; 4]);
        block[508..512].copy_from_slice(&[0; 4]);
        let (header, data) = decode_block(&block, MagicCheck::Lenient).unwrap();
        assert_eq!(header.target_address, 0x1000_0100);
        assert_eq!(data, &[7u8; 256][..]);
    }

    #[test]
    fn strict_rejects_index_past_total() {
        let header = BlockHeader::new(0, 0, 0x1000_0000, 4, 4);
        let block = encode_block(&header, &[]).unwrap();
        let err = decode_block(&block, MagicCheck::Strict).unwrap_err();
        assert!(matches!(err, BlockError::MalformedBlock { field: "block_index", found: 4, .. }));

        let empty = BlockHeader::new(0, 0, 0x1000_0000, 0, 0);
        let block = encode_block(&empty, &[]).unwrap();
        let err = decode_block(&block, MagicCheck::Strict).unwrap_err();
        assert!(matches!(err, BlockError::MalformedBlock { field: "block_index", found: 0, .. }));
        assert!(decode_block(&block, MagicCheck::Lenient).is_ok());
    }
}
