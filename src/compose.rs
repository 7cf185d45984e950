//! Region composer — places a filesystem image inside an existing container.
//!
//! The filesystem always lands *inside* a firmware section rather than in a
//! section of its own: several bootloaders accept only one flashable range per
//! family and silently drop a second one.
//!
//! # Policy
//!
//! For each section, in stream order:
//!
//! * Any block at exactly `fs_start` means a filesystem is already there.
//!   Unless `overwrite` is set this is a [`ComposeError::FilesystemCollision`].
//! * Sections whose family does not take a filesystem (the placeholder tag,
//!   unknown tags) are passed through untouched.
//! * Flashable sections keep their bytes below `fs_start`; anything at or
//!   above it (an older filesystem) is dropped. Then either
//!   - **padded**: the firmware is filled with `0xFF` up to `fs_start` and the
//!     filesystem appended, giving one contiguous range, or
//!   - **sparse**: the firmware is filled up to the next erase block and the
//!     filesystem emitted as a second range starting on the erase block that
//!     contains `fs_start`, left-filled with `0xFF` up to `fs_start`.
//!
//! Unaligned sparse ranges mis-flash on at least one target, so both range
//! boundaries in sparse mode sit on erase blocks.

use thiserror::Error;

use crate::bininfo::BinaryInfo;
use crate::block::{MagicCheck, FLAG_FAMILY_ID_PRESENT, PAYLOAD_SIZE};
use crate::family::Family;
use crate::scanner::{ScanError, ScanOptions, ScannedSection, SectionScanner};
use crate::section::{Range, Section};

/// Flash erase block size of the supported targets.
pub const ERASE_BLOCK_SIZE: usize = 4096;
/// MicroPython's littlefs offset on the Pico W.
pub const DEFAULT_FS_START: u32 = 0x1012_c000;
pub const DEFAULT_FS_SIZE:  usize = 848 * 1024;

const FILL: u8 = 0xFF;

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("Filesystem size {size} is not a multiple of the erase block size {block_size}")]
    SizeMismatch { size: usize, block_size: usize },
    #[error("Filesystem start {fs_start:#010x} is not aligned to {PAYLOAD_SIZE} bytes")]
    Misaligned { fs_start: u32 },
    #[error("Section {section} ({family}) already has data at {address:#010x}; refusing to overwrite an existing filesystem")]
    FilesystemCollision { section: usize, address: u32, family: Family },
    #[error("Section {section}: firmware reaches {address:#010x}, past the filesystem start {fs_start:#010x}")]
    FirmwareOverlap { section: usize, address: u32, fs_start: u32 },
    #[error("Section {section} starts at {base:#010x}, after the filesystem start {fs_start:#010x}")]
    FilesystemBelowSection { section: usize, base: u32, fs_start: u32 },
    #[error("Section {section}: block at {address:#010x} lies before the section base {base:#010x}")]
    BlockBeforeBase { section: usize, address: u32, base: u32 },
    #[error("No section in the image can hold a filesystem")]
    NoFlashableSection,
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),
}

/// Everything the composer needs to know, passed explicitly.
#[derive(Debug, Clone)]
pub struct ComposeOptions {
    pub fs_start:          u32,
    pub fs_size:           usize,
    pub erase_block_size:  usize,
    /// Emit firmware and filesystem as two erase-aligned ranges.
    pub sparse:            bool,
    /// Allow replacing a filesystem that is already in the image.
    pub overwrite:         bool,
    pub magic_check:       MagicCheck,
    /// Refuse to place the filesystem below the firmware's declared end.
    pub verify_binary_end: bool,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            fs_start:          DEFAULT_FS_START,
            fs_size:           DEFAULT_FS_SIZE,
            erase_block_size:  ERASE_BLOCK_SIZE,
            sparse:            false,
            overwrite:         false,
            magic_check:       MagicCheck::Strict,
            verify_binary_end: true,
        }
    }
}

impl ComposeOptions {
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions { magic_check: self.magic_check }
    }

    /// Check the configuration on its own, before any payload exists.
    pub fn validate(&self) -> Result<(), ComposeError> {
        check_fs_size(self.fs_size, self.erase_block_size)?;
        if self.fs_start as usize % PAYLOAD_SIZE != 0 {
            return Err(ComposeError::Misaligned { fs_start: self.fs_start });
        }
        Ok(())
    }
}

/// A filesystem size must be a whole, non-zero number of erase blocks.
pub fn check_fs_size(size: usize, block_size: usize) -> Result<(), ComposeError> {
    if size == 0 || block_size == 0 || size % block_size != 0 {
        return Err(ComposeError::SizeMismatch { size, block_size });
    }
    Ok(())
}

#[inline]
fn align_up(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

/// Merge `fs_data` into the sections of `container`, returning the new
/// section list in the original order.
pub fn compose(container: &[u8], fs_data: &[u8], opts: &ComposeOptions) -> Result<Vec<Section>, ComposeError> {
    check_fs_size(fs_data.len(), opts.erase_block_size)?;
    if opts.fs_start as usize % PAYLOAD_SIZE != 0 {
        return Err(ComposeError::Misaligned { fs_start: opts.fs_start });
    }

    let mut sections = Vec::new();
    let mut placed = 0usize;
    for scanned in SectionScanner::new(container, &opts.scan_options())? {
        let scanned = scanned?;
        check_collision(&scanned, opts)?;

        let family = Family::from_tag(scanned.family_tag);
        if !family.accepts_filesystem() {
            if !family.is_placeholder() {
                tracing::warn!(section = scanned.index, family = %family, "unknown family, passing section through");
            }
            tracing::debug!(section = scanned.index, family = %family, "pass-through section");
            sections.push(scanned.to_section());
            continue;
        }

        sections.push(attach_filesystem(&scanned, fs_data, opts)?);
        placed += 1;
    }

    if placed == 0 {
        return Err(ComposeError::NoFlashableSection);
    }
    tracing::info!(
        fs_start = %format!("{:#010x}", opts.fs_start),
        fs_len = fs_data.len(),
        sections = sections.len(),
        placed,
        sparse = opts.sparse,
        "filesystem composed into image"
    );
    Ok(sections)
}

fn check_collision(scanned: &ScannedSection<'_>, opts: &ComposeOptions) -> Result<(), ComposeError> {
    if opts.overwrite {
        return Ok(());
    }
    match scanned.blocks().find(|&(address, _)| address == opts.fs_start) {
        Some((address, _)) => Err(ComposeError::FilesystemCollision {
            section: scanned.index,
            address,
            family:  Family::from_tag(scanned.family_tag),
        }),
        None => Ok(()),
    }
}

/// Firmware bytes below `fs_start`, laid out by address from the section base.
fn firmware_bytes(scanned: &ScannedSection<'_>, fs_start: u32) -> Result<Vec<u8>, ComposeError> {
    let base = scanned.base_address;
    let mut firmware: Vec<u8> = Vec::new();
    for (address, payload) in scanned.blocks() {
        if address >= fs_start {
            continue;
        }
        if address < base {
            return Err(ComposeError::BlockBeforeBase { section: scanned.index, address, base });
        }
        let end = address as u64 + payload.len() as u64;
        if end > fs_start as u64 {
            return Err(ComposeError::FirmwareOverlap {
                section: scanned.index,
                address: (end - 1) as u32,
                fs_start,
            });
        }
        let off = (address - base) as usize;
        if firmware.len() < off + payload.len() {
            firmware.resize(off + payload.len(), FILL);
        }
        firmware[off..off + payload.len()].copy_from_slice(payload);
    }
    Ok(firmware)
}

/// Length of `firmware` up to the end of the last block holding anything
/// but fill. Fill left behind by an earlier append is not firmware.
fn firmware_extent(firmware: &[u8]) -> usize {
    firmware
        .iter()
        .rposition(|&b| b != FILL)
        .map_or(0, |last| align_up(last + 1, PAYLOAD_SIZE).min(firmware.len()))
}

fn attach_filesystem(scanned: &ScannedSection<'_>, fs_data: &[u8], opts: &ComposeOptions) -> Result<Section, ComposeError> {
    let base = scanned.base_address;
    if opts.fs_start < base {
        return Err(ComposeError::FilesystemBelowSection { section: scanned.index, base, fs_start: opts.fs_start });
    }
    let fs_offset = (opts.fs_start - base) as usize;
    let mut firmware = firmware_bytes(scanned, opts.fs_start)?;

    if opts.verify_binary_end {
        if let Some(end) = BinaryInfo::from_image(base, &firmware).and_then(|info| info.binary_end) {
            if end > opts.fs_start {
                return Err(ComposeError::FirmwareOverlap { section: scanned.index, address: end, fs_start: opts.fs_start });
            }
        }
    }

    let (tag, flags) = (scanned.family_tag, scanned.flags);
    if !opts.sparse {
        let firmware_len = firmware.len();
        firmware.resize(fs_offset, FILL);
        firmware.extend_from_slice(fs_data);
        tracing::debug!(section = scanned.index, firmware_len, pad = fs_offset - firmware_len, "padded filesystem append");
        return Ok(Section::single(base, firmware, tag, flags));
    }

    // Trailing fill (an earlier filesystem's lead-in, padding) is dropped so
    // it cannot pull the firmware into the filesystem's erase block.
    let firmware_len = firmware_extent(&firmware);
    firmware.truncate(firmware_len);
    let erase = opts.erase_block_size;
    let firmware_end = align_up(firmware_len, erase);
    let fs_aligned = fs_offset - fs_offset % erase;
    if firmware_end > fs_aligned {
        // Firmware and filesystem share an erase block: keep them contiguous.
        firmware.resize(fs_offset, FILL);
        firmware.extend_from_slice(fs_data);
        tracing::debug!(section = scanned.index, firmware_len, "sparse append collapsed into one range");
        return Ok(Section::single(base, firmware, tag, flags));
    }

    let lead = fs_offset - fs_aligned;
    let mut fs = Vec::with_capacity(lead + fs_data.len());
    fs.resize(lead, FILL);
    fs.extend_from_slice(fs_data);
    let fs_range = Range::new(base + fs_aligned as u32, fs);
    tracing::debug!(section = scanned.index, firmware_len, firmware_end, fs_aligned, lead, "sparse filesystem append");

    if firmware_len == 0 {
        return Ok(Section::single(fs_range.address, fs_range.bytes, tag, flags));
    }
    firmware.resize(firmware_end, FILL);
    Ok(Section::multi(vec![Range::new(base, firmware), fs_range], tag, flags))
}

/// A container holding only the filesystem, as one section at `fs_start`.
pub fn standalone(fs_data: &[u8], family: Family, opts: &ComposeOptions) -> Result<Section, ComposeError> {
    check_fs_size(fs_data.len(), opts.erase_block_size)?;
    if opts.fs_start as usize % PAYLOAD_SIZE != 0 {
        return Err(ComposeError::Misaligned { fs_start: opts.fs_start });
    }
    Ok(Section::single(opts.fs_start, fs_data.to_vec(), family.tag(), FLAG_FAMILY_ID_PRESENT))
}
