//! In-memory sections: the unit the scanner produces and the writer consumes.

use serde::Serialize;

use crate::block::{FLAG_NOT_MAIN_FLASH, PAYLOAD_SIZE};
use crate::family::Family;

/// One address/bytes pair inside a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub address: u32,
    pub bytes:   Vec<u8>,
}

impl Range {
    pub fn new(address: u32, bytes: Vec<u8>) -> Self {
        Self { address, bytes }
    }

    #[inline]
    fn block_count(&self) -> usize {
        self.bytes.len().div_ceil(PAYLOAD_SIZE)
    }
}

/// Section contents: one contiguous range, or several disjoint ones that
/// share a single block numbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionData {
    SingleRange { address: u32, bytes: Vec<u8> },
    MultiRange { ranges: Vec<Range> },
}

impl SectionData {
    /// Sub-ranges in emission order.
    pub fn ranges(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        let (single, multi) = match self {
            SectionData::SingleRange { address, bytes } => (Some((*address, bytes.as_slice())), None),
            SectionData::MultiRange { ranges } => (None, Some(ranges.iter().map(|r| (r.address, r.bytes.as_slice())))),
        };
        single.into_iter().chain(multi.into_iter().flatten())
    }

    pub fn byte_len(&self) -> usize {
        self.ranges().map(|(_, b)| b.len()).sum()
    }

    /// Blocks needed to carry the data: each sub-range is chunked on its own,
    /// so a short tail in one range never shares a block with the next.
    pub fn block_count(&self) -> usize {
        match self {
            SectionData::SingleRange { bytes, .. } => bytes.len().div_ceil(PAYLOAD_SIZE),
            SectionData::MultiRange { ranges } => ranges.iter().map(Range::block_count).sum(),
        }
    }

    pub fn start_address(&self) -> Option<u32> {
        self.ranges().next().map(|(addr, _)| addr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub family_tag: u32,
    pub flags:      u32,
    pub data:       SectionData,
}

impl Section {
    pub fn single(address: u32, bytes: Vec<u8>, family_tag: u32, flags: u32) -> Self {
        Self { family_tag, flags, data: SectionData::SingleRange { address, bytes } }
    }

    pub fn multi(ranges: Vec<Range>, family_tag: u32, flags: u32) -> Self {
        Self { family_tag, flags, data: SectionData::MultiRange { ranges } }
    }

    pub fn family(&self) -> Family {
        Family::from_tag(self.family_tag)
    }

    pub fn base_address(&self) -> Option<u32> {
        self.data.start_address()
    }

    /// Value written to every block's `block_total` field.
    ///
    /// Placeholder sections declare one block more than they carry; some
    /// bootloaders refuse the section otherwise.
    pub fn declared_total(&self) -> usize {
        let blocks = self.data.block_count();
        if self.family().is_placeholder() { blocks + 1 } else { blocks }
    }

    /// BLAKE3 over the concatenated sub-ranges.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for (_, bytes) in self.data.ranges() {
            hasher.update(bytes);
        }
        hasher.finalize().into()
    }

    pub fn summary(&self, index: usize) -> SectionSummary {
        let base = self.base_address().unwrap_or(0);
        let end = self.data.ranges()
            .map(|(addr, bytes)| addr as u64 + bytes.len() as u64)
            .max()
            .unwrap_or(base as u64);
        SectionSummary {
            index,
            base_address:   base,
            end_address:    end,
            family:         self.family().name().to_owned(),
            family_tag:     self.family_tag,
            flags:          self.flags,
            not_main_flash: self.flags & FLAG_NOT_MAIN_FLASH != 0,
            ranges:         self.data.ranges().count(),
            byte_len:       self.data.byte_len(),
            blocks:         self.declared_total(),
            digest:         hex::encode(self.digest()),
        }
    }
}

/// Serializable one-line description of a section, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SectionSummary {
    pub index:          usize,
    pub base_address:   u32,
    pub end_address:    u64,
    pub family:         String,
    pub family_tag:     u32,
    pub flags:          u32,
    pub not_main_flash: bool,
    pub ranges:         usize,
    pub byte_len:       usize,
    pub blocks:         usize,
    pub digest:         String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{TAG_ABSOLUTE, TAG_RP2040};

    #[test]
    fn block_count_rounds_each_range() {
        let single = SectionData::SingleRange { address: 0, bytes: vec![0; 257] };
        assert_eq!(single.block_count(), 2);

        let multi = SectionData::MultiRange {
            ranges: vec![Range::new(0, vec![0; 100]), Range::new(0x1000, vec![0; 100])],
        };
        assert_eq!(multi.byte_len(), 200);
        assert_eq!(multi.block_count(), 2);
    }

    #[test]
    fn placeholder_declares_one_extra_block() {
        let fw = Section::single(0x1000_0000, vec![1; 512], TAG_RP2040, 0x2000);
        assert_eq!(fw.declared_total(), 2);
        let placeholder = Section::single(0x10ff_ff00, vec![0xEF; 256], TAG_ABSOLUTE, 0x2000);
        assert_eq!(placeholder.declared_total(), 2);
    }

    #[test]
    fn summary_spans_all_ranges() {
        let section = Section::multi(
            vec![Range::new(0x1000_0000, vec![1; 0x1000]), Range::new(0x1001_0000, vec![2; 0x1000])],
            TAG_RP2040,
            0x2000,
        );
        let summary = section.summary(3);
        assert_eq!(summary.index, 3);
        assert_eq!(summary.base_address, 0x1000_0000);
        assert_eq!(summary.end_address, 0x1001_1000);
        assert_eq!(summary.ranges, 2);
        assert_eq!(summary.blocks, 32);
        assert_eq!(summary.family, "rp2040");
        assert_eq!(summary.digest.len(), 64);
    }
}
