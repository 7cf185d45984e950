//! Firmware binary-info reader.
//!
//! RP2040/RP2350 SDK builds embed a small table describing the program: its
//! name and version, where the binary ends, and any flash block devices the
//! firmware expects (e.g. the filesystem region). The table is found via a
//! marker block somewhere in the image:
//!
//! ```text
//! 0x7188ebf2, entries_start, entries_end, mapping_table, 0xe71aa390
//! ```
//!
//! `entries_start..entries_end` is an array of pointers to entries. Each entry
//! begins with a `u16` type and a two-character tag; only `RP` and `MP`
//! entries are read. `mapping_table` lists `{source, dest_start, dest_end}`
//! triples (terminated by a zero source) for data the runtime copies to RAM,
//! which lets RAM addresses be resolved back to flash.
//!
//! Besides the id/value entries, pin declarations are collected per GPIO and
//! named groups pick up the untyped entries that carry their id.
//!
//! Metadata is advisory: anything that cannot be resolved is skipped, never
//! reported as an error.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::section::Section;

pub const MARKER_START: u32 = 0x7188_ebf2;
pub const MARKER_END:   u32 = 0xe71a_a390;

const TYPE_ID_AND_INT:    u16 = 5;
const TYPE_ID_AND_STRING: u16 = 6;
const TYPE_BLOCK_DEVICE:  u16 = 7;
const TYPE_PINS_WITH_FUNC: u16 = 8;
const TYPE_PINS_WITH_NAME: u16 = 9;
const TYPE_NAMED_GROUP:    u16 = 10;

const ID_PROGRAM_NAME:            u32 = 0x0203_1c86;
const ID_PROGRAM_VERSION_STRING:  u32 = 0x11a9_bc3a;
const ID_PROGRAM_BUILD_DATE:      u32 = 0x9da2_2254;
const ID_BINARY_END:              u32 = 0x68f4_65de;
const ID_PROGRAM_URL:             u32 = 0x1856_239a;
const ID_PROGRAM_DESCRIPTION:     u32 = 0xb6a0_7c19;
const ID_PROGRAM_FEATURE:         u32 = 0xa1f4_b453;
const ID_PROGRAM_BUILD_ATTRIBUTE: u32 = 0x4275_f0d3;
const ID_SDK_VERSION:             u32 = 0x5360_b3ab;
const ID_PICO_BOARD:              u32 = 0xb63c_ffbb;
const ID_BOOT2_NAME:              u32 = 0x7f88_82e1;

const MAX_STRING_LEN: usize = 1024;
const MAX_ENTRIES:    usize = 4096;
const MAX_MAPPINGS:   usize = 64;

/// GPIO function selectors, indexed by their 4-bit encoding.
const GPIO_FUNCS: [Option<&str>; 16] = [
    Some("XIP"), Some("SPI"), Some("UART"), Some("I2C"),
    Some("PWM"), Some("SIO"), Some("PIO0"), Some("PIO1"),
    Some("GPCK"), Some("USB"), None, None,
    None, None, None, Some("NULL"),
];

const PIN_ENCODING_LIST:  u32 = 0b001;
const PIN_ENCODING_RANGE: u32 = 0b010;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    pub name:    String,
    pub address: u32,
    pub size:    u32,
    pub flags:   u16,
}

impl BlockDevice {
    pub fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }
}

/// What the firmware declares about one GPIO pin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Pin {
    pub function: Option<&'static str>,
    pub name:     Option<String>,
}

/// A group of entries declared under a common id. Entries whose id matches
/// the group's are moved into `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedGroup {
    pub label:  String,
    pub parent: u32,
    pub flags:  u16,
    pub tag:    u16,
    pub id:     u32,
    pub data:   Vec<RawValue>,
}

/// An entry with an id this reader has no name for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RawValue {
    Int(u32),
    Str(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BinaryInfo {
    pub program_name:        Option<String>,
    pub program_version:     Option<String>,
    pub build_date:          Option<String>,
    pub program_url:         Option<String>,
    pub program_description: Option<String>,
    pub sdk_version:         Option<String>,
    pub pico_board:          Option<String>,
    pub boot2_name:          Option<String>,
    pub binary_end:          Option<u32>,
    pub features:            Vec<String>,
    pub build_attributes:    Vec<String>,
    pub block_devices:       Vec<BlockDevice>,
    pub pins:                BTreeMap<u8, Pin>,
    pub named_groups:        Vec<NamedGroup>,
    pub unknown:             Vec<(u32, RawValue)>,
}

impl BinaryInfo {
    /// Read the binary-info table out of a firmware section, if it has one.
    pub fn from_section(section: &Section) -> Option<Self> {
        Self::read(Memory::new(section.data.ranges().collect()))
    }

    /// Same as [`from_section`](Self::from_section) for one flat image at `base`.
    pub fn from_image(base: u32, bytes: &[u8]) -> Option<Self> {
        Self::read(Memory::new(vec![(base, bytes)]))
    }

    fn read(mem: Memory<'_>) -> Option<Self> {
        let header = mem.find_marker()?;
        Some(mem.with_mappings(header.mapping_table).parse(header))
    }

    /// Declared block devices that start inside the program image.
    pub fn overlapping_block_devices(&self) -> impl Iterator<Item = &BlockDevice> {
        let end = self.binary_end;
        self.block_devices.iter().filter(move |d| end.is_some_and(|end| d.address < end))
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    entries_start: u32,
    entries_end:   u32,
    mapping_table: u32,
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    source:     u32,
    dest_start: u32,
    dest_end:   u32,
}

/// Byte-addressed view over a section's sub-ranges.
struct Memory<'a> {
    ranges:   Vec<(u32, &'a [u8])>,
    mappings: Vec<Mapping>,
}

impl<'a> Memory<'a> {
    fn new(ranges: Vec<(u32, &'a [u8])>) -> Self {
        Self { ranges, mappings: Vec::new() }
    }

    fn with_mappings(mut self, table: u32) -> Self {
        let mut mappings = Vec::new();
        let mut addr = table;
        while mappings.len() < MAX_MAPPINGS {
            let Some(source) = self.u32_at(addr) else { break };
            if source == 0 {
                break;
            }
            let (Some(dest_start), Some(dest_end)) = (self.u32_at(addr.wrapping_add(4)), self.u32_at(addr.wrapping_add(8))) else {
                break;
            };
            mappings.push(Mapping { source, dest_start, dest_end });
            addr = addr.wrapping_add(12);
        }
        self.mappings = mappings;
        self
    }

    fn slice_at(&self, addr: u32, len: usize) -> Option<&'a [u8]> {
        let addr = self.resolve(addr);
        self.ranges.iter().find_map(|&(base, bytes)| {
            let off = addr.checked_sub(base)? as usize;
            bytes.get(off..off.checked_add(len)?)
        })
    }

    /// Translate a RAM address back to its flash source.
    fn resolve(&self, addr: u32) -> u32 {
        self.mappings
            .iter()
            .find(|m| (m.dest_start..m.dest_end).contains(&addr))
            .map(|m| m.source.wrapping_add(addr - m.dest_start))
            .unwrap_or(addr)
    }

    fn u16_at(&self, addr: u32) -> Option<u16> {
        self.slice_at(addr, 2).map(LittleEndian::read_u16)
    }

    fn u32_at(&self, addr: u32) -> Option<u32> {
        self.slice_at(addr, 4).map(LittleEndian::read_u32)
    }

    fn cstr_at(&self, addr: u32) -> Option<String> {
        let start = self.resolve(addr);
        let (base, bytes) = self.ranges.iter().copied().find(|&(base, bytes)| {
            start >= base && ((start - base) as usize) < bytes.len()
        })?;
        let tail = &bytes[(start - base) as usize..];
        let tail = &tail[..tail.len().min(MAX_STRING_LEN)];
        let len = tail.iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&tail[..len]).into_owned())
    }

    fn find_marker(&self) -> Option<Header> {
        let &(base, bytes) = self.ranges.first()?;
        let mut off = 0;
        while off + 20 <= bytes.len() {
            if LittleEndian::read_u32(&bytes[off..]) == MARKER_START
                && LittleEndian::read_u32(&bytes[off + 16..]) == MARKER_END
            {
                tracing::debug!(address = %format!("{:#010x}", base as usize + off), "found binary info marker");
                return Some(Header {
                    entries_start: LittleEndian::read_u32(&bytes[off + 4..]),
                    entries_end:   LittleEndian::read_u32(&bytes[off + 8..]),
                    mapping_table: LittleEndian::read_u32(&bytes[off + 12..]),
                });
            }
            off += 4;
        }
        None
    }

    fn parse(&self, header: Header) -> BinaryInfo {
        let mut info = BinaryInfo::default();
        let count = (header.entries_end.saturating_sub(header.entries_start) / 4) as usize;
        for i in 0..count.min(MAX_ENTRIES) {
            let Some(entry) = self.u32_at(header.entries_start.wrapping_add(i as u32 * 4)) else { continue };
            self.parse_entry(entry, &mut info);
        }
        for group in &mut info.named_groups {
            let (members, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut info.unknown)
                .into_iter()
                .partition(|(id, _)| *id == group.id);
            info.unknown = rest;
            group.data = members.into_iter().map(|(_, value)| value).collect();
        }
        info
    }

    fn parse_entry(&self, addr: u32, info: &mut BinaryInfo) {
        let (Some(kind), Some(tag)) = (self.u16_at(addr), self.slice_at(addr.wrapping_add(2), 2)) else { return };
        if tag != b"RP" && tag != b"MP" {
            return;
        }
        let body = addr.wrapping_add(4);
        match kind {
            TYPE_ID_AND_INT => {
                let (Some(id), Some(value)) = (self.u32_at(body), self.u32_at(body.wrapping_add(4))) else { return };
                match id {
                    ID_BINARY_END => info.binary_end = Some(value),
                    _ => info.unknown.push((id, RawValue::Int(value))),
                }
            }
            TYPE_ID_AND_STRING => {
                let (Some(id), Some(ptr)) = (self.u32_at(body), self.u32_at(body.wrapping_add(4))) else { return };
                let Some(value) = self.cstr_at(ptr) else { return };
                let slot = match id {
                    ID_PROGRAM_NAME            => &mut info.program_name,
                    ID_PROGRAM_VERSION_STRING  => &mut info.program_version,
                    ID_PROGRAM_BUILD_DATE      => &mut info.build_date,
                    ID_PROGRAM_URL             => &mut info.program_url,
                    ID_PROGRAM_DESCRIPTION     => &mut info.program_description,
                    ID_SDK_VERSION             => &mut info.sdk_version,
                    ID_PICO_BOARD              => &mut info.pico_board,
                    ID_BOOT2_NAME              => &mut info.boot2_name,
                    ID_PROGRAM_FEATURE         => return info.features.push(value),
                    ID_PROGRAM_BUILD_ATTRIBUTE => return info.build_attributes.push(value),
                    _                          => return info.unknown.push((id, RawValue::Str(value))),
                };
                *slot = Some(value);
            }
            TYPE_BLOCK_DEVICE => {
                let fields = (
                    self.u32_at(body),
                    self.u32_at(body.wrapping_add(4)),
                    self.u32_at(body.wrapping_add(8)),
                    self.u16_at(body.wrapping_add(16)),
                );
                let (Some(name_ptr), Some(address), Some(size), Some(flags)) = fields else { return };
                let name = self.cstr_at(name_ptr).unwrap_or_default();
                info.block_devices.push(BlockDevice { name, address, size, flags });
            }
            TYPE_PINS_WITH_FUNC => {
                let Some(encoding) = self.u32_at(body) else { return };
                let function = GPIO_FUNCS[((encoding >> 3) & 0xf) as usize];
                let packed = encoding >> 7;
                let pins: Vec<u8> = match encoding & 0b111 {
                    PIN_ENCODING_LIST => (0..5).map(|i| ((packed >> (i * 5)) & 0x1f) as u8).collect(),
                    PIN_ENCODING_RANGE => {
                        let (end, start) = ((packed & 0x1f) as u8, ((packed >> 5) & 0x1f) as u8);
                        (start..=end).collect()
                    }
                    _ => Vec::new(),
                };
                for pin in pins {
                    info.pins.entry(pin).or_default().function = function;
                }
            }
            TYPE_PINS_WITH_NAME => {
                let (Some(mask), Some(name_ptr)) = (self.u32_at(body), self.u32_at(body.wrapping_add(4))) else { return };
                if mask == 0 {
                    return;
                }
                let name = self.cstr_at(name_ptr);
                info.pins.entry(mask.trailing_zeros() as u8).or_default().name = name;
            }
            TYPE_NAMED_GROUP => {
                let fields = (
                    self.u32_at(body),
                    self.u16_at(body.wrapping_add(4)),
                    self.u16_at(body.wrapping_add(6)),
                    self.u32_at(body.wrapping_add(8)),
                    self.u32_at(body.wrapping_add(12)),
                );
                let (Some(parent), Some(flags), Some(tag), Some(id), Some(label_ptr)) = fields else { return };
                let label = self.cstr_at(label_ptr).unwrap_or_default();
                info.named_groups.push(NamedGroup { label, parent, flags, tag, id, data: Vec::new() });
            }
            _ => {}
        }
    }
}
