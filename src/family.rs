//! Family tag registry.
//!
//! The family tag in a block header says which device class a section is
//! meant for. Only the two hardware generations below may receive a
//! filesystem. [`Family::Absolute`] is the placeholder tag: sections carrying
//! it are informational, pass through untouched, and are written with one
//! more block declared than they hold.

use std::fmt;

pub const TAG_RP2040:      u32 = 0xe48b_ff56;
pub const TAG_ABSOLUTE:    u32 = 0xe48b_ff57;
pub const TAG_RP2350_ARM_S: u32 = 0xe48b_ff59;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Rp2040,
    Rp2350ArmS,
    Absolute,
    Other(u32),
}

impl Family {
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            TAG_RP2040       => Family::Rp2040,
            TAG_RP2350_ARM_S => Family::Rp2350ArmS,
            TAG_ABSOLUTE     => Family::Absolute,
            other            => Family::Other(other),
        }
    }

    #[inline]
    pub fn tag(self) -> u32 {
        match self {
            Family::Rp2040     => TAG_RP2040,
            Family::Rp2350ArmS => TAG_RP2350_ARM_S,
            Family::Absolute   => TAG_ABSOLUTE,
            Family::Other(tag) => tag,
        }
    }

    /// Human-readable name (diagnostics only).
    pub fn name(self) -> &'static str {
        match self {
            Family::Rp2040     => "rp2040",
            Family::Rp2350ArmS => "rp2350-arm-s",
            Family::Absolute   => "absolute",
            Family::Other(_)   => "unknown",
        }
    }

    /// Parse from a CLI string: a known name or a hex tag such as `0xe48bff56`.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "rp2040"                   => Some(Family::Rp2040),
            "rp2350" | "rp2350-arm-s"  => Some(Family::Rp2350ArmS),
            "absolute"                 => Some(Family::Absolute),
            other => {
                let hex = other.strip_prefix("0x")?;
                u32::from_str_radix(hex, 16).ok().map(Family::from_tag)
            }
        }
    }

    /// Flashable firmware region that may have a filesystem placed inside it.
    pub fn accepts_filesystem(self) -> bool {
        matches!(self, Family::Rp2040 | Family::Rp2350ArmS)
    }

    pub fn is_placeholder(self) -> bool {
        self == Family::Absolute
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#010x})", self.name(), self.tag())
    }
}
