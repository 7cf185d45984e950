pub mod block;
pub mod family;
pub mod section;
pub mod scanner;
pub mod writer;
pub mod bininfo;
pub mod compose;
pub mod filesystem;
pub mod image;

pub use block::{BlockHeader, MagicCheck, encode_block, decode_block};
pub use family::Family;
pub use section::{Range, Section, SectionData, SectionSummary};
pub use scanner::{ScanOptions, SectionScanner, scan_sections};
pub use writer::{Uf2Writer, write_sections};
pub use bininfo::BinaryInfo;
pub use compose::{ComposeOptions, compose};
pub use image::{Image, ImageError};
