//! High-level [`Image`] API — the primary embedding surface.
//!
//! ```no_run
//! use uf2fs::compose::ComposeOptions;
//! use uf2fs::filesystem::RawImage;
//! use uf2fs::image::{build_filesystem, write_atomic, Image};
//!
//! let opts = ComposeOptions::default();
//! let fs = build_filesystem(&RawImage::new("littlefs.img"), &opts)?;
//! let out = Image::open("firmware.uf2")?.append_filesystem(&fs, &opts)?;
//! write_atomic("firmware-with-fs.uf2", &out)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::bininfo::BinaryInfo;
use crate::compose::{compose, standalone, ComposeError, ComposeOptions};
use crate::family::Family;
use crate::filesystem::FilesystemSource;
use crate::scanner::{scan_sections, ScanError, ScanOptions};
use crate::section::{Section, SectionSummary};
use crate::writer::{write_sections, WriteError};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Input file not found: {}", path.display())]
    MissingInputFile { path: PathBuf },
    #[error("Block device '{name}' at {address:#010x} starts inside the program image, which ends at {binary_end:#010x}")]
    BlockDeviceOverlap { name: String, address: u32, binary_end: u32 },
    #[error("Filesystem source produced {found} bytes, expected {expected}")]
    FilesystemSize { expected: usize, found: usize },
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Image ─────────────────────────────────────────────────────────────────────

/// A whole container held in memory.
#[derive(Debug, Clone)]
pub struct Image {
    bytes: Vec<u8>,
}

impl Image {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref().to_owned();
        let bytes = fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ImageError::MissingInputFile { path: path.clone() },
            _ => ImageError::Io(e),
        })?;
        tracing::debug!(path = %path.display(), len = bytes.len(), "read container");
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sections(&self, opts: &ScanOptions) -> Result<Vec<Section>, ImageError> {
        Ok(scan_sections(&self.bytes, opts)?)
    }

    pub fn summaries(&self, opts: &ScanOptions) -> Result<Vec<SectionSummary>, ImageError> {
        Ok(self.sections(opts)?
            .iter()
            .enumerate()
            .map(|(i, s)| s.summary(i))
            .collect())
    }

    /// Binary info of the first flashable section that carries any.
    pub fn binary_info(&self, opts: &ScanOptions) -> Result<Option<BinaryInfo>, ImageError> {
        Ok(self.sections(opts)?
            .iter()
            .filter(|s| s.family().accepts_filesystem())
            .find_map(BinaryInfo::from_section))
    }

    /// Fail if the firmware declares a block device that starts below its
    /// own binary end. Every overlap is logged; the first is returned.
    pub fn verify(&self, opts: &ScanOptions) -> Result<(), ImageError> {
        let Some(info) = self.binary_info(opts)? else { return Ok(()) };
        let binary_end = info.binary_end.unwrap_or(0);
        let mut first = None;
        for dev in info.overlapping_block_devices() {
            tracing::error!(
                device = %dev.name,
                address = %format!("{:#010x}", dev.address),
                binary_end = %format!("{binary_end:#010x}"),
                "block device overlaps the program image"
            );
            first.get_or_insert_with(|| ImageError::BlockDeviceOverlap {
                name: dev.name.clone(),
                address: dev.address,
                binary_end,
            });
        }
        first.map_or(Ok(()), Err)
    }

    /// Scanner → composer → writer, all in memory. Nothing is written to disk.
    pub fn append_filesystem(&self, fs_data: &[u8], opts: &ComposeOptions) -> Result<Vec<u8>, ImageError> {
        let sections = compose(&self.bytes, fs_data, opts)?;
        Ok(write_sections(&sections)?)
    }
}

// ── Filesystem payload ────────────────────────────────────────────────────────

/// Validate the configured size, then ask `source` for the payload.
///
/// The size check runs before the source is touched, so a bad size never
/// costs a filesystem build.
pub fn build_filesystem(source: &dyn FilesystemSource, opts: &ComposeOptions) -> Result<Vec<u8>, ImageError> {
    opts.validate()?;
    tracing::debug!(source = %source.describe(), size = opts.fs_size, "building filesystem");
    let data = source.build(opts.fs_size)?;
    if data.len() != opts.fs_size {
        return Err(ImageError::FilesystemSize { expected: opts.fs_size, found: data.len() });
    }
    Ok(data)
}

/// A container holding nothing but the filesystem.
pub fn pack_filesystem(fs_data: &[u8], family: Family, opts: &ComposeOptions) -> Result<Vec<u8>, ImageError> {
    let section = standalone(fs_data, family, opts)?;
    Ok(write_sections(&[section])?)
}

// ── Output ────────────────────────────────────────────────────────────────────

/// Write `bytes` to `path` through a temporary file in the same directory,
/// so `path` is either untouched or complete.
pub fn write_atomic<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<(), ImageError> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ImageError::Io(e.error))?;
    tracing::info!(path = %path.display(), len = bytes.len(), "wrote container");
    Ok(())
}
