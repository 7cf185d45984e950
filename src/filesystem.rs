//! Filesystem payload sources.
//!
//! Building the filesystem itself (littlefs, FAT, ...) is somebody else's
//! job. The composer only needs a byte buffer of the configured size, so this
//! module defines the seam and two simple sources.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Produces a filesystem image of exactly `size` bytes.
pub trait FilesystemSource {
    fn build(&self, size: usize) -> io::Result<Vec<u8>>;

    /// Short description for log output.
    fn describe(&self) -> String;
}

/// A filesystem image built ahead of time by an external tool.
#[derive(Debug, Clone)]
pub struct RawImage {
    path: PathBuf,
}

impl RawImage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_owned() }
    }
}

impl FilesystemSource for RawImage {
    fn build(&self, size: usize) -> io::Result<Vec<u8>> {
        let data = fs::read(&self.path)?;
        if data.len() != size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is {} bytes, expected {size}", self.path.display(), data.len()),
            ));
        }
        Ok(data)
    }

    fn describe(&self) -> String {
        format!("raw image {}", self.path.display())
    }
}

/// An erased region: every byte is `0xFF`. Writing it wipes a filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct Erased;

impl FilesystemSource for Erased {
    fn build(&self, size: usize) -> io::Result<Vec<u8>> {
        Ok(vec![0xFF; size])
    }

    fn describe(&self) -> String {
        "erased region".to_owned()
    }
}
