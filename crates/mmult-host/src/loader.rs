//! Loads a pre-built device binary image from disk.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{HostError, Result};

/// Raw bytes of a device binary image.
///
/// The contents are never interpreted on the host; compatibility with the
/// device is decided when the program is created from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryImage {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl BinaryImage {
    /// Wrap bytes that did not come from a file.
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self { path: path.into(), bytes }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Read the whole image at `path`.
///
/// # Errors
///
/// - [`HostError::FileOpenError`] if the file cannot be opened.
/// - [`HostError::FileReadError`] if fewer bytes are read than the file's
///   reported size.
pub fn load_binary_image(path: &Path) -> Result<BinaryImage> {
    info!("loading device binary {}", path.display());
    let mut file = File::open(path)
        .map_err(|source| HostError::FileOpenError { path: path.to_path_buf(), source })?;

    let expected = file
        .metadata()
        .map_err(|source| HostError::FileOpenError { path: path.to_path_buf(), source })?
        .len();

    let mut bytes = Vec::with_capacity(expected as usize);
    let read = file.read_to_end(&mut bytes);
    let actual = bytes.len() as u64;
    if read.is_err() || actual < expected {
        return Err(HostError::FileReadError { path: path.to_path_buf(), expected, actual });
    }

    info!("loaded {} bytes from {}", actual, path.display());
    Ok(BinaryImage { path: path.to_path_buf(), bytes })
}
