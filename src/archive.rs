use std::io::{Cursor, Read};
use thiserror::Error;
use zip::result::ZipError;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive does not contain a manifest.json")]
    NoManifest,

    #[error("{0} missing in archive")]
    MissingPart(String),

    #[error("archive error: {0}")]
    Zip(#[from] ZipError),

    #[error("archive read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Boundary to the upload bundle. The session only ever needs the
/// manifest text and individual part payloads, so decompression details
/// stay behind this trait (and mocks stay trivial in tests).
pub trait ArchiveReader {
    fn manifest_text(&mut self) -> Result<String, ArchiveError>;
    fn part_bytes(&mut self, path: &str) -> Result<Vec<u8>, ArchiveError>;
}

/// ZIP bundle produced by the firmware build: `manifest.json` at any
/// depth plus one entry per part, stored under the exact path the
/// manifest references.
pub struct ZipArchiveReader {
    archive: ZipArchive<Cursor<Vec<u8>>>,
}

impl ZipArchiveReader {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ArchiveError> {
        let archive = ZipArchive::new(Cursor::new(bytes))?;
        Ok(ZipArchiveReader { archive })
    }

    /// First entry whose name ends in `manifest.json`, case-insensitive,
    /// in archive order.
    fn find_manifest_name(&mut self) -> Option<String> {
        for index in 0..self.archive.len() {
            let Ok(entry) = self.archive.by_index(index) else {
                continue;
            };
            if entry.name().to_ascii_lowercase().ends_with("manifest.json") {
                return Some(entry.name().to_string());
            }
        }
        None
    }
}

impl ArchiveReader for ZipArchiveReader {
    fn manifest_text(&mut self) -> Result<String, ArchiveError> {
        let name = self.find_manifest_name().ok_or(ArchiveError::NoManifest)?;
        let mut entry = self.archive.by_name(&name)?;
        let mut text = String::new();
        entry.read_to_string(&mut text)?;
        Ok(text)
    }

    fn part_bytes(&mut self, path: &str) -> Result<Vec<u8>, ArchiveError> {
        let mut entry = match self.archive.by_name(path) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                return Err(ArchiveError::MissingPart(path.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}
