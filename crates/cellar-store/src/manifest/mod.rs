//! Revision manifest codecs.
//!
//! A revision's manifest lives at `buckets/<id>/versions/<ts>.<ext>`. Three
//! encodings exist, probed in fixed order: `.csv`, `.json`, then the legacy
//! extensionless bincode file that migration 1 retires. The writer always
//! produces JSON.

pub(crate) mod csv;
pub(crate) mod json;
pub(crate) mod legacy;

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use cellar_core::{FileDescriptor, RevisionVersion};
use cellar_fs::Fs;

use crate::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManifestFormat {
    Csv,
    Json,
    Legacy,
}

impl ManifestFormat {
    fn extension(self) -> &'static str {
        match self {
            ManifestFormat::Csv => ".csv",
            ManifestFormat::Json => ".json",
            ManifestFormat::Legacy => "",
        }
    }
}

/// A located manifest file. Each call to [`ManifestSource::iter`] re-reads
/// the file from the start.
#[derive(Debug, Clone)]
pub(crate) struct ManifestSource {
    pub path: PathBuf,
    pub format: ManifestFormat,
}

impl ManifestSource {
    /// Probe the on-disk forms of one revision's manifest, first stat wins.
    pub fn locate(
        fs: &dyn Fs,
        versions_dir: &Path,
        version: RevisionVersion,
    ) -> Result<Option<Self>> {
        for format in [
            ManifestFormat::Csv,
            ManifestFormat::Json,
            ManifestFormat::Legacy,
        ] {
            let path = versions_dir.join(format!("{version}{}", format.extension()));
            match fs.stat(&path) {
                Ok(_) => return Ok(Some(Self { path, format })),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io("stat manifest", path, e)),
            }
        }
        Ok(None)
    }

    pub fn iter(&self, fs: &dyn Fs) -> Result<ManifestIter> {
        let inner = match self.format {
            ManifestFormat::Csv => {
                let reader = fs
                    .open(&self.path)
                    .map_err(|e| StoreError::io("open manifest", self.path.clone(), e))?;
                Inner::Csv {
                    lines: BufReader::new(reader).lines(),
                    header_seen: false,
                    path: self.path.clone(),
                }
            }
            ManifestFormat::Json => {
                let bytes = fs
                    .read_file(&self.path)
                    .map_err(|e| StoreError::io("read manifest", self.path.clone(), e))?;
                Inner::Buffered(json::decode(&bytes, &self.path)?.into_iter())
            }
            ManifestFormat::Legacy => {
                let bytes = fs
                    .read_file(&self.path)
                    .map_err(|e| StoreError::io("read manifest", self.path.clone(), e))?;
                Inner::Buffered(legacy::decode(&bytes, &self.path)?.into_iter())
            }
        };
        Ok(ManifestIter { inner })
    }

    /// Convenience for callers that want the whole manifest at once.
    pub fn descriptors(&self, fs: &dyn Fs) -> Result<Vec<FileDescriptor>> {
        self.iter(fs)?.collect()
    }
}

enum Inner {
    Csv {
        lines: std::io::Lines<BufReader<Box<dyn cellar_fs::ReadSeek>>>,
        header_seen: bool,
        path: PathBuf,
    },
    Buffered(std::vec::IntoIter<FileDescriptor>),
}

/// Fallible iterator over manifest entries, decoding lazily for CSV.
pub(crate) struct ManifestIter {
    inner: Inner,
}

impl Iterator for ManifestIter {
    type Item = Result<FileDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Inner::Buffered(descriptors) => descriptors.next().map(Ok),
            Inner::Csv {
                lines,
                header_seen,
                path,
            } => loop {
                let line = match lines.next()? {
                    Ok(line) => line,
                    Err(e) => return Some(Err(StoreError::io("read manifest", path.clone(), e))),
                };
                if line.trim().is_empty() {
                    continue;
                }
                if !*header_seen {
                    *header_seen = true;
                    continue;
                }
                return Some(csv::parse_line(&line, path));
            },
        }
    }
}
