//! # cellar-export
//!
//! Materializes one revision of a bucket onto a filesystem: regular files
//! are decompressed out of the object repository into `<out>/files/…` and
//! chmodded to their recorded mode, symlinks are recreated as symlinks.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use cellar_core::{FileDescriptor, FileType, RelativePath, Revision, RevisionVersion};
use cellar_fs::{Fs, PathMatcher};
use cellar_store::{Store, StoreError};

pub type Result<T> = std::result::Result<T, ExportError>;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cannot export a {file_type} entry: {path}")]
    UnsupportedExportType {
        file_type: FileType,
        path: RelativePath,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
}

impl ExportError {
    fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        ExportError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Writes a revision's tree under `<out_dir>/files/`.
pub struct LocalExporter<'a> {
    store: &'a Store,
    fs: Arc<dyn Fs>,
    out_dir: PathBuf,
    matcher: Option<Box<dyn PathMatcher>>,
}

impl<'a> LocalExporter<'a> {
    pub fn new(store: &'a Store, fs: Arc<dyn Fs>, out_dir: &Path) -> Self {
        Self {
            store,
            fs,
            out_dir: out_dir.to_path_buf(),
            matcher: None,
        }
    }

    /// Restrict the export to paths the matcher accepts.
    pub fn with_matcher(mut self, matcher: Box<dyn PathMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Export `bucket_name` at `version`, or its latest revision when
    /// `version` is `None`. Returns the revision that was exported.
    pub fn export(&self, bucket_name: &str, version: Option<RevisionVersion>) -> Result<Revision> {
        let bucket = self.store.bucket_by_name(bucket_name)?;
        let revision = match version {
            Some(version) => self.store.get_revision(&bucket, version)?,
            None => self.store.latest_revision(&bucket)?,
        };

        let mut exported = 0usize;
        for descriptor in self.store.files_in_revision(&revision)? {
            let relative_path = &descriptor.info().relative_path;
            if let Some(matcher) = &self.matcher {
                if !matcher.matches(relative_path.as_str()) {
                    debug!(path = %relative_path, "skipped by matcher");
                    continue;
                }
            }
            self.export_descriptor(&descriptor)?;
            exported += 1;
        }

        info!(
            bucket = bucket_name,
            version = revision.version,
            exported,
            out = %self.out_dir.display(),
            "export complete"
        );
        Ok(revision)
    }

    fn export_descriptor(&self, descriptor: &FileDescriptor) -> Result<()> {
        let info = descriptor.info();
        let target = self.destination_path(&info.relative_path);
        if let Some(parent) = target.parent() {
            self.fs
                .mkdir_all(parent, 0o700)
                .map_err(|e| ExportError::io("create export dir", parent.to_path_buf(), e))?;
        }

        match descriptor {
            FileDescriptor::Regular(regular) => {
                let mut reader = self.store.open_object(&regular.hash)?;
                let mut writer = self
                    .fs
                    .create(&target)
                    .map_err(|e| ExportError::io("create file", target.clone(), e))?;
                io::copy(&mut reader, &mut writer)
                    .and_then(|_| writer.flush())
                    .map_err(|e| ExportError::io("write file", target.clone(), e))?;
                drop(writer);
                self.fs
                    .chmod(&target, info.file_mode)
                    .map_err(|e| ExportError::io("chmod file", target, e))?;
            }
            FileDescriptor::Symlink(symlink) => {
                self.fs
                    .symlink(&symlink.dest, &target)
                    .map_err(|e| ExportError::io("create symlink", target, e))?;
            }
            FileDescriptor::Dir(_) => {
                return Err(ExportError::UnsupportedExportType {
                    file_type: descriptor.file_type(),
                    path: info.relative_path.clone(),
                });
            }
        }
        Ok(())
    }

    fn destination_path(&self, relative_path: &RelativePath) -> PathBuf {
        let mut path = self.out_dir.join("files");
        for fragment in relative_path.as_str().split('/') {
            path.push(fragment);
        }
        path
    }
}
