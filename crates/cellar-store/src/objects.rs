//! Content-addressed object repository: `objects/<xx>/<rest>.gz`.
//!
//! Objects are keyed by the SHA-512 of their plaintext and stored as gzip
//! streams. A bare `<rest>` file (from a store that has not run migration 2)
//! is still readable. Objects are never deleted.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::trace;

use cellar_core::Hash;

use crate::{Result, Store, StoreError};

impl Store {
    pub(crate) fn object_path_gz(&self, hash: &Hash) -> PathBuf {
        self.object_shard_dir(hash)
            .join(format!("{}.gz", hash.remainder()))
    }

    pub(crate) fn object_path_raw(&self, hash: &Hash) -> PathBuf {
        self.object_shard_dir(hash).join(hash.remainder())
    }

    /// Whether the object for `hash` exists in either on-disk form.
    pub fn is_object_present(&self, hash: &Hash) -> Result<bool> {
        for path in [self.object_path_gz(hash), self.object_path_raw(hash)] {
            match self.fs().stat(&path) {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io("stat object", path, e)),
            }
        }
        Ok(false)
    }

    /// Open the object for `hash` as a plaintext stream, decompressing when
    /// the gzipped form is found.
    pub fn open_object(&self, hash: &Hash) -> Result<Box<dyn Read + Send>> {
        let gz_path = self.object_path_gz(hash);
        match self.fs().open(&gz_path) {
            Ok(reader) => return Ok(Box::new(GzDecoder::new(reader))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io("open object", gz_path, e)),
        }

        let raw_path = self.object_path_raw(hash);
        match self.fs().open(&raw_path) {
            Ok(reader) => Ok(Box::new(reader)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::ObjectNotFound {
                hash: hash.clone(),
            }),
            Err(e) => Err(StoreError::io("open object", raw_path, e)),
        }
    }

    /// Gzip `reader` into a fresh staging file under `tmp/` and return the
    /// plaintext hash together with the staged path.
    pub(crate) fn stage_blob(&self, reader: &mut dyn Read) -> Result<(Hash, PathBuf)> {
        let seq = self.tmp_counter.fetch_add(1, Ordering::SeqCst);
        let staged = self.tmp_dir().join(seq.to_string());

        let writer = self
            .fs()
            .create(&staged)
            .map_err(|e| StoreError::io("create staging file", staged.clone(), e))?;
        let mut encoder = GzEncoder::new(writer, Compression::default());
        io::copy(reader, &mut encoder)
            .map_err(|e| StoreError::io("stage blob", staged.clone(), e))?;
        let mut writer = encoder
            .finish()
            .map_err(|e| StoreError::io("finish gzip stream", staged.clone(), e))?;
        writer
            .flush()
            .map_err(|e| StoreError::io("flush staging file", staged.clone(), e))?;
        drop(writer);

        // Hash the plaintext by reading the staged stream back.
        let staged_reader = self
            .fs()
            .open(&staged)
            .map_err(|e| StoreError::io("reopen staging file", staged.clone(), e))?;
        let mut decoder = GzDecoder::new(staged_reader);
        let hash = Hash::from_reader(&mut decoder)
            .map_err(|e| StoreError::io("hash staged blob", staged.clone(), e))?;

        Ok((hash, staged))
    }

    /// Move a staged file into its content-addressed home. When the object
    /// already exists the staged copy is dropped. Returns whether the object
    /// was newly stored.
    pub(crate) fn ingest_object(&self, hash: &Hash, staged: &PathBuf) -> Result<bool> {
        let target = self.object_path_gz(hash);
        match self.fs().stat(&target) {
            Ok(_) => {
                trace!(%hash, "object already present, dropping staged copy");
                self.fs()
                    .remove(staged)
                    .map_err(|e| StoreError::io("remove staged file", staged.clone(), e))?;
                return Ok(false);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io("stat object", target, e)),
        }

        let shard = self.object_shard_dir(hash);
        self.fs()
            .mkdir_all(&shard, 0o700)
            .map_err(|e| StoreError::io("create shard dir", shard, e))?;
        self.fs()
            .rename(staged, &target)
            .map_err(|e| StoreError::io("ingest object", target.clone(), e))?;
        trace!(%hash, "stored object");
        Ok(true)
    }
}
