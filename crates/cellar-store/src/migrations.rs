//! Forward schema migrations, keyed by `store_metadata/status.json`.
//!
//! Migration N brings a store from schema version N-1 to N. Every migration
//! is idempotent, so a run interrupted partway can simply be repeated. The
//! status file is rewritten after each migration completes.

use std::io;

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;

use crate::manifest::{json, legacy};
use crate::{Result, Store, StoreError};

struct Migration {
    name: &'static str,
    run: fn(&Store) -> Result<()>,
}

const MIGRATIONS: [Migration; 3] = [
    Migration {
        name: "rewrite legacy manifests as JSON",
        run: migrate_legacy_manifests,
    },
    Migration {
        name: "gzip stored objects",
        run: migrate_gzip_objects,
    },
    Migration {
        name: "add .json manifest extensions",
        run: migrate_manifest_extensions,
    },
];

impl Store {
    /// Apply every migration the store's schema version has not seen yet.
    pub fn run_migrations(&self) -> Result<()> {
        let mut schema_version = self.status()?.schema_version;
        for (index, migration) in MIGRATIONS.iter().enumerate() {
            let target = (index + 1) as u32;
            if target <= schema_version {
                continue;
            }
            info!(migration = migration.name, target, "running migration");
            (migration.run)(self)?;
            self.update_status(target)?;
            schema_version = target;
        }
        Ok(())
    }

    fn for_each_manifest_path(
        &self,
        mut apply: impl FnMut(&Store, &std::path::Path, &str) -> Result<()>,
    ) -> Result<()> {
        let buckets_dir = self.buckets_dir();
        let bucket_dirs = self
            .fs()
            .read_dir(&buckets_dir)
            .map_err(|e| StoreError::io("read buckets dir", buckets_dir.clone(), e))?;

        for bucket_entry in bucket_dirs {
            let versions_dir = buckets_dir.join(&bucket_entry.name).join("versions");
            let manifests = match self.fs().read_dir(&versions_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io("read versions dir", versions_dir, e)),
            };
            for manifest in manifests {
                apply(self, &versions_dir, &manifest.name)?;
            }
        }
        Ok(())
    }
}

/// Migration 1: extensionless bincode manifests become JSON arrays, in
/// place. A file that already parses as JSON is left alone, which makes a
/// rerun after a crash a no-op.
fn migrate_legacy_manifests(store: &Store) -> Result<()> {
    store.for_each_manifest_path(|store, versions_dir, name| {
        if name.contains('.') {
            return Ok(());
        }
        let path = versions_dir.join(name);
        let bytes = store
            .fs()
            .read_file(&path)
            .map_err(|e| StoreError::io("read manifest", path.clone(), e))?;

        let descriptors = match legacy::decode(&bytes, &path) {
            Ok(descriptors) => descriptors,
            Err(decode_err) => {
                if serde_json::from_slice::<serde_json::Value>(&bytes).is_ok() {
                    return Ok(());
                }
                return Err(decode_err);
            }
        };

        let encoded = json::encode(&descriptors)?;
        store
            .fs()
            .write_file(&path, &encoded, 0o600)
            .map_err(|e| StoreError::io("write manifest", path, e))
    })
}

/// Migration 2: every stored object gains a gzip wrapper and a `.gz`
/// suffix. Files already suffixed are skipped; a leftover plain file whose
/// `.gz` twin exists is just removed.
fn migrate_gzip_objects(store: &Store) -> Result<()> {
    let objects_dir = store.objects_dir();
    let shards = store
        .fs()
        .read_dir(&objects_dir)
        .map_err(|e| StoreError::io("read objects dir", objects_dir.clone(), e))?;

    for shard in shards {
        let shard_dir = objects_dir.join(&shard.name);
        let objects = store
            .fs()
            .read_dir(&shard_dir)
            .map_err(|e| StoreError::io("read shard dir", shard_dir.clone(), e))?;

        for object in objects {
            if object.name.ends_with(".gz") {
                continue;
            }
            let plain = shard_dir.join(&object.name);
            let gzipped = shard_dir.join(format!("{}.gz", object.name));

            let already_gzipped = match store.fs().stat(&gzipped) {
                Ok(_) => true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => return Err(StoreError::io("stat object", gzipped.clone(), e)),
            };
            if !already_gzipped {
                let mut reader = store
                    .fs()
                    .open(&plain)
                    .map_err(|e| StoreError::io("open object", plain.clone(), e))?;
                let writer = store
                    .fs()
                    .create(&gzipped)
                    .map_err(|e| StoreError::io("create object", gzipped.clone(), e))?;
                let mut encoder = GzEncoder::new(writer, Compression::default());
                io::copy(&mut reader, &mut encoder)
                    .and_then(|_| encoder.finish().map(drop))
                    .map_err(|e| StoreError::io("gzip object", gzipped.clone(), e))?;
            }
            store
                .fs()
                .remove(&plain)
                .map_err(|e| StoreError::io("remove object", plain, e))?;
        }
    }
    Ok(())
}

/// Migration 3: manifest files gain the `.json` extension. Already-renamed
/// files pass through untouched.
fn migrate_manifest_extensions(store: &Store) -> Result<()> {
    store.for_each_manifest_path(|store, versions_dir, name| {
        if name.contains('.') {
            return Ok(());
        }
        let from = versions_dir.join(name);
        let to = versions_dir.join(format!("{name}.json"));
        store
            .fs()
            .rename(&from, &to)
            .map_err(|e| StoreError::io("rename manifest", from, e))
    })
}

#[cfg(test)]
fn gunzip(bytes: &[u8]) -> Vec<u8> {
    use std::io::Read;

    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut plain = Vec::new();
    decoder.read_to_end(&mut plain).unwrap();
    plain
}
