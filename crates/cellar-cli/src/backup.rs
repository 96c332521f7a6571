//! The local uploader: walks a source tree and drives the store's
//! transaction protocol end to end.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use cellar_core::{FileInfo, FileType, Hash, RelativePath, Revision};
use cellar_fs::{Fs, WalkEntry, WalkOptions};
use cellar_store::{RelativePathWithHash, Store, SymlinkWithRelativePath, Transaction};

pub fn run(
    store: &Store,
    fs: &dyn Fs,
    bucket_name: &str,
    source: &Path,
    excludes: &[String],
) -> Result<Revision> {
    let bucket = store.bucket_by_name(bucket_name)?;

    let matcher = |path: &str| !excludes.iter().any(|pattern| path.contains(pattern));
    let options = WalkOptions {
        matcher: Some(&matcher),
        max_concurrency: 1,
    };
    let entries = fs
        .walk(source, &options)
        .with_context(|| format!("walking {}", source.display()))?;

    // Manifests record leaves only; the query layer synthesizes directories.
    let entries: Vec<WalkEntry> = entries
        .into_iter()
        .filter(|entry| entry.metadata.file_type != FileType::Dir)
        .collect();

    let mut infos = Vec::with_capacity(entries.len());
    for entry in &entries {
        let relative = entry
            .path
            .strip_prefix(source)
            .unwrap_or(&entry.path)
            .to_string_lossy()
            .into_owned();
        let relative_path = RelativePath::new(&relative);
        infos.push(FileInfo::new(
            entry.metadata.file_type,
            relative_path,
            entry.metadata.mod_time,
            entry.metadata.size,
            entry.metadata.mode,
        ));
    }

    debug!(files = infos.len(), "declaring backup");
    let transaction = store.open_transaction(&bucket, infos)?;

    match drive(store, fs, &transaction, &entries, source) {
        Ok(revision) => Ok(revision),
        Err(e) => {
            if let Err(rollback_err) = store.rollback(&transaction) {
                debug!(error = %rollback_err, "rollback after failed backup also failed");
            }
            Err(e)
        }
    }
}

fn drive(
    store: &Store,
    fs: &dyn Fs,
    transaction: &Transaction,
    entries: &[WalkEntry],
    source: &Path,
) -> Result<Revision> {
    // Unchanged paths were carried forward at open; only hash and link what
    // the transaction still wants.
    let awaiting_hashes: BTreeSet<RelativePath> =
        transaction.paths_awaiting_hashes().into_iter().collect();
    let awaiting_symlinks: BTreeSet<RelativePath> =
        transaction.paths_awaiting_symlinks().into_iter().collect();

    let mut hashes = Vec::new();
    let mut symlinks = Vec::new();
    let mut by_hash: BTreeMap<Hash, PathBuf> = BTreeMap::new();

    for entry in entries {
        let relative = entry
            .path
            .strip_prefix(source)
            .unwrap_or(&entry.path)
            .to_string_lossy()
            .into_owned();
        let relative_path = RelativePath::new(&relative);

        match entry.metadata.file_type {
            FileType::Regular if awaiting_hashes.contains(&relative_path) => {
                let mut reader = fs
                    .open(&entry.path)
                    .with_context(|| format!("opening {}", entry.path.display()))?;
                let hash = Hash::from_reader(&mut reader)
                    .with_context(|| format!("hashing {}", entry.path.display()))?;
                by_hash.entry(hash.clone()).or_insert(entry.path.clone());
                hashes.push(RelativePathWithHash {
                    relative_path,
                    hash,
                });
            }
            FileType::Symlink if awaiting_symlinks.contains(&relative_path) => {
                let dest = fs
                    .read_link(&entry.path)
                    .with_context(|| format!("reading link {}", entry.path.display()))?;
                symlinks.push(SymlinkWithRelativePath {
                    relative_path,
                    dest: dest.to_string_lossy().into_owned(),
                });
            }
            _ => {}
        }
    }

    let required = store.process_upload_hashes(transaction, hashes)?;
    debug!(required = required.len(), "uploading changed objects");

    if !symlinks.is_empty() {
        store.process_symlinks(transaction, symlinks)?;
    }

    for hash in required {
        let path = by_hash
            .get(&hash)
            .with_context(|| format!("no local file with hash {hash}"))?;
        let mut reader = fs
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        store.backup_file(transaction, &mut reader)?;
    }

    Ok(store.commit(transaction)?)
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;

    use tempfile::TempDir;

    use cellar_fs::OsFs;
    use cellar_store::SystemClock;

    use super::*;

    fn init_store(dir: &Path) -> Store {
        Store::init(Arc::new(OsFs::new()), Arc::new(SystemClock), dir).unwrap()
    }

    #[test]
    fn test_backup_directory_tree() {
        let store_dir = TempDir::new().unwrap();
        let source_dir = TempDir::new().unwrap();
        let fs = OsFs::new();

        std::fs::create_dir(source_dir.path().join("sub")).unwrap();
        std::fs::write(source_dir.path().join("a.txt"), b"file a contents").unwrap();
        std::fs::write(source_dir.path().join("sub/b.txt"), b"file b contents").unwrap();
        std::fs::write(source_dir.path().join("skip.log"), b"noise").unwrap();

        let store = init_store(store_dir.path());
        store.create_bucket("docs").unwrap();

        let revision = run(
            &store,
            &fs,
            "docs",
            source_dir.path(),
            &[".log".to_string()],
        )
        .unwrap();

        let manifest = store.files_in_revision(&revision).unwrap();
        let paths: Vec<_> = manifest
            .iter()
            .map(|d| d.info().relative_path.as_str().to_string())
            .collect();
        assert!(paths.contains(&"a.txt".to_string()));
        assert!(paths.contains(&"sub/b.txt".to_string()));
        assert!(!paths.iter().any(|p| p.ends_with(".log")));

        let mut reader = store
            .file_contents(&revision, &RelativePath::new("sub/b.txt"))
            .unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"file b contents");
    }

    #[cfg(unix)]
    #[test]
    fn test_backup_records_symlinks() {
        let store_dir = TempDir::new().unwrap();
        let source_dir = TempDir::new().unwrap();
        let fs = OsFs::new();

        std::fs::write(source_dir.path().join("a.txt"), b"target").unwrap();
        std::os::unix::fs::symlink("a.txt", source_dir.path().join("link")).unwrap();

        let store = init_store(store_dir.path());
        store.create_bucket("docs").unwrap();

        let revision = run(&store, &fs, "docs", source_dir.path(), &[]).unwrap();

        let mut reader = store
            .file_contents(&revision, &RelativePath::new("link"))
            .unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"target");
    }

    #[test]
    fn test_second_backup_uploads_nothing_new() {
        let store_dir = TempDir::new().unwrap();
        let source_dir = TempDir::new().unwrap();
        let fs = OsFs::new();

        std::fs::write(source_dir.path().join("a.txt"), b"stable contents").unwrap();

        let store = init_store(store_dir.path());
        store.create_bucket("docs").unwrap();

        let first = run(&store, &fs, "docs", source_dir.path(), &[]).unwrap();
        // Wall clock: the second run lands on a later (or equal) second.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let second = run(&store, &fs, "docs", source_dir.path(), &[]).unwrap();

        assert!(second.version > first.version);
        let bucket = store.bucket_by_name("docs").unwrap();
        assert_eq!(store.revisions(&bucket).unwrap().len(), 2);
    }
}
