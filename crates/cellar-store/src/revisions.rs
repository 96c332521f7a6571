//! Revision registry and the read-side query layer.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use chrono::{DateTime, Utc};

use cellar_core::{
    Bucket, ChildInfo, DirFileDescriptor, FileDescriptor, FileInfo, FileType, RelativePath,
    Revision, RevisionVersion, SearchResult,
};

use crate::manifest::ManifestSource;
use crate::{Result, Store, StoreError};

impl Store {
    /// All revisions of `bucket`, oldest first.
    pub fn revisions(&self, bucket: &Bucket) -> Result<Vec<Revision>> {
        let dir = self.versions_dir(bucket.id);
        let entries = self
            .fs()
            .read_dir(&dir)
            .map_err(|e| StoreError::io("read versions dir", dir.clone(), e))?;

        let mut versions = BTreeSet::new();
        for entry in entries {
            let stem = entry.name.split('.').next().unwrap_or("");
            let version: RevisionVersion =
                stem.parse().map_err(|_| StoreError::ManifestUnreadable {
                    path: dir.join(&entry.name),
                    reason: "revision filename is not a timestamp".to_string(),
                })?;
            versions.insert(version);
        }

        Ok(versions
            .into_iter()
            .map(|version| Revision::new(bucket.clone(), version))
            .collect())
    }

    pub fn latest_revision(&self, bucket: &Bucket) -> Result<Revision> {
        self.revisions(bucket)?
            .pop()
            .ok_or_else(|| StoreError::NoRevisionsForBucket {
                name: bucket.name.clone(),
            })
    }

    pub fn get_revision(&self, bucket: &Bucket, version: RevisionVersion) -> Result<Revision> {
        let dir = self.versions_dir(bucket.id);
        match ManifestSource::locate(self.fs(), &dir, version)? {
            Some(_) => Ok(Revision::new(bucket.clone(), version)),
            None => Err(StoreError::RevisionDoesNotExist {
                bucket: bucket.name.clone(),
                version,
            }),
        }
    }

    /// Every descriptor in the revision's manifest.
    pub fn files_in_revision(&self, revision: &Revision) -> Result<Vec<FileDescriptor>> {
        self.manifest_source(revision)?.descriptors(self.fs())
    }

    /// Open the contents of one path in a revision, following symlinks
    /// within the revision.
    pub fn file_contents(
        &self,
        revision: &Revision,
        path: &RelativePath,
    ) -> Result<Box<dyn Read + Send>> {
        let descriptors = self.files_in_revision(revision)?;
        let by_path: BTreeMap<&RelativePath, &FileDescriptor> = descriptors
            .iter()
            .map(|d| (&d.info().relative_path, d))
            .collect();

        // A chain longer than the manifest itself must be revisiting a path.
        let mut current = path.clone();
        for _ in 0..=descriptors.len() {
            match by_path.get(&current) {
                None => {
                    return Err(StoreError::FileOrDirNotFound {
                        path: path.clone(),
                    })
                }
                Some(FileDescriptor::Regular(d)) => return self.open_object(&d.hash),
                Some(FileDescriptor::Symlink(d)) => current = RelativePath::new(&d.dest),
                Some(other) => {
                    return Err(StoreError::UnsupportedFileType {
                        file_type: other.file_type(),
                        path: path.clone(),
                    })
                }
            }
        }
        Err(StoreError::TooManySymlinkHops { path: path.clone() })
    }

    /// The descriptor recorded for exactly `path`.
    pub fn stat_in_revision(
        &self,
        revision: &Revision,
        path: &RelativePath,
    ) -> Result<FileDescriptor> {
        for descriptor in self.manifest_source(revision)?.iter(self.fs())? {
            let descriptor = descriptor?;
            if &descriptor.info().relative_path == path {
                return Ok(descriptor);
            }
        }
        Err(StoreError::FileOrDirNotFound { path: path.clone() })
    }

    /// List the entries directly beneath `path` in a revision.
    ///
    /// Manifests only record leaves, so intermediate directories are
    /// synthesized: the first path component below `path` becomes one `Dir`
    /// descriptor, with a child summary per second-level name. An exact
    /// match on `path` itself returns just that descriptor; an empty `path`
    /// lists the revision root.
    pub fn read_dir_in_revision(
        &self,
        revision: &Revision,
        path: &RelativePath,
    ) -> Result<Vec<FileDescriptor>> {
        let prefix = if path.as_str().is_empty() {
            String::new()
        } else {
            format!("{}/", path.as_str())
        };

        let mut listing: BTreeMap<String, FileDescriptor> = BTreeMap::new();
        let mut synthesized: BTreeMap<String, BTreeMap<String, ChildInfo>> = BTreeMap::new();

        for descriptor in self.manifest_source(revision)?.iter(self.fs())? {
            let descriptor = descriptor?;
            let descriptor_path = descriptor.info().relative_path.as_str().to_string();

            if !path.as_str().is_empty() && descriptor_path == path.as_str() {
                return Ok(vec![descriptor]);
            }
            let Some(remainder) = descriptor_path.strip_prefix(&prefix) else {
                continue;
            };

            let fragments: Vec<&str> = remainder.split('/').collect();
            match fragments[..] {
                [_name] => {
                    listing.insert(remainder.to_string(), descriptor);
                }
                [first, second, ..] => {
                    let children = synthesized.entry(first.to_string()).or_default();
                    let child = children.entry(second.to_string()).or_default();
                    if fragments.len() == 2 {
                        child.file_type = descriptor.file_type();
                    } else {
                        child.file_type = FileType::Dir;
                        child.sub_children += 1;
                    }
                }
                [] => {}
            }
        }

        for (name, children) in synthesized {
            let info = FileInfo::new(
                FileType::Dir,
                RelativePath::new(&format!("{prefix}{name}")),
                DateTime::<Utc>::UNIX_EPOCH,
                0,
                0o700,
            );
            listing
                .entry(name)
                .or_insert_with(|| FileDescriptor::Dir(DirFileDescriptor::with_children(info, children)));
        }

        if listing.is_empty() && !path.as_str().is_empty() {
            return Err(StoreError::FileOrDirNotFound { path: path.clone() });
        }
        Ok(listing.into_values().collect())
    }

    /// Substring search on relative paths across every bucket and revision.
    pub fn search(&self, term: &str) -> Result<Vec<SearchResult>> {
        let mut results = Vec::new();
        for bucket in self.buckets()? {
            for revision in self.revisions(&bucket)? {
                for descriptor in self.manifest_source(&revision)?.iter(self.fs())? {
                    let descriptor = descriptor?;
                    if descriptor.info().relative_path.as_str().contains(term) {
                        results.push(SearchResult {
                            relative_path: descriptor.info().relative_path.clone(),
                            bucket: bucket.clone(),
                            revision: revision.version,
                        });
                    }
                }
            }
        }
        Ok(results)
    }

    fn manifest_source(&self, revision: &Revision) -> Result<ManifestSource> {
        let dir = self.versions_dir(revision.bucket.id);
        ManifestSource::locate(self.fs(), &dir, revision.version)?.ok_or_else(|| {
            StoreError::RevisionDoesNotExist {
                bucket: revision.bucket.name.clone(),
                version: revision.version,
            }
        })
    }
}
