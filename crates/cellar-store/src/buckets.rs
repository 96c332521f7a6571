//! Bucket registry: `store_metadata/buckets-data.json`, a JSON array of
//! `{id, name}` records rewritten whole on every change.

use tracing::info;

use cellar_core::{contains_traversal, Bucket};

use crate::{Result, Store, StoreError};

const MAX_BUCKET_NAME_LEN: usize = 100;

impl Store {
    /// All buckets, in registry order.
    pub fn buckets(&self) -> Result<Vec<Bucket>> {
        let path = self.buckets_registry_path();
        let bytes = self
            .fs()
            .read_file(&path)
            .map_err(|e| StoreError::io("read bucket registry", path.clone(), e))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::ManifestUnreadable {
            path,
            reason: e.to_string(),
        })
    }

    pub fn bucket_by_name(&self, name: &str) -> Result<Bucket> {
        self.buckets()?
            .into_iter()
            .find(|b| b.name == name)
            .ok_or_else(|| StoreError::BucketDoesNotExist {
                name: name.to_string(),
            })
    }

    /// Register a new bucket and create its versions directory. Ids count up
    /// from the highest existing id and are never reused.
    pub fn create_bucket(&self, name: &str) -> Result<Bucket> {
        validate_bucket_name(name)?;

        let mut buckets = self.buckets()?;
        if buckets.iter().any(|b| b.name == name) {
            return Err(StoreError::BucketNameAlreadyTaken {
                name: name.to_string(),
            });
        }

        let id = buckets.iter().map(|b| b.id).max().unwrap_or(0) + 1;
        let bucket = Bucket::new(id, name);
        buckets.push(bucket.clone());

        let path = self.buckets_registry_path();
        let bytes = serde_json::to_vec(&buckets).map_err(|e| StoreError::ManifestUnreadable {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        self.fs()
            .write_file(&path, &bytes, 0o600)
            .map_err(|e| StoreError::io("write bucket registry", path, e))?;

        let versions = self.versions_dir(id);
        self.fs()
            .mkdir_all(&versions, 0o700)
            .map_err(|e| StoreError::io("create versions dir", versions, e))?;

        info!(bucket = name, id, "created bucket");
        Ok(bucket)
    }
}

fn validate_bucket_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::BucketRequiresAName);
    }
    if name.chars().count() > MAX_BUCKET_NAME_LEN {
        return Err(StoreError::BucketNameTooLong {
            name: name.to_string(),
        });
    }
    if contains_traversal(name) {
        return Err(StoreError::IllegalTraversal {
            text: name.to_string(),
        });
    }
    Ok(())
}
