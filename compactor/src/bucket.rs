use std::collections::BTreeSet;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use data_types::{
    BlockMeta, DeletionMark, DynError, NoCompactMark, NoCompactReason, TenantId, META_VERSION,
};
use futures::StreamExt;
use object_store::{path::Path, DynObjectStore, ObjectStore};
use observability_deps::tracing::{debug, warn};
use stratus_time::Time;
use ulid::Ulid;

/// The block meta file name; a block exists iff this object exists.
pub const META_FILENAME: &str = "meta.json";

/// The file holding pending deletions inside uncompacted blocks; never
/// uploaded with compacted blocks.
pub const TOMBSTONES_FILENAME: &str = "tombstones";

/// Marker writes always complete within this bound, on a context detached
/// from the iteration, so shutdown cannot leave half-marked blocks.
pub const MARKER_TIMEOUT: Duration = Duration::from_secs(30);

/// All tenants with at least one object in the store.
pub async fn list_tenants(store: &DynObjectStore) -> Result<Vec<TenantId>, DynError> {
    let listing = store.list_with_delimiter(None).await?;
    let mut tenants = vec![];
    for prefix in listing.common_prefixes {
        if let Some(name) = prefix.parts().last() {
            if let Ok(tenant) = TenantId::new(name.as_ref()) {
                tenants.push(tenant);
            }
        }
    }
    Ok(tenants)
}

/// One tenant's slice of the object store, with the fixed layout
/// `<tenant>/<ulid>/...` plus `<tenant>/markers/`.
#[derive(Debug, Clone)]
pub struct TenantBucket {
    store: Arc<DynObjectStore>,
    tenant: TenantId,
}

impl TenantBucket {
    /// Wrap `store` for `tenant`.
    pub fn new(store: Arc<DynObjectStore>, tenant: TenantId) -> Self {
        Self { store, tenant }
    }

    /// The tenant this bucket serves.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    fn block_path(&self, id: Ulid, file: &str) -> Path {
        Path::from(format!("{}/{}/{}", self.tenant, id, file))
    }

    fn block_prefix(&self, id: Ulid) -> Path {
        Path::from(format!("{}/{}", self.tenant, id))
    }

    fn deletion_mark_path(&self, id: Ulid) -> Path {
        Path::from(format!("{}/markers/{}-deletion-mark.json", self.tenant, id))
    }

    fn no_compact_mark_path(&self, id: Ulid) -> Path {
        Path::from(format!(
            "{}/markers/{}-no-compact-mark.json",
            self.tenant, id
        ))
    }

    /// The ULIDs of all blocks present in the bucket.
    pub async fn list_blocks(&self) -> Result<Vec<Ulid>, DynError> {
        let prefix = Path::from(self.tenant.as_str());
        let listing = self.store.list_with_delimiter(Some(&prefix)).await?;
        let mut ids = vec![];
        for prefix in listing.common_prefixes {
            if let Some(name) = prefix.parts().last() {
                if let Ok(id) = Ulid::from_string(name.as_ref()) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Read and decode a block's `meta.json`.
    pub async fn read_meta(&self, id: Ulid) -> Result<BlockMeta, DynError> {
        let bytes = self
            .store
            .get(&self.block_path(id, META_FILENAME))
            .await?
            .bytes()
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The upload time of a block, from its meta object.
    pub async fn block_upload_time(&self, id: Ulid) -> Result<Time, DynError> {
        let meta = self.store.head(&self.block_path(id, META_FILENAME)).await?;
        Ok(Time::from_date_time(meta.last_modified))
    }

    /// Download a block's objects into `dest/<ulid>/`.
    pub async fn download_block(&self, id: Ulid, dest: &FsPath) -> Result<PathBuf, DynError> {
        let block_dir = dest.join(id.to_string());
        tokio::fs::create_dir_all(&block_dir).await?;

        let prefix = self.block_prefix(id);
        let mut objects = self.store.list(Some(&prefix)).await?;
        while let Some(object) = objects.next().await {
            let object = object?;
            let relative: Vec<String> = object
                .location
                .parts()
                .skip(2)
                .map(|p| p.as_ref().to_owned())
                .collect();
            if relative.is_empty() {
                continue;
            }
            let local = block_dir.join(relative.join("/"));
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let bytes = self.store.get(&object.location).await?.bytes().await?;
            tokio::fs::write(&local, &bytes).await?;
        }

        debug!(tenant = %self.tenant, block = %id, dir = %block_dir.display(), "downloaded block");
        Ok(block_dir)
    }

    /// Upload the block directory `src` as block `id`.
    ///
    /// Segment files are uploaded before `meta.json` so a half-finished
    /// upload is invisible to readers, and `tombstones` is stripped.
    pub async fn upload_block(&self, id: Ulid, src: &FsPath) -> Result<(), DynError> {
        let files = collect_files(src)?;

        let mut segments = vec![];
        let mut meta = None;
        for relative in files {
            if relative == META_FILENAME {
                meta = Some(relative);
            } else if relative == TOMBSTONES_FILENAME {
                continue;
            } else {
                segments.push(relative);
            }
        }
        let meta = meta.ok_or_else(|| {
            format!("block directory {} has no {META_FILENAME}", src.display())
        })?;

        for relative in segments.iter().chain(std::iter::once(&meta)) {
            let bytes = tokio::fs::read(src.join(relative)).await?;
            self.store
                .put(&self.block_path(id, relative), Bytes::from(bytes))
                .await?;
        }

        debug!(tenant = %self.tenant, block = %id, "uploaded block");
        Ok(())
    }

    /// All block IDs with a deletion marker.
    pub async fn deletion_marked_blocks(&self) -> Result<BTreeSet<Ulid>, DynError> {
        self.marked_blocks("-deletion-mark.json").await
    }

    /// All block IDs with a no-compact marker.
    pub async fn no_compact_marked_blocks(&self) -> Result<BTreeSet<Ulid>, DynError> {
        self.marked_blocks("-no-compact-mark.json").await
    }

    async fn marked_blocks(&self, suffix: &str) -> Result<BTreeSet<Ulid>, DynError> {
        let prefix = Path::from(format!("{}/markers", self.tenant));
        let mut objects = self.store.list(Some(&prefix)).await?;
        let mut ids = BTreeSet::new();
        while let Some(object) = objects.next().await {
            let object = object?;
            let name = match object.location.parts().last() {
                Some(part) => part.as_ref().to_owned(),
                None => continue,
            };
            if let Some(id) = name.strip_suffix(suffix) {
                match Ulid::from_string(id) {
                    Ok(id) => {
                        ids.insert(id);
                    }
                    Err(_) => {
                        warn!(tenant = %self.tenant, marker = %name, "ignoring marker with malformed ULID");
                    }
                }
            }
        }
        Ok(ids)
    }

    /// Write a deletion marker for `id`.
    ///
    /// Runs under [`MARKER_TIMEOUT`] detached from the caller's own
    /// deadline, so the marker either completes or fails atomically.
    pub async fn mark_block_for_deletion(&self, id: Ulid, now: Time) -> Result<(), DynError> {
        let mark = DeletionMark {
            id,
            deletion_time: now.timestamp_millis(),
            version: META_VERSION,
        };
        let encoded = Bytes::from(serde_json::to_vec(&mark)?);
        tokio::time::timeout(
            MARKER_TIMEOUT,
            self.store.put(&self.deletion_mark_path(id), encoded),
        )
        .await
        .map_err(|_| format!("timed out writing deletion marker for block {id}"))??;
        debug!(tenant = %self.tenant, block = %id, "block marked for deletion");
        Ok(())
    }

    /// Write a no-compact marker for `id`.
    pub async fn mark_block_no_compact(
        &self,
        id: Ulid,
        reason: NoCompactReason,
        now: Time,
    ) -> Result<(), DynError> {
        let mark = NoCompactMark {
            id,
            no_compact_time: now.timestamp_millis(),
            reason,
            version: META_VERSION,
        };
        let encoded = Bytes::from(serde_json::to_vec(&mark)?);
        tokio::time::timeout(
            MARKER_TIMEOUT,
            self.store.put(&self.no_compact_mark_path(id), encoded),
        )
        .await
        .map_err(|_| format!("timed out writing no-compact marker for block {id}"))??;
        debug!(tenant = %self.tenant, block = %id, ?reason, "block marked no-compact");
        Ok(())
    }
}

fn collect_files(dir: &FsPath) -> Result<Vec<String>, DynError> {
    fn walk(base: &FsPath, dir: &FsPath, out: &mut Vec<String>) -> Result<(), DynError> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                walk(base, &path, out)?;
            } else {
                let relative = path
                    .strip_prefix(base)
                    .map_err(|e| format!("path outside block dir: {e}"))?;
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }

    let mut out = vec![];
    walk(dir, dir, &mut out)?;
    out.sort();
    Ok(out)
}
