//! Helpers shared by the compactor's tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use data_types::{BlockCompaction, BlockMeta, TenantId, META_VERSION};
use object_store::memory::InMemory;
use object_store::DynObjectStore;
use ulid::Ulid;

use crate::TenantBucket;

/// A level-1 block meta spanning `[min_time, max_time]`.
pub(crate) fn meta(id: Ulid, min_time: i64, max_time: i64) -> BlockMeta {
    BlockMeta {
        id,
        min_time,
        max_time,
        version: META_VERSION,
        compaction: BlockCompaction {
            level: 1,
            sources: vec![id],
            parents: vec![],
        },
        resolution: 0,
        external_labels: BTreeMap::new(),
    }
}

/// A meta compacted from `sources` at `level`.
pub(crate) fn compacted_meta(
    id: Ulid,
    min_time: i64,
    max_time: i64,
    level: u32,
    sources: Vec<Ulid>,
) -> BlockMeta {
    BlockMeta {
        compaction: BlockCompaction {
            level,
            sources,
            parents: vec![],
        },
        ..meta(id, min_time, max_time)
    }
}

/// An in-memory store plus a bucket view for `tenant`.
pub(crate) fn memory_bucket(tenant: &str) -> (Arc<DynObjectStore>, TenantBucket) {
    let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
    let bucket = TenantBucket::new(Arc::clone(&store), TenantId::new(tenant).unwrap());
    (store, bucket)
}

/// Upload a minimal block (meta + one chunk + index) described by `meta`.
pub(crate) async fn upload_block(bucket: &TenantBucket, meta: &BlockMeta) {
    let tmp = test_helpers::tmp_dir().unwrap();
    let src = tmp.path().join(meta.id.to_string());
    std::fs::create_dir_all(src.join("chunks")).unwrap();
    std::fs::write(src.join("chunks/000001"), b"chunk-data").unwrap();
    std::fs::write(src.join("index"), b"index-data").unwrap();
    std::fs::write(
        src.join(crate::META_FILENAME),
        serde_json::to_vec(meta).unwrap(),
    )
    .unwrap();
    bucket.upload_block(meta.id, &src).await.unwrap();
}
