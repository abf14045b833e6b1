use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use data_types::{DynError, TenantId};
use object_store::{path::Path as ObjectPath, DynObjectStore, ObjectStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

/// Magic bytes opening an index-header file.
pub const INDEX_HEADER_MAGIC: u32 = 0x5349_4458; // "SIDX"

/// Version of the index-header file format.
pub const INDEX_HEADER_VERSION: u8 = 1;

/// The object name of a block's index header.
pub const INDEX_HEADER_FILENAME: &str = "index-header";

/// Errors reading an index-header file.
#[derive(Debug, Error)]
pub enum IndexHeaderError {
    /// The file is shorter than the fixed framing.
    #[error("index header truncated: {0} bytes")]
    Truncated(usize),

    /// The magic bytes do not match.
    #[error("invalid index header magic {0:#010x}")]
    BadMagic(u32),

    /// The format version is unknown.
    #[error("unsupported index header version {0}")]
    UnsupportedVersion(u8),

    /// The payload checksum does not match.
    #[error("index header checksum mismatch")]
    ChecksumMismatch,

    /// The payload could not be decoded.
    #[error("malformed index header payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Reading the file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexHeaderPayload {
    index_version: u32,
    symbols: Vec<String>,
    label_values: BTreeMap<String, Vec<String>>,
}

/// Read-only access to one block's parsed index header.
pub trait IndexHeaderReader: Debug + Send + Sync {
    /// The version of the block index this header was built from.
    fn index_version(&self) -> u32;

    /// The symbol stored at `offset` in the symbol table.
    fn lookup_symbol(&self, offset: u32) -> Option<&str>;

    /// All values of `name` in this block, sorted.
    fn label_values(&self, name: &str) -> Vec<String>;

    /// All label names in this block, sorted.
    fn label_names(&self) -> Vec<String>;
}

/// An index header parsed from its binary file format:
/// `magic (u32 be) | version (u8) | payload len (u32 be) | payload | crc32 (u32 be)`.
#[derive(Debug)]
pub struct StreamBinaryReader {
    payload: IndexHeaderPayload,
}

impl StreamBinaryReader {
    /// Parse the index header at `path`.
    pub fn open(path: &Path) -> Result<Self, IndexHeaderError> {
        Self::decode(&std::fs::read(path)?)
    }

    /// Parse an index header from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, IndexHeaderError> {
        if bytes.len() < 13 {
            return Err(IndexHeaderError::Truncated(bytes.len()));
        }

        let magic = u32::from_be_bytes(bytes[0..4].try_into().expect("sized slice"));
        if magic != INDEX_HEADER_MAGIC {
            return Err(IndexHeaderError::BadMagic(magic));
        }
        let version = bytes[4];
        if version != INDEX_HEADER_VERSION {
            return Err(IndexHeaderError::UnsupportedVersion(version));
        }

        let len = u32::from_be_bytes(bytes[5..9].try_into().expect("sized slice")) as usize;
        if bytes.len() < 9 + len + 4 {
            return Err(IndexHeaderError::Truncated(bytes.len()));
        }
        let payload = &bytes[9..9 + len];
        let checksum = u32::from_be_bytes(
            bytes[9 + len..9 + len + 4]
                .try_into()
                .expect("sized slice"),
        );
        if crc32fast::hash(payload) != checksum {
            return Err(IndexHeaderError::ChecksumMismatch);
        }

        Ok(Self {
            payload: serde_json::from_slice(payload)?,
        })
    }
}

impl IndexHeaderReader for StreamBinaryReader {
    fn index_version(&self) -> u32 {
        self.payload.index_version
    }

    fn lookup_symbol(&self, offset: u32) -> Option<&str> {
        self.payload
            .symbols
            .get(offset as usize)
            .map(|s| s.as_str())
    }

    fn label_values(&self, name: &str) -> Vec<String> {
        self.payload
            .label_values
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn label_names(&self) -> Vec<String> {
        self.payload.label_values.keys().cloned().collect()
    }
}

/// Encode an index header into the binary file format.
///
/// The block writer owns production headers; this encoder backs tests and
/// tooling.
pub fn encode_index_header(
    index_version: u32,
    symbols: impl IntoIterator<Item = String>,
    label_values: impl IntoIterator<Item = (String, Vec<String>)>,
) -> Vec<u8> {
    let payload = IndexHeaderPayload {
        index_version,
        symbols: symbols.into_iter().collect(),
        label_values: label_values.into_iter().collect(),
    };
    let payload = serde_json::to_vec(&payload).expect("serializable payload");

    let mut out = Vec::with_capacity(payload.len() + 13);
    out.extend_from_slice(&INDEX_HEADER_MAGIC.to_be_bytes());
    out.push(INDEX_HEADER_VERSION);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    out
}

/// Builds the underlying reader of a block on (re)load.
#[async_trait]
pub trait IndexHeaderFactory: Debug + Send + Sync {
    /// Fetch and parse the index header of `block_id`.
    async fn build(&self, block_id: Ulid) -> Result<Box<dyn IndexHeaderReader>, DynError>;
}

/// The production factory: downloads `<tenant>/<block>/index-header`
/// into a local staging directory and parses it.
#[derive(Debug)]
pub struct BucketIndexHeaderFactory {
    store: Arc<DynObjectStore>,
    tenant: TenantId,
    local_dir: PathBuf,
}

impl BucketIndexHeaderFactory {
    /// Create a factory staging headers under `local_dir`.
    pub fn new(store: Arc<DynObjectStore>, tenant: TenantId, local_dir: PathBuf) -> Self {
        Self {
            store,
            tenant,
            local_dir,
        }
    }
}

#[async_trait]
impl IndexHeaderFactory for BucketIndexHeaderFactory {
    async fn build(&self, block_id: Ulid) -> Result<Box<dyn IndexHeaderReader>, DynError> {
        let location = ObjectPath::from(format!(
            "{}/{}/{}",
            self.tenant, block_id, INDEX_HEADER_FILENAME
        ));
        let bytes = self.store.get(&location).await?.bytes().await?;

        let dir = self.local_dir.join(block_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let local = dir.join(INDEX_HEADER_FILENAME);
        tokio::fs::write(&local, &bytes).await?;

        Ok(Box::new(StreamBinaryReader::decode(&bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn header_bytes() -> Vec<u8> {
        encode_index_header(
            2,
            ["__name__".to_owned(), "up".to_owned(), "job".to_owned()],
            [
                ("__name__".to_owned(), vec!["up".to_owned()]),
                ("job".to_owned(), vec!["api".to_owned(), "worker".to_owned()]),
            ],
        )
    }

    #[test]
    fn test_round_trip() {
        let reader = StreamBinaryReader::decode(&header_bytes()).unwrap();
        assert_eq!(reader.index_version(), 2);
        assert_eq!(reader.lookup_symbol(1), Some("up"));
        assert_eq!(reader.lookup_symbol(99), None);
        assert_eq!(
            reader.label_values("job"),
            vec!["api".to_owned(), "worker".to_owned()]
        );
        assert_eq!(
            reader.label_names(),
            vec!["__name__".to_owned(), "job".to_owned()]
        );
    }

    #[test]
    fn test_corrupted_payload_is_rejected() {
        let mut bytes = header_bytes();
        let len = bytes.len();
        bytes[len / 2] ^= 0xff;
        assert_matches!(
            StreamBinaryReader::decode(&bytes),
            Err(IndexHeaderError::ChecksumMismatch)
        );
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        assert_matches!(
            StreamBinaryReader::decode(b"tiny"),
            Err(IndexHeaderError::Truncated(4))
        );

        let mut bytes = header_bytes();
        bytes[0] = 0;
        assert_matches!(
            StreamBinaryReader::decode(&bytes),
            Err(IndexHeaderError::BadMagic(_))
        );
    }
}
