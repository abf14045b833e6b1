use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use data_types::{DynError, MultiError};
use serde::{Deserialize, Serialize};

/// The persisted warm set: which block headers were loaded and when they
/// were last used, in unix milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyLoadedState {
    /// The tenant the state belongs to.
    pub tenant: String,
    /// Last-used time per loaded block ULID.
    pub blocks: BTreeMap<String, i64>,
}

/// Atomically persist `state` to `path`.
///
/// Writes a temporary file in the same directory, fsyncs the file, fsyncs
/// the directory, then renames into place, so a crash leaves either the
/// old or the new state but never a torn file.
pub fn persist_lazy_loaded_state(state: &LazyLoadedState, path: &Path) -> Result<(), DynError> {
    let data = serde_json::to_vec(state)?;

    let dir = path
        .parent()
        .ok_or_else(|| format!("snapshot path {} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir)?;
    let tmp_path = path.with_extension("tmp");

    let mut tmp = File::create(&tmp_path)?;
    let mut errors = MultiError::new();
    errors.add(tmp.write_all(&data));
    errors.add(tmp.sync_all());
    drop(tmp);
    if let Err(e) = errors.err() {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    let dir_handle = File::open(dir)?;
    let mut errors = MultiError::new();
    errors.add(dir_handle.sync_all());
    drop(dir_handle);
    if let Err(e) = errors.err() {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a previously persisted state; `None` when no snapshot exists.
pub fn load_lazy_loaded_state(path: &Path) -> Result<Option<LazyLoadedState>, DynError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let tmp = test_helpers::tmp_dir().unwrap();
        let path = tmp.path().join("lazy-loaded.json");

        let state = LazyLoadedState {
            tenant: "t1".to_owned(),
            blocks: [("01H455VB4QEXG68VDK1QHRE1VB".to_owned(), 42_000)]
                .into_iter()
                .collect(),
        };

        persist_lazy_loaded_state(&state, &path).unwrap();
        let loaded = load_lazy_loaded_state(&path).unwrap().unwrap();
        assert_eq!(loaded, state);

        // No stray temporary file is left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let tmp = test_helpers::tmp_dir().unwrap();
        assert_eq!(
            load_lazy_loaded_state(&tmp.path().join("lazy-loaded.json")).unwrap(),
            None
        );
    }

    #[test]
    fn test_overwrite_replaces_atomically() {
        let tmp = test_helpers::tmp_dir().unwrap();
        let path = tmp.path().join("lazy-loaded.json");

        let mut state = LazyLoadedState {
            tenant: "t1".to_owned(),
            blocks: BTreeMap::new(),
        };
        persist_lazy_loaded_state(&state, &path).unwrap();

        state.blocks.insert("01H455VB4QEXG68VDK1QHRE1VB".to_owned(), 1);
        persist_lazy_loaded_state(&state, &path).unwrap();

        assert_eq!(load_lazy_loaded_state(&path).unwrap().unwrap(), state);
    }
}
