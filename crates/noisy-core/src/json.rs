//! JSON files that are replaced atomically.

use std::fs;
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Prefix of the hidden sibling a file is staged under before the rename
pub const TMP_PREFIX: &str = ".tmp-";

/// Writes `value` as pretty JSON to a temporary sibling, then renames it
/// over `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Serialization(format!("Failed to serialize {:?}: {}", path, e)))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::InvalidArgument(format!("not a file path: {:?}", path)))?;
    let tmp = path.with_file_name(format!("{TMP_PREFIX}{file_name}"));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = fs::read_to_string(path)?;
    serde_json::from_str(&json)
        .map_err(|e| Error::Serialization(format!("Failed to deserialize {:?}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_write_json_atomic_replaces_file() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("values.json");
        write_json_atomic(&path, &BTreeMap::from([("epoch", 1)]))?;
        write_json_atomic(&path, &BTreeMap::from([("epoch", 2)]))?;

        let loaded: BTreeMap<String, usize> = read_json(&path)?;
        assert_eq!(loaded["epoch"], 2);
        assert!(!path.with_file_name(".tmp-values.json").exists());
        Ok(())
    }

    #[test]
    fn test_read_json_reports_bad_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        let err = read_json::<BTreeMap<String, usize>>(&path).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
