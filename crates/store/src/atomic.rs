//! Atomic JSON file helpers shared by every store.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;

use quill_domain::fragment::random_suffix;
use quill_domain::{Error, Result};

/// Write `value` as pretty JSON to `path` atomically: serialize to a
/// sibling `<name>.tmp-<millis>-<rand>` file, then rename over the
/// target. The parent directory is created when missing.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Storage(format!("no parent directory: {}", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Storage(format!("no file name: {}", path.display())))?
        .to_string_lossy();
    let tmp = parent.join(format!("{file_name}.tmp-{millis}-{}", random_suffix(6)));

    let bytes = serde_json::to_vec_pretty(value)?;
    if let Err(e) = std::fs::write(&tmp, &bytes) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Read and parse a JSON file. Absent or unparseable files read as
/// `None`; parse failures are warn-logged so corrupt documents are
/// visible without failing the caller.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read JSON file");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unparseable JSON file skipped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        write_json_atomic(&path, &json!({"a": 1})).unwrap();
        let v: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn no_tmp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_json_atomic(&path, &json!({"a": 1})).unwrap();
        write_json_atomic(&path, &json!({"a": 2})).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["doc.json"]);
    }

    #[test]
    fn absent_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let v: Option<serde_json::Value> = read_json(&dir.path().join("missing.json"));
        assert!(v.is_none());
    }

    #[test]
    fn corrupt_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let v: Option<serde_json::Value> = read_json(&path);
        assert!(v.is_none());
    }
}
