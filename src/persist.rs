#![forbid(unsafe_code)]

//! Small filesystem helpers shared by the manifest, report and sidecar
//! writers.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

/// Writes `contents` to a temp file next to `path` and renames it into place,
/// so readers never observe a half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temp file in {}", parent.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("writing temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("syncing temp file for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("renaming temp file onto {}", path.display()))?;
    Ok(())
}

pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let payload =
        serde_yaml::to_string(value).with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, payload.as_bytes())
}

/// Reads a YAML document, returning `None` when the file does not exist.
/// An empty file deserializes as `None` as well.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let value =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Deletes a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_creates_parents_and_replaces() -> Result<()> {
        let dir = tempdir()?;
        let target = dir.path().join("nested").join("file.txt");
        write_atomic(&target, b"one")?;
        write_atomic(&target, b"two")?;
        assert_eq!(fs::read_to_string(&target)?, "two");
        let leftovers = fs::read_dir(target.parent().unwrap())?.count();
        assert_eq!(leftovers, 1);
        Ok(())
    }

    #[test]
    fn read_yaml_missing_and_empty_files_are_none() -> Result<()> {
        let dir = tempdir()?;
        let missing: Option<BTreeMap<String, u32>> = read_yaml(&dir.path().join("nope.yml"))?;
        assert!(missing.is_none());
        let empty = dir.path().join("empty.yml");
        fs::write(&empty, "\n")?;
        let parsed: Option<BTreeMap<String, u32>> = read_yaml(&empty)?;
        assert!(parsed.is_none());
        Ok(())
    }

    #[test]
    fn yaml_roundtrip_through_atomic_write() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("value.yml");
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u32);
        write_yaml(&path, &map)?;
        let back: BTreeMap<String, u32> = read_yaml(&path)?.unwrap();
        assert_eq!(back, map);
        Ok(())
    }

    #[test]
    fn remove_if_exists_ignores_missing_files() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("gone.tmp");
        remove_if_exists(&path)?;
        fs::write(&path, "x")?;
        remove_if_exists(&path)?;
        assert!(!path.exists());
        Ok(())
    }
}
