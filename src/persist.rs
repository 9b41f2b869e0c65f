// src/persist.rs
//
// Pliki JSON zapisywane w całości: odczyt + atomowy zapis (tmp + rename).

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};
use tokio::task;

use crate::error::StoreError;

/// `Ok(None)` gdy pliku nie ma.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let raw = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&raw)?))
}

pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(value)?;
    let path = path.to_path_buf();
    task::spawn_blocking(move || -> Result<(), StoreError> {
        let dir = parent_dir(&path);
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Task(e.to_string()))?
}

/// Uszkodzony plik odkładamy obok jako `<nazwa>.corrupt`, żeby następny zapis go nie zjadł.
pub(crate) async fn quarantine(path: &Path) {
    let mut target = path.as_os_str().to_owned();
    target.push(".corrupt");
    if let Err(e) = tokio::fs::rename(path, PathBuf::from(target)).await {
        tracing::warn!(error=?e, path=%path.display(), "quarantine of corrupt store failed");
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
