// src/whitelist.rs
//
// Lokalna whitelista hashy treści: raz przepuszczony obrazek nie wraca do logów.

use std::{collections::BTreeSet, path::PathBuf};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{error::StoreError, persist, phash::ContentHash};

/// Oba formaty pliku: `["ab12…", …]` albo `{"sha256": ["ab12…", …]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum WhitelistFile {
    Plain(Vec<String>),
    Keyed { sha256: Vec<String> },
}

impl WhitelistFile {
    fn into_set(self) -> BTreeSet<ContentHash> {
        let raw = match self {
            WhitelistFile::Plain(v) => v,
            WhitelistFile::Keyed { sha256 } => sha256,
        };
        raw.iter().filter_map(|s| ContentHash::parse(s)).collect()
    }
}

pub struct ContentWhitelist {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ContentWhitelist {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> BTreeSet<ContentHash> {
        match persist::read_json::<WhitelistFile>(&self.path).await {
            Ok(Some(f)) => f.into_set(),
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                tracing::warn!(error=%e, path=%self.path.display(), "whitelist unreadable, treating as empty");
                BTreeSet::new()
            }
        }
    }

    pub async fn contains(&self, hash: &ContentHash) -> bool {
        self.load().await.contains(hash)
    }

    pub async fn len(&self) -> usize {
        self.load().await.len()
    }

    /// `Ok(false)` gdy hash już był na liście.
    pub async fn add(&self, hash: ContentHash) -> Result<bool, StoreError> {
        let _w = self.write_lock.lock().await;
        let mut set = match persist::read_json::<WhitelistFile>(&self.path).await {
            Ok(f) => f.map(WhitelistFile::into_set).unwrap_or_default(),
            Err(StoreError::Json(e)) => {
                tracing::warn!(error=%e, path=%self.path.display(), "corrupt whitelist moved aside");
                persist::quarantine(&self.path).await;
                BTreeSet::new()
            }
            Err(e) => return Err(e),
        };
        if !set.insert(hash) {
            return Ok(false);
        }
        let out: Vec<&str> = set.iter().map(ContentHash::as_str).collect();
        persist::write_json_atomic(&self.path, &out).await?;
        Ok(true)
    }
}
