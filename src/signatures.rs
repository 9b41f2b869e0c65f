// src/signatures.rs
//
// Czarna lista sygnatur obrazków (plik JSON). Plik czytany przy każdym sprawdzeniu,
// zapisywany w całości; zapisy idą jeden po drugim.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    error::{HashError, StoreError},
    persist,
    phash::{self, FLAT_REGION, HASH_BITS, ImageHashes, hamming},
    pipeline::{ConfidenceSource, Sample},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSignature {
    pub phash: u64,
    pub dhash: u64,
    pub ahash: u64,
    #[serde(default)]
    pub regions: Vec<u64>,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub added_by: String,
    #[serde(default = "Utc::now")]
    pub added_at: DateTime<Utc>,
}

impl ImageSignature {
    pub fn from_hashes(h: &ImageHashes, note: &str, added_by: &str) -> Self {
        Self {
            phash: h.phash,
            dhash: h.dhash,
            ahash: h.ahash,
            regions: h.regions.clone(),
            note: note.to_string(),
            added_by: added_by.to_string(),
            added_at: Utc::now(),
        }
    }

    fn same_hashes(&self, other: &ImageSignature) -> bool {
        self.phash == other.phash
            && self.dhash == other.dhash
            && self.ahash == other.ahash
            && self.regions == other.regions
    }
}

/// Progi Hamminga dla dopasowań.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchThresholds {
    pub phash_max: u32,
    pub dhash_max: u32,
    pub ahash_max: u32,
    pub region_min_hits: usize,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            phash_max: 16,
            dhash_max: 12,
            ahash_max: 12,
            region_min_hits: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Phash,
    DhashAhash,
    /// `hits` z `tiles` kafelków siatki.
    Regions { hits: usize, tiles: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignatureMatch {
    pub kind: MatchKind,
    /// Dystans, z którego liczymy pewność (pHash, dHash albo najlepszy region).
    pub distance: u32,
    pub signature: ImageSignature,
}

impl SignatureMatch {
    /// Dopasowanie po regionach waży tyle, jaka część siatki się zgadza,
    /// więc wycinek nigdy nie przebije całego obrazka.
    pub fn confidence(&self) -> f64 {
        let base = confidence_from_distance(self.distance);
        match self.kind {
            MatchKind::Regions { hits, tiles } if tiles > 0 => base * hits as f64 / tiles as f64,
            _ => base,
        }
    }
}

/// `1 - d/64`, obcięte do [0, 1].
pub fn confidence_from_distance(distance: u32) -> f64 {
    (1.0 - distance as f64 / HASH_BITS as f64).clamp(0.0, 1.0)
}

/// Czy próbka pasuje do sygnatury; zwraca rodzaj dopasowania i dystans.
pub fn match_signature(
    sample: &ImageHashes,
    sig: &ImageSignature,
    th: &MatchThresholds,
) -> Option<(MatchKind, u32)> {
    let dp = hamming(sample.phash, sig.phash);
    if dp <= th.phash_max {
        return Some((MatchKind::Phash, dp));
    }

    let dd = hamming(sample.dhash, sig.dhash);
    let da = hamming(sample.ahash, sig.ahash);
    if dd <= th.dhash_max && da <= th.ahash_max {
        return Some((MatchKind::DhashAhash, dd));
    }

    // regiony: para i-ty z i-tym, próg jak dla dHash; inna siatka → nie porównujemy
    if sample.regions.len() != sig.regions.len() {
        return None;
    }
    let hits: Vec<u32> = sample
        .regions
        .iter()
        .zip(sig.regions.iter())
        .filter(|(a, b)| **a != FLAT_REGION && **b != FLAT_REGION)
        .map(|(a, b)| hamming(*a, *b))
        .filter(|d| *d <= th.dhash_max)
        .collect();
    if th.region_min_hits > 0 && hits.len() >= th.region_min_hits {
        let best = hits.iter().copied().min().unwrap_or(th.dhash_max);
        let kind = MatchKind::Regions {
            hits: hits.len(),
            tiles: sig.regions.len(),
        };
        return Some((kind, best));
    }
    None
}

/// Najlepsze (najpewniejsze) dopasowanie z listy; remis → wcześniejszy wpis.
pub fn best_match_in(
    sample: &ImageHashes,
    list: &[ImageSignature],
    th: &MatchThresholds,
) -> Option<SignatureMatch> {
    let mut best: Option<SignatureMatch> = None;
    for sig in list {
        if let Some((kind, distance)) = match_signature(sample, sig, th) {
            let m = SignatureMatch {
                kind,
                distance,
                signature: sig.clone(),
            };
            if best.as_ref().is_none_or(|b| m.confidence() > b.confidence()) {
                best = Some(m);
            }
        }
    }
    best
}

/* ===========================
   Store
   =========================== */

pub struct SignatureStore {
    path: PathBuf,
    thresholds: MatchThresholds,
    grid: u32,
    write_lock: Mutex<()>,
}

impl SignatureStore {
    pub fn new(path: impl Into<PathBuf>, thresholds: MatchThresholds, grid: u32) -> Self {
        Self {
            path: path.into(),
            thresholds,
            grid,
            write_lock: Mutex::new(()),
        }
    }

    /// Brak / uszkodzony plik → pusta lista (z ostrzeżeniem).
    pub async fn load(&self) -> Vec<ImageSignature> {
        match persist::read_json::<Vec<ImageSignature>>(&self.path).await {
            Ok(Some(list)) => list,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(error=%e, path=%self.path.display(), "signature store unreadable, treating as empty");
                Vec::new()
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.load().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn best_match(&self, sample: &ImageHashes) -> Option<SignatureMatch> {
        let list = self.load().await;
        best_match_in(sample, &list, &self.thresholds)
    }

    /// Niedekodowalne bajty nigdy nie są na czarnej liście.
    pub async fn is_blacklisted(&self, bytes: &[u8]) -> bool {
        match self.hash(bytes).await {
            Ok(h) => self.best_match(&h).await.is_some(),
            Err(e) => {
                tracing::debug!(error=%e, "is_blacklisted: no hashes");
                false
            }
        }
    }

    pub async fn add(
        &self,
        bytes: &[u8],
        note: &str,
        added_by: &str,
    ) -> Result<ImageSignature, StoreError> {
        let hashes = self.hash(bytes).await?;
        self.add_hashes(&hashes, note, added_by).await
    }

    /// Dopisuje sygnaturę. Identyczne hashe nie są dublowane.
    pub async fn add_hashes(
        &self,
        hashes: &ImageHashes,
        note: &str,
        added_by: &str,
    ) -> Result<ImageSignature, StoreError> {
        let _w = self.write_lock.lock().await;
        let mut list = self.load_for_write().await?;
        let sig = ImageSignature::from_hashes(hashes, note, added_by);
        if let Some(existing) = list.iter().find(|s| s.same_hashes(&sig)) {
            return Ok(existing.clone());
        }
        list.push(sig.clone());
        persist::write_json_atomic(&self.path, &list).await?;
        tracing::info!(phash = sig.phash, note, added_by, total = list.len(), "signature added");
        Ok(sig)
    }

    /// Usuwa wszystkie wpisy o danym pHash. Zwraca ile usunięto.
    pub async fn remove_phash(&self, phash: u64) -> Result<usize, StoreError> {
        let _w = self.write_lock.lock().await;
        let mut list = self.load_for_write().await?;
        let before = list.len();
        list.retain(|s| s.phash != phash);
        let removed = before - list.len();
        if removed > 0 {
            persist::write_json_atomic(&self.path, &list).await?;
            tracing::info!(phash, removed, "signatures removed");
        }
        Ok(removed)
    }

    async fn load_for_write(&self) -> Result<Vec<ImageSignature>, StoreError> {
        match persist::read_json::<Vec<ImageSignature>>(&self.path).await {
            Ok(list) => Ok(list.unwrap_or_default()),
            Err(StoreError::Json(e)) => {
                tracing::warn!(error=%e, path=%self.path.display(), "corrupt signature store moved aside");
                persist::quarantine(&self.path).await;
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn hash(&self, bytes: &[u8]) -> Result<ImageHashes, HashError> {
        phash::hash_all_blocking(bytes.to_vec(), self.grid).await
    }
}

#[async_trait]
impl ConfidenceSource for SignatureStore {
    fn name(&self) -> &str {
        "signature_store"
    }

    async fn score(&self, sample: &Sample<'_>) -> Option<f64> {
        self.best_match(sample.hashes).await.map(|m| m.confidence())
    }
}
