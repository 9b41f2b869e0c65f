// src/phash.rs
//
// Hashe percepcyjne (pHash / dHash / aHash + siatka regionów) i hash treści (SHA-256).
// Wszystko tutaj to czyste funkcje bajtów; wersje async odpalają się na spawn_blocking.

use std::{fmt, io::Cursor, sync::Arc, time::Duration};

use image::{DynamicImage, ImageReader, Limits, imageops::FilterType};
use moka::sync::Cache;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task;

use crate::error::HashError;

/// Domyślna siatka regionów (3×3).
pub const DEFAULT_GRID: u32 = 3;
/// Szerokość wszystkich hashy percepcyjnych w bitach.
pub const HASH_BITS: u32 = 64;

/// Znacznik kafelka bez treści (jednolite tło, marginesy). Prawdziwy pHash
/// kafelka z treścią ma zawsze ~32 ustawione bity, więc zero się nie myli.
pub const FLAT_REGION: u64 = 0;

const MAX_IMAGE_DIMENSION: u32 = 8192;
/// Wariancja jasności (0..255), poniżej której kafelek uznajemy za płaski.
const FLAT_VARIANCE: f64 = 25.0;
const PHASH_SIZE: usize = 32;
const PHASH_LOW: usize = 8;

/* ===========================
   Typy
   =========================== */

/// Komplet hashy jednego obrazka.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHashes {
    pub phash: u64,
    pub dhash: u64,
    pub ahash: u64,
    /// pHash każdego kafelka siatki N×N, wierszami; płaskie kafelki to [`FLAT_REGION`].
    pub regions: Vec<u64>,
}

/// SHA-256 surowych bajtów, hex małymi literami.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Przyjmuje 64 znaki hex (dowolna wielkość liter).
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Skrót do embedów.
    pub fn short(&self) -> &str {
        &self.0[..16.min(self.0.len())]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Liczba różniących się bitów.
#[inline]
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/* ===========================
   Dekodowanie + hashe
   =========================== */

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, HashError> {
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_IMAGE_DIMENSION);
    limits.max_image_height = Some(MAX_IMAGE_DIMENSION);

    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| HashError::Decode(e.to_string()))?;
    reader.limits(limits);
    reader.decode().map_err(|e| HashError::Decode(e.to_string()))
}

pub fn hash_all(bytes: &[u8]) -> Result<ImageHashes, HashError> {
    hash_all_with_grid(bytes, DEFAULT_GRID)
}

pub fn hash_all_with_grid(bytes: &[u8], grid: u32) -> Result<ImageHashes, HashError> {
    let img = decode(bytes)?;
    Ok(hash_image(&img, grid))
}

pub fn hash_image(img: &DynamicImage, grid: u32) -> ImageHashes {
    let gray = DynamicImage::ImageLuma8(img.to_luma8());
    ImageHashes {
        phash: phash(&gray),
        dhash: dhash(&gray),
        ahash: ahash(&gray),
        regions: region_hashes(&gray, grid),
    }
}

/// To samo co [`hash_all_with_grid`], ale poza wątkami runtime'u.
pub async fn hash_all_blocking(bytes: Vec<u8>, grid: u32) -> Result<ImageHashes, HashError> {
    task::spawn_blocking(move || hash_all_with_grid(&bytes, grid))
        .await
        .map_err(|e| HashError::Task(e.to_string()))?
}

/// aHash: 8×8, bit = piksel jaśniejszy niż średnia.
pub fn ahash(img: &DynamicImage) -> u64 {
    let small = img.resize_exact(8, 8, FilterType::Triangle).to_luma8();
    let px: Vec<u64> = small.pixels().map(|p| p.0[0] as u64).collect();
    let sum: u64 = px.iter().sum();
    let mut bits = 0u64;
    for (i, &v) in px.iter().enumerate() {
        // v > sum/64 bez dzielenia całkowitego
        if v * 64 > sum {
            bits |= 1u64 << i;
        }
    }
    bits
}

/// dHash: 9×8, bit = jasność rośnie w prawo.
pub fn dhash(img: &DynamicImage) -> u64 {
    let small = img.resize_exact(9, 8, FilterType::Triangle).to_luma8();
    let mut bits = 0u64;
    for y in 0..8u32 {
        for x in 0..8u32 {
            let left = small.get_pixel(x, y).0[0];
            let right = small.get_pixel(x + 1, y).0[0];
            if right > left {
                bits |= 1u64 << (y * 8 + x);
            }
        }
    }
    bits
}

static DCT_COS: Lazy<[[f64; PHASH_SIZE]; PHASH_LOW]> = Lazy::new(|| {
    let mut t = [[0.0; PHASH_SIZE]; PHASH_LOW];
    for (k, row) in t.iter_mut().enumerate() {
        for (n, v) in row.iter_mut().enumerate() {
            *v = (std::f64::consts::PI * (2 * n + 1) as f64 * k as f64
                / (2 * PHASH_SIZE) as f64)
                .cos();
        }
    }
    t
});

/// pHash: 32×32, DCT-II, lewy górny blok 8×8 porównany z jego medianą.
pub fn phash(img: &DynamicImage) -> u64 {
    let small = img
        .resize_exact(PHASH_SIZE as u32, PHASH_SIZE as u32, FilterType::Lanczos3)
        .to_luma8();

    let mut px = [[0.0f64; PHASH_SIZE]; PHASH_SIZE];
    for (x, y, p) in small.enumerate_pixels() {
        px[y as usize][x as usize] = p.0[0] as f64;
    }

    // DCT po wierszach, tylko niskie częstotliwości
    let mut rows = [[0.0f64; PHASH_LOW]; PHASH_SIZE];
    for y in 0..PHASH_SIZE {
        for u in 0..PHASH_LOW {
            rows[y][u] = (0..PHASH_SIZE).map(|x| px[y][x] * DCT_COS[u][x]).sum();
        }
    }
    // ...i po kolumnach
    let mut low = [0.0f64; PHASH_LOW * PHASH_LOW];
    for v in 0..PHASH_LOW {
        for u in 0..PHASH_LOW {
            low[v * PHASH_LOW + u] = (0..PHASH_SIZE).map(|y| rows[y][u] * DCT_COS[v][y]).sum();
        }
    }

    let mut sorted = low;
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    let median = (sorted[mid - 1] + sorted[mid]) / 2.0;

    let mut bits = 0u64;
    for (i, &c) in low.iter().enumerate() {
        if c > median {
            bits |= 1u64 << i;
        }
    }
    bits
}

/// pHash kafelków siatki grid×grid. Obrazek mniejszy niż siatka → brak regionów.
pub fn region_hashes(img: &DynamicImage, grid: u32) -> Vec<u64> {
    let (w, h) = (img.width(), img.height());
    if grid == 0 || w < grid || h < grid {
        return Vec::new();
    }
    let (tw, th) = (w / grid, h / grid);
    let mut out = Vec::with_capacity((grid * grid) as usize);
    for row in 0..grid {
        for col in 0..grid {
            let tile = img.crop_imm(col * tw, row * th, tw, th);
            if is_flat(&tile) {
                out.push(FLAT_REGION);
            } else {
                out.push(phash(&tile));
            }
        }
    }
    out
}

/// Jednolity kafelek: pHash takiego to szum zmiennoprzecinkowy, nie treść.
fn is_flat(tile: &DynamicImage) -> bool {
    let luma = tile.to_luma8();
    let n = luma.pixels().len();
    if n == 0 {
        return true;
    }
    let (sum, sq) = luma.pixels().fold((0.0f64, 0.0f64), |(s, q), p| {
        let v = p.0[0] as f64;
        (s + v, q + v * v)
    });
    let mean = sum / n as f64;
    sq / n as f64 - mean * mean < FLAT_VARIANCE
}

/* ===========================
   Pamięć podręczna hashy
   =========================== */

/// Zapamiętane hashe per hash treści, żeby powtórne skany tego samego
/// załącznika nie liczyły DCT od nowa.
#[derive(Clone)]
pub struct HashMemo {
    cache: Cache<ContentHash, Arc<ImageHashes>>,
    grid: u32,
}

impl HashMemo {
    pub fn new(capacity: u64, ttl: Duration, grid: u32) -> Self {
        Self {
            cache: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(capacity)
                .build(),
            grid,
        }
    }

    pub async fn get_or_compute(
        &self,
        key: &ContentHash,
        bytes: &[u8],
    ) -> Result<Arc<ImageHashes>, HashError> {
        if let Some(h) = self.cache.get(key) {
            return Ok(h);
        }
        let h = Arc::new(hash_all_blocking(bytes.to_vec(), self.grid).await?);
        self.cache.insert(key.clone(), h.clone());
        Ok(h)
    }
}
