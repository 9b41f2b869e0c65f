// src/reference.rs
//
// Indeks referencyjny: SHA-256 każdego załącznika z wątku moderatorów.
// Jeden wpis na gildię, ważny przez TTL; po wygaśnięciu przebudowa synchroniczna
// (wołający czeka), najwyżej jedna naraz na gildię.

use std::{collections::HashSet, sync::Arc, time::Duration};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time::Instant};

use crate::{
    phash::ContentHash,
    platform::{ModerationApi, with_timeout},
};

const PAGE_SIZE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub thread_name: String,
    pub cache_minutes: u64,
    /// Twardy limit skanowanych wiadomości.
    pub max_messages: usize,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            thread_name: "imagephising".into(),
            cache_minutes: 15,
            max_messages: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceIndex {
    /// Wątek, z którego zbudowano indeks (brak wątku → `None`).
    pub thread_id: Option<u64>,
    pub hashes: HashSet<ContentHash>,
    pub count: usize,
    pub built_at: Instant,
}

impl ReferenceIndex {
    fn empty() -> Self {
        Self {
            thread_id: None,
            hashes: HashSet::new(),
            count: 0,
            built_at: Instant::now(),
        }
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.hashes.contains(hash)
    }
}

pub struct ReferenceIndexCache {
    api: Arc<dyn ModerationApi>,
    cfg: ReferenceConfig,
    ttl: Duration,
    max_attachment_bytes: u64,
    call_timeout: Duration,
    entries: DashMap<u64, Arc<ReferenceIndex>>,
    build_locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl ReferenceIndexCache {
    pub fn new(
        api: Arc<dyn ModerationApi>,
        cfg: ReferenceConfig,
        max_attachment_bytes: u64,
        call_timeout: Duration,
    ) -> Self {
        let ttl = Duration::from_secs(cfg.cache_minutes.saturating_mul(60));
        Self {
            api,
            cfg,
            ttl,
            max_attachment_bytes,
            call_timeout,
            entries: DashMap::new(),
            build_locks: DashMap::new(),
        }
    }

    pub async fn get_index(&self, guild_id: u64) -> Arc<ReferenceIndex> {
        if let Some(idx) = self.fresh(guild_id) {
            return idx;
        }

        let lock = self
            .build_locks
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _g = lock.lock().await;

        // ktoś mógł przebudować, kiedy czekaliśmy
        if let Some(idx) = self.fresh(guild_id) {
            return idx;
        }

        let started = Instant::now();
        let idx = Arc::new(self.build(guild_id).await);
        tracing::info!(
            guild_id,
            count = idx.count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reference index rebuilt"
        );
        self.entries.insert(guild_id, idx.clone());
        idx
    }

    /// Wymusza przebudowę przy następnym dostępie.
    pub fn invalidate(&self, guild_id: u64) {
        self.entries.remove(&guild_id);
    }

    /// Rozmiar zbudowanego indeksu (bez budowania).
    pub fn cached_count(&self, guild_id: u64) -> Option<usize> {
        self.entries.get(&guild_id).map(|e| e.count)
    }

    /// Id wątku referencyjnego z ostatniej budowy, bez odpytywania platformy.
    pub fn cached_thread(&self, guild_id: u64) -> Option<u64> {
        self.entries.get(&guild_id).and_then(|e| e.thread_id)
    }

    fn fresh(&self, guild_id: u64) -> Option<Arc<ReferenceIndex>> {
        let e = self.entries.get(&guild_id)?;
        (e.built_at.elapsed() <= self.ttl).then(|| e.clone())
    }

    async fn build(&self, guild_id: u64) -> ReferenceIndex {
        let thread = match with_timeout(
            self.call_timeout,
            self.api.reference_thread(guild_id, &self.cfg.thread_name),
        )
        .await
        {
            Ok(Some(t)) => t,
            Ok(None) => {
                tracing::debug!(guild_id, thread = %self.cfg.thread_name, "reference thread not found");
                return ReferenceIndex::empty();
            }
            Err(e) => {
                tracing::warn!(error=%e, guild_id, "reference thread lookup failed");
                return ReferenceIndex::empty();
            }
        };

        let mut hashes = HashSet::new();
        let mut scanned = 0usize;
        let mut after: Option<u64> = None;

        while scanned < self.cfg.max_messages {
            let want = (self.cfg.max_messages - scanned).min(PAGE_SIZE as usize) as u8;
            let page = match with_timeout(
                self.call_timeout,
                self.api.fetch_history(thread, want, after),
            )
            .await
            {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error=%e, guild_id, scanned, "reference history page failed, index truncated");
                    break;
                }
            };
            if page.is_empty() {
                break;
            }

            for msg in &page {
                for att in &msg.attachments {
                    if att.size > self.max_attachment_bytes {
                        continue;
                    }
                    match with_timeout(self.call_timeout, self.api.read_attachment(att)).await {
                        Ok(bytes) => {
                            hashes.insert(ContentHash::of(&bytes));
                        }
                        Err(e) => {
                            tracing::debug!(error=%e, attachment = att.id, "reference attachment skipped");
                        }
                    }
                }
            }

            scanned += page.len();
            after = page.iter().map(|m| m.id).max();
            if page.len() < want as usize {
                break;
            }
        }

        ReferenceIndex {
            thread_id: Some(thread),
            count: hashes.len(),
            hashes,
            built_at: Instant::now(),
        }
    }
}
