// Wspólne zaślepki dla testów integracyjnych: platforma w pamięci + obrazki PNG.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::Cursor,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use tempfile::TempDir;

use tigris_phishguard::{
    config::PhishGuardConfig,
    error::PlatformError,
    guard::PhishGuard,
    platform::{
        AttachmentMeta, HistoryMessage, LogDestination, LogEntry, MessageRef, ModerationApi,
    },
};

pub const GUILD: u64 = 1000;
pub const REF_THREAD: u64 = 77;

#[derive(Default)]
pub struct MockApi {
    pub thread: Option<u64>,
    pub log_parent: Option<u64>,
    pub history: Mutex<Vec<HistoryMessage>>,
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_ban: bool,
    pub ban_delay: Option<Duration>,
    pub ban_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
    pub thread_calls: AtomicUsize,
    pub bans: Mutex<Vec<(u64, u64, u8, String)>>,
    pub deleted: Mutex<Vec<(u64, u64)>>,
    /// Id wpisu = pozycja na tej liście + 1.
    pub logs: Mutex<Vec<(LogDestination, LogEntry)>>,
    pub deleted_logs: Mutex<Vec<MessageRef>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread(mut self, id: u64) -> Self {
        self.thread = Some(id);
        self
    }

    pub fn failing_bans(mut self) -> Self {
        self.fail_ban = true;
        self
    }

    /// Ban odpowiada dopiero po `delay`.
    pub fn slow_bans(mut self, delay: Duration) -> Self {
        self.ban_delay = Some(delay);
        self
    }

    pub fn with_log_channel(mut self, id: u64) -> Self {
        self.log_parent = Some(id);
        self
    }

    /// Wiadomość w wątku referencyjnym z jednym załącznikiem.
    pub fn push_reference(&self, message_id: u64, bytes: Vec<u8>) {
        let att = self.attachment(message_id, "ref.png", bytes);
        self.history
            .lock()
            .unwrap()
            .push(HistoryMessage { id: message_id, attachments: vec![att] });
    }

    /// Rejestruje bajty pod unikalnym URL-em i zwraca metadane.
    pub fn attachment(&self, id: u64, filename: &str, bytes: Vec<u8>) -> AttachmentMeta {
        let url = format!("mock://{id}/{filename}");
        let size = bytes.len() as u64;
        self.blobs.lock().unwrap().insert(url.clone(), bytes);
        AttachmentMeta {
            id,
            filename: filename.into(),
            content_type: None,
            size,
            url,
        }
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn ban_count(&self) -> usize {
        self.bans.lock().unwrap().len()
    }

    /// Id wiadomości logów wysłanych w dane miejsce.
    pub fn log_ids_to(&self, dest: LogDestination) -> Vec<u64> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, (d, _))| *d == dest)
            .map(|(i, _)| i as u64 + 1)
            .collect()
    }

    pub fn deleted_log_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.deleted_logs.lock().unwrap().iter().map(|m| m.message_id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn logs_to(&self, dest: LogDestination) -> Vec<LogEntry> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| *d == dest)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl ModerationApi for MockApi {
    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        delete_message_days: u8,
        reason: &str,
    ) -> Result<(), PlatformError> {
        self.ban_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.ban_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_ban {
            return Err(PlatformError::PermissionDenied("ban".into()));
        }
        self.bans
            .lock()
            .unwrap()
            .push((guild_id, user_id, delete_message_days, reason.to_string()));
        Ok(())
    }

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), PlatformError> {
        self.deleted.lock().unwrap().push((channel_id, message_id));
        Ok(())
    }

    async fn send_log(
        &self,
        _guild_id: u64,
        dest: LogDestination,
        entry: &LogEntry,
    ) -> Result<Option<MessageRef>, PlatformError> {
        let mut logs = self.logs.lock().unwrap();
        logs.push((dest, entry.clone()));
        Ok(Some(MessageRef {
            channel_id: 5,
            message_id: logs.len() as u64,
        }))
    }

    async fn delete_log(&self, msg: MessageRef) -> Result<(), PlatformError> {
        self.deleted_logs.lock().unwrap().push(msg);
        Ok(())
    }

    async fn log_channel(&self, _guild_id: u64) -> Result<Option<u64>, PlatformError> {
        Ok(self.log_parent)
    }

    async fn reference_thread(&self, _guild_id: u64, _name: &str) -> Result<Option<u64>, PlatformError> {
        self.thread_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.thread)
    }

    async fn fetch_history(
        &self,
        _channel_id: u64,
        limit: u8,
        after: Option<u64>,
    ) -> Result<Vec<HistoryMessage>, PlatformError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let mut page: Vec<HistoryMessage> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|m| after.is_none_or(|a| m.id > a))
            .cloned()
            .collect();
        page.sort_by_key(|m| m.id);
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn read_attachment(&self, attachment: &AttachmentMeta) -> Result<Vec<u8>, PlatformError> {
        self.blobs
            .lock()
            .unwrap()
            .get(&attachment.url)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(attachment.url.clone()))
    }
}

/// Szachownica 8×8 pól o pseudolosowej jasności; `invert` odwraca jasność.
pub fn noise_image(seed: u64, size: u32, invert: bool) -> DynamicImage {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    let mut cells = [0u8; 64];
    for c in cells.iter_mut() {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        *c = (state >> 56) as u8;
    }
    let cell = (size / 8).max(1);
    let img = GrayImage::from_fn(size, size, |x, y| {
        let cx = (x / cell).min(7) as usize;
        let cy = (y / cell).min(7) as usize;
        let v = cells[cy * 8 + cx];
        Luma([if invert { 255 - v } else { v }])
    });
    DynamicImage::ImageLuma8(img)
}

pub fn png(img: &DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// Obrazek z jednolitym białym paskiem u góry (górny rząd kafelków 3×3).
pub fn banner_image(seed: u64, invert: bool) -> DynamicImage {
    let body = noise_image(seed, 96, invert).to_luma8();
    let img = GrayImage::from_fn(96, 96, |x, y| {
        if y < 32 { Luma([255]) } else { *body.get_pixel(x, y) }
    });
    DynamicImage::ImageLuma8(img)
}

pub fn noise_png(seed: u64) -> Vec<u8> {
    png(&noise_image(seed, 96, false))
}

/// Konfiguracja z plikami w katalogu tymczasowym.
pub fn config_in(dir: &TempDir, actor: &str) -> PhishGuardConfig {
    PhishGuardConfig {
        actor_name: actor.into(),
        signatures_path: dir.path().join("blacklist.json").to_string_lossy().into_owned(),
        whitelist_path: dir.path().join("whitelist.json").to_string_lossy().into_owned(),
        ..Default::default()
    }
}

pub fn guard_with(api: &Arc<MockApi>, cfg: PhishGuardConfig) -> PhishGuard {
    PhishGuard::builder(cfg, api.clone()).build()
}
