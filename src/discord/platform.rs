// src/discord/platform.rs
//
// ModerationApi na serenity. Kanał logów i wątki są cache'owane per gildia;
// brakujący wątek logów zakładamy sami, wątku referencyjnego nigdy.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use serenity::all::{
    AutoArchiveDuration, ChannelId, ChannelType, Colour, CreateEmbed, CreateEmbedFooter,
    CreateMessage, CreateThread, GetMessages, GuildId, Http, MessageId, UserId,
};
use url::Url;

use crate::{
    config::LogsConfig,
    discord::logs::{pick_log_channel, pick_thread, thread_name_for},
    error::PlatformError,
    platform::{AttachmentMeta, HistoryMessage, LogDestination, LogEntry, MessageRef, ModerationApi},
};

/* ===========================
   HTTP (pobieranie załączników)
   =========================== */

static HTTP: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .user_agent("Tigris-PhishGuard/1.0")
        .connect_timeout(Duration::from_millis(1500))
        .timeout(Duration::from_secs(10))
        .redirect(reqwest::redirect::Policy::limited(3))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

pub fn host_is_discord_cdn(url: &str) -> bool {
    let Ok(u) = Url::parse(url) else {
        return false;
    };
    if u.scheme() != "https" {
        return false;
    }
    matches!(
        u.host_str().map(|h| h.to_ascii_lowercase()).as_deref(),
        Some("cdn.discordapp.com" | "media.discordapp.net")
    )
}

/// Pobiera załącznik z CDN Discorda, przerywając po przekroczeniu `max_bytes`.
pub async fn download_attachment(att: &AttachmentMeta, max_bytes: u64) -> Result<Vec<u8>, PlatformError> {
    if !host_is_discord_cdn(&att.url) {
        return Err(PlatformError::Rejected(format!("untrusted host: {}", att.url)));
    }
    if att.size > max_bytes {
        return Err(PlatformError::Rejected(format!("attachment too large: {} B", att.size)));
    }

    let resp = HTTP
        .get(&att.url)
        .send()
        .await
        .map_err(|e| PlatformError::Transient(e.to_string()))?;

    // finalny URL po redirectach też musi być z CDN
    if !host_is_discord_cdn(resp.url().as_str()) {
        return Err(PlatformError::Rejected("redirected off CDN".into()));
    }
    match resp.status().as_u16() {
        200..=299 => {}
        403 => return Err(PlatformError::PermissionDenied(att.url.clone())),
        404 => return Err(PlatformError::NotFound(att.url.clone())),
        s => return Err(PlatformError::Transient(format!("cdn status {s}"))),
    }
    if resp.content_length().is_some_and(|len| len > max_bytes) {
        return Err(PlatformError::Rejected("content-length over limit".into()));
    }

    let mut stream = resp.bytes_stream();
    let mut bytes: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| PlatformError::Transient(e.to_string()))?;
        if (bytes.len() + chunk.len()) as u64 > max_bytes {
            return Err(PlatformError::Rejected("body over limit".into()));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// 403 → brak uprawnień, 404 → nie ma, reszta → przejściowy błąd.
pub fn map_serenity_error(e: serenity::Error) -> PlatformError {
    if let serenity::Error::Http(serenity::http::HttpError::UnsuccessfulRequest(resp)) = &e {
        match resp.status_code.as_u16() {
            403 => return PlatformError::PermissionDenied(resp.error.message.clone()),
            404 => return PlatformError::NotFound(resp.error.message.clone()),
            _ => {}
        }
    }
    PlatformError::Transient(e.to_string())
}

pub fn attachment_meta(a: &serenity::all::Attachment) -> AttachmentMeta {
    AttachmentMeta {
        id: a.id.get(),
        filename: a.filename.clone(),
        content_type: a.content_type.clone(),
        size: a.size as u64,
        url: a.url.clone(),
    }
}

fn clamp_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

pub fn embed_from_entry(entry: &LogEntry) -> CreateEmbed {
    let mut e = CreateEmbed::new()
        .title(clamp_chars(&entry.title, 256))
        .colour(Colour::new(entry.colour));
    if let Some(d) = &entry.description {
        e = e.description(clamp_chars(d, 4000));
    }
    for (name, value, inline) in entry.fields.iter().take(25) {
        e = e.field(clamp_chars(name, 256), clamp_chars(value, 1024), *inline);
    }
    if !entry.footer.is_empty() {
        e = e.footer(CreateEmbedFooter::new(clamp_chars(&entry.footer, 2048)));
    }
    e
}

/* ===========================
   SerenityPlatform
   =========================== */

/// Jak długo pamiętamy, że gildia nie ma kanału logów (sprawdzane przy każdej wiadomości).
const LOG_CHANNEL_MISS_TTL: Duration = Duration::from_secs(10 * 60);

pub struct SerenityPlatform {
    http: Arc<Http>,
    logs: LogsConfig,
    max_attachment_bytes: u64,
    log_channels: DashMap<u64, u64>,
    log_channel_misses: DashMap<u64, Instant>,
    threads: DashMap<(u64, String), u64>,
}

impl SerenityPlatform {
    pub fn new(http: Arc<Http>, logs: LogsConfig, max_attachment_bytes: u64) -> Self {
        Self {
            http,
            logs,
            max_attachment_bytes,
            log_channels: DashMap::new(),
            log_channel_misses: DashMap::new(),
            threads: DashMap::new(),
        }
    }

    /// Aktywne wątki gildii, potem zarchiwizowane publiczne pod `parent`.
    pub async fn find_thread(
        &self,
        guild_id: u64,
        parent: u64,
        name: &str,
    ) -> Result<Option<u64>, PlatformError> {
        let key = (guild_id, name.to_lowercase());
        if let Some(t) = self.threads.get(&key) {
            return Ok(Some(*t));
        }

        let active = GuildId::new(guild_id)
            .get_active_threads(&self.http)
            .await
            .map_err(map_serenity_error)?;
        let list: Vec<(u64, Option<u64>, String)> = active
            .threads
            .iter()
            .map(|t| (t.id.get(), t.parent_id.map(|p| p.get()), t.name.clone()))
            .collect();
        let mut found = pick_thread(&list, parent, name);

        if found.is_none() {
            match ChannelId::new(parent)
                .get_archived_public_threads(&self.http, None, Some(100))
                .await
            {
                Ok(archived) => {
                    let list: Vec<(u64, Option<u64>, String)> = archived
                        .threads
                        .iter()
                        .map(|t| (t.id.get(), t.parent_id.map(|p| p.get()), t.name.clone()))
                        .collect();
                    found = pick_thread(&list, parent, name);
                }
                Err(e) => {
                    tracing::debug!(error=?e, parent, "archived threads unavailable");
                }
            }
        }

        if let Some(t) = found {
            self.threads.insert(key, t);
        }
        Ok(found)
    }

    /// Wątek dla danego miejsca logów; zakładany, gdy go brak.
    /// Nie da się założyć → piszemy do samego kanału logów.
    pub async fn destination_channel(
        &self,
        guild_id: u64,
        dest: LogDestination,
    ) -> Result<Option<u64>, PlatformError> {
        let Some(parent) = self.log_channel(guild_id).await? else {
            return Ok(None);
        };
        let name = thread_name_for(&self.logs, dest);
        if name.trim().is_empty() {
            return Ok(Some(parent));
        }
        if let Some(t) = self.find_thread(guild_id, parent, name).await? {
            return Ok(Some(t));
        }

        let builder = CreateThread::new(name.to_string())
            .kind(ChannelType::PublicThread)
            .auto_archive_duration(AutoArchiveDuration::OneWeek);
        match ChannelId::new(parent).create_thread(&self.http, builder).await {
            Ok(t) => {
                tracing::info!(guild_id, thread = %name, "log thread created");
                self.threads.insert((guild_id, name.to_lowercase()), t.id.get());
                Ok(Some(t.id.get()))
            }
            Err(e) => {
                tracing::warn!(error=?e, guild_id, thread = %name, "create_thread failed, logging to parent channel");
                Ok(Some(parent))
            }
        }
    }
}

#[async_trait]
impl ModerationApi for SerenityPlatform {
    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        delete_message_days: u8,
        reason: &str,
    ) -> Result<(), PlatformError> {
        // Discord przyjmuje maks. 512 znaków powodu i 7 dni
        let reason = clamp_chars(reason, 512);
        GuildId::new(guild_id)
            .ban_with_reason(&self.http, UserId::new(user_id), delete_message_days.min(7), reason)
            .await
            .map_err(map_serenity_error)
    }

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), PlatformError> {
        ChannelId::new(channel_id)
            .delete_message(&self.http, MessageId::new(message_id))
            .await
            .map_err(map_serenity_error)
    }

    async fn send_log(
        &self,
        guild_id: u64,
        dest: LogDestination,
        entry: &LogEntry,
    ) -> Result<Option<MessageRef>, PlatformError> {
        let Some(ch) = self.destination_channel(guild_id, dest).await? else {
            return Ok(None);
        };
        let msg = ChannelId::new(ch)
            .send_message(&self.http, CreateMessage::new().embed(embed_from_entry(entry)))
            .await
            .map_err(map_serenity_error)?;
        Ok(Some(MessageRef {
            channel_id: ch,
            message_id: msg.id.get(),
        }))
    }

    async fn delete_log(&self, msg: MessageRef) -> Result<(), PlatformError> {
        self.delete_message(msg.channel_id, msg.message_id).await
    }

    async fn log_channel(&self, guild_id: u64) -> Result<Option<u64>, PlatformError> {
        if let Some(c) = self.log_channels.get(&guild_id) {
            return Ok(Some(*c));
        }
        if self
            .log_channel_misses
            .get(&guild_id)
            .is_some_and(|t| t.elapsed() < LOG_CHANNEL_MISS_TTL)
        {
            return Ok(None);
        }
        let chans = GuildId::new(guild_id)
            .channels(&self.http)
            .await
            .map_err(map_serenity_error)?;
        let list: Vec<(u64, String)> = chans
            .values()
            .filter(|c| c.kind == ChannelType::Text)
            .map(|c| (c.id.get(), c.name.clone()))
            .collect();
        let picked = pick_log_channel(&self.logs, &list);
        match picked {
            Some(c) => {
                self.log_channels.insert(guild_id, c);
                self.log_channel_misses.remove(&guild_id);
            }
            None => {
                self.log_channel_misses.insert(guild_id, Instant::now());
            }
        }
        Ok(picked)
    }

    async fn reference_thread(&self, guild_id: u64, name: &str) -> Result<Option<u64>, PlatformError> {
        let Some(parent) = self.log_channel(guild_id).await? else {
            return Ok(None);
        };
        self.find_thread(guild_id, parent, name).await
    }

    async fn fetch_history(
        &self,
        channel_id: u64,
        limit: u8,
        after: Option<u64>,
    ) -> Result<Vec<HistoryMessage>, PlatformError> {
        // after=1 → od najstarszej wiadomości
        let after = MessageId::new(after.unwrap_or(1).max(1));
        let mut msgs = ChannelId::new(channel_id)
            .messages(&self.http, GetMessages::new().after(after).limit(limit.clamp(1, 100)))
            .await
            .map_err(map_serenity_error)?;
        msgs.sort_by_key(|m| m.id);
        Ok(msgs
            .iter()
            .map(|m| HistoryMessage {
                id: m.id.get(),
                attachments: m.attachments.iter().map(attachment_meta).collect(),
            })
            .collect())
    }

    async fn read_attachment(&self, attachment: &AttachmentMeta) -> Result<Vec<u8>, PlatformError> {
        download_attachment(attachment, self.max_attachment_bytes).await
    }
}
