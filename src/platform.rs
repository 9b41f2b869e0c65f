// src/platform.rs
//
// Wszystko, czego rdzeń potrzebuje od platformy czatu. Rdzeń nie zna typów serenity;
// implementacja discordowa siedzi w `discord::platform`.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;

/// Rozszerzenia traktowane jak obrazki, gdy brak content-type.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub id: u64,
    pub filename: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub url: String,
}

impl AttachmentMeta {
    pub fn extension(&self) -> Option<String> {
        let (_, ext) = self.filename.rsplit_once('.')?;
        Some(ext.to_ascii_lowercase())
    }

    pub fn is_image(&self) -> bool {
        if let Some(ct) = &self.content_type {
            if ct.to_ascii_lowercase().starts_with("image/") {
                return true;
            }
        }
        self.extension()
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
    }
}

/// Wiadomość z historii wątku referencyjnego.
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub id: u64,
    pub attachments: Vec<AttachmentMeta>,
}

/// Świeża wiadomość z gildii, już przetłumaczona z typów platformy.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub author_id: u64,
    pub author_is_bot: bool,
    /// Administrator, zarządzanie serwerem albo banowanie.
    pub author_is_staff: bool,
    pub author_roles: Vec<u64>,
    /// Kanał-rodzic, gdy wiadomość jest w wątku.
    pub parent_channel_id: Option<u64>,
    pub attachments: Vec<AttachmentMeta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogDestination {
    BanLog,
    FalsePositive,
    Whitelist,
}

impl LogDestination {
    pub fn as_str(self) -> &'static str {
        match self {
            LogDestination::BanLog => "ban_log",
            LogDestination::FalsePositive => "false_positive",
            LogDestination::Whitelist => "whitelist",
        }
    }
}

/// Wpis do logu, renderowany przez platformę (na Discordzie jako embed).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogEntry {
    pub title: String,
    pub colour: u32,
    pub description: Option<String>,
    pub fields: Vec<(String, String, bool)>,
    pub footer: String,
}

impl LogEntry {
    pub fn new(title: impl Into<String>, colour: u32) -> Self {
        Self {
            title: title.into(),
            colour,
            ..Default::default()
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push((name.into(), value.into(), inline));
        self
    }

    pub fn description(mut self, d: impl Into<String>) -> Self {
        self.description = Some(d.into());
        self
    }

    pub fn footer(mut self, f: impl Into<String>) -> Self {
        self.footer = f.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub channel_id: u64,
    pub message_id: u64,
}

/// Operacje moderacyjne konsumowane przez pipeline i executor.
#[async_trait]
pub trait ModerationApi: Send + Sync {
    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        delete_message_days: u8,
        reason: &str,
    ) -> Result<(), PlatformError>;

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), PlatformError>;

    /// `Ok(None)` gdy gildia nie ma takiego miejsca na logi.
    async fn send_log(
        &self,
        guild_id: u64,
        dest: LogDestination,
        entry: &LogEntry,
    ) -> Result<Option<MessageRef>, PlatformError>;

    async fn delete_log(&self, msg: MessageRef) -> Result<(), PlatformError>;

    /// Kanał logów gildii (bez zakładania czegokolwiek).
    async fn log_channel(&self, guild_id: u64) -> Result<Option<u64>, PlatformError>;

    /// Wątek o danej nazwie w kanale logów gildii.
    async fn reference_thread(&self, guild_id: u64, name: &str) -> Result<Option<u64>, PlatformError>;

    /// Strona historii, od najstarszych, po `after` (wyłącznie).
    async fn fetch_history(
        &self,
        channel_id: u64,
        limit: u8,
        after: Option<u64>,
    ) -> Result<Vec<HistoryMessage>, PlatformError>;

    async fn read_attachment(&self, attachment: &AttachmentMeta) -> Result<Vec<u8>, PlatformError>;
}

/// Timeout na pojedyncze wywołanie; przekroczenie = nieudana akcja, bez ponawiania.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, PlatformError>
where
    F: Future<Output = Result<T, PlatformError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(PlatformError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn att(name: &str, ct: Option<&str>) -> AttachmentMeta {
        AttachmentMeta {
            id: 1,
            filename: name.into(),
            content_type: ct.map(Into::into),
            size: 10,
            url: String::new(),
        }
    }

    #[test]
    fn image_detection_uses_content_type_then_extension() {
        assert!(att("x.bin", Some("image/png")).is_image());
        assert!(att("scam.WEBP", None).is_image());
        assert!(!att("notes.txt", Some("text/plain")).is_image());
        assert!(!att("noext", None).is_image());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let r: Result<(), _> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(r, Err(PlatformError::Timeout(Duration::from_millis(50))));
    }
}
