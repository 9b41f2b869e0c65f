// src/discord/review.rs
//
// Ręczna weryfikacja: zgłoszenie bana ląduje w wątku ban-logu z przyciskami.
// Pierwsze kliknięcie staffu zdejmuje wpis z kolejki (atomowo), kolejne dostają
// informację, że już obsłużone.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use serenity::all::{
    ButtonStyle, ChannelId, Colour, ComponentInteraction, Context, CreateActionRow, CreateButton,
    CreateEmbed, CreateEmbedFooter, CreateInteractionResponse, CreateInteractionResponseMessage,
    CreateMessage, Http,
};
use tokio::time::Instant;

use crate::{
    AppContext,
    config::ReviewConfig,
    discord::platform::{SerenityPlatform, map_serenity_error},
    error::PlatformError,
    executor::{BanRequest, ReviewAck, SafetyReviewer},
    platform::{LogDestination, ModerationApi, with_timeout},
};

const BRAND_FOOTER: &str = "Tigris Security System™ • PhishGuard Review";
const CUSTOM_ID_PREFIX: &str = "phq";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewChoice {
    Approve,
    Reject,
}

pub fn custom_id(message_id: u64, choice: ReviewChoice) -> String {
    let c = match choice {
        ReviewChoice::Approve => "approve",
        ReviewChoice::Reject => "reject",
    };
    format!("{CUSTOM_ID_PREFIX}:{message_id}:{c}")
}

pub fn parse_custom_id(s: &str) -> Option<(u64, ReviewChoice)> {
    let mut it = s.split(':');
    if it.next()? != CUSTOM_ID_PREFIX {
        return None;
    }
    let id: u64 = it.next()?.parse().ok()?;
    let choice = match it.next()? {
        "approve" => ReviewChoice::Approve,
        "reject" => ReviewChoice::Reject,
        _ => return None,
    };
    if it.next().is_some() {
        return None;
    }
    Some((id, choice))
}

struct PendingReview {
    request: Arc<BanRequest>,
    created: Instant,
}

/// Ban zatwierdzony przez moderatora, potem usunięcie wiadomości.
/// Oba wywołania z timeoutem, bez ponawiania. `Ok(true)` = wiadomość usunięta.
pub async fn approve_ban(
    api: &dyn ModerationApi,
    req: &BanRequest,
    moderator: u64,
    call_timeout: Duration,
) -> Result<bool, PlatformError> {
    let reason = format!("{} • zatwierdził {}", req.reason, moderator);
    with_timeout(
        call_timeout,
        api.ban(req.guild_id, req.user_id, req.delete_message_days, &reason),
    )
    .await?;
    let deleted = with_timeout(call_timeout, api.delete_message(req.channel_id, req.message_id))
        .await
        .is_ok();
    Ok(deleted)
}

pub struct ReviewQueue {
    http: Arc<Http>,
    platform: Arc<SerenityPlatform>,
    cfg: ReviewConfig,
    call_timeout: Duration,
    pending: DashMap<u64, PendingReview>,
}

impl ReviewQueue {
    pub fn new(
        http: Arc<Http>,
        platform: Arc<SerenityPlatform>,
        cfg: ReviewConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            http,
            platform,
            cfg,
            call_timeout,
            pending: DashMap::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.vacuum();
        self.pending.len()
    }

    fn vacuum(&self) {
        let ttl = Duration::from_secs(self.cfg.pending_ttl_secs);
        self.pending.retain(|_, p| p.created.elapsed() < ttl);
    }

    fn is_staff(&self, comp: &ComponentInteraction) -> bool {
        let Some(m) = comp.member.as_ref() else {
            return false;
        };
        m.permissions.is_some_and(|p| p.ban_members())
            || m
                .roles
                .iter()
                .any(|r| self.cfg.staff_role_ids.contains(&r.get()))
    }

    fn request_embed(req: &BanRequest) -> CreateEmbed {
        let hashes = req
            .content_hashes
            .iter()
            .map(|h| format!("`{}`", h.short()))
            .collect::<Vec<_>>()
            .join(", ");
        let files = req
            .attachments
            .iter()
            .map(|a| format!("[{}]({})", a.filename, a.url))
            .collect::<Vec<_>>()
            .join("\n");
        CreateEmbed::new()
            .title("🛡️ PhishGuard — prośba o bana")
            .colour(Colour::new(0xC0392B))
            .field("Użytkownik", format!("<@{}> (`{}`)", req.user_id, req.user_id), true)
            .field("Kanał", format!("<#{}>", req.channel_id), true)
            .field("Werdykt", req.verdict.as_str(), true)
            .field("Powód", &req.reason, false)
            .field("SHA-256", if hashes.is_empty() { "—".to_string() } else { hashes }, false)
            .field("Pliki", if files.is_empty() { "—".to_string() } else { files }, false)
            .footer(CreateEmbedFooter::new(BRAND_FOOTER))
    }

    /// Obsługa przycisków `phq:*`. `false` = to nie nasza interakcja.
    pub async fn on_component(&self, ctx: &Context, app: &AppContext, comp: &ComponentInteraction) -> bool {
        let Some((message_id, choice)) = parse_custom_id(&comp.data.custom_id) else {
            return false;
        };

        if !self.is_staff(comp) {
            respond_ephemeral(ctx, comp, "Brak uprawnień.").await;
            return true;
        }

        self.vacuum();
        let Some((_, pending)) = self.pending.remove(&message_id) else {
            respond_ephemeral(ctx, comp, "To zgłoszenie zostało już obsłużone albo wygasło.").await;
            return true;
        };
        let req = pending.request;
        let moderator = comp.user.id.get();

        let text = match choice {
            ReviewChoice::Approve => {
                match approve_ban(self.platform.as_ref(), &req, moderator, self.call_timeout).await {
                    Ok(deleted) => {
                        tracing::info!(guild_id = req.guild_id, user_id = req.user_id, moderator, "review approved, user banned");
                        format!(
                            "✅ Ban zatwierdzony przez <@{}>. Wiadomość {}.",
                            moderator,
                            if deleted { "usunięta" } else { "nieusunięta" }
                        )
                    }
                    Err(e) => {
                        tracing::warn!(error=%e, guild_id = req.guild_id, user_id = req.user_id, "review ban failed");
                        format!("⚠️ Ban nieudany: {e}")
                    }
                }
            }
            ReviewChoice::Reject => {
                // odrzucone = fałszywy alarm, więcej nie flagujemy
                let mut added = 0usize;
                if let Some(guard) = app.guard() {
                    for h in &req.content_hashes {
                        match guard.whitelist().add(h.clone()).await {
                            Ok(true) => added += 1,
                            Ok(false) => {}
                            Err(e) => tracing::warn!(error=%e, "whitelist add from review failed"),
                        }
                    }
                }
                tracing::info!(guild_id = req.guild_id, user_id = req.user_id, moderator, added, "review rejected");
                format!("❎ Odrzucone przez <@{}>, {} hash(y) na whiteliście.", moderator, added)
            }
        };

        let _ = comp
            .create_response(
                &ctx.http,
                CreateInteractionResponse::UpdateMessage(
                    CreateInteractionResponseMessage::new()
                        .content(text)
                        .components(vec![]),
                ),
            )
            .await;
        true
    }
}

#[async_trait]
impl SafetyReviewer for ReviewQueue {
    fn name(&self) -> &str {
        "review_queue"
    }

    async fn submit(&self, request: &BanRequest) -> Result<ReviewAck, PlatformError> {
        if !self.cfg.enabled {
            return Ok(ReviewAck::Declined);
        }
        self.vacuum();
        if self.pending.contains_key(&request.message_id) {
            return Ok(ReviewAck::Accepted);
        }

        let Some(ch) = self
            .platform
            .destination_channel(request.guild_id, LogDestination::BanLog)
            .await?
        else {
            return Ok(ReviewAck::Declined);
        };

        let buttons = CreateActionRow::Buttons(vec![
            CreateButton::new(custom_id(request.message_id, ReviewChoice::Approve))
                .label("Zbanuj")
                .style(ButtonStyle::Danger),
            CreateButton::new(custom_id(request.message_id, ReviewChoice::Reject))
                .label("Fałszywy alarm")
                .style(ButtonStyle::Secondary),
        ]);
        ChannelId::new(ch)
            .send_message(
                &self.http,
                CreateMessage::new()
                    .embed(Self::request_embed(request))
                    .components(vec![buttons]),
            )
            .await
            .map_err(map_serenity_error)?;

        self.pending.insert(
            request.message_id,
            PendingReview {
                request: Arc::new(request.clone()),
                created: Instant::now(),
            },
        );
        Ok(ReviewAck::Accepted)
    }
}

async fn respond_ephemeral(ctx: &Context, comp: &ComponentInteraction, text: &str) {
    let _ = comp
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(text)
                    .ephemeral(true),
            ),
        )
        .await;
}
