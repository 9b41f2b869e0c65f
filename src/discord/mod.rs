// src/discord/mod.rs
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::FutureExt;
use serenity::all::*;
use serenity::async_trait;

use crate::{
    AppContext,
    guard::PhishGuard,
    platform::{InboundMessage, ModerationApi},
};

pub mod commands;
pub mod logs;
pub mod platform;
pub mod review;

use self::{platform::SerenityPlatform, review::ReviewQueue};

pub struct Handler {
    pub app: Arc<AppContext>,
}

/// Składa PhishGuarda nad klientem HTTP Discorda. Idempotentne (reconnect = ta sama instancja).
pub fn install(app: &AppContext, http: Arc<Http>) -> Arc<PhishGuard> {
    app.install_guard(|| {
        let cfg = app.settings.phishguard.clone();
        let platform = Arc::new(SerenityPlatform::new(
            http.clone(),
            cfg.logs.clone(),
            cfg.max_attachment_bytes,
        ));
        let api: Arc<dyn ModerationApi> = platform.clone();

        let mut builder = PhishGuard::builder(cfg.clone(), api)
            .ledger(app.ledger.clone())
            .policy(app.policy.clone())
            .bus(app.bus.clone())
            .audit(app.db.clone());

        if cfg.review.enabled {
            let rq = app.install_review(|| {
                Arc::new(ReviewQueue::new(
                    http.clone(),
                    platform.clone(),
                    cfg.review.clone(),
                    Duration::from_millis(cfg.action_timeout_ms.max(1)),
                ))
            });
            builder = builder.reviewer(rq);
        }

        tracing::info!(
            actor = %cfg.actor_name,
            review = cfg.review.enabled,
            promote = cfg.promote_matches,
            "PhishGuard installed"
        );
        Arc::new(builder.build())
    })
}

/// Uprawnienia, które czynią autora moderatorem.
pub fn is_staff(perms: Permissions) -> bool {
    perms.intersects(Permissions::ADMINISTRATOR | Permissions::MANAGE_GUILD | Permissions::BAN_MEMBERS)
}

fn inbound_from(ctx: &Context, msg: &Message, guild_id: GuildId) -> InboundMessage {
    let roles: Vec<RoleId> = msg.member.as_ref().map(|m| m.roles.clone()).unwrap_or_default();

    // uprawnienia z ról (+ @everyone) i rodzic wątku, z cache gildii
    let (author_is_staff, parent_channel_id) = match ctx.cache.guild(guild_id) {
        Some(g) => {
            let perms = std::iter::once(RoleId::new(guild_id.get()))
                .chain(roles.iter().copied())
                .filter_map(|r| g.roles.get(&r))
                .fold(Permissions::empty(), |acc, r| acc | r.permissions);
            let parent = g
                .threads
                .iter()
                .find(|t| t.id == msg.channel_id)
                .and_then(|t| t.parent_id)
                .map(|p| p.get());
            (g.owner_id == msg.author.id || is_staff(perms), parent)
        }
        None => (false, None),
    };

    InboundMessage {
        guild_id: guild_id.get(),
        channel_id: msg.channel_id.get(),
        message_id: msg.id.get(),
        author_id: msg.author.id.get(),
        author_is_bot: msg.author.bot,
        author_is_staff,
        author_roles: roles.iter().map(|r| r.get()).collect(),
        parent_channel_id,
        attachments: msg.attachments.iter().map(platform::attachment_meta).collect(),
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!("Logged in as {}", ready.user.name);

        install(&self.app, ctx.http.clone());

        for g in ready.guilds {
            if let Err(e) = register_commands_for_guild(&ctx, g.id).await {
                tracing::warn!(error=?e, gid=%g.id.get(), "register_commands_for_guild failed (wrapper)");
            }
        }
    }

    // _is_new zgodnie z Serenity 0.12
    async fn guild_create(&self, ctx: Context, guild: Guild, _is_new: Option<bool>) {
        let gid = guild.id.get();
        if let Err(e) = register_commands_for_guild(&ctx, guild.id).await {
            tracing::warn!(error=?e, gid, "register_commands_for_guild failed (on guild_create)");
        }
        tracing::info!(guild=%guild.name, gid, "commands registered (see warnings if any failed)");
    }

    /// Brama interakcji: slash + przyciski weryfikacji
    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let started = Instant::now();
        let app = self.app.clone();

        let fut = async {
            match &interaction {
                Interaction::Command(cmd) => {
                    commands::on_command(&ctx, &app, cmd).await;
                }
                Interaction::Component(comp) => {
                    if let Some(rq) = app.review() {
                        rq.on_component(&ctx, &app, comp).await;
                    }
                }
                _ => {}
            }
        };

        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            tracing::error!(elapsed_ms = started.elapsed().as_millis() as u64, "interaction handler panicked");
        }
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let Some(gid) = msg.guild_id else {
            return;
        };
        if msg.author.bot || msg.attachments.is_empty() || !self.app.settings.phishguard.enabled {
            return;
        }
        let guard = match self.app.guard() {
            Some(g) => g,
            None => install(&self.app, ctx.http.clone()),
        };

        let inbound = inbound_from(&ctx, &msg, gid);
        let started = Instant::now();
        let res = AssertUnwindSafe(guard.on_message(&inbound)).catch_unwind().await;
        match res {
            Ok(Some((decision, outcome))) => tracing::debug!(
                message_id = inbound.message_id,
                verdict = decision.verdict.as_str(),
                outcome = outcome.as_str(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "message handled"
            ),
            Ok(None) => {}
            Err(_) => tracing::error!(message_id = inbound.message_id, "phishguard panicked on message"),
        }
    }
}

fn intents_from_settings(names: &[String]) -> GatewayIntents {
    let mut i = GatewayIntents::empty();
    for n in names {
        match n.as_str() {
            "GUILDS" => i |= GatewayIntents::GUILDS,
            "GUILD_MEMBERS" => i |= GatewayIntents::GUILD_MEMBERS,
            "GUILD_MESSAGES" => i |= GatewayIntents::GUILD_MESSAGES,
            "MESSAGE_CONTENT" => i |= GatewayIntents::MESSAGE_CONTENT,
            _ => {}
        }
    }
    if i.is_empty() {
        crate::default_gateway_intents()
    } else {
        i
    }
}

pub async fn run_bot(ctx: Arc<AppContext>) -> Result<()> {
    let token = &ctx.settings.discord.token;
    if token.is_empty() {
        anyhow::bail!("Brak tokenu Discord (TSS_DISCORD_TOKEN). Uzupełnij w .env.");
    }

    let intents = intents_from_settings(&ctx.settings.discord.intents);
    let handler = Handler { app: ctx.clone() };

    let mut client = serenity::Client::builder(token, intents)
        .event_handler(handler)
        .await?;

    tracing::info!(env = ctx.env(), "Discord client starting…");
    client.start().await?;
    Ok(())
}

async fn register_commands_for_guild(ctx: &Context, guild_id: GuildId) -> Result<()> {
    if let Err(e) = commands::register_commands(ctx, guild_id).await {
        tracing::warn!(error=?e, gid=%guild_id.get(), "register phishguard failed");
    }
    Ok(())
}
