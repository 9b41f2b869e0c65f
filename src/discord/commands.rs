// src/discord/commands.rs
//
// /phishguard add|check|remove|stats|reload|refresh-ref — komendy dla moderacji.

use anyhow::Result;
use serenity::all::{
    Attachment, CommandDataOption, CommandDataOptionValue, CommandInteraction, CommandOptionType,
    Context, CreateCommand, CreateCommandOption, EditInteractionResponse, GuildId, Permissions,
};

use crate::{
    AppContext, db,
    discord::platform::{attachment_meta, download_attachment},
    guard::PhishGuard,
    phash::{self, ContentHash},
};

pub const COMMAND_NAME: &str = "phishguard";

pub async fn register_commands(ctx: &serenity::all::Context, guild_id: GuildId) -> Result<()> {
    let image_opt = |desc: &str| {
        CreateCommandOption::new(CommandOptionType::Attachment, "image", desc.to_string()).required(true)
    };
    guild_id
        .create_command(
            &ctx.http,
            CreateCommand::new(COMMAND_NAME)
                .description("PhishGuard — czarna lista obrazków phishingowych")
                .default_member_permissions(Permissions::BAN_MEMBERS)
                .add_option(
                    CreateCommandOption::new(CommandOptionType::SubCommand, "add", "Dodaj obrazek do czarnej listy")
                        .add_sub_option(image_opt("Obrazek do zablokowania"))
                        .add_sub_option(CreateCommandOption::new(
                            CommandOptionType::String,
                            "note",
                            "Notatka (opcjonalnie)",
                        )),
                )
                .add_option(
                    CreateCommandOption::new(CommandOptionType::SubCommand, "check", "Sprawdź obrazek bez akcji")
                        .add_sub_option(image_opt("Obrazek do sprawdzenia")),
                )
                .add_option(
                    CreateCommandOption::new(CommandOptionType::SubCommand, "remove", "Usuń sygnaturę po pHash")
                        .add_sub_option(
                            CreateCommandOption::new(
                                CommandOptionType::String,
                                "phash",
                                "pHash (dziesiętnie albo 0x…)",
                            )
                            .required(true),
                        ),
                )
                .add_option(CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "stats",
                    "Statystyki PhishGuarda",
                ))
                .add_option(CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "reload",
                    "Przeładuj progi z konfiguracji",
                ))
                .add_option(CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "refresh-ref",
                    "Przebuduj indeks referencyjny teraz",
                )),
        )
        .await?;
    Ok(())
}

/// `true` gdy to była nasza komenda.
pub async fn on_command(ctx: &Context, app: &AppContext, cmd: &CommandInteraction) -> bool {
    if cmd.data.name != COMMAND_NAME {
        return false;
    }
    if let Err(e) = handle(ctx, app, cmd).await {
        tracing::warn!(error=?e, "phishguard cmd failed");
        let _ = cmd
            .edit_response(&ctx.http, EditInteractionResponse::new().content(format!("⚠️ {e}")))
            .await;
    }
    true
}

async fn handle(ctx: &Context, app: &AppContext, cmd: &CommandInteraction) -> Result<()> {
    cmd.defer_ephemeral(&ctx.http).await?;

    let Some(guard) = app.guard() else {
        anyhow::bail!("PhishGuard jeszcze nie wystartował");
    };
    let Some(guild_id) = cmd.guild_id else {
        anyhow::bail!("Tylko na serwerze");
    };
    let Some((sub, opts)) = subcommand(cmd) else {
        anyhow::bail!("Brak podkomendy");
    };
    let max_bytes = app.settings.phishguard.max_attachment_bytes;

    let text = match sub {
        "add" => {
            let att = opt_attachment(cmd, opts, "image").ok_or_else(|| anyhow::anyhow!("Brak obrazka"))?;
            let bytes = download_attachment(&attachment_meta(att), max_bytes).await?;
            let note = opt_str(opts, "note").unwrap_or("manual");
            let sig = guard
                .signatures()
                .add(&bytes, note, &cmd.user.id.get().to_string())
                .await?;
            format!(
                "✅ Dodano sygnaturę `pHash={:#018x}` (`{}`), regionów: {}.",
                sig.phash,
                sig.phash,
                sig.regions.len()
            )
        }
        "check" => {
            let att = opt_attachment(cmd, opts, "image").ok_or_else(|| anyhow::anyhow!("Brak obrazka"))?;
            let bytes = download_attachment(&attachment_meta(att), max_bytes).await?;
            check_report(&guard, guild_id.get(), &bytes, app.settings.phishguard.region_grid).await?
        }
        "remove" => {
            let raw = opt_str(opts, "phash").unwrap_or_default();
            let phash = parse_phash(raw).ok_or_else(|| anyhow::anyhow!("Niepoprawny pHash: {raw}"))?;
            let n = guard.signatures().remove_phash(phash).await?;
            format!("🗑️ Usunięto {n} sygnatur(y).")
        }
        "stats" => {
            let mut lines = vec![
                format!("Sygnatury: **{}**", guard.signatures().len().await),
                format!("Whitelista: **{}**", guard.whitelist().len().await),
                format!("Aktywne claimy: **{}**", guard.ledger().len()),
                format!(
                    "Indeks referencyjny: **{}**",
                    guard
                        .reference()
                        .cached_count(guild_id.get())
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "nie zbudowany".into())
                ),
            ];
            if let Some(rq) = app.review() {
                lines.push(format!("Oczekujące weryfikacje: **{}**", rq.pending_len()));
            }
            if let Some(db) = &app.db {
                match db::count_outcomes(db, guild_id.get()).await {
                    Ok(rows) => {
                        for (outcome, n) in rows {
                            lines.push(format!("`{outcome}`: {n}"));
                        }
                    }
                    Err(e) => tracing::warn!(error=?e, "count_outcomes failed"),
                }
            }
            lines.join("\n")
        }
        "reload" => {
            let p = app.reload_policy()?;
            format!(
                "🔄 Polityka przeładowana: min={:.2}, strong={:.2}, whitelist<{:.2}, safety_required={}, direct_ban_on_strong={}.",
                p.phash_min_threshold,
                p.phash_strong_threshold,
                p.auto_whitelist_if_phash_below,
                p.safety_required,
                p.direct_ban_on_strong
            )
        }
        "refresh-ref" => {
            guard.reference().invalidate(guild_id.get());
            let idx = guard.reference().get_index(guild_id.get()).await;
            format!("📚 Indeks referencyjny: {} hashy.", idx.count)
        }
        other => anyhow::bail!("Nieznana podkomenda: {other}"),
    };

    cmd.edit_response(&ctx.http, EditInteractionResponse::new().content(text))
        .await?;
    Ok(())
}

async fn check_report(guard: &PhishGuard, guild_id: u64, bytes: &[u8], grid: u32) -> Result<String> {
    let content = ContentHash::of(bytes);
    let mut lines = vec![format!("SHA-256: `{}`", content.short())];

    if guard.whitelist().contains(&content).await {
        lines.push("🟢 Na whiteliście.".into());
    }
    if guard.reference().get_index(guild_id).await.contains(&content) {
        lines.push("🔴 Dokładne trafienie w wątku referencyjnym.".into());
    }

    match phash::hash_all_blocking(bytes.to_vec(), grid).await {
        Ok(h) => {
            lines.push(format!("pHash `{:#018x}` dHash `{:#018x}` aHash `{:#018x}`", h.phash, h.dhash, h.ahash));
            match guard.signatures().best_match(&h).await {
                Some(m) => {
                    let policy = guard.policy().current();
                    lines.push(format!(
                        "🟠 Czarna lista: {:?}, dystans {}, pewność {:.3} ({}), notatka: {}",
                        m.kind,
                        m.distance,
                        m.confidence(),
                        policy.confidence_label(m.confidence()),
                        m.signature.note
                    ));
                }
                None => lines.push("Brak dopasowania na czarnej liście.".into()),
            }
        }
        Err(e) => lines.push(format!("Nie da się zdekodować: {e}")),
    }
    Ok(lines.join("\n"))
}

/* ===========================
   Opcje
   =========================== */

fn subcommand(cmd: &CommandInteraction) -> Option<(&str, &[CommandDataOption])> {
    let opt = cmd.data.options.first()?;
    match &opt.value {
        CommandDataOptionValue::SubCommand(opts) => Some((opt.name.as_str(), opts.as_slice())),
        _ => None,
    }
}

fn opt_str<'a>(opts: &'a [CommandDataOption], name: &str) -> Option<&'a str> {
    opts.iter()
        .find(|o| o.name == name)
        .and_then(|o| o.value.as_str())
}

fn opt_attachment<'a>(
    cmd: &'a CommandInteraction,
    opts: &[CommandDataOption],
    name: &str,
) -> Option<&'a Attachment> {
    let id = opts.iter().find(|o| o.name == name).and_then(|o| match o.value {
        CommandDataOptionValue::Attachment(id) => Some(id),
        _ => None,
    })?;
    cmd.data.resolved.attachments.get(&id)
}

/// `0x7b`, 16 znaków hex (jak w wyniku `check`) albo liczba dziesiętna.
pub fn parse_phash(raw: &str) -> Option<u64> {
    let s = raw.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    // 16 znaków to zawsze hex, także gdy same cyfry
    if s.len() == 16 {
        return u64::from_str_radix(s, 16).ok();
    }
    s.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phash_accepts_decimal_and_hex() {
        assert_eq!(parse_phash("123"), Some(123));
        assert_eq!(parse_phash(" 0x7b "), Some(123));
        assert_eq!(parse_phash("ffffffffffffffff"), Some(u64::MAX));
        assert_eq!(parse_phash("zzz"), None);
    }

    #[test]
    fn sixteen_digits_are_hex_even_without_letters() {
        assert_eq!(parse_phash("0000000000000123"), Some(0x123));
        assert_eq!(parse_phash("1234567890123456"), Some(0x1234_5678_9012_3456));
        assert_eq!(parse_phash("12345678901234567"), Some(12_345_678_901_234_567));
    }
}
