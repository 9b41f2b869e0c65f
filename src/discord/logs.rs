// src/discord/logs.rs
//
// Wybór kanału logów i wątków pod nim. Czyste funkcje na (id, nazwa),
// żeby dało się je testować bez gatewaya.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{config::LogsConfig, platform::LogDestination};

/// Znane nazwy kanałów logów, w kolejności preferencji.
pub const KNOWN_LOG_CHANNEL_NAMES: [&str; 8] = [
    "log-botphising",
    "log-botphishing",
    "log-satpam",
    "log-satpam-bot",
    "mod-log",
    "moderation-log",
    "banlog",
    "logs",
];

/// Ostatnia deska ratunku: cokolwiek "phishing" + "log".
static PHISH_LOG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(phis?h\w*[-_ ]?log|log\w*[-_ ]?\w*phis?h)").unwrap());

fn norm(s: &str) -> String {
    s.trim().trim_start_matches('#').to_lowercase()
}

/// id z konfiguracji → nazwa z konfiguracji → znane nazwy → wzorzec.
pub fn pick_log_channel(cfg: &LogsConfig, channels: &[(u64, String)]) -> Option<u64> {
    if cfg.channel_id != 0 && channels.iter().any(|(id, _)| *id == cfg.channel_id) {
        return Some(cfg.channel_id);
    }

    let wanted = norm(&cfg.channel_name);
    if !wanted.is_empty() {
        if let Some((id, _)) = channels.iter().find(|(_, n)| norm(n) == wanted) {
            return Some(*id);
        }
    }

    for known in KNOWN_LOG_CHANNEL_NAMES {
        if let Some((id, _)) = channels.iter().find(|(_, n)| norm(n) == known) {
            return Some(*id);
        }
    }

    channels
        .iter()
        .find(|(_, n)| PHISH_LOG_RE.is_match(n))
        .map(|(id, _)| *id)
}

/// Wątek o nazwie `name` (bez względu na wielkość liter) pod `parent`.
pub fn pick_thread(threads: &[(u64, Option<u64>, String)], parent: u64, name: &str) -> Option<u64> {
    let wanted = norm(name);
    threads
        .iter()
        .find(|(_, p, n)| *p == Some(parent) && norm(n) == wanted)
        .map(|(id, _, _)| *id)
}

pub fn thread_name_for(cfg: &LogsConfig, dest: LogDestination) -> &str {
    match dest {
        LogDestination::BanLog => &cfg.ban_log_thread,
        LogDestination::FalsePositive => &cfg.false_positive_thread,
        LogDestination::Whitelist => &cfg.whitelist_thread,
    }
}
