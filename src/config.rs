use anyhow::Result;
use serde::{Deserialize, Serialize};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::{
    executor::LogRetention,
    policy::PolicyConfig,
    reference::ReferenceConfig,
    signatures::MatchThresholds,
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub env: String,
    pub app: App,
    pub discord: Discord,
    pub database: Database,
    pub logging: Logging,
    #[serde(default)]
    pub phishguard: PhishGuardConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct App {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Discord {
    pub token: String,
    pub app_id: Option<String>,
    pub intents: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Database {
    /// Pusty URL = bez audytu w Postgresie.
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logging {
    pub json: Option<bool>,
    pub level: Option<String>,
}

/* ===========================
   PhishGuard
   =========================== */

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PhishGuardConfig {
    pub enabled: bool,
    /// Nazwa w rejestrze claimów.
    pub actor_name: String,
    pub signatures_path: String,
    pub whitelist_path: String,
    pub max_attachment_bytes: u64,
    pub max_attachments: usize,
    pub region_grid: u32,
    pub claim_ttl_secs: u64,
    pub action_timeout_ms: u64,
    pub hash_cache_capacity: u64,
    pub hash_cache_ttl_secs: u64,
    pub promote_matches: bool,
    /// Administratorzy i moderatorzy (uprawnienia, nie role) nie są sprawdzani.
    pub exempt_staff: bool,
    pub exempt_role_ids: Vec<u64>,
    pub whitelist_channel_ids: Vec<u64>,
    pub matching: MatchThresholds,
    pub reference: ReferenceConfig,
    pub logs: LogsConfig,
    pub review: ReviewConfig,
    pub policy: PolicyConfig,
}

impl Default for PhishGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            actor_name: "PhishGuard".into(),
            signatures_path: "data/phash_blacklist.json".into(),
            whitelist_path: "data/phash_whitelist.json".into(),
            max_attachment_bytes: 8 * 1024 * 1024,
            max_attachments: 10,
            region_grid: 3,
            claim_ttl_secs: 90,
            action_timeout_ms: 5_000,
            hash_cache_capacity: 4096,
            hash_cache_ttl_secs: 60 * 60,
            promote_matches: true,
            exempt_staff: true,
            exempt_role_ids: vec![],
            whitelist_channel_ids: vec![],
            matching: MatchThresholds::default(),
            reference: ReferenceConfig::default(),
            logs: LogsConfig::default(),
            review: ReviewConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

/// Gdzie lądują logi: kanał (id, potem nazwa) i wątki pod nim.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogsConfig {
    pub channel_id: u64,
    pub channel_name: String,
    pub ban_log_thread: String,
    pub false_positive_thread: String,
    pub whitelist_thread: String,
    pub ban_log_auto_delete_secs: u64,
    pub false_positive_auto_delete_secs: u64,
    pub whitelist_auto_delete_secs: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            channel_id: 0,
            channel_name: "log-botphising".into(),
            ban_log_thread: "Ban Log".into(),
            false_positive_thread: "imagephising-fp-log".into(),
            whitelist_thread: "whitelist".into(),
            ban_log_auto_delete_secs: 0,
            false_positive_auto_delete_secs: 3600,
            whitelist_auto_delete_secs: 3600,
        }
    }
}

impl LogsConfig {
    pub fn retention(&self) -> LogRetention {
        LogRetention {
            ban_log_secs: self.ban_log_auto_delete_secs,
            false_positive_secs: self.false_positive_auto_delete_secs,
            whitelist_secs: self.whitelist_auto_delete_secs,
        }
    }
}

/// Kolejka ręcznej weryfikacji banów (przyciski na Discordzie).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewConfig {
    pub enabled: bool,
    /// Role mogące zatwierdzać (oprócz każdego z uprawnieniem BAN_MEMBERS).
    pub staff_role_ids: Vec<u64>,
    pub pending_ttl_secs: u64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            staff_role_ids: vec![],
            pending_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        // Które środowisko?
        let env = std::env::var("TSS_ENV").unwrap_or_else(|_| "development".to_string());

        // Załaduj .env.<env> i .env (jeśli są)
        let _ = dotenvy::from_filename(format!(".env.{}", env));
        let _ = dotenvy::dotenv();

        let figment = Figment::from(Serialized::defaults(Self::defaults(&env)))
            .merge(Toml::file(format!("config/{}.toml", env)))
            // TSS_DATABASE_URL => database.url itd.
            .merge(Env::prefixed("TSS_").split("_"));

        let mut s: Settings = figment.extract()?;
        s.env = env;

        if s.database.max_connections.is_none() {
            s.database.max_connections = Some(5);
        }
        s.phishguard.policy = s.phishguard.policy.clone().sanitize();

        Ok(s)
    }

    pub fn defaults(env: &str) -> Self {
        Self {
            env: env.to_string(),
            app: App {
                name: "Tigris PhishGuard".into(),
            },
            discord: Discord {
                token: "".into(),
                app_id: None,
                intents: vec![
                    "GUILDS".into(),
                    "GUILD_MEMBERS".into(),
                    "GUILD_MESSAGES".into(),
                    "MESSAGE_CONTENT".into(),
                ],
            },
            database: Database {
                url: "".into(),
                max_connections: Some(5),
            },
            logging: Logging {
                json: Some(false),
                level: Some("info".into()),
            },
            phishguard: PhishGuardConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_only_what_it_names() {
        let raw = r#"
            [phishguard]
            claim_ttl_secs = 30

            [phishguard.policy]
            safety_required = false

            [phishguard.logs]
            channel_id = 123
        "#;
        let s: Settings = Figment::from(Serialized::defaults(Settings::defaults("test")))
            .merge(Toml::string(raw))
            .extract()
            .unwrap();
        assert_eq!(s.phishguard.claim_ttl_secs, 30);
        assert!(!s.phishguard.policy.safety_required);
        assert_eq!(s.phishguard.policy.phash_min_threshold, 0.90);
        assert_eq!(s.phishguard.logs.channel_id, 123);
        assert_eq!(s.phishguard.logs.ban_log_thread, "Ban Log");
        assert_eq!(s.phishguard.reference.thread_name, "imagephising");
    }

    #[test]
    fn retention_maps_per_destination() {
        let r = LogsConfig::default().retention();
        assert_eq!(r.ban_log_secs, 0);
        assert_eq!(r.false_positive_secs, 3600);
    }
}
