// src/lib.rs

pub mod config;
pub mod db;
pub mod discord;
pub mod error;
pub mod executor;
pub mod guard;
pub mod ledger;
pub mod logging;
mod persist;
pub mod phash;
pub mod pipeline;
pub mod platform;
pub mod policy;
pub mod reference;
pub mod signatures;
pub mod whitelist;

use anyhow::Result;
use once_cell::sync::OnceCell;
use std::{sync::Arc, time::Duration};

use config::Settings;
use db::Db;
use executor::BanEventBus;
use guard::PhishGuard;
use ledger::ClaimLedger;
use policy::PolicyHandle;

use serenity::all::GatewayIntents;

/// Globalny kontekst aplikacji.
/// Konfiguracja, opcjonalna baza audytu i współdzielone serwisy PhishGuarda.
pub struct AppContext {
    pub settings: Settings,
    pub db: Option<Db>,
    pub policy: Arc<PolicyHandle>,
    /// Rejestr claimów wspólny dla wszystkich detektorów w procesie.
    pub ledger: Arc<ClaimLedger>,
    pub bus: BanEventBus,
    guard: OnceCell<Arc<PhishGuard>>,
    review: OnceCell<Arc<discord::review::ReviewQueue>>,
}

impl AppContext {
    /// Bootstrap:
    /// - logi
    /// - (opcjonalnie) Postgres do audytu
    /// - polityka + rejestr claimów
    /// PhishGuard powstaje dopiero w `ready`, bo potrzebuje klienta HTTP Discorda.
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        logging::init(&settings);

        let db = match db::connect(&settings.database.url, settings.database.max_connections).await {
            Ok(db) => db,
            Err(e) => {
                tracing::warn!(error=?e, "database unavailable, audit disabled");
                None
            }
        };
        if let Some(db) = &db {
            db::maybe_ensure_tables(db).await;
        }

        Ok(Arc::new(Self::assemble(settings, db)))
    }

    /// Kontekst bez logów i bez łączenia z bazą (testy).
    pub fn new_testing(settings: Settings, db: Option<Db>) -> Arc<Self> {
        Arc::new(Self::assemble(settings, db))
    }

    fn assemble(settings: Settings, db: Option<Db>) -> Self {
        let pg = &settings.phishguard;
        Self {
            policy: Arc::new(PolicyHandle::new(pg.policy.clone())),
            ledger: Arc::new(ClaimLedger::new(Duration::from_secs(pg.claim_ttl_secs))),
            bus: BanEventBus::default(),
            settings,
            db,
            guard: OnceCell::new(),
            review: OnceCell::new(),
        }
    }

    /// Zainstalowany PhishGuard (po `ready`).
    pub fn guard(&self) -> Option<Arc<PhishGuard>> {
        self.guard.get().cloned()
    }

    pub fn review(&self) -> Option<Arc<discord::review::ReviewQueue>> {
        self.review.get().cloned()
    }

    /// Pierwsza instalacja wygrywa; kolejne `ready` (reconnect) dostają istniejącą.
    pub fn install_guard(&self, make: impl FnOnce() -> Arc<PhishGuard>) -> Arc<PhishGuard> {
        self.guard.get_or_init(make).clone()
    }

    pub fn install_review(
        &self,
        make: impl FnOnce() -> Arc<discord::review::ReviewQueue>,
    ) -> Arc<discord::review::ReviewQueue> {
        self.review.get_or_init(make).clone()
    }

    /// Środowisko: "production" | "development".
    #[inline]
    pub fn env(&self) -> &str {
        &self.settings.env
    }

    /// Przeładowanie polityki z plików/ENV bez restartu.
    pub fn reload_policy(&self) -> Result<Arc<policy::PolicyConfig>> {
        let fresh = Settings::load()?;
        Ok(self.policy.replace(fresh.phishguard.policy))
    }
}

/// Intents potrzebne PhishGuardowi:
/// - GUILDS, GUILD_MESSAGES, MESSAGE_CONTENT (załączniki w treści wiadomości),
/// - GUILD_MEMBERS (role – wyjątki dla staffu).
pub fn default_gateway_intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS
}

/// Start klienta Discorda.
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    discord::run_bot(ctx).await
}
