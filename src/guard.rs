// src/guard.rs
//
// PhishGuard: spina pipeline i executor, filtruje wyjątki (boty, role, kanały),
// loguje decyzję i zapisuje audyt. Jedyne miejsce, gdzie "loguj i jedź dalej".

use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::sync::broadcast;

use crate::{
    config::PhishGuardConfig,
    db::{self, AuditRow, Db},
    executor::{ActionExecutor, ActionOutcome, BanEventBus, PhishEvent, SafetyReviewer},
    ledger::ClaimLedger,
    phash::HashMemo,
    pipeline::{ConfidenceSource, Decision, DecisionPipeline, PipelineLimits},
    platform::{InboundMessage, ModerationApi, with_timeout},
    policy::PolicyHandle,
    reference::ReferenceIndexCache,
    signatures::SignatureStore,
    whitelist::ContentWhitelist,
};

pub struct PhishGuard {
    pipeline: DecisionPipeline,
    executor: ActionExecutor,
    signatures: Arc<SignatureStore>,
    whitelist: Arc<ContentWhitelist>,
    api: Arc<dyn ModerationApi>,
    call_timeout: Duration,
    exempt_staff: bool,
    exempt_roles: HashSet<u64>,
    whitelist_channels: HashSet<u64>,
    audit: Option<Db>,
}

pub struct PhishGuardBuilder {
    cfg: PhishGuardConfig,
    api: Arc<dyn ModerationApi>,
    ledger: Option<Arc<ClaimLedger>>,
    policy: Option<Arc<PolicyHandle>>,
    bus: Option<BanEventBus>,
    reviewers: Vec<Arc<dyn SafetyReviewer>>,
    sources: Vec<Arc<dyn ConfidenceSource>>,
    audit: Option<Db>,
}

impl PhishGuardBuilder {
    /// Rejestr claimów współdzielony z innymi detektorami.
    pub fn ledger(mut self, ledger: Arc<ClaimLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn policy(mut self, policy: Arc<PolicyHandle>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn bus(mut self, bus: BanEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Kolejność wywołań = kolejność rejestracji.
    pub fn reviewer(mut self, r: Arc<dyn SafetyReviewer>) -> Self {
        self.reviewers.push(r);
        self
    }

    /// Dodatkowe źródło pewności (po czarnej liście sygnatur).
    pub fn confidence_source(mut self, s: Arc<dyn ConfidenceSource>) -> Self {
        self.sources.push(s);
        self
    }

    pub fn audit(mut self, db: Option<Db>) -> Self {
        self.audit = db;
        self
    }

    pub fn build(self) -> PhishGuard {
        let cfg = self.cfg;
        let timeout = Duration::from_millis(cfg.action_timeout_ms.max(1));
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(ClaimLedger::new(Duration::from_secs(cfg.claim_ttl_secs))));
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(PolicyHandle::new(cfg.policy.clone())));

        let signatures = Arc::new(SignatureStore::new(
            cfg.signatures_path.clone(),
            cfg.matching,
            cfg.region_grid,
        ));
        let whitelist = Arc::new(ContentWhitelist::new(cfg.whitelist_path.clone()));

        let mut sources: Vec<Arc<dyn ConfidenceSource>> = vec![signatures.clone()];
        sources.extend(self.sources);

        let reference = ReferenceIndexCache::new(
            self.api.clone(),
            cfg.reference.clone(),
            cfg.max_attachment_bytes,
            timeout,
        );
        let memo = HashMemo::new(
            cfg.hash_cache_capacity,
            Duration::from_secs(cfg.hash_cache_ttl_secs),
            cfg.region_grid,
        );
        let pipeline = DecisionPipeline::new(
            cfg.actor_name.clone(),
            self.api.clone(),
            ledger,
            reference,
            whitelist.clone(),
            sources,
            policy,
            memo,
            PipelineLimits {
                max_attachment_bytes: cfg.max_attachment_bytes,
                max_attachments: cfg.max_attachments,
                call_timeout: timeout,
            },
        );

        let mut executor = ActionExecutor::new(
            self.api.clone(),
            whitelist.clone(),
            self.bus.unwrap_or_default(),
            cfg.logs.retention(),
            timeout,
        )
        .with_reviewers(self.reviewers);
        if cfg.promote_matches {
            executor = executor.with_promotion(signatures.clone());
        }

        PhishGuard {
            pipeline,
            executor,
            signatures,
            whitelist,
            api: self.api,
            call_timeout: timeout,
            exempt_staff: cfg.exempt_staff,
            exempt_roles: cfg.exempt_role_ids.iter().copied().collect(),
            whitelist_channels: cfg.whitelist_channel_ids.iter().copied().collect(),
            audit: self.audit,
        }
    }
}

impl PhishGuard {
    pub fn builder(cfg: PhishGuardConfig, api: Arc<dyn ModerationApi>) -> PhishGuardBuilder {
        PhishGuardBuilder {
            cfg,
            api,
            ledger: None,
            policy: None,
            bus: None,
            reviewers: Vec::new(),
            sources: Vec::new(),
            audit: None,
        }
    }

    pub fn signatures(&self) -> &Arc<SignatureStore> {
        &self.signatures
    }

    pub fn whitelist(&self) -> &Arc<ContentWhitelist> {
        &self.whitelist
    }

    pub fn reference(&self) -> &ReferenceIndexCache {
        self.pipeline.reference()
    }

    pub fn ledger(&self) -> &ClaimLedger {
        self.pipeline.ledger()
    }

    pub fn policy(&self) -> &PolicyHandle {
        self.pipeline.policy()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhishEvent> {
        self.executor.bus().subscribe()
    }

    /// Czy wiadomość w ogóle podlega sprawdzeniu.
    pub fn is_exempt(&self, msg: &InboundMessage) -> bool {
        msg.author_is_bot
            || msg.attachments.is_empty()
            || (self.exempt_staff && msg.author_is_staff)
            || self.whitelist_channels.contains(&msg.channel_id)
            || msg.author_roles.iter().any(|r| self.exempt_roles.contains(r))
    }

    /// Kanał logów, jego wątki i wątek referencyjny: tam moderatorzy wrzucają wzorce.
    pub async fn in_moderation_area(&self, msg: &InboundMessage) -> bool {
        let mut areas: Vec<u64> = self
            .pipeline
            .reference()
            .cached_thread(msg.guild_id)
            .into_iter()
            .collect();
        match with_timeout(self.call_timeout, self.api.log_channel(msg.guild_id)).await {
            Ok(Some(c)) => areas.push(c),
            Ok(None) => {}
            Err(e) => tracing::debug!(error=%e, guild_id = msg.guild_id, "log channel lookup failed"),
        }
        areas
            .iter()
            .any(|a| *a == msg.channel_id || msg.parent_channel_id == Some(*a))
    }

    /// `None` gdy wiadomość pominięta bez oceny.
    pub async fn on_message(&self, msg: &InboundMessage) -> Option<(Decision, ActionOutcome)> {
        if self.is_exempt(msg) || self.in_moderation_area(msg).await {
            return None;
        }

        let decision = self.pipeline.evaluate(msg).await;
        let outcome = self.executor.execute(&decision, msg).await;

        if decision.verdict.is_ban() {
            tracing::warn!(
                actor = self.pipeline.actor(),
                guild_id = msg.guild_id,
                message_id = msg.message_id,
                user_id = msg.author_id,
                verdict = decision.verdict.as_str(),
                confidence = ?decision.best_confidence(),
                outcome = outcome.as_str(),
                "phishing image detected"
            );
        } else {
            tracing::debug!(
                guild_id = msg.guild_id,
                message_id = msg.message_id,
                verdict = decision.verdict.as_str(),
                claimed_by = ?decision.claimed_by,
                outcome = outcome.as_str(),
                "phishguard decision"
            );
        }

        if let Some(db) = &self.audit {
            if decision.verdict != crate::pipeline::ModerationVerdict::Skip {
                let row = AuditRow {
                    guild_id: msg.guild_id,
                    channel_id: msg.channel_id,
                    message_id: msg.message_id,
                    user_id: msg.author_id,
                    verdict: decision.verdict.as_str(),
                    label: decision.label(),
                    outcome: outcome.as_str(),
                    confidence: decision.best_confidence(),
                    content_hashes: decision
                        .content_hashes()
                        .iter()
                        .map(|h| h.to_string())
                        .collect(),
                };
                if let Err(e) = db::record_outcome(db, &row).await {
                    tracing::warn!(error=?e, "phishguard audit insert failed");
                }
            }
        }

        Some((decision, outcome))
    }
}
