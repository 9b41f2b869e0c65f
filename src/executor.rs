// src/executor.rs
//
// Wykonanie werdyktu. Ban przechodzi warstwami:
//   1) recenzent bezpieczeństwa (pierwszy, który przyjmie zgłoszenie),
//   2) zdarzenie na szynie (jeśli ktoś słucha),
//   3) ban bezpośredni, tylko gdy safety_required = false.
// Bez żadnej warstwy: brak kary, ale zawsze wpis w logu.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    error::PlatformError,
    phash::ContentHash,
    pipeline::{Decision, ModerationVerdict},
    platform::{
        AttachmentMeta, InboundMessage, LogDestination, LogEntry, ModerationApi, with_timeout,
    },
    policy::PolicyConfig,
    signatures::SignatureStore,
    whitelist::ContentWhitelist,
};

const BRAND_FOOTER: &str = "Tigris Security System™ • PhishGuard";
const COLOUR_BAN: u32 = 0xE74C3C;
const COLOUR_SKIPPED: u32 = 0x95A5A6;
const COLOUR_REVIEW: u32 = 0xF39C12;
const COLOUR_WHITELIST: u32 = 0x2ECC71;

/* ===========================
   Zgłoszenie bana + recenzenci
   =========================== */

#[derive(Debug, Clone, Serialize)]
pub struct BanRequest {
    pub guild_id: u64,
    pub user_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub reason: String,
    pub delete_message_days: u8,
    pub verdict: ModerationVerdict,
    pub label: String,
    pub confidence: Option<f64>,
    pub content_hashes: Vec<ContentHash>,
    pub attachments: Vec<AttachmentMeta>,
    pub requested_at: DateTime<Utc>,
}

impl BanRequest {
    pub fn from_decision(decision: &Decision, msg: &InboundMessage) -> Self {
        let label = decision.label();
        Self {
            guild_id: msg.guild_id,
            user_id: msg.author_id,
            channel_id: msg.channel_id,
            message_id: msg.message_id,
            reason: format!("PhishGuard: {} ({})", label, decision.verdict.as_str()),
            delete_message_days: decision.policy.delete_message_days.min(7),
            verdict: decision.verdict,
            label: label.to_string(),
            confidence: decision.best_confidence(),
            content_hashes: decision.content_hashes(),
            attachments: decision.deciding().map(|a| a.attachment.clone()).collect(),
            requested_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAck {
    Accepted,
    Declined,
}

/// Zewnętrzna warstwa, która może przejąć decyzję o banie.
#[async_trait]
pub trait SafetyReviewer: Send + Sync {
    fn name(&self) -> &str;
    async fn submit(&self, request: &BanRequest) -> Result<ReviewAck, PlatformError>;
}

#[derive(Debug, Clone)]
pub enum PhishEvent {
    BanRequested(Arc<BanRequest>),
}

/// Szyna zdarzeń: każdy subskrybent może podjąć zgłoszenie asynchronicznie.
#[derive(Clone)]
pub struct BanEventBus {
    tx: broadcast::Sender<PhishEvent>,
}

impl BanEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PhishEvent> {
        self.tx.subscribe()
    }

    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }

    /// `Some(n)` gdy dotarło do n słuchaczy; `None` gdy nikt nie słucha.
    pub fn publish(&self, ev: PhishEvent) -> Option<usize> {
        self.tx.send(ev).ok()
    }
}

impl Default for BanEventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

/* ===========================
   Wynik
   =========================== */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    SubmittedToSafety { reviewer: String },
    EventDispatched { listeners: usize },
    DirectBan { message_deleted: bool },
    BanFailed { error: String },
    SkippedNoSafetyLayer,
    Whitelisted { added: usize },
    FlaggedForReview,
    Skipped,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::SubmittedToSafety { .. } => "submitted_to_safety",
            ActionOutcome::EventDispatched { .. } => "event_dispatched",
            ActionOutcome::DirectBan { .. } => "direct_ban",
            ActionOutcome::BanFailed { .. } => "ban_failed",
            ActionOutcome::SkippedNoSafetyLayer => "skipped_no_safety_layer",
            ActionOutcome::Whitelisted { .. } => "whitelisted",
            ActionOutcome::FlaggedForReview => "flagged_for_review",
            ActionOutcome::Skipped => "skipped",
        }
    }

    fn describe(&self) -> String {
        match self {
            ActionOutcome::SubmittedToSafety { reviewer } => format!("handed to `{reviewer}`"),
            ActionOutcome::EventDispatched { listeners } => {
                format!("ban event dispatched to {listeners} listener(s)")
            }
            ActionOutcome::DirectBan { message_deleted } => format!(
                "banned directly, message {}",
                if *message_deleted { "deleted" } else { "NOT deleted" }
            ),
            ActionOutcome::BanFailed { error } => format!("ban failed: {error}"),
            ActionOutcome::SkippedNoSafetyLayer => "skipped, no safety layer".into(),
            ActionOutcome::Whitelisted { added } => format!("{added} hash(es) whitelisted"),
            ActionOutcome::FlaggedForReview => "flagged for human review".into(),
            ActionOutcome::Skipped => "skipped".into(),
        }
    }
}

/// Po ilu sekundach usuwać wpisy z danego miejsca logów (0 = nigdy).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogRetention {
    pub ban_log_secs: u64,
    pub false_positive_secs: u64,
    pub whitelist_secs: u64,
}

impl LogRetention {
    pub fn for_destination(&self, dest: LogDestination) -> Option<Duration> {
        let secs = match dest {
            LogDestination::BanLog => self.ban_log_secs,
            LogDestination::FalsePositive => self.false_positive_secs,
            LogDestination::Whitelist => self.whitelist_secs,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

/* ===========================
   Executor
   =========================== */

pub struct ActionExecutor {
    api: Arc<dyn ModerationApi>,
    reviewers: Vec<Arc<dyn SafetyReviewer>>,
    bus: BanEventBus,
    whitelist: Arc<ContentWhitelist>,
    promote_into: Option<Arc<SignatureStore>>,
    retention: LogRetention,
    call_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        api: Arc<dyn ModerationApi>,
        whitelist: Arc<ContentWhitelist>,
        bus: BanEventBus,
        retention: LogRetention,
        call_timeout: Duration,
    ) -> Self {
        Self {
            api,
            reviewers: Vec::new(),
            bus,
            whitelist,
            promote_into: None,
            retention,
            call_timeout,
        }
    }

    /// Recenzenci w kolejności priorytetu.
    pub fn with_reviewers(mut self, reviewers: Vec<Arc<dyn SafetyReviewer>>) -> Self {
        self.reviewers = reviewers;
        self
    }

    /// Hashe banowanych obrazków trafiają do czarnej listy.
    pub fn with_promotion(mut self, store: Arc<SignatureStore>) -> Self {
        self.promote_into = Some(store);
        self
    }

    pub fn bus(&self) -> &BanEventBus {
        &self.bus
    }

    pub async fn execute(&self, decision: &Decision, msg: &InboundMessage) -> ActionOutcome {
        match decision.verdict {
            ModerationVerdict::ExactMatchBan | ModerationVerdict::StrongMatchBan => {
                self.execute_ban(decision, msg).await
            }
            ModerationVerdict::AutoWhitelist => self.execute_whitelist(decision, msg).await,
            ModerationVerdict::FalsePositiveReview => {
                let entry = self
                    .entry_for(decision, msg, "🟠 PhishGuard — do weryfikacji", COLOUR_REVIEW)
                    .field("Wynik", ActionOutcome::FlaggedForReview.describe(), false);
                self.post_log(msg.guild_id, LogDestination::FalsePositive, entry).await;
                ActionOutcome::FlaggedForReview
            }
            ModerationVerdict::Skip => {
                tracing::trace!(message_id = msg.message_id, "nothing to do");
                ActionOutcome::Skipped
            }
        }
    }

    async fn execute_ban(&self, decision: &Decision, msg: &InboundMessage) -> ActionOutcome {
        if self.promote_into.is_some() {
            self.promote_matches(decision).await;
        }

        let req = Arc::new(BanRequest::from_decision(decision, msg));
        let outcome = self.escalate(&req, &decision.policy).await;

        let (title, colour) = match outcome {
            ActionOutcome::SkippedNoSafetyLayer | ActionOutcome::BanFailed { .. } => {
                ("⚪ PhishGuard — ban pominięty", COLOUR_SKIPPED)
            }
            _ => ("🔴 PhishGuard — ban", COLOUR_BAN),
        };
        let entry = self
            .entry_for(decision, msg, title, colour)
            .field("Wynik", outcome.describe(), false);
        self.post_log(msg.guild_id, LogDestination::BanLog, entry).await;
        outcome
    }

    async fn escalate(&self, req: &Arc<BanRequest>, policy: &PolicyConfig) -> ActionOutcome {
        for r in &self.reviewers {
            match with_timeout(self.call_timeout, r.submit(req)).await {
                Ok(ReviewAck::Accepted) => {
                    return ActionOutcome::SubmittedToSafety {
                        reviewer: r.name().to_string(),
                    };
                }
                Ok(ReviewAck::Declined) => {
                    tracing::debug!(reviewer = r.name(), "safety reviewer declined");
                }
                Err(e) => {
                    tracing::warn!(error=%e, reviewer = r.name(), "safety reviewer failed");
                }
            }
        }

        if let Some(listeners) = self.bus.publish(PhishEvent::BanRequested(req.clone())) {
            return ActionOutcome::EventDispatched { listeners };
        }

        if policy.safety_required {
            tracing::warn!(
                guild_id = req.guild_id,
                user_id = req.user_id,
                message_id = req.message_id,
                "skipped, no safety layer"
            );
            return ActionOutcome::SkippedNoSafetyLayer;
        }

        let ban = with_timeout(
            self.call_timeout,
            self.api
                .ban(req.guild_id, req.user_id, req.delete_message_days, &req.reason),
        )
        .await;
        if let Err(e) = ban {
            tracing::warn!(error=%e, guild_id = req.guild_id, user_id = req.user_id, "direct ban failed");
            return ActionOutcome::BanFailed { error: e.to_string() };
        }

        let deleted = match with_timeout(
            self.call_timeout,
            self.api.delete_message(req.channel_id, req.message_id),
        )
        .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error=%e, message_id = req.message_id, "delete after ban failed");
                false
            }
        };
        ActionOutcome::DirectBan { message_deleted: deleted }
    }

    async fn execute_whitelist(&self, decision: &Decision, msg: &InboundMessage) -> ActionOutcome {
        let mut added = 0usize;
        for rep in decision.deciding() {
            let Some(h) = rep.content_hash.clone() else {
                continue;
            };
            match self.whitelist.add(h).await {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(error=%e, "whitelist add failed"),
            }
        }
        let outcome = ActionOutcome::Whitelisted { added };
        let entry = self
            .entry_for(decision, msg, "🟢 PhishGuard — whitelist", COLOUR_WHITELIST)
            .field("Wynik", outcome.describe(), false);
        self.post_log(msg.guild_id, LogDestination::Whitelist, entry).await;
        outcome
    }

    /// Dopisuje do sygnatur hashe banowanych obrazków, których jeszcze nie znamy.
    async fn promote_matches(&self, decision: &Decision) {
        let Some(store) = &self.promote_into else {
            return;
        };
        for rep in decision.deciding() {
            let Some(h) = &rep.hashes else {
                continue;
            };
            if store.best_match(h).await.is_some() {
                continue;
            }
            let note = format!("auto: {}", rep.label);
            if let Err(e) = store.add_hashes(h, &note, "phishguard").await {
                tracing::warn!(error=%e, "signature promotion failed");
            }
        }
    }

    fn entry_for(
        &self,
        decision: &Decision,
        msg: &InboundMessage,
        title: &str,
        colour: u32,
    ) -> LogEntry {
        let hashes = decision
            .content_hashes()
            .iter()
            .map(|h| format!("`{}`", h.short()))
            .collect::<Vec<_>>()
            .join(", ");
        let conf = decision
            .best_confidence()
            .map(|c| format!("{:.3}", c))
            .unwrap_or_else(|| "—".into());
        LogEntry::new(title, colour)
            .field("Użytkownik", format!("<@{}> (`{}`)", msg.author_id, msg.author_id), true)
            .field("Kanał", format!("<#{}>", msg.channel_id), true)
            .field("Wiadomość", format!("`{}`", msg.message_id), true)
            .field("Werdykt", decision.verdict.as_str(), true)
            .field("Etykieta", decision.label(), true)
            .field("Pewność", conf, true)
            .field("SHA-256", if hashes.is_empty() { "—".into() } else { hashes }, false)
            .footer(BRAND_FOOTER)
    }

    /// Best effort; usunięcie po czasie odpala osobny task.
    async fn post_log(&self, guild_id: u64, dest: LogDestination, entry: LogEntry) {
        let posted = with_timeout(self.call_timeout, self.api.send_log(guild_id, dest, &entry)).await;
        let mref = match posted {
            Ok(Some(m)) => m,
            Ok(None) => {
                tracing::debug!(guild_id, dest = dest.as_str(), "no log destination");
                return;
            }
            Err(e) => {
                tracing::warn!(error=%e, guild_id, dest = dest.as_str(), "log delivery failed");
                return;
            }
        };
        if let Some(after) = self.retention.for_destination(dest) {
            let api = self.api.clone();
            let timeout = self.call_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if let Err(e) = with_timeout(timeout, api.delete_log(mref)).await {
                    tracing::debug!(error=%e, "log auto-delete failed");
                }
            });
        }
    }
}
