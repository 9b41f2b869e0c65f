// src/pipeline.rs
//
// Decyzja dla jednej wiadomości: claim → filtr załączników → whitelist →
// trafienie w indeksie referencyjnym → pewność ze źródeł → werdykt.
// Nic tu nie zwraca błędu: najgorszy przypadek to Skip.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    ledger::ClaimLedger,
    phash::{ContentHash, HashMemo, ImageHashes},
    platform::{AttachmentMeta, InboundMessage, ModerationApi, with_timeout},
    policy::{PolicyConfig, PolicyHandle},
    reference::{ReferenceIndex, ReferenceIndexCache},
    whitelist::ContentWhitelist,
};

/// Werdykty w kolejności rosnącej wagi (`Ord` = ważność).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ModerationVerdict {
    Skip,
    AutoWhitelist,
    FalsePositiveReview,
    StrongMatchBan,
    ExactMatchBan,
}

impl ModerationVerdict {
    pub fn is_ban(self) -> bool {
        matches!(self, ModerationVerdict::ExactMatchBan | ModerationVerdict::StrongMatchBan)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModerationVerdict::Skip => "skip",
            ModerationVerdict::AutoWhitelist => "auto_whitelist",
            ModerationVerdict::FalsePositiveReview => "false_positive_review",
            ModerationVerdict::StrongMatchBan => "strong_match_ban",
            ModerationVerdict::ExactMatchBan => "exact_match_ban",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    AlreadyClaimed,
    NotImage,
    TooLarge,
    AttachmentLimit,
    Unreadable,
    Whitelisted,
    Undecodable,
    NoSignal,
}

/// Wejście dla źródeł pewności.
pub struct Sample<'a> {
    pub guild_id: u64,
    pub attachment: &'a AttachmentMeta,
    pub content_hash: &'a ContentHash,
    pub hashes: &'a ImageHashes,
}

/// Coś, co potrafi ocenić załącznik w skali [0, 1]. `None` = brak zdania.
#[async_trait]
pub trait ConfidenceSource: Send + Sync {
    fn name(&self) -> &str;
    async fn score(&self, sample: &Sample<'_>) -> Option<f64>;
}

#[derive(Debug, Clone)]
pub struct AttachmentReport {
    pub attachment: AttachmentMeta,
    pub verdict: ModerationVerdict,
    pub skip_reason: Option<SkipReason>,
    pub content_hash: Option<ContentHash>,
    pub hashes: Option<Arc<ImageHashes>>,
    pub confidence: Option<f64>,
    pub source: Option<String>,
    pub label: &'static str,
}

impl AttachmentReport {
    fn skipped(att: &AttachmentMeta, reason: SkipReason) -> Self {
        Self {
            attachment: att.clone(),
            verdict: ModerationVerdict::Skip,
            skip_reason: Some(reason),
            content_hash: None,
            hashes: None,
            confidence: None,
            source: None,
            label: "skip",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub message_id: u64,
    pub verdict: ModerationVerdict,
    /// Właściciel wiadomości, gdy ktoś był pierwszy.
    pub claimed_by: Option<String>,
    pub attachments: Vec<AttachmentReport>,
    pub policy: Arc<PolicyConfig>,
}

impl Decision {
    pub fn best_confidence(&self) -> Option<f64> {
        self.attachments
            .iter()
            .filter_map(|a| a.confidence)
            .reduce(f64::max)
    }

    pub fn exact_hit(&self) -> bool {
        self.attachments
            .iter()
            .any(|a| a.verdict == ModerationVerdict::ExactMatchBan)
    }

    pub fn content_hashes(&self) -> Vec<ContentHash> {
        self.attachments
            .iter()
            .filter_map(|a| a.content_hash.clone())
            .collect()
    }

    /// Raporty, które wyznaczyły werdykt wiadomości.
    pub fn deciding(&self) -> impl Iterator<Item = &AttachmentReport> {
        self.attachments.iter().filter(move |a| a.verdict == self.verdict)
    }

    pub fn label(&self) -> &'static str {
        self.deciding().next().map(|a| a.label).unwrap_or("skip")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    pub max_attachment_bytes: u64,
    pub max_attachments: usize,
    pub call_timeout: Duration,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            max_attachment_bytes: 8 * 1024 * 1024,
            max_attachments: 10,
            call_timeout: Duration::from_secs(5),
        }
    }
}

pub struct DecisionPipeline {
    actor: String,
    api: Arc<dyn ModerationApi>,
    ledger: Arc<ClaimLedger>,
    reference: ReferenceIndexCache,
    whitelist: Arc<ContentWhitelist>,
    sources: Vec<Arc<dyn ConfidenceSource>>,
    policy: Arc<PolicyHandle>,
    memo: HashMemo,
    limits: PipelineLimits,
}

impl DecisionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        actor: impl Into<String>,
        api: Arc<dyn ModerationApi>,
        ledger: Arc<ClaimLedger>,
        reference: ReferenceIndexCache,
        whitelist: Arc<ContentWhitelist>,
        sources: Vec<Arc<dyn ConfidenceSource>>,
        policy: Arc<PolicyHandle>,
        memo: HashMemo,
        limits: PipelineLimits,
    ) -> Self {
        Self {
            actor: actor.into(),
            api,
            ledger,
            reference,
            whitelist,
            sources,
            policy,
            memo,
            limits,
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn ledger(&self) -> &ClaimLedger {
        &self.ledger
    }

    pub fn reference(&self) -> &ReferenceIndexCache {
        &self.reference
    }

    pub fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    pub async fn evaluate(&self, msg: &InboundMessage) -> Decision {
        let policy = self.policy.current();

        if !self.ledger.claim(msg.message_id, &self.actor) {
            let owner = self.ledger.who_claimed(msg.message_id);
            tracing::debug!(message_id = msg.message_id, owner = ?owner, "message already claimed");
            return Decision {
                message_id: msg.message_id,
                verdict: ModerationVerdict::Skip,
                claimed_by: owner,
                attachments: msg
                    .attachments
                    .iter()
                    .map(|a| AttachmentReport::skipped(a, SkipReason::AlreadyClaimed))
                    .collect(),
                policy,
            };
        }

        // indeks pobieramy raz na wiadomość i dopiero gdy jest co sprawdzać
        let mut index: Option<Arc<ReferenceIndex>> = None;
        let mut reports = Vec::with_capacity(msg.attachments.len());
        for (i, att) in msg.attachments.iter().enumerate() {
            if i >= self.limits.max_attachments {
                reports.push(AttachmentReport::skipped(att, SkipReason::AttachmentLimit));
                continue;
            }
            reports.push(self.classify(msg.guild_id, att, &policy, &mut index).await);
        }

        let verdict = reports
            .iter()
            .map(|r| r.verdict)
            .max()
            .unwrap_or(ModerationVerdict::Skip);

        Decision {
            message_id: msg.message_id,
            verdict,
            claimed_by: None,
            attachments: reports,
            policy,
        }
    }

    async fn classify(
        &self,
        guild_id: u64,
        att: &AttachmentMeta,
        policy: &PolicyConfig,
        index: &mut Option<Arc<ReferenceIndex>>,
    ) -> AttachmentReport {
        if !att.is_image() {
            return AttachmentReport::skipped(att, SkipReason::NotImage);
        }
        if att.size > self.limits.max_attachment_bytes {
            return AttachmentReport::skipped(att, SkipReason::TooLarge);
        }

        let bytes = match with_timeout(self.limits.call_timeout, self.api.read_attachment(att)).await {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(error=%e, attachment = att.id, "attachment unreadable");
                return AttachmentReport::skipped(att, SkipReason::Unreadable);
            }
        };
        if bytes.len() as u64 > self.limits.max_attachment_bytes {
            return AttachmentReport::skipped(att, SkipReason::TooLarge);
        }

        let content = ContentHash::of(&bytes);
        let mut report = AttachmentReport::skipped(att, SkipReason::NoSignal);
        report.content_hash = Some(content.clone());

        if self.whitelist.contains(&content).await {
            report.skip_reason = Some(SkipReason::Whitelisted);
            return report;
        }

        let idx = match index.as_ref() {
            Some(i) => i.clone(),
            None => {
                let i = self.reference.get_index(guild_id).await;
                *index = Some(i.clone());
                i
            }
        };
        // hashe liczymy też przy trafieniu (promocja do sygnatur)
        let hashes = self.memo.get_or_compute(&content, &bytes).await.ok();
        report.hashes = hashes.clone();

        // trafienie dokładne wygrywa z każdą pewnością
        if idx.contains(&content) {
            report.verdict = ModerationVerdict::ExactMatchBan;
            report.skip_reason = None;
            report.confidence = Some(1.0);
            report.source = Some("reference_index".into());
            report.label = "reference_exact";
            return report;
        }

        let Some(hashes) = hashes else {
            report.skip_reason = Some(SkipReason::Undecodable);
            return report;
        };

        let sample = Sample {
            guild_id,
            attachment: att,
            content_hash: &content,
            hashes: &hashes,
        };
        let mut best: Option<(f64, &str)> = None;
        for src in &self.sources {
            let Some(conf) = src.score(&sample).await else {
                continue;
            };
            if !conf.is_finite() {
                continue;
            }
            let conf = conf.clamp(0.0, 1.0);
            if best.is_none_or(|(b, _)| conf > b) {
                best = Some((conf, src.name()));
            }
        }
        let Some((conf, source)) = best else {
            return report;
        };

        report.confidence = Some(conf);
        report.source = Some(source.to_string());
        report.skip_reason = None;
        report.verdict = verdict_for_confidence(conf, policy);
        report.label = policy.confidence_label(conf);
        report
    }
}

/// Werdykt bez trafienia w indeksie referencyjnym.
///
/// Ban na samą pewność tylko przy `direct_ban_on_strong` i gdy referencja
/// nie jest wymagana; brak wymogu referencji nigdy sam z siebie nie banuje.
pub fn verdict_for_confidence(conf: f64, policy: &PolicyConfig) -> ModerationVerdict {
    if conf >= policy.phash_strong_threshold
        && policy.direct_ban_on_strong
        && !policy.reference_required_for_ban
    {
        ModerationVerdict::StrongMatchBan
    } else if conf < policy.auto_whitelist_if_phash_below {
        ModerationVerdict::AutoWhitelist
    } else {
        ModerationVerdict::FalsePositiveReview
    }
}
