mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{GUILD, MockApi, REF_THREAD, banner_image, config_in, guard_with, noise_png, png};
use tempfile::tempdir;
use tigris_phishguard::{
    AppContext,
    config::Settings,
    error::PlatformError,
    executor::{ActionOutcome, BanRequest, PhishEvent, ReviewAck, SafetyReviewer},
    guard::PhishGuard,
    ledger::ClaimLedger,
    phash::ContentHash,
    pipeline::{ConfidenceSource, ModerationVerdict, Sample, SkipReason},
    platform::{InboundMessage, LogDestination},
    policy::{PolicyConfig, PolicyHandle},
};

struct FixedConfidence(f64);

#[async_trait]
impl ConfidenceSource for FixedConfidence {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn score(&self, _sample: &Sample<'_>) -> Option<f64> {
        Some(self.0)
    }
}

struct StubReviewer {
    name: &'static str,
    answer: Result<ReviewAck, PlatformError>,
    calls: AtomicUsize,
}

impl StubReviewer {
    fn new(name: &'static str, answer: Result<ReviewAck, PlatformError>) -> Arc<Self> {
        Arc::new(Self {
            name,
            answer,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SafetyReviewer for StubReviewer {
    fn name(&self) -> &str {
        self.name
    }

    async fn submit(&self, _request: &BanRequest) -> Result<ReviewAck, PlatformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

fn permissive_policy() -> Arc<PolicyHandle> {
    Arc::new(PolicyHandle::new(PolicyConfig {
        safety_required: false,
        direct_ban_on_strong: true,
        reference_required_for_ban: false,
        ..Default::default()
    }))
}

fn direct_ban_policy() -> Arc<PolicyHandle> {
    Arc::new(PolicyHandle::new(PolicyConfig {
        safety_required: false,
        ..Default::default()
    }))
}

/// Wiadomość z jednym załącznikiem o podanych bajtach.
fn message(api: &MockApi, message_id: u64, bytes: Vec<u8>) -> InboundMessage {
    InboundMessage {
        guild_id: GUILD,
        channel_id: 10,
        message_id,
        author_id: 555,
        attachments: vec![api.attachment(message_id, "promo.png", bytes)],
        ..Default::default()
    }
}

/// Platforma, której wątek referencyjny zawiera `bytes`.
fn api_with_reference(bytes: &[u8]) -> Arc<MockApi> {
    let api = MockApi::new().with_thread(REF_THREAD);
    api.push_reference(1, bytes.to_vec());
    Arc::new(api)
}

#[tokio::test]
async fn exact_reference_hit_beats_low_confidence() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(1);
    let api = api_with_reference(&bytes);
    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .confidence_source(Arc::new(FixedConfidence(0.1)))
        .build();

    let msg = message(&api, 900, bytes.clone());
    let (decision, outcome) = guard.on_message(&msg).await.unwrap();

    assert_eq!(decision.verdict, ModerationVerdict::ExactMatchBan);
    assert!(decision.exact_hit());
    assert_eq!(decision.best_confidence(), Some(1.0));
    assert_eq!(decision.label(), "reference_exact");
    assert_eq!(decision.content_hashes(), vec![ContentHash::of(&bytes)]);

    // domyślnie safety_required = true, a nikt nie słucha
    assert_eq!(outcome, ActionOutcome::SkippedNoSafetyLayer);
    assert_eq!(api.ban_count(), 0);
    assert_eq!(api.logs_to(LogDestination::BanLog).len(), 1);
}

#[tokio::test]
async fn same_message_is_handled_by_one_detector() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(2);
    let api = api_with_reference(&bytes);
    let ledger = Arc::new(ClaimLedger::default());
    let policy = direct_ban_policy();

    let guard_a = PhishGuard::builder(config_in(&dir, "GuardA"), api.clone())
        .ledger(ledger.clone())
        .policy(policy.clone())
        .build();
    let guard_b = PhishGuard::builder(config_in(&dir, "GuardB"), api.clone())
        .ledger(ledger.clone())
        .policy(policy)
        .build();

    let msg = message(&api, 42, bytes);
    let (first, out_a) = guard_a.on_message(&msg).await.unwrap();
    let (second, out_b) = guard_b.on_message(&msg).await.unwrap();

    assert_eq!(first.verdict, ModerationVerdict::ExactMatchBan);
    assert_eq!(out_a, ActionOutcome::DirectBan { message_deleted: true });

    assert_eq!(second.verdict, ModerationVerdict::Skip);
    assert_eq!(second.claimed_by.as_deref(), Some("GuardA"));
    assert_eq!(second.attachments[0].skip_reason, Some(SkipReason::AlreadyClaimed));
    assert_eq!(out_b, ActionOutcome::Skipped);

    assert_eq!(api.ban_count(), 1);
    assert_eq!(ledger.who_claimed(42).as_deref(), Some("GuardA"));
}

#[tokio::test]
async fn direct_ban_purges_history_and_deletes_message() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(3);
    let api = api_with_reference(&bytes);
    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .policy(direct_ban_policy())
        .build();

    let msg = message(&api, 901, bytes);
    let (_, outcome) = guard.on_message(&msg).await.unwrap();

    assert_eq!(outcome, ActionOutcome::DirectBan { message_deleted: true });
    let bans = api.bans.lock().unwrap().clone();
    assert_eq!(bans.len(), 1);
    assert_eq!((bans[0].0, bans[0].1, bans[0].2), (GUILD, 555, 7));
    assert_eq!(api.deleted.lock().unwrap().as_slice(), &[(10, 901)]);
}

#[tokio::test]
async fn failed_ban_is_reported_not_raised() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(4);
    let api = MockApi::new().with_thread(REF_THREAD).failing_bans();
    api.push_reference(1, bytes.clone());
    let api = Arc::new(api);
    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .policy(direct_ban_policy())
        .build();

    let (_, outcome) = guard.on_message(&message(&api, 902, bytes)).await.unwrap();

    assert!(matches!(outcome, ActionOutcome::BanFailed { .. }));
    assert!(api.deleted.lock().unwrap().is_empty());
    assert_eq!(api.logs_to(LogDestination::BanLog).len(), 1);
}

#[tokio::test]
async fn ban_event_reaches_subscribers_instead_of_direct_ban() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(5);
    let api = api_with_reference(&bytes);
    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .policy(direct_ban_policy())
        .build();
    let mut rx = guard.subscribe();

    let (_, outcome) = guard.on_message(&message(&api, 903, bytes)).await.unwrap();

    assert_eq!(outcome, ActionOutcome::EventDispatched { listeners: 1 });
    assert_eq!(api.ban_count(), 0);
    let PhishEvent::BanRequested(req) = rx.try_recv().unwrap();
    assert_eq!((req.guild_id, req.user_id, req.message_id), (GUILD, 555, 903));
    assert_eq!(req.verdict, ModerationVerdict::ExactMatchBan);
}

#[tokio::test]
async fn reviewers_are_tried_in_order() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(6);
    let api = api_with_reference(&bytes);
    let broken = StubReviewer::new("broken", Err(PlatformError::Transient("503".into())));
    let busy = StubReviewer::new("busy", Ok(ReviewAck::Declined));
    let staff = StubReviewer::new("staff", Ok(ReviewAck::Accepted));
    let never = StubReviewer::new("never", Ok(ReviewAck::Accepted));

    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .reviewer(broken.clone())
        .reviewer(busy.clone())
        .reviewer(staff.clone())
        .reviewer(never.clone())
        .build();

    let (_, outcome) = guard.on_message(&message(&api, 904, bytes)).await.unwrap();

    assert_eq!(
        outcome,
        ActionOutcome::SubmittedToSafety {
            reviewer: "staff".into()
        }
    );
    assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
    assert_eq!(busy.calls.load(Ordering::SeqCst), 1);
    assert_eq!(never.calls.load(Ordering::SeqCst), 0);
    assert_eq!(api.ban_count(), 0);
}

#[tokio::test]
async fn whitelisted_content_is_skipped_even_if_referenced() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(7);
    let api = api_with_reference(&bytes);
    let guard = guard_with(&api, config_in(&dir, "PhishGuard"));
    guard.whitelist().add(ContentHash::of(&bytes)).await.unwrap();

    let (decision, outcome) = guard.on_message(&message(&api, 905, bytes)).await.unwrap();

    assert_eq!(decision.verdict, ModerationVerdict::Skip);
    assert_eq!(decision.attachments[0].skip_reason, Some(SkipReason::Whitelisted));
    assert_eq!(outcome, ActionOutcome::Skipped);
    assert!(api.logs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn undecodable_image_is_skipped() {
    let dir = tempdir().unwrap();
    let api = Arc::new(MockApi::new());
    let guard = guard_with(&api, config_in(&dir, "PhishGuard"));

    let msg = message(&api, 906, b"definitely not a png".to_vec());
    let (decision, outcome) = guard.on_message(&msg).await.unwrap();

    assert_eq!(decision.verdict, ModerationVerdict::Skip);
    assert_eq!(decision.attachments[0].skip_reason, Some(SkipReason::Undecodable));
    assert_eq!(outcome, ActionOutcome::Skipped);
    assert_eq!(api.ban_count(), 0);
}

#[tokio::test]
async fn non_images_and_bots_are_ignored() {
    let dir = tempdir().unwrap();
    let api = Arc::new(MockApi::new());
    let guard = guard_with(&api, config_in(&dir, "PhishGuard"));

    let mut msg = InboundMessage {
        guild_id: GUILD,
        channel_id: 10,
        message_id: 907,
        author_id: 555,
        attachments: vec![api.attachment(907, "notes.txt", b"hello".to_vec())],
        ..Default::default()
    };
    let (decision, _) = guard.on_message(&msg).await.unwrap();
    assert_eq!(decision.attachments[0].skip_reason, Some(SkipReason::NotImage));

    msg.message_id = 908;
    msg.author_is_bot = true;
    assert!(guard.on_message(&msg).await.is_none());
}

#[tokio::test]
async fn blacklisted_image_goes_to_review_by_default() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(8);
    let api = Arc::new(MockApi::new());
    let guard = guard_with(&api, config_in(&dir, "PhishGuard"));
    guard.signatures().add(&bytes, "scam", "tester").await.unwrap();

    let (decision, outcome) = guard.on_message(&message(&api, 909, bytes)).await.unwrap();

    assert_eq!(decision.verdict, ModerationVerdict::FalsePositiveReview);
    assert_eq!(decision.best_confidence(), Some(1.0));
    assert_eq!(decision.label(), "phash_strong");
    assert_eq!(decision.attachments[0].source.as_deref(), Some("signature_store"));
    assert_eq!(outcome, ActionOutcome::FlaggedForReview);
    assert_eq!(api.logs_to(LogDestination::FalsePositive).len(), 1);
    assert_eq!(api.ban_count(), 0);
}

#[tokio::test]
async fn strong_match_bans_directly_when_allowed() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(9);
    let api = Arc::new(MockApi::new());
    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .policy(permissive_policy())
        .build();
    guard.signatures().add(&bytes, "scam", "tester").await.unwrap();

    let (decision, outcome) = guard.on_message(&message(&api, 910, bytes)).await.unwrap();

    assert_eq!(decision.verdict, ModerationVerdict::StrongMatchBan);
    assert_eq!(outcome, ActionOutcome::DirectBan { message_deleted: true });
    // identyczne hashe nie są dublowane przy promocji
    assert_eq!(guard.signatures().len().await, 1);
}

#[tokio::test]
async fn low_confidence_is_whitelisted_once() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(10);
    let api = Arc::new(MockApi::new());
    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .confidence_source(Arc::new(FixedConfidence(0.2)))
        .build();

    let (decision, outcome) = guard.on_message(&message(&api, 911, bytes.clone())).await.unwrap();
    assert_eq!(decision.verdict, ModerationVerdict::AutoWhitelist);
    assert_eq!(outcome, ActionOutcome::Whitelisted { added: 1 });
    assert!(guard.whitelist().contains(&ContentHash::of(&bytes)).await);
    assert_eq!(api.logs_to(LogDestination::Whitelist).len(), 1);

    let (again, _) = guard.on_message(&message(&api, 912, bytes)).await.unwrap();
    assert_eq!(again.attachments[0].skip_reason, Some(SkipReason::Whitelisted));
}

#[tokio::test]
async fn no_signal_means_skip() {
    let dir = tempdir().unwrap();
    let api = Arc::new(MockApi::new());
    let guard = guard_with(&api, config_in(&dir, "PhishGuard"));

    let (decision, outcome) = guard.on_message(&message(&api, 913, noise_png(11))).await.unwrap();

    assert_eq!(decision.verdict, ModerationVerdict::Skip);
    assert_eq!(decision.attachments[0].skip_reason, Some(SkipReason::NoSignal));
    assert_eq!(outcome, ActionOutcome::Skipped);
}

#[tokio::test]
async fn app_context_installs_guard_once() {
    let dir = tempdir().unwrap();
    let mut settings = Settings::defaults("test");
    settings.phishguard = config_in(&dir, "PhishGuard");
    let app = AppContext::new_testing(settings, None);
    assert!(app.guard().is_none());

    let api = Arc::new(MockApi::new());
    let first = app.install_guard(|| {
        Arc::new(
            PhishGuard::builder(app.settings.phishguard.clone(), api.clone())
                .ledger(app.ledger.clone())
                .policy(app.policy.clone())
                .build(),
        )
    });
    let again = app.install_guard(|| panic!("reconnect must reuse the installed guard"));

    assert!(Arc::ptr_eq(&first, &again));
    assert!(app.guard().is_some_and(|g| Arc::ptr_eq(&g, &first)));
    assert!(app.ledger.is_empty());
}

#[tokio::test]
async fn shared_blank_banner_does_not_ban_unrelated_image() {
    let dir = tempdir().unwrap();
    let api = Arc::new(MockApi::new());
    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .policy(permissive_policy())
        .build();
    guard
        .signatures()
        .add(&png(&banner_image(100, false)), "scam", "tester")
        .await
        .unwrap();

    let msg = message(&api, 920, png(&banner_image(7777, true)));
    let (decision, outcome) = guard.on_message(&msg).await.unwrap();

    assert!(!decision.verdict.is_ban(), "verdict {:?}", decision.verdict);
    assert!(!matches!(outcome, ActionOutcome::DirectBan { .. }));
    assert_eq!(api.ban_count(), 0);
}

#[tokio::test]
async fn staff_posting_a_reference_image_is_not_checked() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(12);
    let api = api_with_reference(&bytes);
    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .policy(direct_ban_policy())
        .build();

    let mut msg = message(&api, 921, bytes.clone());
    msg.author_is_staff = true;
    assert!(guard.on_message(&msg).await.is_none());
    assert_eq!(api.ban_count(), 0);

    // z wyłączonym wyjątkiem dla moderatorów liczy się tylko treść
    let mut cfg = config_in(&dir, "Strict");
    cfg.exempt_staff = false;
    let strict = PhishGuard::builder(cfg, api.clone())
        .policy(direct_ban_policy())
        .build();
    let mut msg = message(&api, 922, bytes);
    msg.author_is_staff = true;
    let (decision, _) = strict.on_message(&msg).await.unwrap();
    assert_eq!(decision.verdict, ModerationVerdict::ExactMatchBan);
}

#[tokio::test]
async fn log_channel_its_threads_and_reference_thread_are_not_checked() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(13);
    let api = MockApi::new().with_thread(REF_THREAD).with_log_channel(500);
    api.push_reference(1, bytes.clone());
    let api = Arc::new(api);
    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .policy(direct_ban_policy())
        .build();

    let mut in_logs = message(&api, 923, bytes.clone());
    in_logs.channel_id = 500;
    assert!(guard.on_message(&in_logs).await.is_none());

    let mut in_log_thread = message(&api, 924, bytes.clone());
    in_log_thread.channel_id = 600;
    in_log_thread.parent_channel_id = Some(500);
    assert!(guard.on_message(&in_log_thread).await.is_none());

    // wątek referencyjny rozpoznany po zbudowaniu indeksu, nawet bez rodzica
    guard.reference().get_index(GUILD).await;
    let mut in_reference = message(&api, 925, bytes.clone());
    in_reference.channel_id = REF_THREAD;
    assert!(guard.on_message(&in_reference).await.is_none());
    assert_eq!(api.ban_count(), 0);

    let (decision, _) = guard.on_message(&message(&api, 926, bytes)).await.unwrap();
    assert_eq!(decision.verdict, ModerationVerdict::ExactMatchBan);
    assert_eq!(api.ban_count(), 1);
}

#[tokio::test]
async fn most_severe_attachment_decides_the_message() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(14);
    let api = api_with_reference(&bytes);
    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .confidence_source(Arc::new(FixedConfidence(0.1)))
        .build();

    let mut msg = message(&api, 927, noise_png(15));
    msg.attachments.push(api.attachment(9271, "scam.png", bytes));
    let (decision, _) = guard.on_message(&msg).await.unwrap();

    assert_eq!(decision.attachments[0].verdict, ModerationVerdict::AutoWhitelist);
    assert_eq!(decision.attachments[1].verdict, ModerationVerdict::ExactMatchBan);
    assert_eq!(decision.verdict, ModerationVerdict::ExactMatchBan);
}

#[tokio::test]
async fn oversized_and_surplus_attachments_are_skipped() {
    let dir = tempdir().unwrap();
    let api = Arc::new(MockApi::new());
    let mut cfg = config_in(&dir, "PhishGuard");
    cfg.max_attachment_bytes = 4096;
    cfg.max_attachments = 1;
    let guard = guard_with(&api, cfg);

    // zadeklarowany rozmiar ponad limit: nawet nie pobieramy
    let mut declared = message(&api, 928, noise_png(16));
    declared.attachments[0].size = 10 * 1024 * 1024;
    let (decision, _) = guard.on_message(&declared).await.unwrap();
    assert_eq!(decision.attachments[0].skip_reason, Some(SkipReason::TooLarge));

    // rozmiar skłamany w metadanych, prawdziwe bajty za duże
    let mut lying = message(&api, 929, vec![0u8; 8192]);
    lying.attachments[0].size = 100;
    let (decision, _) = guard.on_message(&lying).await.unwrap();
    assert_eq!(decision.attachments[0].skip_reason, Some(SkipReason::TooLarge));

    let mut two = message(&api, 930, noise_png(17));
    two.attachments.push(api.attachment(9301, "second.png", noise_png(18)));
    let (decision, outcome) = guard.on_message(&two).await.unwrap();
    assert_eq!(decision.attachments[1].skip_reason, Some(SkipReason::AttachmentLimit));
    assert_eq!(decision.verdict, ModerationVerdict::Skip);
    assert_eq!(outcome, ActionOutcome::Skipped);
}

#[tokio::test(start_paused = true)]
async fn ban_that_times_out_fails_without_retry() {
    let dir = tempdir().unwrap();
    let bytes = noise_png(19);
    let api = MockApi::new()
        .with_thread(REF_THREAD)
        .slow_bans(Duration::from_secs(60));
    api.push_reference(1, bytes.clone());
    let api = Arc::new(api);
    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .policy(direct_ban_policy())
        .build();

    let (_, outcome) = guard.on_message(&message(&api, 931, bytes)).await.unwrap();

    assert!(matches!(outcome, ActionOutcome::BanFailed { .. }), "{outcome:?}");
    assert_eq!(api.ban_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.ban_count(), 0);
    assert!(api.deleted.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn review_and_whitelist_logs_expire_ban_log_stays() {
    let dir = tempdir().unwrap();
    let banned = noise_png(20);
    let api = api_with_reference(&banned);
    let guard = PhishGuard::builder(config_in(&dir, "PhishGuard"), api.clone())
        .confidence_source(Arc::new(FixedConfidence(0.2)))
        .build();
    let flagged = noise_png(21);
    guard.signatures().add(&flagged, "scam", "tester").await.unwrap();

    guard.on_message(&message(&api, 932, banned)).await.unwrap();
    guard.on_message(&message(&api, 933, flagged)).await.unwrap();
    guard.on_message(&message(&api, 934, noise_png(22))).await.unwrap();

    let ban_ids = api.log_ids_to(LogDestination::BanLog);
    let mut expiring = api.log_ids_to(LogDestination::FalsePositive);
    expiring.extend(api.log_ids_to(LogDestination::Whitelist));
    expiring.sort_unstable();
    assert_eq!((ban_ids.len(), expiring.len()), (1, 2));
    assert!(api.deleted_log_ids().is_empty());

    tokio::time::sleep(Duration::from_secs(3601)).await;

    assert_eq!(api.deleted_log_ids(), expiring);
    assert!(!api.deleted_log_ids().contains(&ban_ids[0]));
}
