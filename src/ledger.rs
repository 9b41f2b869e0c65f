// src/ledger.rs
//
// Rejestr "kto już obsługuje tę wiadomość". Wspólny dla wszystkich detektorów;
// wpis żyje TTL sekund, przeterminowane sprzątamy przy każdym wywołaniu.

use std::time::Duration;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::time::Instant;

pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRecord {
    pub actor: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct ClaimLedger {
    ttl: Duration,
    records: DashMap<u64, ClaimRecord>,
}

impl Default for ClaimLedger {
    fn default() -> Self {
        Self::new(DEFAULT_CLAIM_TTL)
    }
}

impl ClaimLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// `true` tylko dla pierwszego chętnego w oknie TTL.
    pub fn claim(&self, message_id: u64, actor: &str) -> bool {
        self.claim_at(message_id, actor, Instant::now())
    }

    pub fn claim_at(&self, message_id: u64, actor: &str, now: Instant) -> bool {
        self.vacuum_at(now);
        let fresh = ClaimRecord {
            actor: actor.to_string(),
            expires_at: now + self.ttl,
        };
        // sprawdzenie i wstawienie pod jednym lockiem shardu
        match self.records.entry(message_id) {
            Entry::Occupied(mut e) => {
                if e.get().expires_at <= now {
                    e.insert(fresh);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(v) => {
                v.insert(fresh);
                true
            }
        }
    }

    pub fn who_claimed(&self, message_id: u64) -> Option<String> {
        self.who_claimed_at(message_id, Instant::now())
    }

    pub fn who_claimed_at(&self, message_id: u64, now: Instant) -> Option<String> {
        self.vacuum_at(now);
        self.records
            .get(&message_id)
            .filter(|r| r.expires_at > now)
            .map(|r| r.actor.clone())
    }

    pub fn vacuum(&self) {
        self.vacuum_at(Instant::now());
    }

    pub fn vacuum_at(&self, now: Instant) {
        self.records.retain(|_, r| r.expires_at > now);
    }

    /// Liczba żywych wpisów.
    pub fn len(&self) -> usize {
        self.vacuum();
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
