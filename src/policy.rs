// src/policy.rs
//
// Progi decyzji i flagi bezpieczeństwa. Jedna decyzja widzi jeden snapshot (Arc),
// przeładowanie podmienia snapshot między decyzjami.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub phash_min_threshold: f64,
    pub phash_strong_threshold: f64,
    pub auto_whitelist_if_phash_below: f64,
    pub delete_message_days: u8,
    pub safety_required: bool,
    pub reference_required_for_ban: bool,
    pub direct_ban_on_strong: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            phash_min_threshold: 0.90,
            phash_strong_threshold: 0.98,
            auto_whitelist_if_phash_below: 0.50,
            delete_message_days: 7,
            safety_required: true,
            reference_required_for_ban: true,
            direct_ban_on_strong: false,
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errs = Vec::new();
        for (name, value) in [
            ("phash_min_threshold", self.phash_min_threshold),
            ("phash_strong_threshold", self.phash_strong_threshold),
            ("auto_whitelist_if_phash_below", self.auto_whitelist_if_phash_below),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errs.push(ConfigError::ThresholdOutOfRange { name, value });
            }
        }
        if errs.is_empty() {
            if self.phash_strong_threshold < self.phash_min_threshold {
                errs.push(ConfigError::StrongBelowMin {
                    strong: self.phash_strong_threshold,
                    min: self.phash_min_threshold,
                });
            }
            if self.auto_whitelist_if_phash_below > self.phash_min_threshold {
                errs.push(ConfigError::WhitelistAboveMin {
                    below: self.auto_whitelist_if_phash_below,
                    min: self.phash_min_threshold,
                });
            }
        }
        if self.delete_message_days > 7 {
            errs.push(ConfigError::RetentionTooLong(self.delete_message_days));
        }
        errs
    }

    /// Złe progi → progi domyślne, retencja przycięta do 7 dni. Flagi zostają.
    pub fn sanitize(mut self) -> Self {
        let errs = self.validate();
        if errs.is_empty() {
            return self;
        }
        for e in &errs {
            tracing::warn!(error=%e, "invalid phishguard policy value, falling back to default");
        }
        let thresholds_bad = errs
            .iter()
            .any(|e| !matches!(e, ConfigError::RetentionTooLong(_)));
        if thresholds_bad {
            let d = PolicyConfig::default();
            self.phash_min_threshold = d.phash_min_threshold;
            self.phash_strong_threshold = d.phash_strong_threshold;
            self.auto_whitelist_if_phash_below = d.auto_whitelist_if_phash_below;
        }
        self.delete_message_days = self.delete_message_days.min(7);
        self
    }

    /// Etykieta pewności do logów.
    pub fn confidence_label(&self, confidence: f64) -> &'static str {
        if confidence >= self.phash_strong_threshold {
            "phash_strong"
        } else if confidence >= self.phash_min_threshold {
            "phash_suspected"
        } else {
            "weak"
        }
    }
}

/// Współdzielona, przeładowywalna polityka.
#[derive(Debug)]
pub struct PolicyHandle {
    inner: RwLock<Arc<PolicyConfig>>,
}

impl PolicyHandle {
    pub fn new(cfg: PolicyConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(cfg.sanitize())),
        }
    }

    pub fn current(&self) -> Arc<PolicyConfig> {
        match self.inner.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Podmienia politykę; zwraca nową (po sanityzacji).
    pub fn replace(&self, cfg: PolicyConfig) -> Arc<PolicyConfig> {
        let next = Arc::new(cfg.sanitize());
        match self.inner.write() {
            Ok(mut g) => *g = next.clone(),
            Err(poisoned) => *poisoned.into_inner() = next.clone(),
        }
        tracing::info!(policy=?next, "phishguard policy reloaded");
        next
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}
