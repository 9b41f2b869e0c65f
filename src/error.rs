// src/error.rs
//
// Błędy na granicach I/O. Każdy moduł zwraca swój typ, a dopiero
// orkiestrator (PhishGuard / ActionExecutor) zamienia je na "brak sygnału"
// albo "akcja nieudana" i loguje.

use std::time::Duration;

use thiserror::Error;

/// Obrazek nie dał się zdekodować albo zahashować.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("image decode failed: {0}")]
    Decode(String),
    #[error("hashing task failed: {0}")]
    Task(String),
}

/// Plik sygnatur / whitelisty.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Hash(#[from] HashError),
    #[error("store task failed: {0}")]
    Task(String),
}

/// Wywołania platformy (ban, delete, historia, pobieranie załączników).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request failed: {0}")]
    Transient(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rejected locally: {0}")]
    Rejected(String),
}

/// Niepoprawna polityka (progi poza zakresem itp.).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} = {value} is outside [0, 1]")]
    ThresholdOutOfRange { name: &'static str, value: f64 },
    #[error("phash_strong_threshold ({strong}) is below phash_min_threshold ({min})")]
    StrongBelowMin { strong: f64, min: f64 },
    #[error("auto_whitelist_if_phash_below ({below}) is above phash_min_threshold ({min})")]
    WhitelistAboveMin { below: f64, min: f64 },
    #[error("delete_message_days = {0} exceeds 7")]
    RetentionTooLong(u8),
}
