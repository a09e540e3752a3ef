use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A resolved display identity, keyed by normalized phone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Digits only, no separators, no leading `+`.
    pub phone: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Opaque media reference for the avatar; binary content is fetched
    /// and cached separately.
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

/// Strips everything but ASCII digits: `+52 1 (55) 1234-5678` and
/// `5215512345678` normalize to the same cache key.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Shape check for pairing-code requests: an E.164-like digit string.
/// Full validation is the server's concern.
pub fn is_plausible_msisdn(digits: &str) -> bool {
    (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}
