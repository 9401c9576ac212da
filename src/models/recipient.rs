use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// A coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Device tokens as they appear on a stored recipient document.
///
/// Older clients wrote a bare string, later ones a list, and the current app
/// writes a map of device id to token. All three shapes are accepted and
/// collapsed by [`TokenBag::normalize`] before any selection happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenBag {
    Single(String),
    List(Vec<Option<String>>),
    Devices(BTreeMap<String, Option<String>>),
}

impl TokenBag {
    /// Canonical token list: trimmed, non-empty, first occurrence wins.
    pub fn normalize(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            TokenBag::Single(token) => vec![token.as_str()],
            TokenBag::List(tokens) => tokens.iter().flatten().map(String::as_str).collect(),
            TokenBag::Devices(devices) => devices.values().flatten().map(String::as_str).collect(),
        };

        let mut seen = HashSet::new();
        raw.into_iter()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .filter(|token| seen.insert(*token))
            .map(str::to_string)
            .collect()
    }

    /// The same bag shape with `purged` tokens removed, or `None` when nothing is left.
    pub fn without(&self, purged: &HashSet<String>) -> Option<TokenBag> {
        let keep = |token: &String| !purged.contains(token.trim());

        let remaining = match self {
            TokenBag::Single(token) => keep(token).then(|| TokenBag::Single(token.clone())),
            TokenBag::List(tokens) => {
                let kept: Vec<Option<String>> = tokens
                    .iter()
                    .flatten()
                    .filter(|token| keep(token))
                    .cloned()
                    .map(Some)
                    .collect();
                (!kept.is_empty()).then_some(TokenBag::List(kept))
            }
            TokenBag::Devices(devices) => {
                let kept: BTreeMap<String, Option<String>> = devices
                    .iter()
                    .filter(|(_, token)| token.as_ref().is_some_and(keep))
                    .map(|(device, token)| (device.clone(), token.clone()))
                    .collect();
                (!kept.is_empty()).then_some(TokenBag::Devices(kept))
            }
        };

        remaining.filter(|bag| !bag.normalize().is_empty())
    }
}

/// Raw recipient document as held by the recipient store (`user_tokens`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientRecord {
    #[serde(default)]
    pub user_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenBag>,

    /// Legacy single-token field kept by older app builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcm_token: Option<String>,

    /// Absent means inactive, matching the `isActive == true` store query.
    #[serde(default)]
    pub is_active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_lat: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_lng: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl RecipientRecord {
    pub fn location(&self) -> Option<GeoPoint> {
        match (self.last_known_lat, self.last_known_lng) {
            (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)).filter(GeoPoint::is_valid),
            _ => None,
        }
    }

    pub fn all_tokens(&self) -> Vec<String> {
        let mut tokens = self
            .tokens
            .as_ref()
            .map(TokenBag::normalize)
            .unwrap_or_default();

        if let Some(legacy) = self.fcm_token.as_deref().map(str::trim)
            && !legacy.is_empty()
            && !tokens.iter().any(|t| t == legacy)
        {
            tokens.push(legacy.to_string());
        }

        tokens
    }

    /// Drops `purged` tokens in place. Returns `true` when anything changed.
    ///
    /// A record left without tokens is deactivated.
    pub fn purge(&mut self, purged: &HashSet<String>) -> bool {
        let before = self.all_tokens();
        if !before.iter().any(|token| purged.contains(token)) {
            return false;
        }

        self.tokens = self.tokens.as_ref().and_then(|bag| bag.without(purged));
        if self
            .fcm_token
            .as_deref()
            .is_some_and(|token| purged.contains(token.trim()))
        {
            self.fcm_token = None;
        }

        if self.all_tokens().is_empty() {
            self.is_active = false;
        }

        true
    }
}

/// A recipient with its token bag already normalised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: String,
    pub tokens: Vec<String>,
    pub is_active: bool,
    pub location: Option<GeoPoint>,
    pub platform: Option<String>,
}

impl Recipient {
    /// `doc_id` is used when the document predates the `userId` field.
    pub fn from_record(doc_id: &str, record: &RecipientRecord) -> Self {
        let user_id = if record.user_id.is_empty() {
            doc_id.to_string()
        } else {
            record.user_id.clone()
        };

        Self {
            user_id,
            tokens: record.all_tokens(),
            is_active: record.is_active,
            location: record.location(),
            platform: record.platform.clone(),
        }
    }

    pub fn token(&self, token: &str) -> RecipientToken {
        RecipientToken {
            user_id: self.user_id.clone(),
            token: token.to_string(),
            is_active: self.is_active,
            location: self.location,
            platform: self.platform.clone(),
        }
    }
}

/// One deliverable device token and the recipient it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientToken {
    pub user_id: String,
    pub token: String,
    pub is_active: bool,
    pub location: Option<GeoPoint>,
    pub platform: Option<String>,
}
