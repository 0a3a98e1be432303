//! Upload wire types
//!
//! The first message on an upload connection is a JSON handshake. The server
//! answers with the new file's id, owner token and share url, then accepts raw
//! chunks until a single `0x00` byte marks the end.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::blob::BlobError;
use crate::channel::ChannelError;
use crate::config::LimitsConfig;

// ============================================================================
// Constants
// ============================================================================

/// Message that finalizes an upload
pub const COMPLETE_SENTINEL: &[u8] = &[0x00];

// ============================================================================
// Handshake Types
// ============================================================================

/// First message of an upload
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeRequest {
    /// `"send-v1 <base58 secret>"` or a bare base58 secret
    pub authorization: String,

    #[serde(rename = "fileMetadata", default)]
    pub file_metadata: Option<String>,

    /// Download limit, 0 = unlimited
    #[serde(rename = "dlimit", default, deserialize_with = "lenient_u64")]
    pub download_limit: u64,

    /// Lifetime in seconds, 0 = no expiry
    #[serde(rename = "timeLimit", default, deserialize_with = "lenient_u64")]
    pub time_limit: u64,

    #[serde(rename = "has_password", default, deserialize_with = "lenient_bool")]
    pub has_password: bool,
}

/// Expiry and limit of a new record after clamping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTerms {
    pub expire_at: Option<DateTime<Utc>>,
    pub download_limit: u32,
}

impl HandshakeRequest {
    /// Clamp the requested terms to the server limits.
    ///
    /// Out-of-range values fall back to "no expiry" and "unlimited" rather
    /// than being capped.
    pub fn terms(&self, limits: &LimitsConfig, now: DateTime<Utc>) -> TransferTerms {
        let expire_at = match self.time_limit {
            0 => None,
            secs if secs > limits.max_ttl_secs => None,
            secs => i64::try_from(secs)
                .ok()
                .and_then(|secs| now.checked_add_signed(Duration::seconds(secs))),
        };

        let download_limit = match u32::try_from(self.download_limit) {
            Ok(limit) if limit <= limits.max_download_limit => limit,
            _ => 0,
        };

        TransferTerms {
            expire_at,
            download_limit,
        }
    }
}

/// Reply to a successful handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeAck {
    pub id: String,
    #[serde(rename = "ownerToken")]
    pub owner_token: String,
    /// Share link for recipients
    pub url: String,
}

/// Reply to the completion sentinel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompleteAck {
    pub ok: bool,
}

// ============================================================================
// Lenient Fields
// ============================================================================

/// Accept numbers, numeric strings and garbage; garbage, negatives and
/// fractions degrade to a whole non-negative number or 0.
fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_u64().is_some_and(|n| n != 0),
        _ => false,
    })
}

// ============================================================================
// Errors
// ============================================================================

/// Why an upload session was aborted
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("upload exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("file record no longer exists")]
    RecordGone,

    #[error("storage error: {0}")]
    Storage(#[from] BlobError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("connection closed before completion")]
    Disconnected,
}
