//! File record types
//!
//! A [`FileRecord`] describes one transfer: who may manage it, who may fetch it,
//! the current challenge nonce and the limits that make it disappear.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Nonce length in bytes
pub const NONCE_LEN: usize = 16;

/// Random bytes behind a public file identifier (128-bit)
pub const FILE_ID_BYTES: usize = 16;

/// Random bytes behind an owner token
pub const OWNER_TOKEN_BYTES: usize = 16;

/// TTL reported for records without a time expiry
pub const UNLIMITED_TTL: i64 = -1;

// ============================================================================
// Nonce
// ============================================================================

/// Single-use challenge value advertised to clients.
///
/// Stored as hex in snapshots, advertised as base58 on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Generate a fresh random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    /// Wire encoding used in challenge headers
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }

    /// Parse a base58 nonce as advertised in a challenge header
    pub fn from_base58(value: &str) -> Option<Self> {
        let bytes = bs58::decode(value).into_vec().ok()?;
        let bytes: [u8; NONCE_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", self.to_base58())
    }
}

impl From<Nonce> for String {
    fn from(nonce: Nonce) -> Self {
        hex::encode(nonce.0)
    }
}

impl TryFrom<String> for Nonce {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&value).map_err(|e| format!("invalid nonce hex: {}", e))?;
        let bytes: [u8; NONCE_LEN] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("invalid nonce length: {}", v.len()))?;
        Ok(Self(bytes))
    }
}

// ============================================================================
// File Record
// ============================================================================

/// Returned when a download would exceed the record's limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("download limit reached")]
pub struct LimitReached;

/// Metadata entry for one in-flight or completed transfer
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Public identifier (hex)
    pub id: String,

    /// Secret held by the uploader
    pub owner_token: String,

    /// Base58 secret whose decoded bytes key the nonce proofs
    pub auth_secret: String,

    /// Current challenge
    pub nonce: Nonce,

    #[serde(default)]
    pub password_protected: bool,

    /// Opaque client metadata
    #[serde(default)]
    pub metadata: String,

    /// Absolute expiry, `None` means no time expiry
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,

    /// 0 means unlimited
    #[serde(default)]
    pub download_limit: u32,

    #[serde(default)]
    pub download_count: u32,

    /// Blob size, set once the upload finalizes
    #[serde(default)]
    pub length: Option<u64>,
}

impl FileRecord {
    /// Create a record with freshly generated id, owner token and nonce
    pub fn new(
        auth_secret: String,
        metadata: String,
        expire_at: Option<DateTime<Utc>>,
        download_limit: u32,
        password_protected: bool,
    ) -> Self {
        Self {
            id: random_hex(FILE_ID_BYTES),
            owner_token: random_hex(OWNER_TOKEN_BYTES),
            auth_secret,
            nonce: Nonce::random(),
            password_protected,
            metadata,
            expire_at,
            download_limit,
            download_count: 0,
            length: None,
        }
    }

    /// A record past its expiry is dead even before the janitor reaps it
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }

    /// Whether the upload finished
    pub fn is_complete(&self) -> bool {
        self.length.is_some()
    }

    pub fn is_exhausted(&self) -> bool {
        self.download_limit != 0 && self.download_count >= self.download_limit
    }

    /// Whether the next download uses the last allowed slot
    pub fn is_final_download(&self) -> bool {
        self.download_limit != 0 && self.download_count.saturating_add(1) >= self.download_limit
    }

    /// Remaining time to live in milliseconds, [`UNLIMITED_TTL`] without expiry
    pub fn ttl_millis(&self, now: DateTime<Utc>) -> i64 {
        match self.expire_at {
            Some(at) => (at - now).num_milliseconds().max(0),
            None => UNLIMITED_TTL,
        }
    }

    /// Replace the nonce, returning the new value
    pub fn rotate_nonce(&mut self) -> Nonce {
        let mut next = Nonce::random();
        while next == self.nonce {
            next = Nonce::random();
        }
        self.nonce = next;
        next
    }

    /// Take one download slot
    pub fn claim_download(&mut self) -> Result<(), LimitReached> {
        if self.is_exhausted() {
            return Err(LimitReached);
        }
        self.download_count += 1;
        Ok(())
    }

    /// Give back a slot taken by a download that never started
    pub fn release_download(&mut self) {
        self.download_count = self.download_count.saturating_sub(1);
    }
}

impl fmt::Debug for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRecord")
            .field("id", &self.id)
            .field("nonce", &self.nonce)
            .field("password_protected", &self.password_protected)
            .field("expire_at", &self.expire_at)
            .field("download_limit", &self.download_limit)
            .field("download_count", &self.download_count)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Random bytes, hex encoded
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ============================================================================
// Tests
// ============================================================================
