//! Nonce challenge/response authentication
//!
//! Every response about a file advertises the record's current nonce:
//!
//! ```text
//! WWW-Authenticate: send-v1 <base58(nonce)>
//! ```
//!
//! A recipient proves knowledge of the auth secret by sending
//! `Authorization: send-v1 <base58(HMAC-SHA256(secret, nonce))>`. A valid proof
//! rotates the nonce before the response is built, so a captured proof cannot
//! be replayed. An invalid proof leaves the nonce untouched so the client can
//! retry against the value it already signed.
//!
//! Owner operations compare the owner token directly and never rotate.

use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::store::{FileRecord, FileStore, LimitReached, Nonce, NonceRotation};

type HmacSha256 = Hmac<Sha256>;

/// Scheme used in both challenge and authorization headers
pub const AUTH_SCHEME: &str = "send-v1";

/// Proof bytes (HMAC-SHA256 output)
pub type Proof = [u8; 32];

// ============================================================================
// Errors
// ============================================================================

/// Authentication outcome other than success
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Authorization header missing or not `<scheme> <proof>`
    #[error("malformed authorization header")]
    Malformed,

    /// Unknown, expired or unfinished record
    #[error("file not found")]
    NotFound,

    /// Bad proof or owner token; carries the unchanged challenge when one applies
    #[error("unauthorized")]
    Unauthorized { challenge: Option<Nonce> },

    /// Download limit already used up
    #[error("download limit reached")]
    Exhausted { challenge: Nonce },
}

// ============================================================================
// Proofs
// ============================================================================

/// Decode a base58 auth secret. Empty or invalid secrets are rejected.
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let bytes = bs58::decode(secret.trim()).into_vec().ok()?;
    (!bytes.is_empty()).then_some(bytes)
}

/// Compute the proof for `nonce` keyed by the raw secret bytes
pub fn create_proof(secret: &[u8], nonce: &Nonce) -> Proof {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(nonce.as_bytes());
    let mut proof = [0u8; 32];
    proof.copy_from_slice(&mac.finalize().into_bytes());
    proof
}

/// Client-side helper: the full `Authorization` header value for a base58 secret
pub fn authorization_value(secret: &str, nonce: &Nonce) -> Option<String> {
    let key = decode_secret(secret)?;
    let proof = create_proof(&key, nonce);
    Some(format!("{} {}", AUTH_SCHEME, bs58::encode(proof).into_string()))
}

/// Verify a presented proof against a base58 secret and nonce in constant time
pub fn verify_proof(secret: &str, nonce: &Nonce, proof: &[u8]) -> bool {
    let Some(key) = decode_secret(secret) else {
        return false;
    };
    let expected = create_proof(&key, nonce);
    expected.as_slice().ct_eq(proof).into()
}

/// Constant-time owner token comparison
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

// ============================================================================
// Headers
// ============================================================================

/// Challenge header value for a nonce
pub fn challenge_value(nonce: &Nonce) -> HeaderValue {
    HeaderValue::from_str(&format!("{} {}", AUTH_SCHEME, nonce.to_base58()))
        .expect("base58 is valid header text")
}

/// Extract the proof bytes from an `Authorization` header.
///
/// A missing header or one without a space is malformed. A proof that does not
/// decode as base58 is returned empty and fails verification like any other
/// wrong proof.
pub fn parse_authorization(headers: &HeaderMap) -> Result<Vec<u8>, AuthError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::Malformed)?;

    let (_scheme, proof) = value.trim().split_once(' ').ok_or(AuthError::Malformed)?;
    let proof = proof.trim();
    if proof.is_empty() {
        return Err(AuthError::Malformed);
    }

    Ok(bs58::decode(proof).into_vec().unwrap_or_default())
}

/// Extract the secret from a handshake authorization string
/// (`"send-v1 <secret>"` or a bare secret)
pub fn secret_from_authorization(value: &str) -> Option<&str> {
    let secret = value.split_whitespace().last()?;
    decode_secret(secret).map(|_| secret)
}

// ============================================================================
// Store Operations
// ============================================================================

/// What a proof-authenticated request is about to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Metadata,
    Download,
}

/// Successful proof-authenticated access
#[derive(Debug, Clone)]
pub struct Authorized {
    /// Record state right after the access (nonce rotated, count claimed)
    pub record: FileRecord,
    /// Nonce to advertise for the next request
    pub next_nonce: Nonce,
}

/// Verify a proof and apply the access.
///
/// The proof is checked against the nonce it was computed over, then that
/// exact nonce is rotated with a compare-and-swap: of several requests
/// presenting the same proof only one gets past the swap. Downloads then take
/// a slot under the shard lock, so two downloads never share the last one.
pub fn authorize(
    store: &FileStore,
    id: &str,
    proof: &[u8],
    access: Access,
    now: DateTime<Utc>,
) -> Result<Authorized, AuthError> {
    let mut record = store
        .get(id)
        .filter(|record| !record.is_expired(now) && record.is_complete())
        .ok_or(AuthError::NotFound)?;

    if !verify_proof(&record.auth_secret, &record.nonce, proof) {
        return Err(AuthError::Unauthorized {
            challenge: Some(record.nonce),
        });
    }

    if access == Access::Download && record.is_exhausted() {
        return Err(AuthError::Exhausted {
            challenge: record.nonce,
        });
    }

    let next_nonce = match store.compare_and_rotate_nonce(id, &record.nonce) {
        NonceRotation::Rotated(next) => next,
        NonceRotation::Mismatch(current) => {
            return Err(AuthError::Unauthorized {
                challenge: Some(current),
            })
        }
        NonceRotation::Missing => return Err(AuthError::NotFound),
    };

    match access {
        Access::Metadata => record.nonce = next_nonce,
        Access::Download => {
            record = match store.increment_download(id) {
                Some(Ok(claimed)) => claimed,
                Some(Err(LimitReached)) => {
                    return Err(AuthError::Exhausted {
                        challenge: next_nonce,
                    })
                }
                None => return Err(AuthError::NotFound),
            };
        }
    }

    Ok(Authorized {
        next_nonce: record.nonce,
        record,
    })
}

/// Current challenge of a live record, without authenticating
pub fn current_challenge(store: &FileStore, id: &str, now: DateTime<Utc>) -> Option<FileRecord> {
    store.get(id).filter(|record| !record.is_expired(now))
}

/// Run `f` on a live record after checking the owner token
pub fn with_owner<T, F>(
    store: &FileStore,
    id: &str,
    owner_token: &str,
    now: DateTime<Utc>,
    f: F,
) -> Result<T, AuthError>
where
    F: FnOnce(&mut FileRecord) -> T,
{
    store
        .update(id, |record| {
            if record.is_expired(now) {
                return Err(AuthError::NotFound);
            }
            if !tokens_match(&record.owner_token, owner_token) {
                return Err(AuthError::Unauthorized { challenge: None });
            }
            Ok(f(record))
        })
        .unwrap_or(Err(AuthError::NotFound))
}

/// Remove a live record after checking the owner token
pub fn remove_as_owner(
    store: &FileStore,
    id: &str,
    owner_token: &str,
    now: DateTime<Utc>,
) -> Result<FileRecord, AuthError> {
    let mut denied = false;
    let removed = store.remove_if(id, |record| {
        if record.is_expired(now) {
            return false;
        }
        let allowed = tokens_match(&record.owner_token, owner_token);
        denied = !allowed;
        allowed
    });

    match removed {
        Some(record) => Ok(record),
        None if denied => Err(AuthError::Unauthorized { challenge: None }),
        None => Err(AuthError::NotFound),
    }
}

// ============================================================================
// Tests
// ============================================================================
