//! Replay-protected symmetric envelope.
//!
//! Every request carries `{iv, timestamp, payload}` where the payload is
//! ChaCha20-Poly1305 ciphertext under a key derived from host identity
//! and the caller-supplied timestamp. The timestamp is validated against
//! a ±10 minute window before any key material is derived, so stale or
//! replayed ciphertext fails closed without touching the cipher.
//!
//! Timestamp validation is a pure function; acting on a detected clock
//! drift (resynchronizing the host clock) is the caller's concern.

use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Canonical timestamp format used on the wire and in event records.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Accepted request timestamp formats: with and without the UTC suffix.
const ACCEPTED_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%SZ"];

/// Nonce length for the AEAD construction.
pub const NONCE_LEN: usize = 12;

const REPLAY_WINDOW_MINUTES: i64 = 10;

/// Outcome of validating a caller-supplied timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampVerdict {
    Accepted,
    TooOld,
    TooFarInFuture,
    Unparseable,
}

impl TimestampVerdict {
    /// Whether the rejection indicates clock skew between caller and host.
    pub fn is_clock_drift(&self) -> bool {
        matches!(self, TimestampVerdict::TooOld | TimestampVerdict::TooFarInFuture)
    }
}

/// Validate a request timestamp against the replay window around `now`.
///
/// Boundary values at exactly ±10 minutes are accepted.
pub fn check_timestamp(ts: &str, now: DateTime<Utc>) -> TimestampVerdict {
    let parsed = ACCEPTED_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(ts, fmt).ok());

    let Some(t) = parsed else {
        return TimestampVerdict::Unparseable;
    };
    let t = t.and_utc();
    let window = Duration::minutes(REPLAY_WINDOW_MINUTES);

    if now > t + window {
        TimestampVerdict::TooOld
    } else if now < t - window {
        TimestampVerdict::TooFarInFuture
    } else {
        TimestampVerdict::Accepted
    }
}

/// Current time rendered in the canonical wire format.
pub fn current_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a canonical-format timestamp, accepting both wire variants.
pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    ACCEPTED_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(ts, fmt).ok())
        .map(|t| t.and_utc())
}

/// The two pieces of host identity mixed into every per-request key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostIdentity {
    pub instance_id: String,
    pub reservation_id: String,
}

impl HostIdentity {
    pub fn new(instance_id: impl Into<String>, reservation_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            reservation_id: reservation_id.into(),
        }
    }

    /// Per-request key: SHA-256 over the identity mixing string.
    ///
    /// The key exists only for the duration of one request and is never
    /// persisted.
    fn derive_key(&self, timestamp: &str) -> [u8; 32] {
        let mut hash = Sha256::new();
        hash.update(self.instance_id.as_bytes());
        hash.update(self.reservation_id.as_bytes());
        hash.update(timestamp.as_bytes());
        hash.finalize().into()
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    iv: String,
    timestamp: String,
    payload: String,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Replay-window rejection; the request must fail closed.
    #[error("request rejected: timestamp {0:?}")]
    Rejected(TimestampVerdict),
    /// Ciphertext failed authentication under the derived key.
    #[error("envelope authentication failure")]
    Auth,
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// A successfully opened request envelope.
#[derive(Debug)]
pub struct DecryptedRequest {
    /// Nonce supplied by the caller; reused for the response.
    pub nonce: Vec<u8>,
    /// Decrypted task payload (JSON task descriptor).
    pub payload: String,
}

/// Open a request envelope, enforcing the replay window first.
pub fn decrypt_request(
    raw: &str,
    identity: &HostIdentity,
    now: DateTime<Utc>,
) -> Result<DecryptedRequest, EnvelopeError> {
    let env: WireEnvelope =
        serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

    let verdict = check_timestamp(&env.timestamp, now);
    if verdict != TimestampVerdict::Accepted {
        return Err(EnvelopeError::Rejected(verdict));
    }

    let nonce = general_purpose::STANDARD
        .decode(env.iv.as_bytes())
        .map_err(|e| EnvelopeError::Malformed(format!("bad iv encoding: {e}")))?;
    if nonce.len() != NONCE_LEN {
        return Err(EnvelopeError::Malformed(format!(
            "iv must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }

    let ciphertext = general_purpose::STANDARD
        .decode(env.payload.as_bytes())
        .map_err(|e| EnvelopeError::Malformed(format!("bad payload encoding: {e}")))?;

    let key = identity.derive_key(&env.timestamp);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| EnvelopeError::Auth)?;

    let payload =
        String::from_utf8(plaintext).map_err(|_| EnvelopeError::Malformed("payload is not utf-8".into()))?;

    Ok(DecryptedRequest { nonce, payload })
}

/// Seal a response payload under the request nonce and a fresh timestamp.
///
/// The construction is symmetric: the client uses the same call to seal
/// its requests.
pub fn encrypt_response(
    payload: &str,
    nonce: &[u8],
    timestamp: &str,
    identity: &HostIdentity,
) -> Result<String, EnvelopeError> {
    if nonce.len() != NONCE_LEN {
        return Err(EnvelopeError::Malformed(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }

    let key = identity.derive_key(timestamp);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), payload.as_bytes())
        .map_err(|_| EnvelopeError::Auth)?;

    let env = WireEnvelope {
        iv: general_purpose::STANDARD.encode(nonce),
        timestamp: timestamp.to_string(),
        payload: general_purpose::STANDARD.encode(ciphertext),
    };
    serde_json::to_string(&env).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn test_identity() -> HostIdentity {
        HostIdentity::new("i-8e4e00ca", "r-f41760b0")
    }

    #[test]
    fn accepts_timestamp_inside_window() {
        let verdict = check_timestamp("2024-06-15T11:55:00Z", fixed_now());
        assert_eq!(verdict, TimestampVerdict::Accepted);
    }

    #[test]
    fn accepts_timestamp_without_utc_suffix() {
        let verdict = check_timestamp("2024-06-15T12:03:00", fixed_now());
        assert_eq!(verdict, TimestampVerdict::Accepted);
    }

    #[test]
    fn window_boundaries_are_inclusive() {
        assert_eq!(
            check_timestamp("2024-06-15T11:50:00Z", fixed_now()),
            TimestampVerdict::Accepted
        );
        assert_eq!(
            check_timestamp("2024-06-15T12:10:00Z", fixed_now()),
            TimestampVerdict::Accepted
        );
    }

    #[test]
    fn one_second_past_window_is_rejected() {
        assert_eq!(
            check_timestamp("2024-06-15T11:49:59Z", fixed_now()),
            TimestampVerdict::TooOld
        );
        assert_eq!(
            check_timestamp("2024-06-15T12:10:01Z", fixed_now()),
            TimestampVerdict::TooFarInFuture
        );
    }

    #[test]
    fn garbage_timestamp_is_unparseable() {
        assert_eq!(
            check_timestamp("last tuesday", fixed_now()),
            TimestampVerdict::Unparseable
        );
        assert!(!TimestampVerdict::Unparseable.is_clock_drift());
        assert!(TimestampVerdict::TooOld.is_clock_drift());
    }

    #[test]
    fn round_trips_request_response() {
        let identity = test_identity();
        let nonce = [7u8; NONCE_LEN];
        let timestamp = format_timestamp(fixed_now());
        let payload = r#"{"name":"Status","parameters":{}}"#;

        let sealed = encrypt_response(payload, &nonce, &timestamp, &identity).unwrap();
        let opened = decrypt_request(&sealed, &identity, fixed_now()).unwrap();

        assert_eq!(opened.payload, payload);
        assert_eq!(opened.nonce, nonce);
    }

    #[test]
    fn wrong_identity_fails_authentication() {
        let nonce = [9u8; NONCE_LEN];
        let timestamp = format_timestamp(fixed_now());
        let sealed = encrypt_response("secret", &nonce, &timestamp, &test_identity()).unwrap();

        let other = HostIdentity::new("i-00000000", "r-f41760b0");
        let err = decrypt_request(&sealed, &other, fixed_now()).unwrap_err();
        assert!(matches!(err, EnvelopeError::Auth));
    }

    #[test]
    fn stale_envelope_is_rejected_before_decryption() {
        let identity = test_identity();
        let nonce = [1u8; NONCE_LEN];
        let old = "2024-06-15T11:00:00Z";
        let sealed = encrypt_response("late", &nonce, old, &identity).unwrap();

        let err = decrypt_request(&sealed, &identity, fixed_now()).unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::Rejected(TimestampVerdict::TooOld)
        ));
    }

    #[test]
    fn non_json_envelope_is_malformed() {
        let err = decrypt_request("not json at all", &test_identity(), fixed_now()).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }
}
