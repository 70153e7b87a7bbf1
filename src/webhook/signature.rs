//! Webhook signature verification (Svix-style HMAC-SHA256).
//!
//! The signed content is `"{id}.{timestamp}.{body}"`; the digest is
//! base64-encoded and compared against every whitespace-separated
//! `version,signature` pair in the signature header. Comparison happens
//! inside `Mac::verify_slice`, which is constant-time.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::error::WebhookError;

/// Webhook delivery id header.
pub const ID_HEADER: &str = "svix-id";
/// Webhook timestamp header (unix seconds).
pub const TIMESTAMP_HEADER: &str = "svix-timestamp";
/// Signature list header: whitespace-separated `version,signature` pairs.
pub const SIGNATURE_HEADER: &str = "svix-signature";

/// Literal prefix signing secrets are stored with; stripped before use.
const SECRET_PREFIX: &str = "whsec_";

type HmacSha256 = Hmac<Sha256>;

fn keyed_mac(secret: &str, msg_id: &str, timestamp: &str, body: &[u8]) -> HmacSha256 {
    let key = secret.strip_prefix(SECRET_PREFIX).unwrap_or(secret);
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .unwrap_or_else(|_| HmacSha256::new_from_slice(b"invalid-key").expect("hmac"));
    mac.update(msg_id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

/// Compute a `v1,<base64 digest>` signature for the given content.
/// Used by tests and by anyone replaying deliveries against the receiver.
pub fn sign(secret: &str, msg_id: &str, timestamp: &str, body: &[u8]) -> String {
    let digest = keyed_mac(secret, msg_id, timestamp, body)
        .finalize()
        .into_bytes();
    format!("v1,{}", BASE64.encode(digest))
}

/// Verify an inbound delivery against the configured secret.
///
/// `secret = None` accepts unconditionally with a warning — the explicit
/// permissive fallback for environments without a configured secret.
pub fn verify(
    secret: Option<&str>,
    msg_id: &str,
    timestamp: &str,
    body: &[u8],
    signature_header: &str,
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<(), WebhookError> {
    let Some(secret) = secret else {
        warn!("No webhook signing secret configured; accepting delivery unverified");
        return Ok(());
    };

    let ts: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| WebhookError::InvalidTimestamp(timestamp.to_string()))?;
    let skew_secs = (now.timestamp() - ts).abs();
    if skew_secs > tolerance_secs {
        return Err(WebhookError::StaleTimestamp { skew_secs });
    }

    for pair in signature_header.split_whitespace() {
        let Some((_version, candidate)) = pair.split_once(',') else {
            continue;
        };
        let Ok(candidate) = BASE64.decode(candidate) else {
            continue;
        };
        if keyed_mac(secret, msg_id, timestamp, body)
            .verify_slice(&candidate)
            .is_ok()
        {
            return Ok(());
        }
    }

    Err(WebhookError::SignatureMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test-secret";
    const BODY: &[u8] = br#"{"type":"email.opened"}"#;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn ts() -> String {
        now().timestamp().to_string()
    }

    #[test]
    fn valid_signature_is_accepted() {
        let ts = ts();
        let sig = sign(SECRET, "msg_1", &ts, BODY);
        verify(Some(SECRET), "msg_1", &ts, BODY, &sig, now(), 300).unwrap();
    }

    #[test]
    fn prefix_is_stripped_before_keying() {
        // Signing with the bare secret must match a prefixed verifier key.
        let ts = ts();
        let sig = sign("test-secret", "msg_1", &ts, BODY);
        verify(Some(SECRET), "msg_1", &ts, BODY, &sig, now(), 300).unwrap();
    }

    #[test]
    fn tampered_body_is_rejected() {
        let ts = ts();
        let sig = sign(SECRET, "msg_1", &ts, BODY);
        let tampered = br#"{"type":"email.clicked"}"#;
        let err = verify(Some(SECRET), "msg_1", &ts, tampered, &sig, now(), 300).unwrap_err();
        assert!(matches!(err, WebhookError::SignatureMismatch));
    }

    #[test]
    fn signature_covers_id_and_timestamp() {
        let ts = ts();
        let sig = sign(SECRET, "msg_1", &ts, BODY);
        let err = verify(Some(SECRET), "msg_2", &ts, BODY, &sig, now(), 300).unwrap_err();
        assert!(matches!(err, WebhookError::SignatureMismatch));
    }

    #[test]
    fn any_matching_pair_in_the_list_accepts() {
        let ts = ts();
        let good = sign(SECRET, "msg_1", &ts, BODY);
        let header = format!("v1,bm90LXRoZS1zaWc= {good} v2,garbage");
        verify(Some(SECRET), "msg_1", &ts, BODY, &header, now(), 300).unwrap();
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let old = (now().timestamp() - 600).to_string();
        let sig = sign(SECRET, "msg_1", &old, BODY);
        let err = verify(Some(SECRET), "msg_1", &old, BODY, &sig, now(), 300).unwrap_err();
        assert!(matches!(err, WebhookError::StaleTimestamp { skew_secs: 600 }));
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let future = (now().timestamp() + 600).to_string();
        let sig = sign(SECRET, "msg_1", &future, BODY);
        let err = verify(Some(SECRET), "msg_1", &future, BODY, &sig, now(), 300).unwrap_err();
        assert!(matches!(err, WebhookError::StaleTimestamp { .. }));
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        let sig = sign(SECRET, "msg_1", "soon", BODY);
        let err = verify(Some(SECRET), "msg_1", "soon", BODY, &sig, now(), 300).unwrap_err();
        assert!(matches!(err, WebhookError::InvalidTimestamp(_)));
    }

    #[test]
    fn no_secret_accepts_unconditionally() {
        verify(None, "msg_1", "whatever", BODY, "v1,bogus", now(), 300).unwrap();
    }
}
