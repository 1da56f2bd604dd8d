use hmac::{Hmac, Mac};
use sha2::Sha256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature header is not in algorithm=hex form")]
    Malformed,
    #[error("signature digest is not valid hex")]
    InvalidHex,
    #[error("signature does not match")]
    Mismatch,
}

fn signing_mac(
    secret: &str,
    message_id: &str,
    timestamp: &str,
    body: &[u8],
) -> Option<Hmac<Sha256>> {
    let Ok(mut mac) = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes()) else {
        return None;
    };
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    Some(mac)
}

/// Lowercase hex HMAC-SHA256 of `message_id ++ timestamp ++ body` under `secret`.
pub fn eventsub_signature(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> String {
    signing_mac(secret, message_id, timestamp, body)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default()
}

/// Verify a `Twitch-Eventsub-Message-Signature` header (`<algorithm>=<hex>`).
///
/// The algorithm label is not interpreted; the digest is always HMAC-SHA256
/// and must be lowercase hex, as Twitch sends it. Comparison is constant time.
pub fn verify_eventsub_signature(
    secret: &str,
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    signature_header: &str,
) -> Result<(), SignatureError> {
    let Some((_algorithm, hex_sig)) = signature_header.trim().split_once('=') else {
        return Err(SignatureError::Malformed);
    };
    if !hex_sig
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(SignatureError::InvalidHex);
    }
    let expected = hex::decode(hex_sig).map_err(|_| SignatureError::InvalidHex)?;

    let Some(mac) = signing_mac(secret, message_id, timestamp, body) else {
        return Err(SignatureError::Mismatch);
    };
    mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef";
    const ID: &str = "e76c6bd4-55c9-4987-8304-da1588d8988b";
    const TS: &str = "2019-11-16T10:11:12.634234626Z";
    const BODY: &[u8] = br#"{"challenge":"abc123"}"#;

    #[test]
    fn accepts_matching_signature() {
        let header = format!("v1={}", eventsub_signature(SECRET, ID, TS, BODY));
        assert_eq!(verify_eventsub_signature(SECRET, ID, TS, BODY, &header), Ok(()));
    }

    #[test]
    fn accepts_sha256_label() {
        let header = format!("sha256={}", eventsub_signature(SECRET, ID, TS, BODY));
        assert!(verify_eventsub_signature(SECRET, ID, TS, BODY, &header).is_ok());
    }

    #[test]
    fn rejects_wrong_secret() {
        let header = format!("v1={}", eventsub_signature("another-secret", ID, TS, BODY));
        assert_eq!(
            verify_eventsub_signature(SECRET, ID, TS, BODY, &header),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn covers_id_timestamp_and_body() {
        let header = format!("v1={}", eventsub_signature(SECRET, ID, TS, BODY));
        assert!(verify_eventsub_signature(SECRET, "other-id", TS, BODY, &header).is_err());
        assert!(verify_eventsub_signature(SECRET, ID, "2020-01-01T00:00:00Z", BODY, &header).is_err());
        assert!(verify_eventsub_signature(SECRET, ID, TS, b"{}", &header).is_err());
    }

    #[test]
    fn rejects_uppercase_digest() {
        let digest = eventsub_signature(SECRET, ID, TS, BODY).to_uppercase();
        assert_eq!(
            verify_eventsub_signature(SECRET, ID, TS, BODY, &format!("v1={digest}")),
            Err(SignatureError::InvalidHex)
        );
    }

    #[test]
    fn rejects_malformed_headers() {
        assert_eq!(
            verify_eventsub_signature(SECRET, ID, TS, BODY, "deadbeef"),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_eventsub_signature(SECRET, ID, TS, BODY, "v1=not-hex"),
            Err(SignatureError::InvalidHex)
        );
        assert_eq!(
            verify_eventsub_signature(SECRET, ID, TS, BODY, "v1="),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        let digest = eventsub_signature(SECRET, ID, TS, BODY);
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
