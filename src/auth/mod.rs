//! Session and auth substrate: signed cookies, JWT acceptance, WS tickets.

pub mod session;
pub mod ticket;

pub use session::SessionService;
pub use ticket::{TicketClaims, TicketService};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub session_id: String,
    pub user_id: Option<String>,
}

type HmacSha256 = Hmac<Sha256>;

/// Sign an opaque value for the session cookie: `value.sig` with a
/// base64url HMAC-SHA256 tag.
pub fn sign_value(secret: &[u8], value: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(value.as_bytes());
    let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{value}.{tag}")
}

/// Verify a signed cookie value; returns the inner value on success.
/// Tag comparison is constant-time.
pub fn verify_value(secret: &[u8], signed: &str) -> Option<String> {
    let (value, tag) = signed.rsplit_once('.')?;
    let provided = URL_SAFE_NO_PAD.decode(tag).ok()?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(value.as_bytes());
    let expected = mac.finalize().into_bytes();

    let matches: bool = expected.ct_eq(provided.as_slice()).into();
    matches.then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_sign_verify_roundtrip() {
        let signed = sign_value(b"secret", "sess-123");
        assert_eq!(verify_value(b"secret", &signed), Some("sess-123".to_string()));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let signed = sign_value(b"secret", "sess-123");
        let tampered = signed.replace("sess-123", "sess-999");
        assert_eq!(verify_value(b"secret", &tampered), None);
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let signed = sign_value(b"secret", "sess-123");
        assert_eq!(verify_value(b"other", &signed), None);
    }

    #[test]
    fn test_verify_rejects_garbage() {
        assert_eq!(verify_value(b"secret", "no-dot-here"), None);
        assert_eq!(verify_value(b"secret", "value.!!!not-base64!!!"), None);
        assert_eq!(verify_value(b"secret", ""), None);
    }

    #[test]
    fn test_value_with_dots_survives() {
        // rsplit keeps embedded dots in the value.
        let signed = sign_value(b"secret", "a.b.c");
        assert_eq!(verify_value(b"secret", &signed), Some("a.b.c".to_string()));
    }
}
