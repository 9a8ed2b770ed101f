//! Unverified reading of bearer token claims.
//!
//! The client never validates signatures; it only peeks at `exp`/`iat` so it
//! can tell a dead credential apart from a live one and size the credential
//! cache to the token's real lifetime.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenClaims {
    pub exp: Option<i64>,
    pub iat: Option<i64>,
    pub sub: Option<String>,
}

impl TokenClaims {
    /// Decode the payload segment of a JWT. Returns `None` for opaque tokens.
    pub fn decode(token: &str) -> Option<Self> {
        let mut parts = token.split('.');
        let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.iat.and_then(|iat| Utc.timestamp_opt(iat, 0).single())
    }

    /// Issuer-defined lifetime (`exp - iat`), when both claims are present.
    pub fn lifetime(&self) -> Option<Duration> {
        let (exp, iat) = (self.exp?, self.iat?);
        u64::try_from(exp.checked_sub(iat)?).ok().map(Duration::from_secs)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|exp| now >= exp).unwrap_or(false)
    }
}

/// Whether a token is known to be expired. Opaque tokens are assumed live.
pub fn is_expired(token: &str) -> bool {
    TokenClaims::decode(token)
        .map(|claims| claims.is_expired_at(Utc::now()))
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) fn make_jwt(iat: i64, exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u-1","iat":{},"exp":{}}}"#, iat, exp));
    format!("{}.{}.sig", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reads_lifetime() {
        let token = make_jwt(1_700_000_000, 1_700_003_600);
        let claims = TokenClaims::decode(&token).expect("claims");
        assert_eq!(claims.sub.as_deref(), Some("u-1"));
        assert_eq!(claims.lifetime(), Some(Duration::from_secs(3600)));
        assert_eq!(claims.expires_at().map(|t| t.timestamp()), Some(1_700_003_600));
    }

    #[test]
    fn test_opaque_tokens_have_no_claims() {
        assert!(TokenClaims::decode("abcdef").is_none());
        assert!(TokenClaims::decode("a.b").is_none());
        assert!(TokenClaims::decode("a.!!!.c").is_none());
        assert!(!is_expired("abcdef"));
    }

    #[test]
    fn test_expiry_check() {
        let now = Utc::now().timestamp();
        assert!(is_expired(&make_jwt(now - 7200, now - 3600)));
        assert!(!is_expired(&make_jwt(now, now + 3600)));
    }

    #[test]
    fn test_negative_lifetime_ignored() {
        let claims = TokenClaims {
            exp: Some(10),
            iat: Some(20),
            sub: None,
        };
        assert_eq!(claims.lifetime(), None);
    }

    #[test]
    fn test_extreme_claims_do_not_overflow() {
        let claims = TokenClaims {
            exp: Some(i64::MAX),
            iat: Some(i64::MIN),
            sub: None,
        };
        assert_eq!(claims.lifetime(), None);
        assert!(claims.expires_at().is_none());
        assert!(!claims.is_expired_at(Utc::now()));
    }
}
