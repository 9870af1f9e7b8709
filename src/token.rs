use crate::errors::LodestarError;
use crate::settings::Token as TokenCfg;
use josekit::jws::{JwsHeader, HS256};
use josekit::jwt::{self, JwtPayload};
use serde_json::json;
use std::time::{Duration, SystemTime};

/// Claims carried by a validated session token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub subject: String,
    pub email: String,
}

/// Stateless signer/verifier for compact session tokens.
///
/// Key material is read once from configuration; a token is valid iff its
/// HMAC verifies and its expiry lies in the future. There is no server-side
/// session store and no pre-expiry revocation.
#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenCodec {
    pub fn new(cfg: &TokenCfg) -> Self {
        Self {
            secret: cfg.secret.as_bytes().to_vec(),
            ttl: Duration::from_secs(cfg.ttl_secs),
        }
    }

    /// Issue a signed session token for a user
    pub fn issue(&self, subject: &str, email: &str) -> Result<String, LodestarError> {
        let signer = HS256.signer_from_bytes(&self.secret)?;

        let mut header = JwsHeader::new();
        header.set_token_type("JWT");
        header.set_algorithm("HS256");

        let now = SystemTime::now();
        let mut payload = JwtPayload::new();
        payload.set_subject(subject);
        payload.set_claim("email", Some(json!(email)))?;
        payload.set_issued_at(&now);
        payload.set_expires_at(&(now + self.ttl));

        let token = jwt::encode_with_signer(&payload, &header, &signer)?;
        Ok(token)
    }

    /// Verify a session token and extract its claims.
    ///
    /// Any structural, signature, or expiry failure is TokenInvalid; no
    /// partial claims escape.
    pub fn validate(&self, token: &str) -> Result<Claims, LodestarError> {
        let verifier = HS256.verifier_from_bytes(&self.secret)?;

        let (payload, _header) = jwt::decode_with_verifier(token, &verifier)
            .map_err(|_| LodestarError::TokenInvalid)?;

        let expires_at = payload.expires_at().ok_or(LodestarError::TokenInvalid)?;
        if SystemTime::now() >= expires_at {
            return Err(LodestarError::TokenInvalid);
        }

        let subject = payload
            .subject()
            .ok_or(LodestarError::TokenInvalid)?
            .to_string();
        let email = payload
            .claim("email")
            .and_then(|v| v.as_str())
            .ok_or(LodestarError::TokenInvalid)?
            .to_string();

        Ok(Claims { subject, email })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(ttl_secs: u64) -> TokenCodec {
        TokenCodec::new(&TokenCfg {
            secret: "test-secret-key-material-0123456789".to_string(),
            ttl_secs,
        })
    }

    #[test]
    fn test_round_trip() {
        let codec = codec(3600);

        let token = codec.issue("user-1", "u1@example.com").expect("issue failed");
        let claims = codec.validate(&token).expect("validate failed");

        assert_eq!(claims.subject, "user-1");
        assert_eq!(claims.email, "u1@example.com");
    }

    #[test]
    fn test_tampered_token_rejected() {
        let codec = codec(3600);

        let token = codec.issue("user-1", "u1@example.com").expect("issue failed");

        // Flip one character of the payload segment
        let mut bytes = token.into_bytes();
        let mid = bytes.len() / 2;
        bytes[mid] = if bytes[mid] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).expect("utf8");

        assert!(matches!(
            codec.validate(&tampered),
            Err(LodestarError::TokenInvalid)
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        // Zero TTL: the token is already at its deadline when checked
        let codec = codec(0);

        let token = codec.issue("user-1", "u1@example.com").expect("issue failed");

        assert!(matches!(
            codec.validate(&token),
            Err(LodestarError::TokenInvalid)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let codec_a = codec(3600);
        let codec_b = TokenCodec::new(&TokenCfg {
            secret: "a-completely-different-signing-key".to_string(),
            ttl_secs: 3600,
        });

        let token = codec_a
            .issue("user-1", "u1@example.com")
            .expect("issue failed");

        assert!(matches!(
            codec_b.validate(&token),
            Err(LodestarError::TokenInvalid)
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let codec = codec(3600);

        assert!(matches!(
            codec.validate("not-a-token"),
            Err(LodestarError::TokenInvalid)
        ));
        assert!(matches!(
            codec.validate(""),
            Err(LodestarError::TokenInvalid)
        ));
    }
}
