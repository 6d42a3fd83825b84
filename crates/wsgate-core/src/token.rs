//! Bearer token verification.
//!
//! Tokens are JWTs signed with the private half of an RSA key pair; the
//! gateway holds only the public key. Verification accepts RS256, RS384 and
//! RS512 exclusively, so an HMAC or PSS token can never be validated against
//! the public key material.
//!
//! Besides the signature, two time checks apply:
//!
//! - `exp` must be present and in the future;
//! - `iat` must be present and no older than the freshness window, which caps
//!   how long an issued token stays usable regardless of its expiry.

use crate::error::{AuthError, KeyError};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Accepted signature algorithms.
pub const ALLOWED_ALGORITHMS: [Algorithm; 3] =
    [Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// The registered claims the gateway consumes.
///
/// NumericDate values may carry a fractional part, so times are `f64`.
#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iat: Option<f64>,
    #[serde(default)]
    exp: Option<f64>,
}

/// Verifies `Authorization` header values against a configured public key.
///
/// A verifier built without a key is disabled: [`TokenVerifier::enabled`]
/// returns `false` and callers skip verification entirely.
pub struct TokenVerifier {
    key: Option<DecodingKey>,
    freshness: Duration,
    validation: Validation,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("enabled", &self.enabled())
            .field("freshness", &self.freshness)
            .finish()
    }
}

impl TokenVerifier {
    /// A verifier with no key; authentication is turned off.
    pub fn disabled() -> Self {
        Self::with_key(None, Duration::ZERO)
    }

    /// Build a verifier from a PEM-encoded RSA public key (PKCS#1 or SPKI).
    pub fn from_pem(pem: &[u8], freshness: Duration) -> Result<Self, KeyError> {
        let key = DecodingKey::from_rsa_pem(pem).map_err(|e| KeyError::Parse(e.to_string()))?;
        Ok(Self::with_key(Some(key), freshness))
    }

    /// Load the public key file if one is configured, otherwise return a
    /// disabled verifier.
    pub fn load(path: Option<&Path>, freshness: Duration) -> Result<Self, KeyError> {
        match path {
            Some(path) => {
                let pem = std::fs::read(path).map_err(|source| KeyError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_pem(&pem, freshness)
            }
            None => Ok(Self::disabled()),
        }
    }

    fn with_key(key: Option<DecodingKey>, freshness: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.algorithms = ALLOWED_ALGORITHMS.to_vec();
        // Time claims are checked by hand so each failure gets its own error.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();
        Self {
            key,
            freshness,
            validation,
        }
    }

    /// Whether a public key was configured.
    pub fn enabled(&self) -> bool {
        self.key.is_some()
    }

    /// The freshness window applied to `iat`.
    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Verify an `Authorization` header value and return the token subject.
    pub fn verify(&self, header: &str) -> Result<String, AuthError> {
        self.verify_at(header, unix_now())
    }

    /// Verify as of `now` (seconds since the Unix epoch).
    pub fn verify_at(&self, header: &str, now: i64) -> Result<String, AuthError> {
        let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
        if token.is_empty() {
            return Err(AuthError::InvalidToken("no token".into()));
        }
        let Some(key) = &self.key else {
            return Err(AuthError::InvalidToken("no verification key configured".into()));
        };

        let claims = decode::<Claims>(token, key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?
            .claims;

        let now = now as f64;
        match claims.exp {
            Some(exp) if exp > now => {}
            _ => return Err(AuthError::TokenExpired),
        }

        let oldest = now - self.freshness.as_secs_f64();
        match claims.iat {
            Some(iat) if iat >= oldest => {}
            _ => return Err(AuthError::TokenTooOld),
        }

        Ok(claims.sub.unwrap_or_default())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use std::io::Write;

    const PRIVATE_PEM: &[u8] = include_bytes!("../testdata/private.pem");
    const PUBLIC_PEM: &[u8] = include_bytes!("../testdata/public.pem");
    const PUBLIC_PKCS1_PEM: &[u8] = include_bytes!("../testdata/public_pkcs1.pem");

    const NOW: i64 = 1_700_000_000;

    fn verifier() -> TokenVerifier {
        TokenVerifier::from_pem(PUBLIC_PEM, Duration::from_secs(60)).unwrap()
    }

    fn sign(alg: Algorithm, claims: serde_json::Value) -> String {
        let key = EncodingKey::from_rsa_pem(PRIVATE_PEM).unwrap();
        encode(&Header::new(alg), &claims, &key).unwrap()
    }

    #[test]
    fn valid_token_returns_subject() {
        for alg in ALLOWED_ALGORITHMS {
            let token = sign(alg, json!({"sub": "alice@example.com", "iat": NOW, "exp": NOW + 60}));
            let subject = verifier()
                .verify_at(&format!("Bearer {token}"), NOW)
                .unwrap();
            assert_eq!(subject, "alice@example.com");
        }
    }

    #[test]
    fn bearer_prefix_is_optional() {
        let token = sign(Algorithm::RS256, json!({"sub": "bob", "iat": NOW, "exp": NOW + 60}));
        assert_eq!(verifier().verify_at(&token, NOW).unwrap(), "bob");
    }

    #[test]
    fn pkcs1_public_key_is_accepted() {
        let verifier = TokenVerifier::from_pem(PUBLIC_PKCS1_PEM, Duration::from_secs(60)).unwrap();
        let token = sign(Algorithm::RS512, json!({"sub": "carol", "iat": NOW, "exp": NOW + 60}));
        assert_eq!(verifier.verify_at(&token, NOW).unwrap(), "carol");
    }

    #[test]
    fn expired_token() {
        let token = sign(Algorithm::RS256, json!({"sub": "s", "iat": NOW, "exp": NOW - 1}));
        assert_eq!(verifier().verify_at(&token, NOW), Err(AuthError::TokenExpired));

        // Expiry is checked before freshness.
        let token = sign(Algorithm::RS256, json!({"sub": "s", "iat": NOW - 3600, "exp": NOW - 60}));
        assert_eq!(verifier().verify_at(&token, NOW), Err(AuthError::TokenExpired));
    }

    #[test]
    fn expiry_must_be_in_the_future() {
        let token = sign(Algorithm::RS256, json!({"sub": "s", "iat": NOW, "exp": NOW}));
        assert_eq!(verifier().verify_at(&token, NOW), Err(AuthError::TokenExpired));
    }

    #[test]
    fn missing_expiry_is_expired() {
        let token = sign(Algorithm::RS256, json!({"sub": "s", "iat": NOW}));
        assert_eq!(verifier().verify_at(&token, NOW), Err(AuthError::TokenExpired));
    }

    #[test]
    fn stale_token_is_too_old_even_when_unexpired() {
        let token = sign(Algorithm::RS256, json!({"sub": "s", "iat": NOW - 120, "exp": NOW + 600}));
        let err = verifier().verify_at(&token, NOW).unwrap_err();
        assert_eq!(err, AuthError::TokenTooOld);
        assert_eq!(err.to_string(), "token is too old");
    }

    #[test]
    fn token_at_freshness_boundary_is_accepted() {
        let token = sign(Algorithm::RS256, json!({"sub": "s", "iat": NOW - 60, "exp": NOW + 600}));
        assert!(verifier().verify_at(&token, NOW).is_ok());
    }

    #[test]
    fn missing_issued_at_is_too_old() {
        let token = sign(Algorithm::RS256, json!({"sub": "s", "exp": NOW + 60}));
        assert_eq!(verifier().verify_at(&token, NOW), Err(AuthError::TokenTooOld));
    }

    #[test]
    fn pss_signed_token_is_rejected() {
        let token = sign(Algorithm::PS256, json!({"sub": "s", "iat": NOW, "exp": NOW + 60}));
        let err = verifier().verify_at(&token, NOW).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)), "{err:?}");
    }

    #[test]
    fn hmac_with_public_key_as_secret_is_rejected() {
        let key = EncodingKey::from_secret(PUBLIC_PEM);
        let token = encode(
            &Header::new(Algorithm::HS256),
            &json!({"sub": "mallory", "iat": NOW, "exp": NOW + 60}),
            &key,
        )
        .unwrap();
        let err = verifier().verify_at(&token, NOW).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)), "{err:?}");
    }

    #[test]
    fn garbage_and_empty_tokens_are_invalid() {
        let err = verifier().verify_at("Bearer invalid-token", NOW).unwrap_err();
        assert!(err.to_string().starts_with("token is invalid"));
        assert!(matches!(verifier().verify_at("", NOW), Err(AuthError::InvalidToken(_))));
        assert!(matches!(verifier().verify_at("Bearer ", NOW), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn tampered_signature_is_invalid() {
        let token = sign(Algorithm::RS256, json!({"sub": "s", "iat": NOW, "exp": NOW + 60}));
        let other = sign(Algorithm::RS256, json!({"sub": "t", "iat": NOW, "exp": NOW + 60}));
        let (head_payload, _) = token.rsplit_once('.').unwrap();
        let (_, other_sig) = other.rsplit_once('.').unwrap();
        let forged = format!("{head_payload}.{other_sig}");
        assert!(matches!(verifier().verify_at(&forged, NOW), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn fractional_numeric_dates_are_accepted() {
        let iat = NOW as f64 - 0.5;
        let exp = NOW as f64 + 30.25;
        let token = sign(Algorithm::RS256, json!({"sub": "frac", "iat": iat, "exp": exp}));
        assert_eq!(verifier().verify_at(&token, NOW).unwrap(), "frac");

        let just_expired = NOW as f64 - 0.5;
        let token = sign(Algorithm::RS256, json!({"sub": "frac", "iat": iat, "exp": just_expired}));
        assert_eq!(verifier().verify_at(&token, NOW), Err(AuthError::TokenExpired));

        let stale = NOW as f64 - 60.5;
        let token = sign(Algorithm::RS256, json!({"sub": "frac", "iat": stale, "exp": exp}));
        assert_eq!(verifier().verify_at(&token, NOW), Err(AuthError::TokenTooOld));
    }

    #[test]
    fn debug_shows_state_not_key() {
        let debug = format!("{:?}", verifier());
        assert!(debug.contains("enabled: true"), "{debug}");
        assert!(debug.contains("freshness: 60s"), "{debug}");
        assert!(format!("{:?}", TokenVerifier::disabled()).contains("enabled: false"));
    }

    #[test]
    fn missing_subject_is_empty() {
        let token = sign(Algorithm::RS256, json!({"iat": NOW, "exp": NOW + 60}));
        assert_eq!(verifier().verify_at(&token, NOW).unwrap(), "");
    }

    #[test]
    fn verify_uses_wall_clock() {
        let now = unix_now();
        let token = sign(Algorithm::RS256, json!({"sub": "live", "iat": now, "exp": now + 300}));
        assert_eq!(verifier().verify(&format!("Bearer {token}")).unwrap(), "live");
    }

    #[test]
    fn enabled_only_with_key() {
        assert!(verifier().enabled());
        assert!(!TokenVerifier::disabled().enabled());
        assert!(!TokenVerifier::load(None, Duration::from_secs(60)).unwrap().enabled());
    }

    #[test]
    fn load_key_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PUBLIC_PEM).unwrap();
        let verifier = TokenVerifier::load(Some(file.path()), Duration::from_secs(30)).unwrap();
        assert!(verifier.enabled());
        assert_eq!(verifier.freshness(), Duration::from_secs(30));
    }

    #[test]
    fn invalid_key_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a pem").unwrap();
        let err = TokenVerifier::load(Some(file.path()), Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, KeyError::Parse(_)));

        let err = TokenVerifier::load(Some(Path::new("/nonexistent/key.pem")), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, KeyError::Read { .. }));
    }
}
