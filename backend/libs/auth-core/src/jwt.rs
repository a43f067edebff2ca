//! RS256 token issuance and verification against the rotating key set.
//!
//! Claims are handled as raw JSON so the tenant-roles claim name stays
//! operator-configurable; typed accessors cover the registered claims.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, Header, Validation};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::keys::KeyManager;
use crate::AuthError;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            audience: default_audience(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl JwtConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

fn default_issuer() -> String {
    "https://gateway.orderplatform.dev".to_string()
}

fn default_audience() -> String {
    "order-platform".to_string()
}

fn default_token_ttl_secs() -> u64 {
    3_600
}

/// A freshly minted token plus its advertised lifetime.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: u64,
}

/// Mints RS256 tokens with the current `kid` in the header.
pub struct TokenIssuer {
    keys: Arc<KeyManager>,
    config: JwtConfig,
}

impl TokenIssuer {
    pub fn new(keys: Arc<KeyManager>, config: JwtConfig) -> Self {
        Self { keys, config }
    }

    /// Issue a token for one principal.
    ///
    /// `tenant_roles` lands under the configured tenant claim name;
    /// `permissions` under `perm` when non-empty.
    pub fn issue(
        &self,
        subject: &str,
        scopes: &[String],
        tenant_claim: &str,
        tenant_roles: &HashMap<String, Vec<String>>,
        permissions: &[String],
    ) -> Result<IssuedToken, AuthError> {
        let now = Utc::now().timestamp();
        let ttl = self.config.token_ttl_secs;

        let mut claims = json!({
            "iss": self.config.issuer,
            "sub": subject,
            "aud": self.config.audience,
            "iat": now,
            "exp": now + ttl as i64,
            "scope": scopes.join(" "),
        });
        let claims_map = claims.as_object_mut().expect("claims literal is an object");
        claims_map.insert(tenant_claim.to_string(), json!(tenant_roles));
        if !permissions.is_empty() {
            claims_map.insert("perm".to_string(), json!(permissions));
        }

        let (kid, encoding_key) = self.keys.current_signing_key();
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(kid);

        let token = encode(&header, &claims, &encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        Ok(IssuedToken {
            token,
            expires_in: ttl,
        })
    }
}

/// A verified token's claims with typed accessors.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub subject: String,
    pub claims: Map<String, Value>,
}

impl VerifiedToken {
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }
}

/// Verifies tokens against whatever keys the manager retains.
pub struct TokenVerifier {
    keys: Arc<KeyManager>,
    config: JwtConfig,
}

impl TokenVerifier {
    pub fn new(keys: Arc<KeyManager>, config: JwtConfig) -> Self {
        Self { keys, config }
    }

    /// Full verification: signature against the header `kid`, expiry,
    /// issuer and audience. Every failure collapses to `InvalidToken`;
    /// the API layer answers `invalid_token` without detail.
    pub fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        let header = decode_header(token)?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::InvalidToken("unexpected algorithm".to_string()));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("missing kid".to_string()))?;
        let decoding_key = self
            .keys
            .verification_key(&kid)
            .ok_or_else(|| AuthError::InvalidToken(format!("unknown kid {kid}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 5;
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);

        let data = decode::<Map<String, Value>>(token, &decoding_key, &validation)?;

        let subject = data
            .claims
            .get("sub")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::InvalidToken("missing sub".to_string()))?
            .to_string();

        Ok(VerifiedToken {
            subject,
            claims: data.claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyManagerConfig;

    fn manager() -> Arc<KeyManager> {
        Arc::new(
            KeyManager::bootstrap(KeyManagerConfig {
                rotation_interval_secs: 86_400,
                max_token_ttl_secs: 3_600,
                retain_keys: 2,
            })
            .unwrap(),
        )
    }

    fn issue_default(keys: &Arc<KeyManager>) -> IssuedToken {
        let issuer = TokenIssuer::new(Arc::clone(keys), JwtConfig::default());
        let tenants = HashMap::from([("acme".to_string(), vec!["BUYER".to_string()])]);
        issuer
            .issue(
                "user-1",
                &["orders.write".to_string()],
                "mt",
                &tenants,
                &[],
            )
            .unwrap()
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let keys = manager();
        let issued = issue_default(&keys);
        assert_eq!(issued.expires_in, 3_600);

        let verifier = TokenVerifier::new(Arc::clone(&keys), JwtConfig::default());
        let verified = verifier.verify(&issued.token).unwrap();

        assert_eq!(verified.subject, "user-1");
        assert_eq!(
            verified.claim("scope").and_then(Value::as_str),
            Some("orders.write")
        );
        assert_eq!(verified.claims["mt"]["acme"][0], "BUYER");
    }

    #[test]
    fn token_survives_one_rotation_but_not_pruning() {
        let keys = manager();
        let issued = issue_default(&keys);
        let verifier = TokenVerifier::new(Arc::clone(&keys), JwtConfig::default());

        keys.rotate().unwrap();
        assert!(
            verifier.verify(&issued.token).is_ok(),
            "token minted just before rotation must stay valid"
        );

        // retain_keys = 2: a second rotation prunes the minting key.
        keys.rotate().unwrap();
        let err = verifier.verify(&issued.token).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn issuer_mismatch_is_rejected() {
        let keys = manager();
        let issued = issue_default(&keys);

        let mut config = JwtConfig::default();
        config.issuer = "https://other-issuer.example".to_string();
        let verifier = TokenVerifier::new(Arc::clone(&keys), config);

        assert!(matches!(
            verifier.verify(&issued.token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn audience_mismatch_is_rejected() {
        let keys = manager();
        let issued = issue_default(&keys);

        let mut config = JwtConfig::default();
        config.audience = "some-other-api".to_string();
        let verifier = TokenVerifier::new(Arc::clone(&keys), config);

        assert!(matches!(
            verifier.verify(&issued.token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let keys = manager();
        let verifier = TokenVerifier::new(keys, JwtConfig::default());
        assert!(verifier.verify("not.a.token").is_err());
        assert!(verifier.verify("").is_err());
    }

    #[test]
    fn tampered_payload_fails_signature_check() {
        let keys = manager();
        let issued = issue_default(&keys);
        let verifier = TokenVerifier::new(Arc::clone(&keys), JwtConfig::default());

        let mut parts: Vec<String> = issued.token.split('.').map(String::from).collect();
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;
        let mut payload: Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(&parts[1]).unwrap()).unwrap();
        payload["sub"] = json!("user-2");
        parts[1] = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
        let forged = parts.join(".");

        assert!(verifier.verify(&forged).is_err());
    }
}
