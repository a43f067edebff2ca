//! Rotating RSA key manager and its JWKS projection.
//!
//! Exactly one key is current at any moment; older keys are retained
//! public-side so tokens signed just before a rotation keep verifying
//! until the retention horizon. Readers never lock out rotation: the ring
//! lives behind an `RwLock`, keys are immutable once inserted, and the
//! current-kid pointer is swapped only after the new key is in the map.
//! The rotation task is the single writer.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::AuthError;

const RSA_BITS: usize = 2048;

#[derive(Debug, Clone, Deserialize)]
pub struct KeyManagerConfig {
    /// How often a fresh signing key is generated
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,
    /// Longest token lifetime ever issued; bounds the retention floor
    #[serde(default = "default_max_token_ttl_secs")]
    pub max_token_ttl_secs: u64,
    /// Keys retained including the current one
    #[serde(default = "default_retain_keys")]
    pub retain_keys: usize,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            rotation_interval_secs: default_rotation_interval_secs(),
            max_token_ttl_secs: default_max_token_ttl_secs(),
            retain_keys: default_retain_keys(),
        }
    }
}

impl KeyManagerConfig {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    /// Retention floor: a token minted the instant before a rotation must
    /// stay verifiable for its whole lifetime.
    pub fn effective_retain(&self) -> usize {
        let floor =
            self.max_token_ttl_secs.div_ceil(self.rotation_interval_secs.max(1)) as usize + 1;
        self.retain_keys.max(floor)
    }
}

fn default_rotation_interval_secs() -> u64 {
    86_400
}

fn default_max_token_ttl_secs() -> u64 {
    3_600
}

fn default_retain_keys() -> usize {
    3
}

/// One generated key pair plus its public JWKS entry.
pub struct KeyMaterial {
    pub kid: String,
    pub created_at: DateTime<Utc>,
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
    jwk: Jwk,
}

/// Public JWKS entry for one key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

/// JWKS document served at `/.well-known/jwks.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

struct KeyRing {
    /// Oldest first; pruning pops from the front.
    keys: Vec<Arc<KeyMaterial>>,
    current_kid: String,
}

/// Thread-safe key set with a single rotating writer.
pub struct KeyManager {
    ring: RwLock<KeyRing>,
    config: KeyManagerConfig,
    consecutive_failures: AtomicU32,
    healthy: AtomicBool,
}

impl KeyManager {
    /// Generate the first key and mark it current. Called once at startup;
    /// after this, `current_signing_key` cannot fail.
    pub fn bootstrap(config: KeyManagerConfig) -> Result<Self, AuthError> {
        let first = generate_key()?;
        info!(kid = %first.kid, "Signing key bootstrapped");

        Ok(Self {
            ring: RwLock::new(KeyRing {
                current_kid: first.kid.clone(),
                keys: vec![Arc::new(first)],
            }),
            config,
            consecutive_failures: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
        })
    }

    /// Generate a new key, make it current, prune past retention.
    pub fn rotate(&self) -> Result<String, AuthError> {
        let fresh = generate_key()?;
        let kid = fresh.kid.clone();
        let retain = self.config.effective_retain();

        let mut ring = self.ring.write().expect("key ring lock poisoned");
        ring.keys.push(Arc::new(fresh));
        // Pointer swap happens after the insert; readers holding the old
        // kid still resolve it from the map.
        ring.current_kid = kid.clone();
        while ring.keys.len() > retain {
            let dropped = ring.keys.remove(0);
            info!(kid = %dropped.kid, "Pruned retired signing key");
        }
        drop(ring);

        info!(kid = %kid, "Signing key rotated");
        Ok(kid)
    }

    /// The key new tokens are signed with. Infallible after bootstrap.
    pub fn current_signing_key(&self) -> (String, EncodingKey) {
        let ring = self.ring.read().expect("key ring lock poisoned");
        let current = ring
            .keys
            .iter()
            .find(|k| k.kid == ring.current_kid)
            .expect("current kid always present in ring");
        (current.kid.clone(), current.encoding.clone())
    }

    /// Verification key for a header `kid`; `None` once pruned.
    pub fn verification_key(&self, kid: &str) -> Option<DecodingKey> {
        let ring = self.ring.read().expect("key ring lock poisoned");
        ring.keys
            .iter()
            .find(|k| k.kid == kid)
            .map(|k| k.decoding.clone())
    }

    /// Public key set, newest first.
    pub fn jwks(&self) -> Jwks {
        let ring = self.ring.read().expect("key ring lock poisoned");
        let mut keys: Vec<Jwk> = ring.keys.iter().map(|k| k.jwk.clone()).collect();
        keys.reverse();
        Jwks { keys }
    }

    pub fn retained_kids(&self) -> Vec<String> {
        let ring = self.ring.read().expect("key ring lock poisoned");
        ring.keys.iter().map(|k| k.kid.clone()).collect()
    }

    /// False after two consecutive rotation failures; wired to the
    /// readiness probe.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn record_rotation_outcome(&self, outcome: &Result<String, AuthError>) {
        match outcome {
            Ok(_) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.healthy.store(true, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= 2 {
                    error!(failures, error = %e, "Repeated key rotation failure, marking unhealthy");
                    self.healthy.store(false, Ordering::Relaxed);
                } else {
                    warn!(error = %e, "Key rotation failed, keeping previous key current");
                }
            }
        }
    }
}

/// Background rotation loop. Spawn once per issuing service.
pub async fn rotation_task(manager: Arc<KeyManager>) {
    let interval = manager.config.rotation_interval();
    loop {
        tokio::time::sleep(interval).await;

        let rotating = Arc::clone(&manager);
        let outcome = tokio::task::spawn_blocking(move || rotating.rotate())
            .await
            .unwrap_or_else(|e| Err(AuthError::KeyGeneration(format!("rotation task panic: {e}"))));

        manager.record_rotation_outcome(&outcome);
    }
}

fn generate_key() -> Result<KeyMaterial, AuthError> {
    let mut rng = rand::rngs::OsRng;
    let private = RsaPrivateKey::new(&mut rng, RSA_BITS)
        .map_err(|e| AuthError::KeyGeneration(e.to_string()))?;
    let public = RsaPublicKey::from(&private);

    let private_pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| AuthError::KeyGeneration(e.to_string()))?;
    let public_pem = public
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| AuthError::KeyGeneration(e.to_string()))?;

    let encoding = EncodingKey::from_rsa_pem(private_pem.as_bytes())
        .map_err(|e| AuthError::KeyGeneration(e.to_string()))?;
    let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
        .map_err(|e| AuthError::KeyGeneration(e.to_string()))?;

    let kid = Uuid::new_v4().simple().to_string();
    let jwk = Jwk {
        kty: "RSA".to_string(),
        use_: "sig".to_string(),
        alg: "RS256".to_string(),
        kid: kid.clone(),
        n: URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
    };

    Ok(KeyMaterial {
        kid,
        created_at: Utc::now(),
        encoding,
        decoding,
        jwk,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(retain: usize) -> KeyManagerConfig {
        KeyManagerConfig {
            rotation_interval_secs: 86_400,
            max_token_ttl_secs: 3_600,
            retain_keys: retain,
        }
    }

    #[test]
    fn bootstrap_yields_a_current_key() {
        let manager = KeyManager::bootstrap(test_config(3)).unwrap();
        let (kid, _) = manager.current_signing_key();
        assert!(!kid.is_empty());
        assert!(manager.verification_key(&kid).is_some());
        assert!(manager.is_healthy());
    }

    #[test]
    fn rotation_swaps_current_and_retains_previous() {
        let manager = KeyManager::bootstrap(test_config(3)).unwrap();
        let (old_kid, _) = manager.current_signing_key();

        let new_kid = manager.rotate().unwrap();
        let (current_kid, _) = manager.current_signing_key();

        assert_eq!(current_kid, new_kid);
        assert_ne!(current_kid, old_kid);
        // Previous key still verifies until pruned.
        assert!(manager.verification_key(&old_kid).is_some());
    }

    #[test]
    fn pruning_keeps_at_most_retain_keys() {
        let manager = KeyManager::bootstrap(test_config(2)).unwrap();
        let (first_kid, _) = manager.current_signing_key();

        manager.rotate().unwrap();
        manager.rotate().unwrap();

        let kids = manager.retained_kids();
        assert_eq!(kids.len(), 2);
        assert!(!kids.contains(&first_kid), "oldest key must be pruned");
        assert!(manager.verification_key(&first_kid).is_none());
    }

    #[test]
    fn retention_floor_covers_token_lifetime() {
        // Tokens live 10x longer than the rotation interval: the
        // configured retain of 1 must be raised.
        let config = KeyManagerConfig {
            rotation_interval_secs: 60,
            max_token_ttl_secs: 600,
            retain_keys: 1,
        };
        assert_eq!(config.effective_retain(), 11);
    }

    #[test]
    fn jwks_exposes_all_retained_public_keys() {
        let manager = KeyManager::bootstrap(test_config(3)).unwrap();
        manager.rotate().unwrap();

        let jwks = manager.jwks();
        assert_eq!(jwks.keys.len(), 2);
        for jwk in &jwks.keys {
            assert_eq!(jwk.kty, "RSA");
            assert_eq!(jwk.alg, "RS256");
            assert_eq!(jwk.use_, "sig");
            assert!(!jwk.n.is_empty());
            assert!(!jwk.e.is_empty());
            // base64url without padding
            assert!(!jwk.n.contains('='));
        }
        // Newest first: the current key leads the document.
        let (current_kid, _) = manager.current_signing_key();
        assert_eq!(jwks.keys[0].kid, current_kid);
    }

    #[test]
    fn two_rotation_failures_mark_unhealthy() {
        let manager = KeyManager::bootstrap(test_config(3)).unwrap();

        let failure: Result<String, AuthError> =
            Err(AuthError::KeyGeneration("no entropy".to_string()));
        manager.record_rotation_outcome(&failure);
        assert!(manager.is_healthy(), "one failure keeps the old key and stays up");

        manager.record_rotation_outcome(&failure);
        assert!(!manager.is_healthy(), "second consecutive failure is fatal to liveness");

        manager.record_rotation_outcome(&Ok("kid".to_string()));
        assert!(manager.is_healthy(), "successful rotation recovers");
    }
}
