use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Signature, expiry, issuer or audience check failed; surfaced to
    /// clients as `invalid_token`.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// RSA key generation failed (entropy exhaustion, allocation).
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Signing failed with the current key.
    #[error("Token signing failed: {0}")]
    Signing(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        AuthError::InvalidToken(err.to_string())
    }
}
