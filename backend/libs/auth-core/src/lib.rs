//! Authentication and authority derivation shared by every service.
//!
//! [`keys`] owns the rotating RSA signing keys and the public JWKS view;
//! [`jwt`] mints and verifies RS256 tokens against that key set; and
//! [`authority`] turns verified claims into the flat authority strings
//! (`SCOPE_*`, `TENANT_<tenant>:<role>`, ...) request guards match on.

pub mod authority;
mod error;
pub mod jwt;
pub mod keys;

pub use authority::{Authority, AuthzConfig};
pub use error::AuthError;
pub use jwt::{IssuedToken, JwtConfig, TokenIssuer, TokenVerifier, VerifiedToken};
pub use keys::{Jwk, Jwks, KeyManager, KeyManagerConfig};
