pub mod auth;
pub mod correlation;

pub use auth::Principal;
pub use correlation::{CorrelationId, RequestContext};
