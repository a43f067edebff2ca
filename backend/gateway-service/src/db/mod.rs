pub mod login_attempts;
pub mod sagas;
pub mod users;
