//! Authentication module for the DareMeX backend
//!
//! Email/password sign-in against the hosted auth service, with refresh-token
//! renewal. Tokens are persisted through the config file.

pub mod session;
pub mod tokens;

pub use session::{login, logout, refresh, status};
pub use tokens::{StoredToken, TokenStore};
