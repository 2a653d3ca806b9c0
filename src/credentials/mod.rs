//! OAuth bearer-token storage.
//!
//! Tokens are cached in memory and mirrored to JSON files on disk so that an
//! authorisation survives restarts.  One token is held per [`Tenant`]: the
//! global operator, or an organisation that authorised separately.

pub mod oauth_state;
pub mod store;

pub use oauth_state::PendingLogins;
pub use store::{CredentialStore, Tenant, TokenData};
