//! sea-orm entities for the tables created by the `migration` crate.

pub mod oauth_state;
pub mod user_account;
