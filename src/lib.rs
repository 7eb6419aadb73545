pub mod cli;
pub mod config;
pub mod crypto;
pub mod github;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use github::{AuthError, Credential, CredentialBroker};
