//! Subcommand implementations.

pub mod admin;
pub mod checkout;
pub mod pull;
