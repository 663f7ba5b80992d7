//! Runtime engine for the Smyth Runtime Environment.
//!
//! The engine binds the contracts in `smyth_core` to live state: the
//! connector service bus ([`runtime::Runtime`]), the secure call pipeline
//! ([`guard`]), candidate-bound clients ([`requester`]), reference
//! connectors ([`connectors`]), the `smythfs://` virtual filesystem
//! ([`smythfs`]), conversations and the agent runtime.

pub mod agent;
pub mod connectors;
pub mod conversation;
pub mod guard;
pub mod requester;
pub mod runtime;
pub mod smythfs;
pub mod usage;

pub use runtime::{Runtime, RuntimeStatus, SreConfig};


pub static APP_USER_AGENT: &str = concat!(
    "Mozilla/5.0 smyth.sre ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
);
