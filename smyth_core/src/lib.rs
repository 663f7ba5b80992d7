//! Core types and connector contracts for the Smyth Runtime Environment.
//!
//! This crate defines the data model the runtime is built on -- identity and
//! ACLs, the `smythfs://` URI grammar, the error taxonomy -- and the traits
//! every pluggable subsystem implements. The `smyth_engine` crate provides
//! the service bus, the secure call pipeline, and reference connectors.

pub mod access;
pub mod account;
pub mod acl;
pub mod cache;
pub mod connector;
pub mod error;
pub mod llm;
pub mod nkv;
pub mod storage;
pub mod uri;
pub mod usage;
pub mod vault;
pub mod vectordb;

pub use access::{AccessCandidate, AccessLevel, AccessRequest, AccessRole};
pub use acl::{ACL_HASH_ALGORITHM, ACL_WILDCARD, Acl};
pub use connector::{Connector, Subsystem};
pub use error::{Error, Result};
pub use uri::SmythFsUri;

/// Re-exported JSON value; connector settings and metadata are carried as
/// opaque JSON.
pub use serde_json::Value as Json;

/// A boxed, sendable future, used where dynamic dispatch needs an erased
/// future type (connector factories, dyn skill calls).
pub type BoxPinFut<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;
