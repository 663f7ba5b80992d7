//! Reference connectors.
//!
//! One local implementation per subsystem contract: in-memory cache, NKV
//! and vector store, object_store-backed storage, a JSON file vault, a
//! local account table, and two LLM connectors (an OpenAI-compatible HTTP
//! client and a deterministic echo model for tests).

pub mod account;
pub mod cache;
pub mod llm;
pub mod nkv;
pub mod storage;
pub mod vault;
pub mod vectordb;

pub use account::LocalAccount;
pub use cache::MemoryCache;
pub use llm::mock::{EchoLlm, MockEmbedder};
pub use llm::openai::OpenAiLlm;
pub use nkv::MemoryNkv;
pub use storage::LocalStorage;
pub use vault::JsonVault;
pub use vectordb::RamVec;
