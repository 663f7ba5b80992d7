//! Connector base contract and subsystem naming.
//!
//! Every pluggable capability implements [`Connector`] for lifecycle and
//! identification, plus one of the subsystem-specific traits
//! ([`crate::storage::StorageConnector`], [`crate::vectordb::VectorDbConnector`], ...).
//! The service bus owns connector instances and drives `start`/`stop`;
//! connectors never reach each other directly but resolve collaborators
//! through the bus at call time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The subsystems a runtime configuration may bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subsystem {
    Storage,
    Vault,
    Cache,
    #[serde(rename = "NKV")]
    Nkv,
    #[serde(rename = "VectorDB")]
    VectorDb,
    #[serde(rename = "LLM")]
    Llm,
    Account,
    Code,
    Router,
    AgentData,
    Log,
}

impl Subsystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Storage => "Storage",
            Subsystem::Vault => "Vault",
            Subsystem::Cache => "Cache",
            Subsystem::Nkv => "NKV",
            Subsystem::VectorDb => "VectorDB",
            Subsystem::Llm => "LLM",
            Subsystem::Account => "Account",
            Subsystem::Code => "Code",
            Subsystem::Router => "Router",
            Subsystem::AgentData => "AgentData",
            Subsystem::Log => "Log",
        }
    }
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle and identification shared by all connectors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Registered connector name, e.g. `"LocalStorage"` or `"RAMVec"`.
    fn name(&self) -> &str;

    fn subsystem(&self) -> Subsystem;

    /// Called once by the bus after construction, before the runtime is ready.
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Called in reverse init order during shutdown. Must be idempotent.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsystem_config_names() {
        assert_eq!(serde_json::to_string(&Subsystem::Nkv).unwrap(), "\"NKV\"");
        assert_eq!(
            serde_json::to_string(&Subsystem::VectorDb).unwrap(),
            "\"VectorDB\""
        );
        assert_eq!(serde_json::to_string(&Subsystem::Llm).unwrap(), "\"LLM\"");
        let s: Subsystem = serde_json::from_str("\"Storage\"").unwrap();
        assert_eq!(s, Subsystem::Storage);
    }
}
