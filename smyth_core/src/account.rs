//! Account connector contract.
//!
//! Maps a candidate to its team and supplies team-level settings such as
//! custom LLM definitions.

use async_trait::async_trait;

use crate::access::AccessCandidate;
use crate::connector::Connector;
use crate::error::Result;

#[async_trait]
pub trait AccountConnector: Connector {
    /// Team id the candidate belongs to. Team candidates resolve to
    /// themselves.
    async fn team_of(&self, candidate: &AccessCandidate) -> Result<String>;

    /// Opaque team settings document (custom LLM definitions, limits, ...).
    async fn team_settings(&self, team_id: &str) -> Result<serde_json::Value>;
}
