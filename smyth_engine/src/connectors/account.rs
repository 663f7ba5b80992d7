//! Local account connector.
//!
//! Maps candidates to teams from an in-process table, with a configurable
//! default team for unmapped candidates. Team settings are opaque JSON
//! documents (custom LLM definitions and the like).

use async_trait::async_trait;
use dashmap::DashMap;

use smyth_core::account::AccountConnector;
use smyth_core::{AccessCandidate, AccessRole, Connector, Json, Result, Subsystem};

pub const DEFAULT_TEAM: &str = "default";

pub struct LocalAccount {
    default_team: String,
    members: DashMap<String, String>,
    settings: DashMap<String, Json>,
}

impl Default for LocalAccount {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalAccount {
    pub fn new() -> Self {
        Self {
            default_team: DEFAULT_TEAM.to_string(),
            members: DashMap::new(),
            settings: DashMap::new(),
        }
    }

    pub fn with_default_team(mut self, team: impl Into<String>) -> Self {
        self.default_team = team.into();
        self
    }

    pub fn with_member(self, candidate: &AccessCandidate, team: impl Into<String>) -> Self {
        self.members.insert(candidate.cache_key(), team.into());
        self
    }

    pub fn with_team_settings(self, team: impl Into<String>, settings: Json) -> Self {
        self.settings.insert(team.into(), settings);
        self
    }
}

impl Connector for LocalAccount {
    fn name(&self) -> &str {
        "Local"
    }

    fn subsystem(&self) -> Subsystem {
        Subsystem::Account
    }
}

#[async_trait]
impl AccountConnector for LocalAccount {
    async fn team_of(&self, candidate: &AccessCandidate) -> Result<String> {
        if candidate.role() == AccessRole::Team {
            return Ok(candidate.id().to_string());
        }
        Ok(self
            .members
            .get(&candidate.cache_key())
            .map(|team| team.clone())
            .unwrap_or_else(|| self.default_team.clone()))
    }

    async fn team_settings(&self, team_id: &str) -> Result<Json> {
        Ok(self
            .settings
            .get(team_id)
            .map(|s| s.clone())
            .unwrap_or(Json::Null))
    }
}
