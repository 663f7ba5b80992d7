//! `smythfs://` URI grammar.
//!
//! ```text
//! smythfs://<owner>.<role>/<path>
//! role ∈ {team, agent}
//! ```
//!
//! `<owner>` is a team id or agent id; the first path segment is the
//! top-level container. Parsing is hand-rolled rather than delegated to a
//! generic URL parser because owner ids are case-sensitive and must not go
//! through host normalization.

use serde::{Deserialize, Serialize};

use crate::access::AccessRole;
use crate::error::{Error, Result};

pub const SMYTHFS_SCHEME: &str = "smythfs";

/// A parsed `smythfs://` URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SmythFsUri {
    owner: String,
    role: AccessRole,
    path: String,
}

impl SmythFsUri {
    pub fn new(owner: impl Into<String>, role: AccessRole, path: impl Into<String>) -> Result<Self> {
        let owner = owner.into();
        let path = path.into();
        let path = path.trim_matches('/').to_string();
        if !matches!(role, AccessRole::Team | AccessRole::Agent) {
            return Err(Error::invalid("smythfs role must be team or agent"));
        }
        if owner.is_empty() || owner.contains('/') {
            return Err(Error::invalid("smythfs owner must be a non-empty id"));
        }
        if path.is_empty() {
            return Err(Error::invalid("smythfs path must not be empty"));
        }
        Ok(Self { owner, role, path })
    }

    /// Parses `smythfs://<owner>.<role>/<path>`.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("smythfs://")
            .ok_or_else(|| Error::invalid(format!("not a smythfs uri: {uri}")))?;
        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| Error::invalid(format!("smythfs uri has no path: {uri}")))?;
        // The role is the last dot-separated label; owner ids may contain dots.
        let (owner, role) = authority
            .rsplit_once('.')
            .ok_or_else(|| Error::invalid(format!("smythfs authority must be <owner>.<role>: {uri}")))?;
        let role = match role {
            "team" => AccessRole::Team,
            "agent" => AccessRole::Agent,
            other => {
                return Err(Error::invalid(format!(
                    "smythfs role must be team or agent, got {other}"
                )));
            }
        };
        Self::new(owner, role, path)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn role(&self) -> AccessRole {
        self.role
    }

    /// Object path below the authority, without leading slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// First path segment: the top-level container.
    pub fn container(&self) -> &str {
        self.path.split('/').next().unwrap_or_default()
    }

    /// File extension of the last path segment, if any.
    pub fn extension(&self) -> Option<&str> {
        let name = self.path.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        (!stem.is_empty() && !ext.is_empty()).then_some(ext)
    }
}

impl std::fmt::Display for SmythFsUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "smythfs://{}.{}/{}",
            self.owner,
            self.role.as_str(),
            self.path
        )
    }
}

impl std::str::FromStr for SmythFsUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_team_uri() {
        let uri = SmythFsUri::parse("smythfs://default.team/myTestAgent/myTestFile.txt").unwrap();
        assert_eq!(uri.owner(), "default");
        assert_eq!(uri.role(), AccessRole::Team);
        assert_eq!(uri.path(), "myTestAgent/myTestFile.txt");
        assert_eq!(uri.container(), "myTestAgent");
        assert_eq!(uri.extension(), Some("txt"));
        assert_eq!(
            uri.to_string(),
            "smythfs://default.team/myTestAgent/myTestFile.txt"
        );
    }

    #[test]
    fn test_owner_case_preserved() {
        let uri = SmythFsUri::parse("smythfs://TeamAPICall.team/image-agent/smythos.png").unwrap();
        assert_eq!(uri.owner(), "TeamAPICall");
        assert_eq!(uri.extension(), Some("png"));
    }

    #[test]
    fn test_owner_with_dots() {
        let uri = SmythFsUri::parse("smythfs://agent.v2.prod.agent/files/a.bin").unwrap();
        assert_eq!(uri.owner(), "agent.v2.prod");
        assert_eq!(uri.role(), AccessRole::Agent);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(SmythFsUri::parse("http://default.team/x").is_err());
        assert!(SmythFsUri::parse("smythfs://default.user/x").is_err());
        assert!(SmythFsUri::parse("smythfs://default.team").is_err());
        assert!(SmythFsUri::parse("smythfs://noteam/x").is_err());
        assert!(SmythFsUri::parse("smythfs://default.team/").is_err());
    }

    #[test]
    fn test_round_trip() {
        let s = "smythfs://t-1.team/container/deep/path.json";
        assert_eq!(SmythFsUri::parse(s).unwrap().to_string(), s);
    }
}
