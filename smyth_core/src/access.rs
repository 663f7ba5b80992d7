//! Caller identity and access requests.
//!
//! An [`AccessCandidate`] is the authenticated principal behind a request: a
//! `(role, id)` pair created at the entry of a request and immutable from
//! then on. Candidates derive [`AccessRequest`]s, which pair the candidate
//! with the access level an operation needs and travel through the secure
//! call pipeline into every connector.

use serde::{Deserialize, Serialize};

/// The kind of principal driving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessRole {
    User,
    Team,
    Agent,
}

impl AccessRole {
    /// Single-letter prefix used in prepared resource names, e.g. `u_alice_docs`.
    pub fn initial(&self) -> char {
        match self {
            AccessRole::User => 'u',
            AccessRole::Team => 't',
            AccessRole::Agent => 'a',
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessRole::User => "user",
            AccessRole::Team => "team",
            AccessRole::Agent => "agent",
        }
    }
}

impl std::fmt::Display for AccessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access levels, ordered. Owner implies Write and Read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
    Owner,
}

/// The authenticated principal `(role, id)` driving a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessCandidate {
    role: AccessRole,
    id: String,
}

impl AccessCandidate {
    pub fn new(role: AccessRole, id: impl Into<String>) -> Self {
        Self {
            role,
            id: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(AccessRole::User, id)
    }

    pub fn team(id: impl Into<String>) -> Self {
        Self::new(AccessRole::Team, id)
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(AccessRole::Agent, id)
    }

    pub fn role(&self) -> AccessRole {
        self.role
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stable key for per-candidate cache entries, e.g. `acl:<resource>:u:alice`.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.role.initial(), self.id)
    }

    pub fn request(&self, level: AccessLevel) -> AccessRequest {
        AccessRequest {
            candidate: self.clone(),
            level,
        }
    }

    pub fn read_request(&self) -> AccessRequest {
        self.request(AccessLevel::Read)
    }

    pub fn write_request(&self) -> AccessRequest {
        self.request(AccessLevel::Write)
    }

    pub fn owner_request(&self) -> AccessRequest {
        self.request(AccessLevel::Owner)
    }
}

impl std::fmt::Display for AccessCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.role, self.id)
    }
}

/// A candidate paired with the access level an operation requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    candidate: AccessCandidate,
    level: AccessLevel,
}

impl AccessRequest {
    pub fn new(candidate: AccessCandidate, level: AccessLevel) -> Self {
        Self { candidate, level }
    }

    pub fn candidate(&self) -> &AccessCandidate {
        &self.candidate
    }

    pub fn level(&self) -> AccessLevel {
        self.level
    }

    /// Same candidate at a different level.
    pub fn at(&self, level: AccessLevel) -> AccessRequest {
        self.candidate.request(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_views() {
        let c = AccessCandidate::user("alice");
        assert_eq!(c.role(), AccessRole::User);
        assert_eq!(c.id(), "alice");
        assert_eq!(c.cache_key(), "u:alice");
        assert_eq!(c.read_request().level(), AccessLevel::Read);
        assert_eq!(c.owner_request().level(), AccessLevel::Owner);
        assert_eq!(c.to_string(), "user(alice)");
    }

    #[test]
    fn test_level_ordering() {
        assert!(AccessLevel::Read < AccessLevel::Write);
        assert!(AccessLevel::Write < AccessLevel::Owner);
    }
}
