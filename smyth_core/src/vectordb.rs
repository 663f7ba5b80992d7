//! VectorDB connector contract.
//!
//! A vector connector manages namespaces of embedded vectors plus the
//! datasources (chunked documents) they came from. Isolation across
//! candidates rests on a single primitive: the prepared namespace name
//!
//! ```text
//! prepared = role_initial + "_" + candidate_id + "_" + namespace
//! ```
//!
//! so two candidates using the same user-visible name operate on different
//! prepared names and can never observe each other.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::access::{AccessCandidate, AccessRequest};
use crate::acl::Acl;
use crate::connector::Connector;
use crate::error::{Error, Result};

/// Builds the candidate-scoped namespace name, e.g. `u_alice_docs`.
pub fn prepared_namespace(candidate: &AccessCandidate, namespace: &str) -> String {
    format!(
        "{}_{}_{}",
        candidate.role().initial(),
        candidate.id(),
        namespace
    )
}

/// Namespace descriptor recorded at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub prepared_name: String,
    pub display_name: String,
    pub candidate_id: String,
    pub candidate_role: crate::access::AccessRole,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    /// Backend tag, e.g. `"ram"`.
    pub storage_type: String,
}

/// A single stored vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Raw material for an insert: either text to embed or a ready vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VectorSource {
    Text(String),
    Vector(Vec<f32>),
}

impl VectorSource {
    pub fn is_text(&self) -> bool {
        matches!(self, VectorSource::Text(_))
    }
}

/// One source in an [`VectorDbConnector::insert`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: VectorSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A chunked document inserted as a group of vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datasource {
    pub id: String,
    pub label: String,
    pub text: String,
    pub vector_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Parameters for [`VectorDbConnector::create_datasource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub text: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl DatasourceInput {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::invalid("chunk_size must be > 0"));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::invalid("chunk_overlap must be < chunk_size"));
        }
        Ok(())
    }

    /// Chunk count law: `ceil((L - o) / (s - o))` for text length `L`.
    pub fn expected_chunks(&self, text_len: usize) -> usize {
        if text_len <= self.chunk_size {
            return usize::from(text_len > 0);
        }
        (text_len - self.chunk_overlap).div_ceil(self.chunk_size - self.chunk_overlap)
    }
}

/// What a delete call targets: explicit ids or everything owned by a
/// datasource.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteTarget {
    Ids(Vec<String>),
    Datasource(String),
}

impl From<&str> for DeleteTarget {
    fn from(id: &str) -> Self {
        DeleteTarget::Ids(vec![id.to_string()])
    }
}

/// Search input: embed a string query, or search by raw vector.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    Text(String),
    Vector(Vec<f32>),
}

impl From<&str> for SearchQuery {
    fn from(q: &str) -> Self {
        SearchQuery::Text(q.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub top_k: usize,
    pub include_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    /// Metadata equality filter: every `(key, value)` must match.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            include_metadata: false,
            threshold: None,
            filter: None,
        }
    }
}

impl SearchOptions {
    pub fn top_k(k: usize) -> Self {
        Self {
            top_k: k,
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self) -> Self {
        self.include_metadata = true;
        self
    }
}

/// One search hit. `metadata` is absent (not `{}`) unless the caller asked
/// for it; `values` may be empty when the backend does not return
/// embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub values: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[async_trait]
pub trait VectorDbConnector: Connector {
    /// Namespace-level ACL, keyed by the prepared name.
    async fn resource_acl(&self, prepared: &str, candidate: &AccessCandidate) -> Result<Acl>;

    /// Idempotent namespace creation.
    async fn create_namespace(
        &self,
        req: &AccessRequest,
        namespace: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<NamespaceInfo>;

    async fn namespace_exists(&self, req: &AccessRequest, namespace: &str) -> Result<bool>;

    /// Fails with [`Error::NamespaceNotFound`] for unknown namespaces.
    async fn get_namespace(&self, req: &AccessRequest, namespace: &str) -> Result<NamespaceInfo>;

    /// Cascades: vectors, datasources, then the namespace ACL.
    async fn delete_namespace(&self, req: &AccessRequest, namespace: &str) -> Result<()>;

    /// Inserts sources; one call must be homogeneous (all text or all
    /// vectors). Duplicate ids overwrite. Returns assigned ids.
    async fn insert(
        &self,
        req: &AccessRequest,
        namespace: &str,
        sources: Vec<SourceInput>,
    ) -> Result<Vec<String>>;

    async fn delete(
        &self,
        req: &AccessRequest,
        namespace: &str,
        target: DeleteTarget,
    ) -> Result<()>;

    /// Cosine-similarity search, descending score, capped at
    /// `options.top_k`.
    async fn search(
        &self,
        req: &AccessRequest,
        namespace: &str,
        query: SearchQuery,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>>;

    /// Chunks, embeds, inserts, and records the datasource descriptor.
    async fn create_datasource(
        &self,
        req: &AccessRequest,
        namespace: &str,
        input: DatasourceInput,
    ) -> Result<Datasource>;

    /// None for missing ids; never an error.
    async fn get_datasource(
        &self,
        req: &AccessRequest,
        namespace: &str,
        id: &str,
    ) -> Result<Option<Datasource>>;

    /// Fails with [`Error::DatasourceNotFound`] when absent; otherwise
    /// removes all owned vectors, then the descriptor.
    async fn delete_datasource(&self, req: &AccessRequest, namespace: &str, id: &str)
    -> Result<()>;

    /// Empty when the namespace does not exist.
    async fn list_datasources(&self, req: &AccessRequest, namespace: &str)
    -> Result<Vec<Datasource>>;
}
