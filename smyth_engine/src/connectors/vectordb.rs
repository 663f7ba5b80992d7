//! In-memory vector connector.
//!
//! `RAMVec` keeps one lock per namespace; insert/delete/search on a single
//! namespace are linearizable for a candidate. Namespace names arrive
//! user-visible and are prepared per candidate
//! (`<role-initial>_<id>_<name>`) before touching state, which is the
//! isolation primitive shared by every vector backend.
//!
//! Datasource descriptors are held in the namespace state and mirrored to
//! an optional NKV sidecar store so they survive a backend that has its
//! own persistence story.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use smyth_core::llm::Embedder;
use smyth_core::nkv::NkvConnector;
use smyth_core::vectordb::{
    Datasource, DatasourceInput, DeleteTarget, NamespaceInfo, SearchOptions, SearchQuery,
    SearchResult, SourceInput, VectorDbConnector, VectorRecord, VectorSource, prepared_namespace,
};
use smyth_core::{AccessCandidate, AccessRequest, Acl, Connector, Error, Result, Subsystem};

const CONNECTOR_NAME: &str = "RAMVec";
const STORAGE_TYPE: &str = "ram";

/// Splits text into character chunks of `size` with `overlap` carried
/// between consecutive chunks. The chunk count follows
/// `ceil((len - overlap) / (size - overlap))`; the last chunk may be
/// shorter.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let step = size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

struct StoredVector {
    record: VectorRecord,
    text: Option<String>,
}

struct NamespaceState {
    info: NamespaceInfo,
    acl: Acl,
    vectors: Vec<StoredVector>,
    datasources: BTreeMap<String, Datasource>,
}

pub struct RamVec {
    embedder: Arc<dyn Embedder>,
    namespaces: DashMap<String, Arc<RwLock<NamespaceState>>>,
    sidecar: Option<Arc<dyn NkvConnector>>,
}

impl RamVec {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            namespaces: DashMap::new(),
            sidecar: None,
        }
    }

    /// Mirrors datasource descriptors into an NKV store per namespace.
    pub fn with_sidecar(mut self, nkv: Arc<dyn NkvConnector>) -> Self {
        self.sidecar = Some(nkv);
        self
    }

    fn state(&self, req: &AccessRequest, namespace: &str) -> Result<Arc<RwLock<NamespaceState>>> {
        let prepared = prepared_namespace(req.candidate(), namespace);
        self.namespaces
            .get(&prepared)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))
    }

    fn sidecar_store(prepared: &str) -> String {
        format!("vec_ds_{prepared}")
    }

    async fn sidecar_put(&self, req: &AccessRequest, prepared: &str, ds: &Datasource) {
        if let Some(nkv) = &self.sidecar {
            let value = serde_json::to_string(ds).unwrap_or_default();
            if let Err(err) = nkv
                .set(req, &Self::sidecar_store(prepared), &ds.id, value)
                .await
            {
                log::warn!(target: "vectordb", datasource = ds.id.as_str(), error = err.to_string(); "datasource sidecar write failed");
            }
        }
    }

    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.embedder.embed(texts).await
    }
}

impl Connector for RamVec {
    fn name(&self) -> &str {
        CONNECTOR_NAME
    }

    fn subsystem(&self) -> Subsystem {
        Subsystem::VectorDb
    }
}

#[async_trait]
impl VectorDbConnector for RamVec {
    async fn resource_acl(&self, prepared: &str, candidate: &AccessCandidate) -> Result<Acl> {
        match self.namespaces.get(prepared) {
            Some(state) => Ok(state.read().acl.clone()),
            None => Ok(Acl::for_candidate(candidate)),
        }
    }

    async fn create_namespace(
        &self,
        req: &AccessRequest,
        namespace: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<NamespaceInfo> {
        let prepared = prepared_namespace(req.candidate(), namespace);
        let entry = self.namespaces.entry(prepared.clone()).or_insert_with(|| {
            Arc::new(RwLock::new(NamespaceState {
                info: NamespaceInfo {
                    prepared_name: prepared.clone(),
                    display_name: namespace.to_string(),
                    candidate_id: req.candidate().id().to_string(),
                    candidate_role: req.candidate().role(),
                    metadata: metadata.unwrap_or(serde_json::Value::Null),
                    storage_type: STORAGE_TYPE.to_string(),
                },
                acl: Acl::for_candidate(req.candidate()),
                vectors: Vec::new(),
                datasources: BTreeMap::new(),
            }))
        });
        let info = entry.read().info.clone();
        Ok(info)
    }

    async fn namespace_exists(&self, req: &AccessRequest, namespace: &str) -> Result<bool> {
        let prepared = prepared_namespace(req.candidate(), namespace);
        Ok(self.namespaces.contains_key(&prepared))
    }

    async fn get_namespace(&self, req: &AccessRequest, namespace: &str) -> Result<NamespaceInfo> {
        let state = self.state(req, namespace)?;
        let info = state.read().info.clone();
        Ok(info)
    }

    async fn delete_namespace(&self, req: &AccessRequest, namespace: &str) -> Result<()> {
        let prepared = prepared_namespace(req.candidate(), namespace);
        self.namespaces
            .remove(&prepared)
            .ok_or_else(|| Error::NamespaceNotFound(namespace.to_string()))?;
        if let Some(nkv) = &self.sidecar {
            let _ = nkv.delete_store(req, &Self::sidecar_store(&prepared)).await;
        }
        Ok(())
    }

    async fn insert(
        &self,
        req: &AccessRequest,
        namespace: &str,
        sources: Vec<SourceInput>,
    ) -> Result<Vec<String>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        let all_text = sources.iter().all(|s| s.source.is_text());
        let all_vector = sources.iter().all(|s| !s.source.is_text());
        if !all_text && !all_vector {
            return Err(Error::invalid(
                "insert sources must be homogeneous: all text or all vectors",
            ));
        }

        let state = self.state(req, namespace)?;
        let ndims = self.embedder.ndims();

        // Embedding happens before the namespace lock is taken.
        let mut prepared: Vec<(String, Vec<f32>, Option<String>, Option<serde_json::Value>)> =
            Vec::with_capacity(sources.len());
        if all_text {
            let texts: Vec<String> = sources
                .iter()
                .map(|s| match &s.source {
                    VectorSource::Text(t) => t.clone(),
                    VectorSource::Vector(_) => unreachable!(),
                })
                .collect();
            let embeddings = self.embed_texts(texts.clone()).await?;
            for ((source, text), values) in sources.into_iter().zip(texts).zip(embeddings) {
                let id = source.id.unwrap_or_else(|| xid::new().to_string());
                prepared.push((id, values, Some(text), source.metadata));
            }
        } else {
            for source in sources {
                let VectorSource::Vector(values) = source.source else {
                    unreachable!()
                };
                if ndims != 0 && values.len() != ndims {
                    return Err(Error::invalid(format!(
                        "mismatched vector dimensions: expected {ndims}, got {}",
                        values.len()
                    )));
                }
                let id = source.id.unwrap_or_else(|| xid::new().to_string());
                prepared.push((id, values, None, source.metadata));
            }
        }

        let mut ids = Vec::with_capacity(prepared.len());
        let mut state = state.write();
        for (id, values, text, metadata) in prepared {
            let record = VectorRecord {
                id: id.clone(),
                values,
                datasource_id: None,
                metadata,
            };
            match state.vectors.iter_mut().find(|v| v.record.id == id) {
                Some(existing) => {
                    existing.record = record;
                    existing.text = text;
                }
                None => state.vectors.push(StoredVector { record, text }),
            }
            ids.push(id);
        }
        Ok(ids)
    }

    async fn delete(
        &self,
        req: &AccessRequest,
        namespace: &str,
        target: DeleteTarget,
    ) -> Result<()> {
        let state = self.state(req, namespace)?;
        let mut state = state.write();
        match target {
            DeleteTarget::Ids(ids) => {
                state.vectors.retain(|v| !ids.contains(&v.record.id));
            }
            DeleteTarget::Datasource(ds_id) => {
                state
                    .vectors
                    .retain(|v| v.record.datasource_id.as_deref() != Some(&ds_id));
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        req: &AccessRequest,
        namespace: &str,
        query: SearchQuery,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        let state = self.state(req, namespace)?;
        let query_vec = match query {
            SearchQuery::Vector(v) => v,
            SearchQuery::Text(text) => self.embedder.embed_query(&text).await?,
        };

        let state = state.read();
        let mut hits: Vec<SearchResult> = state
            .vectors
            .iter()
            .filter_map(|stored| {
                let score = cosine_similarity(&query_vec, &stored.record.values);
                if options.threshold.is_some_and(|t| score < t) {
                    return None;
                }
                if let Some(filter) = options.filter.as_ref().and_then(|f| f.as_object()) {
                    let meta = stored.record.metadata.as_ref()?;
                    if !filter.iter().all(|(k, v)| meta.get(k) == Some(v)) {
                        return None;
                    }
                }
                Some(SearchResult {
                    id: stored.record.id.clone(),
                    score,
                    values: stored.record.values.clone(),
                    text: stored.text.clone(),
                    metadata: options
                        .include_metadata
                        .then(|| stored.record.metadata.clone())
                        .flatten(),
                })
            })
            .collect();

        // Stable sort keeps ties in insertion order.
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(options.top_k);
        Ok(hits)
    }

    async fn create_datasource(
        &self,
        req: &AccessRequest,
        namespace: &str,
        input: DatasourceInput,
    ) -> Result<Datasource> {
        input.validate()?;
        let state = self.state(req, namespace)?;
        let prepared_name = prepared_namespace(req.candidate(), namespace);

        let ds_id = input.id.clone().unwrap_or_else(|| xid::new().to_string());
        let label = input.label.clone().unwrap_or_else(|| ds_id.clone());
        let chunks = chunk_text(&input.text, input.chunk_size, input.chunk_overlap);
        let embeddings = self.embed_texts(chunks.clone()).await?;

        let acl = state.read().acl.serialize();
        let mut vector_ids = Vec::with_capacity(chunks.len());
        let mut stored = Vec::with_capacity(chunks.len());
        for (chunk, values) in chunks.into_iter().zip(embeddings) {
            let vector_id = format!("{ds_id}_{}", uuid::Uuid::new_v4());
            let metadata = serde_json::json!({
                "acl": acl,
                "namespace_id": prepared_name,
                "datasource_id": ds_id,
                "datasource_label": label,
                "user_metadata": input.metadata.clone().unwrap_or(serde_json::Value::Null),
            });
            stored.push(StoredVector {
                record: VectorRecord {
                    id: vector_id.clone(),
                    values,
                    datasource_id: Some(ds_id.clone()),
                    metadata: Some(metadata),
                },
                text: Some(chunk),
            });
            vector_ids.push(vector_id);
        }

        let descriptor = Datasource {
            id: ds_id.clone(),
            label,
            text: input.text,
            vector_ids,
            metadata: input.metadata,
        };
        {
            let mut state = state.write();
            state.vectors.extend(stored);
            state.datasources.insert(ds_id, descriptor.clone());
        }
        self.sidecar_put(req, &prepared_name, &descriptor).await;
        Ok(descriptor)
    }

    async fn get_datasource(
        &self,
        req: &AccessRequest,
        namespace: &str,
        id: &str,
    ) -> Result<Option<Datasource>> {
        let Ok(state) = self.state(req, namespace) else {
            return Ok(None);
        };
        let ds = state.read().datasources.get(id).cloned();
        Ok(ds)
    }

    async fn delete_datasource(
        &self,
        req: &AccessRequest,
        namespace: &str,
        id: &str,
    ) -> Result<()> {
        let state = self.state(req, namespace)?;
        {
            let mut state = state.write();
            if state.datasources.remove(id).is_none() {
                return Err(Error::DatasourceNotFound(id.to_string()));
            }
            state
                .vectors
                .retain(|v| v.record.datasource_id.as_deref() != Some(id));
        }
        if let Some(nkv) = &self.sidecar {
            let prepared = prepared_namespace(req.candidate(), namespace);
            let _ = nkv.delete(req, &Self::sidecar_store(&prepared), id).await;
        }
        Ok(())
    }

    async fn list_datasources(
        &self,
        req: &AccessRequest,
        namespace: &str,
    ) -> Result<Vec<Datasource>> {
        let Ok(state) = self.state(req, namespace) else {
            return Ok(Vec::new());
        };
        let list = state.read().datasources.values().cloned().collect();
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::llm::mock::MockEmbedder;
    use crate::connectors::nkv::MemoryNkv;

    fn ramvec() -> RamVec {
        RamVec::new(Arc::new(MockEmbedder::default()))
    }

    #[test]
    fn test_chunk_text_law() {
        let chunks = chunk_text("ABCDEFGHIJKLMNOPQRSTUVWXYZ", 10, 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "ABCDEFGHIJ");
        assert_eq!(chunks[1], "IJKLMNOPQR");
        assert_eq!(chunks[2], "QRSTUVWXYZ");

        assert_eq!(chunk_text("", 10, 2).len(), 0);
        assert_eq!(chunk_text("short", 10, 2), vec!["short".to_string()]);
        // The last chunk may be shorter than `size`.
        let chunks = chunk_text("ABCDEFGHIJK", 10, 2);
        assert_eq!(chunks, vec!["ABCDEFGHIJ".to_string(), "IJK".to_string()]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_datasource_chunking_and_search() {
        let vec = ramvec();
        let user = AccessCandidate::user("test-user");
        let req = user.write_request();
        vec.create_namespace(&req, "docs", None).await.unwrap();

        let ds = vec
            .create_datasource(
                &req,
                "docs",
                DatasourceInput {
                    id: Some("ds1".into()),
                    label: None,
                    text: "ABCDEFGHIJKLMNOPQRSTUVWXYZ".into(),
                    chunk_size: 10,
                    chunk_overlap: 2,
                    metadata: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(ds.vector_ids.len(), 3);

        let results = vec
            .search(
                &user.read_request(),
                "docs",
                "KLM".into(),
                SearchOptions::top_k(1).with_metadata(),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].text.as_deref().unwrap().contains("KLM"));
        let meta = results[0].metadata.as_ref().unwrap();
        assert_eq!(meta["datasource_id"], "ds1");
        assert_eq!(meta["namespace_id"], "u_test-user_docs");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_metadata_absent_unless_requested() {
        let vec = ramvec();
        let user = AccessCandidate::user("u");
        let req = user.write_request();
        vec.create_namespace(&req, "ns", None).await.unwrap();
        vec.insert(
            &req,
            "ns",
            vec![SourceInput {
                id: Some("v1".into()),
                source: VectorSource::Text("hello world".into()),
                metadata: Some(serde_json::json!({"k": "v"})),
            }],
        )
        .await
        .unwrap();

        let results = vec
            .search(&user.read_request(), "ns", "hello".into(), SearchOptions::top_k(5))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].metadata.is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_namespace_isolation() {
        let vec = ramvec();
        let alice = AccessCandidate::user("alice");
        let bob = AccessCandidate::user("bob");
        let carol = AccessCandidate::user("carol");

        for (user, ds) in [(&alice, "ds-alice"), (&bob, "ds-bob")] {
            let req = user.write_request();
            vec.create_namespace(&req, "shared-name", None).await.unwrap();
            vec.create_datasource(
                &req,
                "shared-name",
                DatasourceInput {
                    id: Some(ds.into()),
                    label: None,
                    text: "some text to index".into(),
                    chunk_size: 32,
                    chunk_overlap: 0,
                    metadata: None,
                },
            )
            .await
            .unwrap();
        }

        let alice_ds = vec
            .list_datasources(&alice.read_request(), "shared-name")
            .await
            .unwrap();
        assert_eq!(alice_ds.len(), 1);
        assert_eq!(alice_ds[0].id, "ds-alice");

        let bob_ds = vec
            .list_datasources(&bob.read_request(), "shared-name")
            .await
            .unwrap();
        assert_eq!(bob_ds.len(), 1);
        assert_eq!(bob_ds[0].id, "ds-bob");

        assert!(
            !vec.namespace_exists(&carol.read_request(), "shared-name")
                .await
                .unwrap()
        );
        assert!(matches!(
            vec.search(&carol.read_request(), "shared-name", "q".into(), SearchOptions::default())
                .await,
            Err(Error::NamespaceNotFound(_))
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_heterogeneous_sources_rejected() {
        let vec = ramvec();
        let req = AccessCandidate::user("u").write_request();
        vec.create_namespace(&req, "ns", None).await.unwrap();
        let err = vec
            .insert(
                &req,
                "ns",
                vec![
                    SourceInput {
                        id: None,
                        source: VectorSource::Text("t".into()),
                        metadata: None,
                    },
                    SourceInput {
                        id: None,
                        source: VectorSource::Vector(vec![0.0; 64]),
                        metadata: None,
                    },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_duplicate_id_overwrites() {
        let vec = ramvec();
        let user = AccessCandidate::user("u");
        let req = user.write_request();
        vec.create_namespace(&req, "ns", None).await.unwrap();
        for text in ["first version", "second version"] {
            vec.insert(
                &req,
                "ns",
                vec![SourceInput {
                    id: Some("v1".into()),
                    source: VectorSource::Text(text.into()),
                    metadata: None,
                }],
            )
            .await
            .unwrap();
        }
        let results = vec
            .search(&user.read_request(), "ns", "version".into(), SearchOptions::top_k(10))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text.as_deref(), Some("second version"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_search_ordering_and_top_k() {
        let vec = ramvec();
        let user = AccessCandidate::user("u");
        let req = user.write_request();
        vec.create_namespace(&req, "ns", None).await.unwrap();
        vec.create_datasource(
            &req,
            "ns",
            DatasourceInput {
                id: Some("ds".into()),
                label: None,
                text: "ABCDEFGHIJKLMNOPQRSTUVWXYZ".into(),
                chunk_size: 6,
                chunk_overlap: 1,
                metadata: None,
            },
        )
        .await
        .unwrap();

        let results = vec
            .search(&user.read_request(), "ns", "ABCDE".into(), SearchOptions::top_k(3))
            .await
            .unwrap();
        assert!(results.len() <= 3);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_datasource_lifecycle() {
        let nkv = Arc::new(MemoryNkv::new());
        let vec = ramvec().with_sidecar(nkv.clone());
        let user = AccessCandidate::user("u");
        let req = user.write_request();
        vec.create_namespace(&req, "ns", None).await.unwrap();
        vec.create_datasource(
            &req,
            "ns",
            DatasourceInput {
                id: Some("ds1".into()),
                label: Some("My Docs".into()),
                text: "ABCDEFGHIJKLMNOP".into(),
                chunk_size: 8,
                chunk_overlap: 0,
                metadata: None,
            },
        )
        .await
        .unwrap();

        // Missing ids answer None, not an error.
        assert!(vec.get_datasource(&req, "ns", "nope").await.unwrap().is_none());
        let ds = vec.get_datasource(&req, "ns", "ds1").await.unwrap().unwrap();
        assert_eq!(ds.label, "My Docs");
        assert_eq!(ds.vector_ids.len(), 2);

        // The descriptor is mirrored into the NKV sidecar.
        let mirrored = nkv
            .get(&req, "vec_ds_u_u_ns", "ds1")
            .await
            .unwrap()
            .unwrap();
        assert!(mirrored.contains("My Docs"));

        vec.delete_datasource(&req, "ns", "ds1").await.unwrap();
        assert!(vec.get_datasource(&req, "ns", "ds1").await.unwrap().is_none());
        let results = vec
            .search(&user.read_request(), "ns", "ABCDE".into(), SearchOptions::top_k(10))
            .await
            .unwrap();
        assert!(results.is_empty());
        assert!(matches!(
            vec.delete_datasource(&req, "ns", "ds1").await,
            Err(Error::DatasourceNotFound(_))
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_list_datasources_missing_namespace() {
        let vec = ramvec();
        let req = AccessCandidate::user("u").read_request();
        assert!(vec.list_datasources(&req, "ghost").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_delete_namespace_cascades() {
        let vec = ramvec();
        let user = AccessCandidate::user("u");
        let req = user.owner_request();
        vec.create_namespace(&req, "ns", None).await.unwrap();
        vec.create_datasource(
            &req,
            "ns",
            DatasourceInput {
                id: Some("ds".into()),
                label: None,
                text: "data".into(),
                chunk_size: 10,
                chunk_overlap: 0,
                metadata: None,
            },
        )
        .await
        .unwrap();

        vec.delete_namespace(&req, "ns").await.unwrap();
        assert!(!vec.namespace_exists(&req, "ns").await.unwrap());
        assert!(vec.list_datasources(&req, "ns").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_dimension_mismatch() {
        let vec = ramvec();
        let req = AccessCandidate::user("u").write_request();
        vec.create_namespace(&req, "ns", None).await.unwrap();
        let err = vec
            .insert(
                &req,
                "ns",
                vec![SourceInput {
                    id: None,
                    source: VectorSource::Vector(vec![0.0; 3]),
                    metadata: None,
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
