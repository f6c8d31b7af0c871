//! Vector store client (Chroma HTTP API, v1).
//!
//! [`ChromaClient`] talks to the store as a whole; binding a collection with
//! [`ChromaClient::get_or_create_collection`] yields a [`ChromaCollectionClient`] scoped to that
//! one collection, which is what the pipeline queries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::generation::EmbeddingVector;
use super::{check_status, ClientError, ClientResult};

const SERVICE: &str = "vector store";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectionHandle {
    pub id: String,
    pub name: String,
}

/// One retrieved document, in the store's relevance order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryHit {
    pub document: String,
    pub metadata: Option<Map<String, Value>>,
}

/// A client bound to one collection.
#[async_trait]
pub trait CollectionClient: Send + Sync {
    fn collection(&self) -> &CollectionHandle;

    /// Nearest documents for each embedding, flattened in query order.
    async fn query(
        &self,
        embeddings: &[EmbeddingVector],
        top_n: usize,
        filter: Option<Value>,
    ) -> ClientResult<Vec<QueryHit>>;
}

#[derive(Clone)]
pub struct ChromaClient {
    http: reqwest::Client,
    base_url: String,
}

impl ChromaClient {
    /// `base_url` is the service root, e.g. `http://localhost:8000`.
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: format!("{}/api/v1", base_url.trim_end_matches('/')),
        }
    }

    pub async fn get_or_create_collection(&self, name: &str) -> ClientResult<ChromaCollectionClient> {
        let response = self
            .http
            .post(format!("{}/collections", self.base_url))
            .json(&serde_json::json!({ "name": name, "get_or_create": true }))
            .send()
            .await?;
        let response = check_status(SERVICE, response).await?;
        let handle: CollectionHandle = response
            .json()
            .await
            .map_err(|err| ClientError::Decode(err.to_string()))?;

        Ok(ChromaCollectionClient {
            client: self.clone(),
            handle,
        })
    }
}

pub struct ChromaCollectionClient {
    client: ChromaClient,
    handle: CollectionHandle,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query_embeddings: &'a [EmbeddingVector],
    n_results: usize,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    filter: Option<Value>,
    include: [&'static str; 2],
}

/// Chroma answers with one inner list per query embedding.
#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    documents: Vec<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Map<String, Value>>>>>,
}

impl QueryResponse {
    fn into_hits(self) -> Vec<QueryHit> {
        let metadatas = self.metadatas.unwrap_or_default();
        let mut hits = Vec::new();
        for (query_index, documents) in self.documents.into_iter().enumerate() {
            for (hit_index, document) in documents.into_iter().enumerate() {
                let Some(document) = document else { continue };
                let metadata = metadatas
                    .get(query_index)
                    .and_then(|row| row.get(hit_index))
                    .cloned()
                    .flatten();
                hits.push(QueryHit { document, metadata });
            }
        }
        hits
    }
}

#[async_trait]
impl CollectionClient for ChromaCollectionClient {
    fn collection(&self) -> &CollectionHandle {
        &self.handle
    }

    async fn query(
        &self,
        embeddings: &[EmbeddingVector],
        top_n: usize,
        filter: Option<Value>,
    ) -> ClientResult<Vec<QueryHit>> {
        let request = QueryRequest {
            query_embeddings: embeddings,
            n_results: top_n,
            filter,
            include: ["documents", "metadatas"],
        };
        let response = self
            .client
            .http
            .post(format!("{}/collections/{}/query", self.client.base_url, self.handle.id))
            .json(&request)
            .send()
            .await?;
        let response = check_status(SERVICE, response).await?;
        let body: QueryResponse = response
            .json()
            .await
            .map_err(|err| ClientError::Decode(err.to_string()))?;
        Ok(body.into_hits())
    }
}
