/// Retrieval-augmented pipeline over pluggable collaborators
///
/// embed the request text, search the vector store, then generate a reply
/// from the request and the matched documents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Pipeline, PipelineRequest, PipelineResponse};
use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub document: Value,
    pub score: f32,
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<ScoredDocument>, PipelineError>;
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &PipelineRequest,
        matches: &[ScoredDocument],
    ) -> Result<String, PipelineError>;
}

pub struct RetrievalPipeline<E, V, G> {
    embedder: E,
    store: V,
    generator: G,
    top_k: usize,
}

impl<E, V, G> RetrievalPipeline<E, V, G>
where
    E: EmbeddingService,
    V: VectorStore,
    G: ResponseGenerator,
{
    pub const DEFAULT_TOP_K: usize = 5;

    pub fn new(embedder: E, store: V, generator: G) -> Self {
        Self {
            embedder,
            store,
            generator,
            top_k: Self::DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }
}

#[async_trait]
impl<E, V, G> Pipeline for RetrievalPipeline<E, V, G>
where
    E: EmbeddingService,
    V: VectorStore,
    G: ResponseGenerator,
{
    async fn respond(&self, request: &PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        let vector = self.embedder.embed(&request.text).await?;

        let mut matches = self.store.search(&vector, self.top_k).await?;
        matches.truncate(self.top_k);
        tracing::debug!(
            "Request {} matched {} documents",
            request.request_id,
            matches.len()
        );

        let text = self.generator.generate(request, &matches).await?;
        Ok(PipelineResponse::text(text))
    }
}
