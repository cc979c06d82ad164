//! A cache for parsed and validated query documents.
use std::sync::Arc;

use apollo_compiler::validation::Valid;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Schema;
use tracing::Instrument;

use crate::cache::Cache;
use crate::cache::InMemoryCache;
use crate::error::Error;
use crate::error::PipelineError;

/// A parsed and validated query document, shared between requests.
pub type Document = Arc<Valid<ExecutableDocument>>;

/// Resolves query text to a [`Document`], reusing previously validated documents.
///
/// Only documents that parsed and validated successfully are stored.
#[derive(Clone)]
pub(crate) struct QueryCache {
    storage: Arc<dyn Cache<Document>>,
    schema: Arc<Valid<Schema>>,
}

impl QueryCache {
    pub(crate) fn new(schema: Arc<Valid<Schema>>) -> Self {
        Self::with_storage(schema, Arc::new(InMemoryCache::new()))
    }

    pub(crate) fn with_storage(
        schema: Arc<Valid<Schema>>,
        storage: Arc<dyn Cache<Document>>,
    ) -> Self {
        Self { storage, schema }
    }

    /// Attempt to get a [`Document`] for `query`, parsing it on a miss.
    pub(crate) async fn get(&self, query: &str) -> Result<Document, PipelineError> {
        if let Some(document) = self.storage.get(query) {
            tracing::debug!(cache.hit = true, "query document cache hit");
            return Ok(document);
        }
        tracing::debug!(cache.hit = false, "query document cache miss");

        let schema = self.schema.clone();
        let source = query.to_string();
        let parsed = tokio::task::spawn_blocking(move || parse_and_validate(&schema, source))
            .instrument(tracing::info_span!("parse_query"))
            .await;
        let document = match parsed {
            Ok(result) => Arc::new(result?),
            Err(err) => {
                failfast_error!("parsing query task failed: {}", err);
                return Err(PipelineError::DocumentSyntaxError(vec![Error::builder()
                    .message(format!("parsing query task failed: {err}"))
                    .build()]));
            }
        };

        self.storage.add(query.to_string(), document.clone());
        Ok(document)
    }
}

fn parse_and_validate(
    schema: &Valid<Schema>,
    source: String,
) -> Result<Valid<ExecutableDocument>, PipelineError> {
    let document = ExecutableDocument::parse(schema, source, "query.graphql")
        .map_err(|with_errors| PipelineError::syntax(with_errors.errors))?;
    document
        .validate(schema)
        .map_err(|with_errors| PipelineError::validation(with_errors.errors))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = "type Query { name: String, me: User } type User { id: ID! }";

    fn schema() -> Arc<Valid<Schema>> {
        Arc::new(Schema::parse_and_validate(SCHEMA, "schema.graphql").unwrap())
    }

    #[tokio::test]
    async fn hit_after_a_successful_parse() {
        let storage: Arc<InMemoryCache<Document>> = Arc::new(InMemoryCache::new());
        let cache = QueryCache::with_storage(schema(), storage.clone());

        let first = cache.get("query Named { name }").await.unwrap();
        assert_eq!(storage.len(), 1);
        let second = cache.get("query Named { name }").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.operations.get(Some("Named")).is_ok());
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let storage: Arc<InMemoryCache<Document>> = Arc::new(InMemoryCache::new());
        let cache = QueryCache::with_storage(schema(), storage.clone());

        let syntax = cache.get("{ name").await.unwrap_err();
        assert!(matches!(syntax, PipelineError::DocumentSyntaxError(_)));
        let invalid = cache
            .get("query Q($unused: Int) { name }")
            .await
            .unwrap_err();
        assert!(matches!(invalid, PipelineError::DocumentValidationError(_)));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn add_overwrites_the_cached_document() {
        let storage: Arc<InMemoryCache<Document>> = Arc::new(InMemoryCache::new());
        let cache = QueryCache::with_storage(schema(), storage.clone());
        let other = cache.get("query Other { name }").await.unwrap();

        cache.get("query First { name }").await.unwrap();
        storage.add("query First { name }".to_string(), other);

        let document = cache.get("query First { name }").await.unwrap();
        assert!(document.operations.get(Some("Other")).is_ok());
    }
}
