//!  (A)utomatic (P)ersisted (Q)ueries.
//!
//!  For more information on APQ see:
//!  <https://www.apollographql.com/docs/apollo-server/performance/apq/>

use std::num::NonZeroUsize;
use std::sync::Arc;

use serde::Deserialize;
use sha2::Digest;
use sha2::Sha256;

use crate::cache::Cache;
use crate::cache::LruCache;
use crate::error::PipelineError;
use crate::graphql;
use crate::Context;

pub(crate) const DEFAULT_CAPACITY: usize = 100;

/// A persisted query.
#[derive(Deserialize, Clone, Debug)]
struct PersistedQuery {
    #[allow(unused)]
    version: u8,
    #[serde(rename = "sha256Hash")]
    sha256hash: String,
}

/// Recorded in the request [`Context`] when the request negotiated a persisted query:
/// `true` when the query text was read from the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistedQueryHit(pub bool);

/// Stores query texts by their SHA-256 hash.
#[derive(Clone)]
pub(crate) struct PersistedQueries {
    cache: Arc<dyn Cache<String>>,
}

impl PersistedQueries {
    pub(crate) fn new(capacity: NonZeroUsize) -> Self {
        Self::with_cache(Arc::new(LruCache::new(capacity)))
    }

    pub(crate) fn with_cache(cache: Arc<dyn Cache<String>>) -> Self {
        Self { cache }
    }

    /// Stores the query of a request carrying both a query and its hash, or fills in the
    /// query of a request carrying only the hash.
    pub(crate) fn apply(
        &self,
        body: &mut graphql::Request,
        context: &Context,
    ) -> Result<(), PipelineError> {
        let Some((query_hash, query_hash_bytes)) = persisted_query(body) else {
            return Ok(());
        };

        if let Some(query) = body.query.as_deref() {
            if !query_matches_hash(query, &query_hash_bytes) {
                tracing::warn!("apq: graphql request doesn't match provided sha256Hash");
                return Err(PipelineError::PersistedQueryHashMismatch);
            }
            tracing::trace!("apq: cache insert");
            context.insert(PersistedQueryHit(false));
            self.cache.add(format!("apq|{query_hash}"), query.to_string());
            return Ok(());
        }

        match self.cache.get(&format!("apq|{query_hash}")) {
            Some(cached_query) => {
                tracing::trace!("apq: cache hit");
                context.insert(PersistedQueryHit(true));
                body.query = Some(cached_query);
                Ok(())
            }
            None => {
                tracing::trace!("apq: cache miss");
                Err(PipelineError::PersistedQueryNotFound)
            }
        }
    }
}

/// Rejects persisted query negotiation when APQ is disabled.
pub(crate) fn reject(body: &graphql::Request) -> Result<(), PipelineError> {
    if body.extensions.contains_key("persistedQuery") {
        Err(PipelineError::PersistedQueryNotSupported)
    } else {
        Ok(())
    }
}

fn persisted_query(body: &graphql::Request) -> Option<(String, Vec<u8>)> {
    body.extensions
        .get("persistedQuery")
        .and_then(|value| serde_json_bytes::from_value::<PersistedQuery>(value.clone()).ok())
        .and_then(|persisted_query| {
            hex::decode(persisted_query.sha256hash.as_bytes())
                .ok()
                .map(|decoded| (persisted_query.sha256hash, decoded))
        })
}

fn query_matches_hash(query: &str, hash: &[u8]) -> bool {
    let mut digest = Sha256::new();
    digest.update(query.as_bytes());
    hash == digest.finalize().as_slice()
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;
    use crate::cache::InMemoryCache;

    const QUERY: &str = "{ name }";

    fn hash(query: &str) -> String {
        hex::encode(Sha256::digest(query.as_bytes()))
    }

    fn request(query: Option<&str>, hash: &str) -> graphql::Request {
        graphql::Request::builder()
            .and_query(query.map(str::to_string))
            .extension(
                "persistedQuery",
                json!({"version": 1, "sha256Hash": hash}),
            )
            .build()
    }

    #[test]
    fn registers_then_serves_a_query() {
        let store: Arc<InMemoryCache<String>> = Arc::new(InMemoryCache::new());
        let apq = PersistedQueries::with_cache(store.clone());

        let context = Context::new();
        let mut hash_only = request(None, &hash(QUERY));
        assert_eq!(
            apq.apply(&mut hash_only, &context),
            Err(PipelineError::PersistedQueryNotFound)
        );

        let mut register = request(Some(QUERY), &hash(QUERY));
        apq.apply(&mut register, &context).unwrap();
        assert_eq!(context.get::<PersistedQueryHit>(), Some(PersistedQueryHit(false)));
        assert_eq!(store.len(), 1);

        apq.apply(&mut hash_only, &context).unwrap();
        assert_eq!(hash_only.query.as_deref(), Some(QUERY));
        assert_eq!(context.get::<PersistedQueryHit>(), Some(PersistedQueryHit(true)));
    }

    #[test]
    fn mismatching_hash_is_rejected() {
        let apq = PersistedQueries::new(NonZeroUsize::new(10).unwrap());
        let mut body = request(Some(QUERY), &hash("{ other }"));
        assert_eq!(
            apq.apply(&mut body, &Context::new()),
            Err(PipelineError::PersistedQueryHashMismatch)
        );
    }

    #[test]
    fn plain_requests_are_untouched() {
        let apq = PersistedQueries::new(NonZeroUsize::new(10).unwrap());
        let mut body = graphql::Request::builder().query(QUERY).build();
        apq.apply(&mut body, &Context::new()).unwrap();
        assert_eq!(body.query.as_deref(), Some(QUERY));
        assert!(reject(&body).is_ok());
    }

    #[test]
    fn disabled_apq_rejects_negotiation() {
        let body = request(None, &hash(QUERY));
        assert_eq!(reject(&body), Err(PipelineError::PersistedQueryNotSupported));
    }
}
