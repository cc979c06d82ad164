use axum::body::Body;
use http::Method;
use mediatype::MediaType;

use super::decode_error;
use super::is_json;
use super::read_body;
use super::Extracted;
use super::OperationKind;
use super::OperationKinds;
use super::RawRequest;
use super::Transport;
use super::DEFAULT_MAX_BODY_SIZE;
use crate::error::TransportError;
use crate::graphql;
use crate::Context;

/// `POST` requests with a JSON body.
#[derive(Clone, Debug)]
pub struct Post {
    allowed_kinds: OperationKinds,
    max_body_size: usize,
}

impl Default for Post {
    fn default() -> Self {
        Self {
            allowed_kinds: OperationKinds::from([OperationKind::Query, OperationKind::Mutation]),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl Post {
    /// Rejects bodies larger than `max_body_size` bytes.
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }
}

#[async_trait::async_trait]
impl Transport for Post {
    fn name(&self) -> &'static str {
        "POST"
    }

    fn matches(&self, method: &Method, content_type: Option<&MediaType<'_>>) -> bool {
        method == Method::POST && is_json(content_type)
    }

    fn allowed_kinds(&self) -> OperationKinds {
        self.allowed_kinds
    }

    async fn extract(
        &self,
        request: http::Request<Body>,
        _context: &Context,
    ) -> Result<Extracted, TransportError> {
        let bytes = read_body(request.into_body(), self.max_body_size).await?;
        let body = graphql::Request::deserialize_from_bytes(&bytes)
            .map_err(|err| decode_error("invalid json body", err))?;
        Ok(Extracted::Operation(
            RawRequest::builder()
                .body(body)
                .transport(self.name())
                .allowed_kinds(self.allowed_kinds)
                .build(),
        ))
    }
}
