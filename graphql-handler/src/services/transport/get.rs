use axum::body::Body;
use http::Method;
use mediatype::MediaType;

use super::decode_error;
use super::Extracted;
use super::OperationKind;
use super::OperationKinds;
use super::RawRequest;
use super::Transport;
use crate::error::TransportError;
use crate::graphql;
use crate::Context;

/// `GET` requests carrying the GraphQL request in the URL query string.
///
/// GET must stay safe to repeat, so only queries are allowed.
#[derive(Clone, Debug)]
pub struct Get {
    allowed_kinds: OperationKinds,
}

impl Default for Get {
    fn default() -> Self {
        Self {
            allowed_kinds: OperationKinds::from([OperationKind::Query]),
        }
    }
}

#[async_trait::async_trait]
impl Transport for Get {
    fn name(&self) -> &'static str {
        "GET"
    }

    fn matches(&self, method: &Method, _content_type: Option<&MediaType<'_>>) -> bool {
        method == Method::GET
    }

    fn allowed_kinds(&self) -> OperationKinds {
        self.allowed_kinds
    }

    async fn extract(
        &self,
        request: http::Request<Body>,
        _context: &Context,
    ) -> Result<Extracted, TransportError> {
        let body = graphql::Request::from_urlencoded_query(request.uri().query().unwrap_or(""))
            .map_err(|err| decode_error("invalid query string", err))?;
        Ok(Extracted::Operation(
            RawRequest::builder()
                .body(body)
                .transport(self.name())
                .allowed_kinds(self.allowed_kinds)
                .build(),
        ))
    }
}
