//! Transports: protocol adapters that extract a GraphQL request from an HTTP request
//! and write a GraphQL response back in their own wire format.

use std::fmt;
use std::sync::Arc;

use apollo_compiler::ast::OperationType;
use axum::body::Body;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::HeaderValue;
use http::Method;
use http::StatusCode;
use http_body_util::BodyExt;
use http_body_util::LengthLimitError;
use http_body_util::Limited;
use mediatype::MediaType;
use serde::Deserialize;
use serde::Serialize;

use crate::error::PipelineError;
use crate::error::TransportError;
use crate::graphql;
use crate::Context;

mod get;
mod multipart;
mod options;
mod post;

pub use self::get::Get;
pub use self::multipart::MultipartForm;
pub use self::multipart::Upload;
pub use self::multipart::Uploads;
pub use self::options::Options;
pub use self::post::Post;
pub(crate) use self::multipart::DEFAULT_MAX_UPLOAD_SIZE;

pub(crate) const DEFAULT_MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

/// The kind of a GraphQL operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }

    const fn bit(&self) -> u8 {
        match self {
            OperationKind::Query => 0b001,
            OperationKind::Mutation => 0b010,
            OperationKind::Subscription => 0b100,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<OperationType> for OperationKind {
    fn from(operation_type: OperationType) -> Self {
        match operation_type {
            OperationType::Query => OperationKind::Query,
            OperationType::Mutation => OperationKind::Mutation,
            OperationType::Subscription => OperationKind::Subscription,
        }
    }
}

/// The set of operation kinds a transport allows.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OperationKinds(u8);

impl OperationKinds {
    pub const fn empty() -> Self {
        OperationKinds(0)
    }

    pub const fn with(self, kind: OperationKind) -> Self {
        OperationKinds(self.0 | kind.bit())
    }

    pub const fn contains(&self, kind: OperationKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = OperationKind> + '_ {
        [
            OperationKind::Query,
            OperationKind::Mutation,
            OperationKind::Subscription,
        ]
        .into_iter()
        .filter(|kind| self.contains(*kind))
    }
}

impl<const N: usize> From<[OperationKind; N]> for OperationKinds {
    fn from(kinds: [OperationKind; N]) -> Self {
        kinds
            .into_iter()
            .fold(OperationKinds::empty(), OperationKinds::with)
    }
}

impl fmt::Display for OperationKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, kind) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(kind.as_str())?;
        }
        Ok(())
    }
}

impl fmt::Debug for OperationKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A transport-agnostic request, tagged with the policy of the transport it came from.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RawRequest {
    /// The GraphQL request as sent by the client.
    pub body: graphql::Request,

    /// Name of the originating transport.
    pub transport: &'static str,

    /// Operation kinds the originating transport allows.
    pub allowed_kinds: OperationKinds,
}

#[buildstructor::buildstructor]
impl RawRequest {
    #[builder(visibility = "pub")]
    fn new(
        body: graphql::Request,
        transport: &'static str,
        allowed_kinds: OperationKinds,
    ) -> Self {
        Self {
            body,
            transport,
            allowed_kinds,
        }
    }
}

/// The outcome of [`Transport::extract`].
#[derive(Debug)]
pub enum Extracted {
    /// A GraphQL request to run through the pipeline.
    Operation(RawRequest),
    /// The transport answered the request itself.
    Reply(http::Response<Body>),
}

/// A protocol adapter.
///
/// The server tries its transports in registration order and uses the first one whose
/// [`Transport::matches`] returns true.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Name used in logs and error messages, usually the HTTP method.
    fn name(&self) -> &'static str;

    /// Whether this transport handles a request with this method and content type.
    fn matches(&self, method: &Method, content_type: Option<&MediaType<'_>>) -> bool;

    /// Operation kinds requests coming through this transport may run.
    fn allowed_kinds(&self) -> OperationKinds;

    /// Reads a [`RawRequest`] out of the HTTP request.
    async fn extract(
        &self,
        request: http::Request<Body>,
        context: &Context,
    ) -> Result<Extracted, TransportError>;

    /// Serializes `response` in this transport's wire format.
    fn write(
        &self,
        response: &graphql::Response,
        status: StatusCode,
    ) -> Result<http::Response<Body>, TransportError> {
        write_json(response, status)
    }
}

/// Writes a response as an `application/json` body.
pub fn write_json(
    response: &graphql::Response,
    status: StatusCode,
) -> Result<http::Response<Body>, TransportError> {
    let body = response.to_bytes()?;
    Ok(http::Response::builder()
        .status(status)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(Body::from(body))?)
}

/// Ordered set of transports.
#[derive(Clone, Default)]
pub(crate) struct Transports {
    transports: Vec<Arc<dyn Transport>>,
}

impl Transports {
    pub(crate) fn push(&mut self, transport: Arc<dyn Transport>) {
        self.transports.push(transport);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.transports.iter()
    }

    /// Selects the first transport matching the request.
    pub(crate) fn select<B>(
        &self,
        request: &http::Request<B>,
    ) -> Result<Arc<dyn Transport>, PipelineError> {
        let content_type = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|header| header.to_str().ok())
            .and_then(|str| MediaType::parse(str).ok());
        self.transports
            .iter()
            .find(|transport| transport.matches(request.method(), content_type.as_ref()))
            .cloned()
            .ok_or(PipelineError::UnsupportedTransport)
    }
}

/// Whether `content_type` is `application/json` or `application/graphql-response+json`.
pub(crate) fn is_json(content_type: Option<&MediaType<'_>>) -> bool {
    match content_type {
        Some(mime) => {
            mime.ty.as_str() == "application"
                && (mime.subty.as_str() == "json"
                    || (mime.subty.as_str() == "graphql-response"
                        && mime.suffix.map(|s| s.as_str()) == Some("json")))
        }
        None => false,
    }
}

/// Maps a request decoding failure, prefixing malformed input with `what` could not be
/// decoded.
pub(crate) fn decode_error(what: &str, err: graphql::DecodeError) -> TransportError {
    match err {
        graphql::DecodeError::InvalidVariables(reason) => TransportError::InvalidVariables(reason),
        graphql::DecodeError::Malformed(err) => TransportError::Malformed(format!("{what}: {err}")),
    }
}

/// Collects a request body, failing once it grows past `limit` bytes.
pub(crate) async fn read_body(body: Body, limit: usize) -> Result<Bytes, TransportError> {
    Limited::new(body, limit)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|err| {
            if err.downcast_ref::<LengthLimitError>().is_some() {
                TransportError::PayloadTooLarge(limit)
            } else {
                TransportError::Body(err)
            }
        })
}
