//! Pipeline errors.
use apollo_compiler::validation::DiagnosticList;
use displaydoc::Display;
use http::StatusCode;
use thiserror::Error;
use tower::BoxError;

pub use crate::configuration::ConfigurationError;
pub(crate) use crate::graphql::Error;
use crate::graphql::IntoGraphQLErrors;
use crate::services::transport::OperationKind;
use crate::services::transport::OperationKinds;

/// Fatal errors of a request: each one short-circuits the pipeline to an error-only
/// response before any field is executed.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[ignore_extra_doc_attributes]
#[non_exhaustive]
pub enum PipelineError {
    /// transport not supported
    UnsupportedTransport,

    /// malformed request: {reason}
    MalformedRequest {
        /// Why the transport could not extract a request.
        reason: String,
    },

    /// the query document could not be parsed
    DocumentSyntaxError(Vec<Error>),

    /// the query document failed validation
    DocumentValidationError(Vec<Error>),

    /// {0}
    OperationNotFound(String),

    /// {transport} requests only allow {allowed} operations
    ///
    /// The selected operation is of kind `requested`.
    OperationNotAllowed {
        /// Name of the transport that rejected the operation (usually the HTTP method).
        transport: String,
        /// The operation kinds that transport allows.
        allowed: OperationKinds,
        /// The kind of the selected operation.
        requested: OperationKind,
    },

    /// invalid variables
    VariableCoercionError(Vec<Error>),

    /// PersistedQueryNotFound
    PersistedQueryNotFound,

    /// PersistedQueryNotSupported
    PersistedQueryNotSupported,

    /// provided sha does not match query
    PersistedQueryHashMismatch,

    /// the request was cancelled
    Cancelled,
}

impl PipelineError {
    /// The HTTP status an HTTP-style transport answers this error with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::UnsupportedTransport | PipelineError::MalformedRequest { .. } => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::DocumentSyntaxError(_)
            | PipelineError::DocumentValidationError(_)
            | PipelineError::OperationNotFound(_)
            | PipelineError::VariableCoercionError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::OperationNotAllowed { .. } => StatusCode::NOT_ACCEPTABLE,
            // automatic persisted queries are negotiated in-band
            PipelineError::PersistedQueryNotFound
            | PipelineError::PersistedQueryNotSupported
            | PipelineError::PersistedQueryHashMismatch => StatusCode::OK,
            // never written, the connection is dropped instead
            PipelineError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        }
    }

    /// The `extensions.code` attached to every GraphQL error of this category.
    pub fn extension_code(&self) -> &'static str {
        match self {
            PipelineError::UnsupportedTransport => "TRANSPORT_NOT_SUPPORTED",
            PipelineError::MalformedRequest { .. } => "MALFORMED_REQUEST",
            PipelineError::DocumentSyntaxError(_) => "GRAPHQL_PARSE_FAILED",
            PipelineError::DocumentValidationError(_) => "GRAPHQL_VALIDATION_FAILED",
            PipelineError::OperationNotFound(_) => "OPERATION_NOT_FOUND",
            PipelineError::OperationNotAllowed { .. } => "OPERATION_NOT_ALLOWED",
            PipelineError::VariableCoercionError(_) => "VALIDATION_INVALID_TYPE_VARIABLE",
            PipelineError::PersistedQueryNotFound => "PERSISTED_QUERY_NOT_FOUND",
            PipelineError::PersistedQueryNotSupported => "PERSISTED_QUERY_NOT_SUPPORTED",
            PipelineError::PersistedQueryHashMismatch => "PERSISTED_QUERY_HASH_MISMATCH",
            PipelineError::Cancelled => "REQUEST_CANCELLED",
        }
    }

    pub(crate) fn syntax(errors: DiagnosticList) -> Self {
        PipelineError::DocumentSyntaxError(diagnostics_to_errors(errors))
    }

    pub(crate) fn validation(errors: DiagnosticList) -> Self {
        PipelineError::DocumentValidationError(diagnostics_to_errors(errors))
    }
}

fn diagnostics_to_errors(errors: DiagnosticList) -> Vec<Error> {
    errors
        .iter()
        .map(|diagnostic| Error::from(diagnostic.to_json()))
        .collect()
}

impl IntoGraphQLErrors for PipelineError {
    fn into_graphql_errors(self) -> Vec<Error> {
        let code = self.extension_code();
        match self {
            PipelineError::DocumentSyntaxError(errors)
            | PipelineError::DocumentValidationError(errors)
            | PipelineError::VariableCoercionError(errors) => errors
                .into_iter()
                .map(|mut error| {
                    error.extensions.entry("code").or_insert(code.into());
                    error
                })
                .collect(),
            err => vec![Error::builder()
                .message(err.to_string())
                .extension_code(code)
                .build()],
        }
    }
}

/// Errors raised by a transport while reading a request or writing a response.
#[derive(Error, Display, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// malformed request: {0}
    Malformed(String),

    /// invalid variables: {0}
    InvalidVariables(String),

    /// request body exceeds the {0} bytes limit
    PayloadTooLarge(usize),

    /// could not read the request body: {0}
    Body(BoxError),

    /// could not serialize the response: {0}
    Serialization(#[from] serde_json::Error),

    /// could not build the http response: {0}
    Http(#[from] http::Error),
}

impl From<TransportError> for PipelineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidVariables(reason) => {
                PipelineError::VariableCoercionError(vec![Error::builder().message(reason).build()])
            }
            TransportError::Malformed(reason) => PipelineError::MalformedRequest { reason },
            err => PipelineError::MalformedRequest {
                reason: err.to_string(),
            },
        }
    }
}

/// Errors raised while building an [`ExecutableSchema`](crate::ExecutableSchema).
#[derive(Error, Display, Debug)]
#[non_exhaustive]
pub enum SchemaError {
    /// schema is invalid: {0}
    Invalid(String),

    /// type {type_name} has no field {field_name}
    UnknownField {
        /// The type the resolver was registered on.
        type_name: String,
        /// The missing field.
        field_name: String,
    },
}
