use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::Method;
use indexmap::IndexMap;
use mediatype::names::BOUNDARY;
use mediatype::names::FORM_DATA;
use mediatype::names::MULTIPART;
use mediatype::MediaType;
use mediatype::ReadParams;

use super::decode_error;
use super::Extracted;
use super::OperationKind;
use super::OperationKinds;
use super::RawRequest;
use super::Transport;
use crate::error::TransportError;
use crate::graphql;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;
use crate::Context;

pub(crate) const DEFAULT_MAX_UPLOAD_SIZE: usize = 32 * 1024 * 1024;

/// One file of a multipart request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upload {
    /// Name of the multipart field holding the file, as referenced by the `map` field.
    pub key: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl Upload {
    /// The value substituted into variables in place of the file.
    fn descriptor(&self) -> Value {
        let mut descriptor = Object::new();
        descriptor.insert("key", Value::from(self.key.clone()));
        descriptor.insert(
            "filename",
            self.filename.clone().map(Value::from).unwrap_or_default(),
        );
        descriptor.insert(
            "contentType",
            self.content_type.clone().map(Value::from).unwrap_or_default(),
        );
        descriptor.insert("size", Value::Number(self.bytes.len().into()));
        Value::Object(descriptor)
    }
}

/// The files of a multipart request, stored in the request [`Context`].
///
/// Resolvers receive upload descriptors as argument values and look the bytes up here.
#[derive(Clone, Debug, Default)]
pub struct Uploads(Arc<IndexMap<String, Upload>>);

impl Uploads {
    pub fn get(&self, key: &str) -> Option<&Upload> {
        self.0.get(key)
    }

    /// Finds the upload an argument value (an upload descriptor) refers to.
    pub fn resolve(&self, descriptor: &Value) -> Option<&Upload> {
        descriptor
            .as_object()
            .and_then(|descriptor| descriptor.get("key"))
            .and_then(|key| key.as_str())
            .and_then(|key| self.get(key))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// `multipart/form-data` requests following the GraphQL multipart request convention:
/// an `operations` field, a `map` field, then one field per file.
#[derive(Clone, Debug)]
pub struct MultipartForm {
    allowed_kinds: OperationKinds,
    max_upload_size: usize,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self {
            allowed_kinds: OperationKinds::from([OperationKind::Query, OperationKind::Mutation]),
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }
}

impl MultipartForm {
    /// Rejects requests whose whole multipart stream exceeds `max_upload_size` bytes.
    pub fn with_max_upload_size(mut self, max_upload_size: usize) -> Self {
        self.max_upload_size = max_upload_size;
        self
    }

    fn map_error(&self, err: multer::Error) -> TransportError {
        match err {
            multer::Error::StreamSizeExceeded { .. } => {
                TransportError::PayloadTooLarge(self.max_upload_size)
            }
            err => TransportError::Malformed(format!("invalid multipart request: {err}")),
        }
    }
}

fn is_multipart(content_type: Option<&MediaType<'_>>) -> bool {
    content_type.is_some_and(|mime| mime.ty == MULTIPART && mime.subty == FORM_DATA)
}

#[async_trait::async_trait]
impl Transport for MultipartForm {
    fn name(&self) -> &'static str {
        "POST"
    }

    fn matches(&self, method: &Method, content_type: Option<&MediaType<'_>>) -> bool {
        method == Method::POST && is_multipart(content_type)
    }

    fn allowed_kinds(&self) -> OperationKinds {
        self.allowed_kinds
    }

    async fn extract(
        &self,
        request: http::Request<Body>,
        context: &Context,
    ) -> Result<Extracted, TransportError> {
        let boundary = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|header| header.to_str().ok())
            .and_then(|str| MediaType::parse(str).ok())
            .and_then(|mime| mime.get_param(BOUNDARY).map(|b| b.to_string()))
            .ok_or_else(|| self.map_error(multer::Error::NoBoundary))?;

        let constraints = multer::Constraints::new()
            .size_limit(multer::SizeLimit::new().whole_stream(self.max_upload_size as u64));
        let mut multipart = multer::Multipart::with_constraints(
            request.into_body().into_data_stream(),
            boundary,
            constraints,
        );

        let mut body: graphql::Request = match multipart
            .next_field()
            .await
            .map_err(|err| self.map_error(err))?
        {
            Some(field) if field.name() == Some("operations") => {
                let bytes = field.bytes().await.map_err(|err| self.map_error(err))?;
                graphql::Request::deserialize_from_bytes(&bytes).map_err(|err| {
                    decode_error("Invalid JSON in the 'operations' multipart field", err)
                })?
            }
            _ => {
                return Err(TransportError::Malformed(
                    "Missing multipart field 'operations', it should be a first field in request body."
                        .to_string(),
                ))
            }
        };

        let map: IndexMap<String, Vec<String>> = match multipart
            .next_field()
            .await
            .map_err(|err| self.map_error(err))?
        {
            Some(field) if field.name() == Some("map") => {
                let bytes = field.bytes().await.map_err(|err| self.map_error(err))?;
                serde_json::from_slice(&bytes).map_err(|err| {
                    TransportError::Malformed(format!(
                        "Invalid JSON in the 'map' multipart field: {err}"
                    ))
                })?
            }
            _ => {
                return Err(TransportError::Malformed(
                    "Missing multipart field 'map', it should be a second field in request body."
                        .to_string(),
                ))
            }
        };

        let mut files = IndexMap::new();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| self.map_error(err))?
        {
            let Some(key) = field.name().map(str::to_owned) else {
                continue;
            };
            let filename = field.file_name().map(str::to_owned);
            let content_type = field.content_type().map(|mime| mime.to_string());
            let bytes = field.bytes().await.map_err(|err| self.map_error(err))?;
            files.insert(
                key.clone(),
                Upload {
                    key,
                    filename,
                    content_type,
                    bytes,
                },
            );
        }

        let mut variables = Value::Object(std::mem::take(&mut body.variables));
        for (key, paths) in map.iter() {
            let upload = files.get(key).ok_or_else(|| {
                TransportError::Malformed(format!("Missing files in the request: {key}."))
            })?;
            for path in paths {
                let mut segments = path.split('.');
                if segments.next() != Some("variables") {
                    return Err(TransportError::Malformed(format!(
                        "Invalid path '{path}' found inside 'map' field, it should start with 'variables.'."
                    )));
                }
                let variable_path = Path::from(segments.collect::<Vec<_>>().join("/"));
                if variable_path.is_empty() {
                    return Err(TransportError::Malformed(format!(
                        "Invalid path '{path}' found inside 'map' field, missing name of variable."
                    )));
                }
                let slot = variables.get_path_mut(&variable_path).ok_or_else(|| {
                    TransportError::Malformed(format!(
                        "Invalid path '{path}' found inside 'map' field, it does not point to a valid value inside 'operations' field."
                    ))
                })?;
                *slot = upload.descriptor();
            }
        }
        if let Value::Object(variables) = variables {
            body.variables = variables;
        }

        tracing::debug!(files = files.len(), "multipart request extracted");
        context.insert(Uploads(Arc::new(files)));

        Ok(Extracted::Operation(
            RawRequest::builder()
                .body(body)
                .transport(self.name())
                .allowed_kinds(self.allowed_kinds)
                .build(),
        ))
    }
}
