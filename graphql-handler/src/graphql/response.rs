use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;

use crate::graphql::Error;
use crate::json_ext::Object;
use crate::json_ext::Value;

/// A graphql primary response.
///
/// `errors` is written before `data`, and `data` is always written (as `null` when no
/// execution took place).
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Response {
    /// The errors, in the order they were produced.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<Error>,

    /// The response data.
    #[serde(default)]
    pub data: Option<Value>,

    /// The optional graphql extensions.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl Response {
    /// Constructor
    #[builder(visibility = "pub")]
    fn new(
        data: Option<Value>,
        errors: Vec<Error>,
        // Skip the `Object` type alias in order to use buildstructor’s map special-casing
        extensions: Map<ByteString, Value>,
    ) -> Self {
        Self {
            errors,
            data,
            extensions,
        }
    }

    /// An error-only response: no execution took place.
    pub fn from_errors(errors: Vec<Error>) -> Self {
        Self {
            errors,
            data: None,
            extensions: Object::new(),
        }
    }

    /// Serializes the response as the JSON body written by HTTP transports.
    pub fn to_bytes(&self) -> Result<bytes::Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(bytes::Bytes::from)
    }
}
