use bytes::Bytes;
use displaydoc::Display;
use serde::de::Error as _;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;
use thiserror::Error;

use crate::json_ext::Object;

/// Why a [`Request`] could not be decoded.
#[derive(Error, Display, Debug)]
pub enum DecodeError {
    /// {0}
    Malformed(#[from] serde_json::Error),

    /// {0}
    InvalidVariables(String),
}

/// A GraphQL `Request` as submitted by a client, before it is resolved to a document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Request {
    /// The GraphQL operation (e.g., query, mutation) string.
    ///
    /// For historical purposes, the term "query" is commonly used to refer to
    /// *any* GraphQL operation which might be, e.g., a `mutation`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub query: Option<String>,

    /// The (optional) GraphQL operation name.
    ///
    /// When specified, this name must match the name of an operation in the
    /// GraphQL document.  When excluded, there must exist only a single
    /// operation in the GraphQL document.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation_name: Option<String>,

    /// The (optional) GraphQL variables in the form of a JSON object.
    #[serde(
        skip_serializing_if = "Object::is_empty",
        default,
        deserialize_with = "deserialize_null_default"
    )]
    pub variables: Object,

    /// The (optional) GraphQL `extensions` of a GraphQL request.
    ///
    /// Automatic persisted queries are negotiated through the `persistedQuery`
    /// key of this object.
    #[serde(
        skip_serializing_if = "Object::is_empty",
        default,
        deserialize_with = "deserialize_null_default"
    )]
    pub extensions: Object,
}

// NOTE: this deserialize helper is used to transform `null` to Default::default()
fn deserialize_null_default<'de, D, T: Default + Deserialize<'de>>(
    deserializer: D,
) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
{
    <Option<T>>::deserialize(deserializer).map(|x| x.unwrap_or_default())
}

/// The request body as sent, before `variables` is checked to be an object.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    operation_name: Option<String>,
    #[serde(default)]
    variables: Value,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    extensions: Object,
}

fn variables_object(variables: Value) -> Result<Object, DecodeError> {
    match variables {
        Value::Null => Ok(Object::new()),
        Value::Object(variables) => Ok(variables),
        other => {
            let kind = match other {
                Value::Bool(_) => "a boolean",
                Value::Number(_) => "a number",
                Value::String(_) => "a string",
                _ => "an array",
            };
            Err(DecodeError::InvalidVariables(format!(
                "variables must be a JSON object, got {kind}"
            )))
        }
    }
}

#[buildstructor::buildstructor]
impl Request {
    #[builder(visibility = "pub")]
    fn new(
        query: Option<String>,
        operation_name: Option<String>,
        // Skip the `Object` type alias in order to use buildstructor’s map special-casing
        variables: JsonMap<ByteString, Value>,
        extensions: JsonMap<ByteString, Value>,
    ) -> Self {
        Self {
            query,
            operation_name,
            variables,
            extensions,
        }
    }

    /// Deserialize a JSON request body.
    ///
    /// A body that decodes but whose `variables` is not an object fails with
    /// [`DecodeError::InvalidVariables`].
    pub fn deserialize_from_bytes(data: &Bytes) -> Result<Request, DecodeError> {
        let wire: WireRequest = serde_json::from_slice(data)?;
        Ok(Self {
            query: wire.query,
            operation_name: wire.operation_name,
            variables: variables_object(wire.variables)?,
            extensions: wire.extensions,
        })
    }

    /// Convert encoded URL query string parameters (also known as "search
    /// params") into a GraphQL [`Request`].
    ///
    /// `variables` and `extensions` are themselves JSON encoded strings.
    pub fn from_urlencoded_query(url_encoded_query: &str) -> Result<Request, DecodeError> {
        let urldecoded: serde_json::Value =
            serde_urlencoded::from_bytes(url_encoded_query.as_bytes())
                .map_err(serde_json::Error::custom)?;

        let operation_name = match urldecoded.get("operationName") {
            Some(serde_json::Value::String(operation_name)) if !operation_name.is_empty() => {
                Some(operation_name.clone())
            }
            _ => None,
        };
        let query = match urldecoded.get("query") {
            Some(serde_json::Value::String(query)) => Some(query.clone()),
            _ => None,
        };
        let variables: Value = get_from_urldecoded(&urldecoded, "variables")
            .map_err(|err| {
                DecodeError::InvalidVariables(format!("variables are not valid JSON: {err}"))
            })?
            .unwrap_or_default();
        let extensions: Object =
            get_from_urldecoded(&urldecoded, "extensions")?.unwrap_or_default();

        Ok(Self::builder()
            .and_query(query)
            .and_operation_name(operation_name)
            .variables(variables_object(variables)?)
            .extensions(extensions)
            .build())
    }
}

fn get_from_urldecoded<'a, T: Deserialize<'a>>(
    object: &'a serde_json::Value,
    key: &str,
) -> Result<Option<T>, serde_json::Error> {
    match object.get(key) {
        Some(serde_json::Value::String(encoded)) if !encoded.is_empty() => {
            Some(serde_json::from_str(encoded.as_str())).transpose()
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn test_request() {
        let data = serde_json::json!(
        {
          "query": "query aTest($arg1: String!) { test(who: $arg1) }",
          "operationName": "aTest",
          "variables": { "arg1": "me" },
          "extensions": {"extension": 1}
        })
        .to_string();
        let result = Request::deserialize_from_bytes(&Bytes::from(data)).unwrap();
        assert_eq!(
            result,
            Request::builder()
                .query("query aTest($arg1: String!) { test(who: $arg1) }")
                .operation_name("aTest")
                .variables(json!({ "arg1": "me" }).as_object().unwrap().clone())
                .extensions(json!({"extension": 1}).as_object().unwrap().clone())
                .build()
        );
    }

    #[test]
    fn test_no_variables() {
        let result = Request::deserialize_from_bytes(&Bytes::from_static(
            br#"{"query":"{ name }","variables":null}"#,
        ))
        .unwrap();
        assert_eq!(result.query.as_deref(), Some("{ name }"));
        assert!(result.variables.is_empty());
        assert!(result.extensions.is_empty());
    }

    #[test]
    fn from_urlencoded_query_decodes_json_parameters() {
        let result = Request::from_urlencoded_query(
            "query=query%20Q(%24id%3A%20ID!)%20%7B%20user(id%3A%20%24id)%20%7D&operationName=Q&variables=%7B%22id%22%3A%221%22%7D",
        )
        .unwrap();
        assert_eq!(
            result.query.as_deref(),
            Some("query Q($id: ID!) { user(id: $id) }")
        );
        assert_eq!(result.operation_name.as_deref(), Some("Q"));
        assert_eq!(result.variables.get("id"), Some(&json!("1")));
    }

    #[test]
    fn from_urlencoded_query_rejects_invalid_variables() {
        assert!(matches!(
            Request::from_urlencoded_query("query=%7Bname%7D&variables=%7Bnope"),
            Err(DecodeError::InvalidVariables(_))
        ));
        assert!(matches!(
            Request::from_urlencoded_query("query=%7Bname%7D&variables=%5B1%5D"),
            Err(DecodeError::InvalidVariables(_))
        ));
    }

    #[test]
    fn variables_must_be_an_object() {
        let err = Request::deserialize_from_bytes(&Bytes::from_static(
            br#"{"query":"{ name }","variables":"nope"}"#,
        ))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "variables must be a JSON object, got a string"
        );
        assert!(matches!(
            Request::deserialize_from_bytes(&Bytes::from_static(b"{")),
            Err(DecodeError::Malformed(_))
        ));
    }
}
