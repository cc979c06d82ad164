use axum::body::Body;
use http::header::ALLOW;
use http::HeaderValue;
use http::Method;
use http::StatusCode;
use mediatype::MediaType;

use super::Extracted;
use super::OperationKinds;
use super::Transport;
use crate::error::TransportError;
use crate::Context;

/// Answers `OPTIONS` requests with the methods the server accepts.
///
/// Never reaches the executor.
#[derive(Clone, Debug)]
pub struct Options {
    allow: HeaderValue,
}

impl Options {
    /// `methods` are advertised in the `Allow` header, after `OPTIONS` itself.
    pub fn new<'a>(methods: impl IntoIterator<Item = &'a str>) -> Self {
        let mut allow = vec!["OPTIONS"];
        for method in methods {
            if !allow.contains(&method) {
                allow.push(method);
            }
        }
        Self {
            allow: HeaderValue::from_str(&allow.join(", "))
                .unwrap_or_else(|_| HeaderValue::from_static("OPTIONS")),
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new(["GET", "POST"])
    }
}

#[async_trait::async_trait]
impl Transport for Options {
    fn name(&self) -> &'static str {
        "OPTIONS"
    }

    fn matches(&self, method: &Method, _content_type: Option<&MediaType<'_>>) -> bool {
        method == Method::OPTIONS
    }

    fn allowed_kinds(&self) -> OperationKinds {
        OperationKinds::empty()
    }

    async fn extract(
        &self,
        _request: http::Request<Body>,
        _context: &Context,
    ) -> Result<Extracted, TransportError> {
        Ok(Extracted::Reply(
            http::Response::builder()
                .status(StatusCode::OK)
                .header(ALLOW, self.allow.clone())
                .body(Body::empty())?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_with_allow() {
        let request = http::Request::options("/graphql")
            .body(Body::empty())
            .unwrap();
        let Extracted::Reply(response) = Options::new(["GET", "POST", "POST"])
            .extract(request, &Context::new())
            .await
            .unwrap()
        else {
            panic!("expected a reply");
        };
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ALLOW], "OPTIONS, GET, POST");
    }
}
