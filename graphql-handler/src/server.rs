//! The request pipeline and its HTTP server.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use axum::body::Body;
use futures::future::BoxFuture;
use futures::TryFutureExt;
use http::StatusCode;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::service_fn;
use tower::util::BoxCloneService;
use tower::BoxError;
use tower::Service;
use tower::ServiceExt;
use tracing::Instrument;
use tracing::Span;

use crate::apq;
use crate::apq::PersistedQueries;
use crate::cache::Cache;
use crate::cache::LruCache;
use crate::configuration::Configuration;
use crate::error::Error;
use crate::error::PipelineError;
use crate::executor;
use crate::executor::Executor;
use crate::graphql;
use crate::graphql::IntoGraphQLErrors;
use crate::middleware::Middleware;
use crate::query_cache::Document;
use crate::query_cache::QueryCache;
use crate::schema::ExecutableSchema;
use crate::services::field;
use crate::services::operation;
use crate::services::response;
use crate::services::transport::write_json;
use crate::services::transport::Extracted;
use crate::services::transport::Transports;
use crate::services::Get;
use crate::services::MultipartForm;
use crate::services::Options;
use crate::services::Post;
use crate::Context;
use crate::OperationContext;
use crate::PipelineState;
use crate::Transport;

#[derive(Clone)]
struct Inner {
    schema: Arc<ExecutableSchema>,
    transports: Transports,
    query_cache: QueryCache,
    persisted_queries: Option<PersistedQueries>,
    middleware: Middleware,
    request_timeout: Option<Duration>,
}

/// Runs HTTP requests through transport selection, document resolution, authorization
/// and execution.
///
/// Transports, caches and middleware are registered while building the server; a built
/// server is cheap to clone and every clone shares the same registries and caches.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    /// A server without transports, with an unbounded document cache and without
    /// persisted queries.
    pub fn new(schema: ExecutableSchema) -> Self {
        let query_cache = QueryCache::new(schema.schema().clone());
        Self {
            inner: Arc::new(Inner {
                schema: Arc::new(schema),
                transports: Transports::default(),
                query_cache,
                persisted_queries: None,
                middleware: Middleware::default(),
                request_timeout: None,
            }),
        }
    }

    /// A server with the default transports, caches and limits enabled by `configuration`.
    pub fn new_default(schema: ExecutableSchema, configuration: &Configuration) -> Self {
        let mut server = Self::new(schema);
        let mut methods = Vec::new();

        let transports = &configuration.transports;
        if transports.get {
            server = server.add_transport(Get::default());
            methods.push("GET");
        }
        if transports.post {
            server = server.add_transport(
                Post::default().with_max_body_size(configuration.limits.max_body_size),
            );
            methods.push("POST");
        }
        if transports.multipart {
            server = server.add_transport(
                MultipartForm::default()
                    .with_max_upload_size(configuration.multipart.max_upload_size),
            );
            methods.push("POST");
        }
        if transports.options {
            server = server.add_transport(Options::new(methods));
        }

        if let Some(capacity) = configuration.query_cache.bound() {
            server = server.set_query_cache(Arc::new(LruCache::new(capacity)));
        }

        let persisted_queries = &configuration.persisted_queries;
        if persisted_queries.enabled {
            match NonZeroUsize::new(persisted_queries.capacity) {
                Some(capacity) => {
                    server.inner_mut().persisted_queries = Some(PersistedQueries::new(capacity))
                }
                None => tracing::warn!("persisted queries need a capacity, leaving them disabled"),
            }
        }

        if let Some(timeout) = configuration.limits.request_timeout {
            server = server.request_timeout(timeout);
        }
        server
    }

    fn inner_mut(&mut self) -> &mut Inner {
        Arc::make_mut(&mut self.inner)
    }

    /// Registers a transport after the already registered ones.
    pub fn add_transport(mut self, transport: impl Transport) -> Self {
        self.inner_mut().transports.push(Arc::new(transport));
        self
    }

    /// Replaces the query document cache backend.
    pub fn set_query_cache(mut self, cache: Arc<dyn Cache<Document>>) -> Self {
        let inner = self.inner_mut();
        inner.query_cache = QueryCache::with_storage(inner.schema.schema().clone(), cache);
        self
    }

    /// Enables automatic persisted queries, storing query texts in `store`.
    pub fn use_persisted_queries(mut self, store: Arc<dyn Cache<String>>) -> Self {
        self.inner_mut().persisted_queries = Some(PersistedQueries::with_cache(store));
        self
    }

    /// Cancels requests still running after `timeout`.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.inner_mut().request_timeout = Some(timeout);
        self
    }

    /// Registers an interceptor wrapping each operation, after the already registered
    /// ones.
    pub fn around_operations<F, Fut>(mut self, interceptor: F) -> Self
    where
        F: Fn(operation::Request, operation::Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = operation::ServiceResult> + Send + 'static,
    {
        self.inner_mut().middleware.operations.push(interceptor);
        self
    }

    /// Registers an interceptor wrapping the assembly of each response.
    pub fn around_responses<F, Fut>(mut self, interceptor: F) -> Self
    where
        F: Fn(response::Request, response::Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = response::ServiceResult> + Send + 'static,
    {
        self.inner_mut().middleware.responses.push(interceptor);
        self
    }

    /// Registers an interceptor wrapping every field resolution.
    pub fn around_fields<F, Fut>(mut self, interceptor: F) -> Self
    where
        F: Fn(field::Request, field::Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = field::ServiceResult> + Send + 'static,
    {
        self.inner_mut().middleware.fields.push(interceptor);
        self
    }

    pub fn middleware(&self) -> &Middleware {
        &self.inner.middleware
    }

    /// Runs one request through the pipeline.
    ///
    /// Every failure is answered with an error-only GraphQL response, except
    /// [`PipelineError::Cancelled`]: a request running past the configured timeout is
    /// dropped without writing anything.
    pub async fn handle(
        &self,
        request: http::Request<Body>,
    ) -> Result<http::Response<Body>, PipelineError> {
        self.handle_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Like [`Server::handle`], also giving up as soon as `cancellation` is cancelled.
    ///
    /// Dropping the pipeline drops every in-flight resolver with it.
    pub async fn handle_with_cancellation(
        &self,
        request: http::Request<Body>,
        cancellation: CancellationToken,
    ) -> Result<http::Response<Body>, PipelineError> {
        let span = tracing::info_span!(
            "graphql_request",
            method = %request.method(),
            transport = tracing::field::Empty,
            operation_name = tracing::field::Empty,
        );
        let pipeline = self.run(request).instrument(span);
        let cancellable = async {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(PipelineError::Cancelled),
                response = pipeline => Ok(response),
            }
        };
        let result = match self.inner.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, cancellable)
                .await
                .unwrap_or(Err(PipelineError::Cancelled)),
            None => cancellable.await,
        };
        if let Err(err) = &result {
            tracing::debug!(error = %err, "request cancelled");
        }
        result
    }

    async fn run(&self, request: http::Request<Body>) -> http::Response<Body> {
        let context = Context::new();
        let transport = match self.inner.transports.select(&request) {
            Ok(transport) => transport,
            Err(err) => return fail(None, err, &context),
        };
        Span::current().record("transport", transport.name());
        context.transition(PipelineState::TransportMatched);
        context.insert(request.headers().clone());

        match self.process(transport.as_ref(), request, &context).await {
            Ok(response) => {
                context.transition(PipelineState::Sent);
                response
            }
            Err(err) => fail(Some(transport.as_ref()), err, &context),
        }
    }

    async fn process(
        &self,
        transport: &dyn Transport,
        request: http::Request<Body>,
        context: &Context,
    ) -> Result<http::Response<Body>, PipelineError> {
        let mut raw = match transport.extract(request, context).await? {
            Extracted::Operation(raw) => raw,
            Extracted::Reply(reply) => return Ok(reply),
        };

        match &self.inner.persisted_queries {
            Some(persisted_queries) => persisted_queries.apply(&mut raw.body, context)?,
            None => apq::reject(&raw.body)?,
        }
        let query = raw
            .body
            .query
            .clone()
            .ok_or_else(|| PipelineError::MalformedRequest {
                reason: "Must provide query string.".to_string(),
            })?;

        let document = self.inner.query_cache.get(&query).await?;
        context.transition(PipelineState::DocumentResolved);

        let operation = executor::prepare(
            self.inner.schema.schema(),
            query,
            document,
            raw,
            context,
        )?;
        Span::current().record("operation_name", operation.operation_name());

        let (response, status) = match self
            .execute(Arc::new(operation), context.clone())
            .await
        {
            Ok(response) => (response, StatusCode::OK),
            Err(err) => middleware_error(err),
        };
        context.transition(PipelineState::ResponseAssembled);

        Ok(write(Some(transport), &response, status))
    }

    /// Runs the operation chain, whose terminal runs the response chain around the
    /// executor.
    async fn execute(
        &self,
        operation: Arc<OperationContext>,
        context: Context,
    ) -> Result<graphql::Response, BoxError> {
        let inner = self.inner.clone();
        let executor = BoxCloneService::new(service_fn(move |request: response::Request| {
            let inner = inner.clone();
            async move {
                let response = Executor::new(
                    inner.schema.clone(),
                    inner.middleware.fields.clone(),
                    request.operation,
                    request.context.clone(),
                )
                .execute()
                .await;
                Ok::<_, BoxError>(
                    response::Response::builder()
                        .response(response)
                        .context(request.context)
                        .build(),
                )
            }
        }));

        let responses = self.inner.middleware.responses.wrap(executor);
        let terminal = BoxCloneService::new(service_fn(move |request: operation::Request| {
            responses
                .clone()
                .oneshot(response::Request::from(request))
                .map_ok(operation::Response::from)
        }));

        let response = self
            .inner
            .middleware
            .operations
            .wrap(terminal)
            .oneshot(
                operation::Request::builder()
                    .operation(operation)
                    .context(context)
                    .build(),
            )
            .await?;
        Ok(response.response)
    }

    /// Accepts connections until `shutdown` resolves, then lets open connections finish
    /// their in-flight requests.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> std::io::Result<()> {
        let connections = TaskTracker::new();
        let connection_shutdown = CancellationToken::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(self.clone().serve_connection(
                            stream,
                            peer,
                            connection_shutdown.clone(),
                        ));
                    }
                    Err(err) => {
                        // usually out of file descriptors, give connections time to close
                        tracing::warn!(error = %err, "failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        drop(listener);
        connection_shutdown.cancel();
        connections.close();
        connections.wait().await;
        Ok(())
    }

    async fn serve_connection(
        self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %err, "could not set TCP_NODELAY");
        }
        let service = hyper::service::service_fn(move |request: http::Request<Incoming>| {
            let server = self.clone();
            async move { server.handle(request.map(Body::new)).await }
        });
        let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        tokio::pin!(connection);

        let result = tokio::select! {
            result = &mut connection => result,
            _ = shutdown.cancelled() => {
                connection.as_mut().graceful_shutdown();
                connection.await
            }
        };
        if let Err(err) = result {
            tracing::debug!(%peer, error = %err, "connection closed with an error");
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field(
                "transports",
                &self
                    .inner
                    .transports
                    .iter()
                    .map(|transport| transport.name())
                    .collect::<Vec<_>>(),
            )
            .field("middleware", &self.inner.middleware)
            .field("persisted_queries", &self.inner.persisted_queries.is_some())
            .field("request_timeout", &self.inner.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Only fails with [`PipelineError::Cancelled`], in which case nothing must be written.
impl Service<http::Request<Body>> for Server {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let server = self.clone();
        Box::pin(async move { server.handle(request).await.map_err(BoxError::from) })
    }
}

fn fail(
    transport: Option<&dyn Transport>,
    err: PipelineError,
    context: &Context,
) -> http::Response<Body> {
    tracing::debug!(error = %err, state = ?context.state(), "request failed");
    context.transition(PipelineState::Sent);
    let status = err.status_code();
    let response = graphql::Response::from_errors(err.into_graphql_errors());
    write(transport, &response, status)
}

/// An error out of the operation or response chain. A GraphQL error is a deliberate
/// rejection and keeps its message and extensions.
fn middleware_error(err: BoxError) -> (graphql::Response, StatusCode) {
    match err.downcast::<Error>() {
        Ok(error) => (graphql::Response::from_errors(vec![*error]), StatusCode::OK),
        Err(err) => {
            tracing::error!(error = %err, "middleware failed");
            (
                graphql::Response::from_errors(vec![Error::builder()
                    .message(err.to_string())
                    .extension_code("INTERNAL_SERVER_ERROR")
                    .build()]),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    }
}

fn write(
    transport: Option<&dyn Transport>,
    response: &graphql::Response,
    status: StatusCode,
) -> http::Response<Body> {
    let written = match transport {
        Some(transport) => transport.write(response, status),
        None => write_json(response, status),
    };
    written.unwrap_or_else(|err| {
        tracing::error!(error = %err, "could not write the response");
        let mut response = http::Response::new(Body::empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use serde_json_bytes::json;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::cache::InMemoryCache;
    use crate::json_ext::Value;

    fn schema() -> ExecutableSchema {
        ExecutableSchema::parse("type Query { name: String, slow: String }")
            .unwrap()
            .resolver("Query", "name", |_request| async { Ok(Value::from("test")) })
            .unwrap()
            .resolver("Query", "slow", |_request| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::from("late"))
            })
            .unwrap()
    }

    fn post(body: serde_json::Value) -> http::Request<Body> {
        http::Request::post("/graphql")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body(response: http::Response<Body>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn default_server_registers_the_configured_transports() {
        let server = Server::new_default(schema(), &Configuration::default());
        let debug = format!("{server:?}");
        assert!(
            debug.contains(r#"transports: ["GET", "POST", "POST", "OPTIONS"]"#),
            "{debug}"
        );
        assert!(debug.contains("persisted_queries: true"), "{debug}");

        let configuration: Configuration =
            "transports:\n  get: false\n  multipart: false\npersisted_queries:\n  enabled: false\n"
                .parse()
                .unwrap();
        let debug = format!("{:?}", Server::new_default(schema(), &configuration));
        assert!(debug.contains(r#"transports: ["POST", "OPTIONS"]"#), "{debug}");
        assert!(debug.contains("persisted_queries: false"), "{debug}");
    }

    #[tokio::test]
    async fn server_without_transports_answers_400() {
        let response = Server::new(schema())
            .handle(post(serde_json::json!({"query": "{ name }"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        insta::assert_json_snapshot!(body(response).await, @r###"
        {
          "errors": [
            {
              "message": "transport not supported",
              "extensions": {
                "code": "TRANSPORT_NOT_SUPPORTED"
              }
            }
          ],
          "data": null
        }
        "###);
    }

    #[tokio::test]
    async fn missing_query_is_malformed() {
        let server = Server::new(schema()).add_transport(Post::default());
        let response = server
            .handle(post(serde_json::json!({"variables": {}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body(response).await;
        assert_eq!(
            body["errors"][0]["message"],
            "malformed request: Must provide query string."
        );
        assert_eq!(body["errors"][0]["extensions"]["code"], "MALFORMED_REQUEST");
    }

    #[tokio::test]
    async fn persisted_queries_are_rejected_unless_enabled() {
        let request = || {
            post(serde_json::json!({
                "extensions": {"persistedQuery": {"version": 1, "sha256Hash": "ecf4edb46db40b5132295c0291d62fb65d6759a9eedfa4d5d612dd5ec54a6b38"}}
            }))
        };

        let server = Server::new(schema()).add_transport(Post::default());
        let body_disabled = body(server.handle(request()).await.unwrap()).await;
        assert_eq!(
            body_disabled["errors"][0]["extensions"]["code"],
            "PERSISTED_QUERY_NOT_SUPPORTED"
        );

        let server = server.use_persisted_queries(Arc::new(InMemoryCache::new()));
        let response = server.handle(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body(response).await["errors"][0]["extensions"]["code"],
            "PERSISTED_QUERY_NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn request_headers_are_visible_to_middleware() {
        let server = Server::new(schema())
            .add_transport(Post::default())
            .around_operations(|request: operation::Request, next: operation::Next| async move {
                let authorized = request
                    .context
                    .get::<http::HeaderMap>()
                    .and_then(|headers| headers.get("x-token").cloned())
                    .is_some();
                if authorized {
                    next.run(request).await
                } else {
                    Err(Error::builder()
                        .message("unauthorized")
                        .extension_code("UNAUTHENTICATED")
                        .build()
                        .into())
                }
            });

        let response = server
            .handle(post(serde_json::json!({"query": "{ name }"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body(response).await,
            serde_json::json!({"errors": [{"message": "unauthorized", "extensions": {"code": "UNAUTHENTICATED"}}], "data": null})
        );

        let mut request = post(serde_json::json!({"query": "{ name }"}));
        request
            .headers_mut()
            .insert("x-token", http::HeaderValue::from_static("secret"));
        let response = server.handle(request).await.unwrap();
        assert_eq!(body(response).await, serde_json::json!({"data": {"name": "test"}}));
    }

    #[tokio::test]
    async fn opaque_middleware_errors_are_internal_errors() {
        let server = Server::new(schema())
            .add_transport(Post::default())
            .around_responses(|_request: response::Request, _next: response::Next| async {
                Err::<response::Response, BoxError>("backend unavailable".into())
            });
        let response = server
            .handle(post(serde_json::json!({"query": "{ name }"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body(response).await["errors"][0],
            serde_json::json!({"message": "backend unavailable", "extensions": {"code": "INTERNAL_SERVER_ERROR"}})
        );
    }

    #[test_log::test(tokio::test)]
    async fn cancelled_requests_write_nothing() {
        let server = Server::new(schema()).add_transport(Post::default());
        let cancellation = CancellationToken::new();
        let pending = tokio::spawn({
            let server = server.clone();
            let cancellation = cancellation.clone();
            async move {
                server
                    .handle_with_cancellation(
                        post(serde_json::json!({"query": "{ slow }"})),
                        cancellation,
                    )
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancellation.cancel();
        assert_eq!(pending.await.unwrap().unwrap_err(), PipelineError::Cancelled);
    }

    #[tokio::test]
    async fn timed_out_requests_fail_the_service() {
        let server = Server::new(schema())
            .add_transport(Post::default())
            .request_timeout(Duration::from_millis(200));
        let err = server
            .clone()
            .oneshot(post(serde_json::json!({"query": "{ slow }"})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "the request was cancelled");

        // requests finishing in time are unaffected
        let response = server
            .oneshot(post(serde_json::json!({"query": "{ name }"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test_log::test(tokio::test)]
    async fn serves_http_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = Server::new_default(schema(), &Configuration::default());
        let (shutdown, stop) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve(listener, async move {
            let _ = stop.await;
        }));

        let body = r#"{"query":"{ name }"}"#;
        let mut stream = TcpStream::connect(address).await.unwrap();
        stream
            .write_all(
                format!(
                    "POST /graphql HTTP/1.1\r\nhost: localhost\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        assert!(raw.starts_with("HTTP/1.1 200 OK"), "{raw}");
        assert!(raw.ends_with(r#"{"data":{"name":"test"}}"#), "{raw}");

        shutdown.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn response_state_is_recorded() {
        let server = Server::new(schema())
            .add_transport(Post::default())
            .around_responses(|request: response::Request, next: response::Next| async move {
                let context = request.context.clone();
                let mut response = next.run(request).await?;
                response
                    .response
                    .extensions
                    .insert("state", json!(format!("{:?}", context.state())));
                Ok(response)
            });
        let response = server
            .handle(post(serde_json::json!({"query": "{ name }"})))
            .await
            .unwrap();
        assert_eq!(
            body(response).await,
            serde_json::json!({"data": {"name": "test"}, "extensions": {"state": "Executing"}})
        );
    }
}
