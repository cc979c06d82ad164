//! User-installable interceptors around operations, responses and fields.
//!
//! Interceptors registered as `[a, b]` compose as `a(b(terminal))`: the first registered
//! interceptor runs first and finishes last.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::Poll;

use futures::future::BoxFuture;
use tower::util::BoxCloneService;
use tower::BoxError;
use tower::Service;
use tower::ServiceExt;

use crate::services::field;
use crate::services::operation;
use crate::services::response;

/// An interceptor wrapping the rest of a chain.
///
/// Implemented for any `Fn(Req, Next<Req, Res>) -> impl Future<Output = Result<Res, BoxError>>`.
/// Returning without calling [`Next::run`] short-circuits the chain.
pub trait Interceptor<Req, Res>: Send + Sync + 'static {
    fn intercept(
        &self,
        request: Req,
        next: Next<Req, Res>,
    ) -> BoxFuture<'static, Result<Res, BoxError>>;
}

impl<F, Fut, Req, Res> Interceptor<Req, Res> for F
where
    F: Fn(Req, Next<Req, Res>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, BoxError>> + Send + 'static,
    Req: Send + 'static,
    Res: Send + 'static,
{
    fn intercept(
        &self,
        request: Req,
        next: Next<Req, Res>,
    ) -> BoxFuture<'static, Result<Res, BoxError>> {
        Box::pin(self(request, next))
    }
}

/// The remainder of a chain, ending in the terminal handler.
///
/// `run` consumes the continuation, so it can be called at most once.
pub struct Next<Req, Res> {
    inner: BoxCloneService<Req, Res, BoxError>,
}

impl<Req, Res> Next<Req, Res>
where
    Req: 'static,
    Res: 'static,
{
    pub async fn run(self, request: Req) -> Result<Res, BoxError> {
        self.inner.oneshot(request).await
    }
}

impl<Req, Res> fmt::Debug for Next<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

struct InterceptorService<Req, Res> {
    interceptor: Arc<dyn Interceptor<Req, Res>>,
    next: BoxCloneService<Req, Res, BoxError>,
}

impl<Req, Res> Clone for InterceptorService<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            interceptor: self.interceptor.clone(),
            next: self.next.clone(),
        }
    }
}

impl<Req, Res> Service<Req> for InterceptorService<Req, Res>
where
    Req: 'static,
    Res: 'static,
{
    type Response = Res;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Res, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Req) -> Self::Future {
        self.interceptor.intercept(
            request,
            Next {
                inner: self.next.clone(),
            },
        )
    }
}

/// An ordered, append-only list of interceptors.
pub struct Chain<Req, Res> {
    interceptors: Vec<Arc<dyn Interceptor<Req, Res>>>,
}

impl<Req, Res> Default for Chain<Req, Res> {
    fn default() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }
}

impl<Req, Res> Clone for Chain<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            interceptors: self.interceptors.clone(),
        }
    }
}

impl<Req, Res> fmt::Debug for Chain<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl<Req, Res> Chain<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    pub fn push(&mut self, interceptor: impl Interceptor<Req, Res>) {
        self.interceptors.push(Arc::new(interceptor));
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Wraps `terminal` so the first registered interceptor is the outermost.
    pub fn wrap(
        &self,
        terminal: BoxCloneService<Req, Res, BoxError>,
    ) -> BoxCloneService<Req, Res, BoxError> {
        self.interceptors
            .iter()
            .rev()
            .fold(terminal, |next, interceptor| {
                BoxCloneService::new(InterceptorService {
                    interceptor: interceptor.clone(),
                    next,
                })
            })
    }
}

/// The three chains a server runs requests through.
#[derive(Clone, Debug, Default)]
pub struct Middleware {
    /// Wraps each operation once.
    pub operations: Chain<operation::Request, operation::Response>,
    /// Wraps the assembly of each response once.
    pub responses: Chain<response::Request, response::Response>,
    /// Wraps every field resolution individually.
    pub fields: Chain<field::Request, field::Response>,
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use tower::service_fn;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, name: &'static str) -> impl Interceptor<u32, u32> {
        let log = log.clone();
        move |request: u32, next: Next<u32, u32>| {
            let log = log.clone();
            async move {
                log.lock().push(format!("{name}-before"));
                let response = next.run(request + 1).await?;
                log.lock().push(format!("{name}-after"));
                Ok::<_, BoxError>(response)
            }
        }
    }

    fn terminal(log: &Log) -> BoxCloneService<u32, u32, BoxError> {
        let log = log.clone();
        BoxCloneService::new(service_fn(move |request: u32| {
            let log = log.clone();
            async move {
                log.lock().push("terminal".to_string());
                Ok::<_, BoxError>(request * 10)
            }
        }))
    }

    #[tokio::test]
    async fn first_registered_is_outermost() {
        let log = Log::default();
        let mut chain = Chain::default();
        chain.push(recording(&log, "a"));
        chain.push(recording(&log, "b"));
        chain.push(recording(&log, "c"));

        let response = chain.wrap(terminal(&log)).oneshot(0).await.unwrap();

        assert_eq!(response, 30);
        assert_eq!(
            *log.lock(),
            vec!["a-before", "b-before", "c-before", "terminal", "c-after", "b-after", "a-after"]
        );
    }

    #[tokio::test]
    async fn empty_chain_is_the_terminal() {
        let log = Log::default();
        let chain: Chain<u32, u32> = Chain::default();
        assert_eq!(chain.wrap(terminal(&log)).oneshot(4).await.unwrap(), 40);
        assert_eq!(*log.lock(), vec!["terminal"]);
    }

    #[tokio::test]
    async fn interceptors_may_short_circuit() {
        let log = Log::default();
        let mut chain = Chain::default();
        chain.push(recording(&log, "a"));
        chain.push(|_request: u32, _next: Next<u32, u32>| async { Ok::<_, BoxError>(7) });
        chain.push(recording(&log, "never"));

        let response = chain.wrap(terminal(&log)).oneshot(0).await.unwrap();

        assert_eq!(response, 7);
        assert_eq!(*log.lock(), vec!["a-before", "a-after"]);
    }

    #[tokio::test]
    async fn errors_unwind_through_outer_interceptors() {
        let log = Log::default();
        let mut chain = Chain::default();
        chain.push(|request: u32, next: Next<u32, u32>| async move {
            match next.run(request).await {
                Ok(response) => Ok::<_, BoxError>(response),
                Err(err) => Ok(err.to_string().len() as u32),
            }
        });
        chain.push(|_request: u32, _next: Next<u32, u32>| async {
            Err::<u32, BoxError>("denied".into())
        });

        let response = chain.wrap(terminal(&log)).oneshot(0).await.unwrap();

        assert_eq!(response, 6);
        assert!(log.lock().is_empty());
    }
}
