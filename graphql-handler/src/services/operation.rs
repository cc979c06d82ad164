use std::sync::Arc;

use tower::BoxError;

use crate::executor::OperationContext;
use crate::graphql;
use crate::Context;

pub type BoxService = tower::util::BoxCloneService<Request, Response, BoxError>;
pub type ServiceResult = Result<Response, BoxError>;
pub type Next = crate::middleware::Next<Request, Response>;

/// An operation that was selected, authorized and had its variables coerced.
#[non_exhaustive]
pub struct Request {
    pub operation: Arc<OperationContext>,

    /// Context for extension
    pub context: Context,
}

#[buildstructor::buildstructor]
impl Request {
    #[builder(visibility = "pub")]
    fn new(operation: Arc<OperationContext>, context: Context) -> Request {
        Self { operation, context }
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub struct Response {
    pub response: graphql::Response,

    pub context: Context,
}

#[buildstructor::buildstructor]
impl Response {
    #[builder(visibility = "pub")]
    fn new(response: graphql::Response, context: Context) -> Response {
        Self { response, context }
    }
}

impl From<super::response::Response> for Response {
    fn from(response: super::response::Response) -> Self {
        Self {
            response: response.response,
            context: response.context,
        }
    }
}
