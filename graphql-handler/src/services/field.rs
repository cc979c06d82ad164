use std::sync::Arc;

use apollo_compiler::schema::Type;
use apollo_compiler::Name;
use tower::BoxError;

use crate::executor::OperationContext;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::Context;

pub type BoxService = tower::util::BoxCloneService<Request, Response, BoxError>;
pub type ServiceResult = Result<Response, BoxError>;
pub type Next = crate::middleware::Next<Request, Response>;

/// What is being resolved.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct FieldContext {
    /// The object type the field is selected on.
    pub parent_type: Name,
    pub field_name: Name,
    /// Alias if present, field name otherwise.
    pub response_key: Name,
    /// Coerced arguments, schema defaults applied.
    pub arguments: Object,
    /// Where the value lands in the response data.
    pub path: Path,
    pub return_type: Type,
}

/// One field resolution.
#[non_exhaustive]
pub struct Request {
    pub field: Arc<FieldContext>,

    /// The resolved value of the enclosing object (`null` for root fields).
    pub parent: Arc<Value>,

    pub operation: Arc<OperationContext>,

    /// Context for extension
    pub context: Context,
}

#[buildstructor::buildstructor]
impl Request {
    #[builder(visibility = "pub")]
    fn new(
        field: Arc<FieldContext>,
        parent: Arc<Value>,
        operation: Arc<OperationContext>,
        context: Context,
    ) -> Request {
        Self {
            field,
            parent,
            operation,
            context,
        }
    }

    /// Argument `name`, `None` when it was neither given nor defaulted.
    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.field.arguments.get(name)
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub struct Response {
    /// The raw resolved value, completed against the field type by the executor.
    pub value: Value,

    pub context: Context,
}

#[buildstructor::buildstructor]
impl Response {
    #[builder(visibility = "pub")]
    fn new(value: Value, context: Context) -> Response {
        Self { value, context }
    }
}
