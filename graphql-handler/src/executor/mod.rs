//! Operation selection, kind authorization, variable coercion and field execution.

use std::fmt;

use apollo_compiler::executable::Operation;
use apollo_compiler::request::coerce_variable_values;
use apollo_compiler::validation::Valid;
use apollo_compiler::ExecutableDocument;
use apollo_compiler::Node;
use apollo_compiler::Schema;

use crate::error::Error;
use crate::error::PipelineError;
use crate::json_ext::Object;
use crate::query_cache::Document;
use crate::services::transport::OperationKind;
use crate::services::transport::OperationKinds;
use crate::services::transport::RawRequest;
use crate::Context;
use crate::PipelineState;

mod execute;

pub(crate) use self::execute::Executor;

/// The operation a request runs, as seen by middleware and resolvers.
#[non_exhaustive]
pub struct OperationContext {
    /// The query text the client sent, or the persisted query it referenced.
    pub query: String,

    pub document: Document,

    /// The selected operation of [`OperationContext::document`].
    pub operation: Node<Operation>,

    pub kind: OperationKind,

    /// Variables coerced against the operation's variable definitions, defaults applied.
    pub variables: Object,

    /// Request extensions as sent by the client.
    pub extensions: Object,

    /// Name of the transport the request came through.
    pub transport: &'static str,
}

impl OperationContext {
    pub fn operation_name(&self) -> Option<&str> {
        self.operation.name.as_ref().map(|name| name.as_str())
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("operation_name", &self.operation_name())
            .field("kind", &self.kind)
            .field("variables", &self.variables)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// Takes a resolved document through operation selection, authorization and variable
/// coercion, recording each step in the request context.
pub(crate) fn prepare(
    schema: &Valid<Schema>,
    query: String,
    document: Document,
    request: RawRequest,
    context: &Context,
) -> Result<OperationContext, PipelineError> {
    let RawRequest {
        body,
        transport,
        allowed_kinds,
        ..
    } = request;

    let operation = select_operation(&document, body.operation_name.as_deref())?;
    context.transition(PipelineState::OperationSelected);

    let kind = OperationKind::from(operation.operation_type);
    authorize(transport, allowed_kinds, kind)?;
    context.transition(PipelineState::Authorized);

    let variables = coerce_variables(schema, &document, &operation, &body.variables)?;
    context.transition(PipelineState::VariablesCoerced);

    Ok(OperationContext {
        query,
        document,
        operation,
        kind,
        variables,
        extensions: body.extensions,
        transport,
    })
}

/// A document with a single operation runs it whatever the requested name; otherwise
/// the name must match one of the operations exactly.
pub(crate) fn select_operation(
    document: &ExecutableDocument,
    operation_name: Option<&str>,
) -> Result<Node<Operation>, PipelineError> {
    let operations = document.operations.iter().collect::<Vec<_>>();
    if let [operation] = operations.as_slice() {
        return Ok((*operation).clone());
    }
    match operation_name {
        Some(name) => operations
            .into_iter()
            .find(|operation| {
                operation
                    .name
                    .as_ref()
                    .is_some_and(|candidate| candidate.as_str() == name)
            })
            .cloned()
            .ok_or_else(|| {
                PipelineError::OperationNotFound(format!("Unknown operation named \"{name}\""))
            }),
        None if operations.is_empty() => Err(PipelineError::OperationNotFound(
            "the document does not contain any operation".to_string(),
        )),
        None => Err(PipelineError::OperationNotFound(
            "Must provide operation name if query contains multiple operations.".to_string(),
        )),
    }
}

/// Checks the kind of the selected operation against the transport policy.
pub(crate) fn authorize(
    transport: &str,
    allowed: OperationKinds,
    requested: OperationKind,
) -> Result<(), PipelineError> {
    if allowed.contains(requested) {
        Ok(())
    } else {
        tracing::debug!(%transport, %requested, "operation kind not allowed");
        Err(PipelineError::OperationNotAllowed {
            transport: transport.to_string(),
            allowed,
            requested,
        })
    }
}

pub(crate) fn coerce_variables(
    schema: &Valid<Schema>,
    document: &ExecutableDocument,
    operation: &Operation,
    variables: &Object,
) -> Result<Object, PipelineError> {
    coerce_variable_values(schema, operation, variables)
        .map(Valid::into_inner)
        .map_err(|err| {
            PipelineError::VariableCoercionError(vec![Error::from(
                err.to_graphql_error(&document.sources),
            )])
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json_bytes::json;

    use super::*;
    use crate::graphql;

    const SCHEMA: &str = r#"
        type Query { name: String, hello(to: String!): String }
        type Mutation { rename(name: String!): String }
        type Subscription { ticks: Int }
    "#;

    fn schema() -> Valid<Schema> {
        Schema::parse_and_validate(SCHEMA, "schema.graphql").unwrap()
    }

    fn document(schema: &Valid<Schema>, query: &str) -> Document {
        Arc::new(ExecutableDocument::parse_and_validate(schema, query, "query.graphql").unwrap())
    }

    fn raw(query: &str, operation_name: Option<&str>, variables: Object) -> RawRequest {
        RawRequest::builder()
            .body(
                graphql::Request::builder()
                    .query(query)
                    .and_operation_name(operation_name.map(str::to_string))
                    .variables(variables)
                    .build(),
            )
            .transport("GET")
            .allowed_kinds(OperationKinds::from([OperationKind::Query]))
            .build()
    }

    #[test]
    fn single_operation_is_selected_without_a_name() {
        let schema = schema();
        let document = document(&schema, "query Only { name }");
        let operation = select_operation(&document, None).unwrap();
        assert_eq!(operation.name.as_ref().unwrap().as_str(), "Only");
        // a mismatching name does not matter with a single operation
        assert!(select_operation(&document, Some("Other")).is_ok());
    }

    #[test]
    fn multiple_operations_need_a_matching_name() {
        let schema = schema();
        let document = document(&schema, "query A { name } query B { name }");

        let b = select_operation(&document, Some("B")).unwrap();
        assert_eq!(b.name.as_ref().unwrap().as_str(), "B");

        let err = select_operation(&document, None).unwrap_err();
        assert!(matches!(err, PipelineError::OperationNotFound(_)));
        let err = select_operation(&document, Some("C")).unwrap_err();
        assert_eq!(err.to_string(), "Unknown operation named \"C\"");
    }

    #[test]
    fn read_only_transports_reject_mutations_and_subscriptions() {
        let allowed = OperationKinds::from([OperationKind::Query]);
        assert!(authorize("GET", allowed, OperationKind::Query).is_ok());
        for requested in [OperationKind::Mutation, OperationKind::Subscription] {
            let err = authorize("GET", allowed, requested).unwrap_err();
            assert_eq!(err.to_string(), "GET requests only allow query operations");
        }
    }

    #[test]
    fn authorization_happens_before_variable_coercion() {
        let schema = schema();
        let query = "mutation ($name: String!) { rename(name: $name) }";
        let document = document(&schema, query);
        let context = Context::new();

        // the variable is missing, but the kind check fails first
        let err = prepare(
            &schema,
            query.to_string(),
            document,
            raw(query, None, Object::new()),
            &context,
        )
        .unwrap_err();

        assert!(matches!(err, PipelineError::OperationNotAllowed { .. }));
        assert_eq!(context.state(), PipelineState::OperationSelected);
    }

    #[test]
    fn missing_required_variable_is_a_coercion_error() {
        let schema = schema();
        let query = "query ($to: String!) { hello(to: $to) }";
        let document = document(&schema, query);

        let err = prepare(
            &schema,
            query.to_string(),
            document,
            raw(query, None, Object::new()),
            &Context::new(),
        )
        .unwrap_err();

        let PipelineError::VariableCoercionError(errors) = err else {
            panic!("expected a coercion error");
        };
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn prepared_operations_carry_coerced_variables() {
        let schema = schema();
        let query = "query Greet($to: String! = \"world\") { hello(to: $to) }";
        let document = document(&schema, query);
        let context = Context::new();

        let operation = prepare(
            &schema,
            query.to_string(),
            document,
            raw(query, None, Object::new()),
            &context,
        )
        .unwrap();

        assert_eq!(operation.operation_name(), Some("Greet"));
        assert_eq!(operation.kind, OperationKind::Query);
        assert_eq!(operation.variables.get("to"), Some(&json!("world")));
        assert_eq!(context.state(), PipelineState::VariablesCoerced);
    }
}
