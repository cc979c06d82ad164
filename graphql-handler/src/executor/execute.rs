use std::cmp::Ordering;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use apollo_compiler::ast::OperationType;
use apollo_compiler::executable::DirectiveList;
use apollo_compiler::executable::Field;
use apollo_compiler::executable::Selection;
use apollo_compiler::executable::Value as InputValue;
use apollo_compiler::response::GraphQLError;
use apollo_compiler::schema::ExtendedType;
use apollo_compiler::schema::Type;
use apollo_compiler::Name;
use apollo_compiler::Node;
use futures::future::join_all;
use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json_bytes::ByteString;
use tower::service_fn;
use tower::util::BoxCloneService;
use tower::BoxError;
use tower::ServiceExt;

use super::OperationContext;
use crate::error::Error;
use crate::graphql;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::json_ext::Value;
use crate::middleware::Chain;
use crate::schema::ExecutableSchema;
use crate::schema::Resolver;
use crate::services::field;
use crate::services::FieldContext;
use crate::Context;
use crate::PipelineState;

/// A field error travelling up to the nearest nullable position. The error itself has
/// already been recorded.
#[derive(Debug, Clone, Copy)]
struct PropagateNull;

/// Stops null propagation at a nullable type.
fn try_nullify(ty: &Type, result: Result<Value, PropagateNull>) -> Result<Value, PropagateNull> {
    match result {
        Ok(value) => Ok(value),
        Err(PropagateNull) if ty.is_non_null() => Err(PropagateNull),
        Err(PropagateNull) => Ok(Value::Null),
    }
}

/// Orders field errors by where their field appears in the document, then by path.
fn error_order(left: &Error, right: &Error) -> Ordering {
    let location = |error: &Error| {
        error
            .locations
            .first()
            .map(|location| (location.line, location.column))
    };
    location(left)
        .cmp(&location(right))
        .then_with(|| left.path.cmp(&right.path))
}

type ResponseKeys<'a> = IndexMap<&'a Name, Vec<&'a Node<Field>>>;

/// Executes one prepared operation.
pub(crate) struct Executor {
    schema: Arc<ExecutableSchema>,
    fields: Chain<field::Request, field::Response>,
    operation: Arc<OperationContext>,
    context: Context,
    errors: Mutex<Vec<Error>>,
}

impl Executor {
    pub(crate) fn new(
        schema: Arc<ExecutableSchema>,
        fields: Chain<field::Request, field::Response>,
        operation: Arc<OperationContext>,
        context: Context,
    ) -> Self {
        Self {
            schema,
            fields,
            operation,
            context,
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Runs the operation to a response carrying whatever data could be completed along
    /// with the field errors met on the way.
    pub(crate) async fn execute(self) -> graphql::Response {
        self.context.transition(PipelineState::Executing);

        let operation = &self.operation.operation;
        // mutation root fields run one after the other
        let serial = operation.operation_type == OperationType::Mutation;
        let data = match self
            .execute_selection_set(
                &operation.selection_set.ty,
                Arc::new(Value::Null),
                Path::empty(),
                operation.selection_set.selections.iter().collect(),
                serial,
            )
            .await
        {
            Ok(object) => Value::Object(object),
            Err(PropagateNull) => Value::Null,
        };

        let mut errors = self.errors.into_inner();
        // sibling fields finish in any order
        errors.sort_by(error_order);
        if !errors.is_empty() {
            tracing::debug!(errors = errors.len(), "operation completed with field errors");
        }
        graphql::Response::builder()
            .data(data)
            .errors(errors)
            .build()
    }

    fn execute_selection_set<'a>(
        &'a self,
        object_type: &'a Name,
        parent: Arc<Value>,
        path: Path,
        selections: Vec<&'a Selection>,
        serial: bool,
    ) -> BoxFuture<'a, Result<Object, PropagateNull>> {
        async move {
            let mut grouped = ResponseKeys::new();
            self.collect_fields(object_type, selections, &mut HashSet::new(), &mut grouped);

            let results = if serial {
                let mut results = Vec::with_capacity(grouped.len());
                for (key, fields) in grouped {
                    let path = path.join(key.as_str());
                    let result = self
                        .execute_field(object_type, parent.clone(), path, fields)
                        .await;
                    results.push((key, result));
                }
                results
            } else {
                join_all(grouped.into_iter().map(|(key, fields)| {
                    let path = path.join(key.as_str());
                    let parent = parent.clone();
                    async move {
                        let result = self.execute_field(object_type, parent, path, fields).await;
                        (key, result)
                    }
                }))
                .await
            };

            let mut object = Object::new();
            for (key, result) in results {
                object.insert(key.as_str(), result?);
            }
            Ok(object)
        }
        .boxed()
    }

    /// <https://spec.graphql.org/October2021/#CollectFields()>
    fn collect_fields<'a>(
        &'a self,
        object_type: &str,
        selections: impl IntoIterator<Item = &'a Selection>,
        visited_fragments: &mut HashSet<&'a Name>,
        grouped: &mut ResponseKeys<'a>,
    ) {
        for selection in selections {
            match selection {
                Selection::Field(field) => {
                    if self.is_included(&field.directives) {
                        grouped.entry(field.response_key()).or_default().push(field);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    if !self.is_included(&spread.directives)
                        || !visited_fragments.insert(&spread.fragment_name)
                    {
                        continue;
                    }
                    let fragments = &self.operation.document.fragments;
                    let Some(fragment) = fragments.get(&spread.fragment_name) else {
                        continue;
                    };
                    if self.type_applies(object_type, fragment.type_condition()) {
                        self.collect_fields(
                            object_type,
                            &fragment.selection_set.selections,
                            visited_fragments,
                            grouped,
                        );
                    }
                }
                Selection::InlineFragment(inline) => {
                    let applies = inline
                        .type_condition
                        .as_ref()
                        .map_or(true, |condition| self.type_applies(object_type, condition));
                    if self.is_included(&inline.directives) && applies {
                        self.collect_fields(
                            object_type,
                            &inline.selection_set.selections,
                            visited_fragments,
                            grouped,
                        );
                    }
                }
            }
        }
    }

    /// Evaluates `@skip` and `@include`.
    fn is_included(&self, directives: &DirectiveList) -> bool {
        let condition = |name: &str| {
            directives
                .get(name)
                .and_then(|directive| {
                    directive
                        .arguments
                        .iter()
                        .find(|argument| argument.name.as_str() == "if")
                })
                .and_then(|argument| match argument.value.as_ref() {
                    InputValue::Boolean(condition) => Some(*condition),
                    InputValue::Variable(variable) => self
                        .operation
                        .variables
                        .get(variable.as_str())
                        .and_then(Value::as_bool),
                    _ => None,
                })
        };
        !condition("skip").unwrap_or(false) && condition("include").unwrap_or(true)
    }

    fn type_applies(&self, object_type: &str, condition: &str) -> bool {
        object_type == condition || self.schema.schema().is_subtype(condition, object_type)
    }

    fn execute_field<'a>(
        &'a self,
        object_type: &'a Name,
        parent: Arc<Value>,
        path: Path,
        fields: Vec<&'a Node<Field>>,
    ) -> BoxFuture<'a, Result<Value, PropagateNull>> {
        async move {
            let field = fields[0];
            if field.name.as_str() == "__typename" {
                return Ok(Value::from(object_type.as_str()));
            }

            let ty = field.ty();
            let result = match self.resolve_field(object_type, field, parent, &path).await {
                Ok(value) => {
                    self.complete_value(object_type, ty, value, path, &fields)
                        .await
                }
                Err(error) => {
                    self.errors.lock().push(error);
                    Err(PropagateNull)
                }
            };
            try_nullify(ty, result)
        }
        .boxed()
    }

    /// Runs the field middleware chain around the field's resolver.
    async fn resolve_field(
        &self,
        object_type: &Name,
        field: &Node<Field>,
        parent: Arc<Value>,
        path: &Path,
    ) -> Result<Value, Error> {
        let request = field::Request::builder()
            .field(Arc::new(FieldContext {
                parent_type: object_type.clone(),
                field_name: field.name.clone(),
                response_key: field.response_key().clone(),
                arguments: self.coerce_arguments(field),
                path: path.clone(),
                return_type: field.ty().clone(),
            }))
            .parent(parent)
            .operation(self.operation.clone())
            .context(self.context.clone())
            .build();
        let resolver = self
            .schema
            .resolver_for(object_type.as_str(), field.name.as_str())
            .cloned();
        let service = self.fields.wrap(resolver_service(resolver));

        match AssertUnwindSafe(service.oneshot(request))
            .catch_unwind()
            .await
        {
            Ok(Ok(response)) => Ok(response.value),
            Ok(Err(err)) => Err(match err.downcast::<Error>() {
                Ok(error) => {
                    let mut error = *error;
                    if error.locations.is_empty() {
                        error.locations = self.field_error("", field, path).locations;
                    }
                    error.path = Some(path.clone());
                    error
                }
                Err(err) => self.field_error(err.to_string(), field, path),
            }),
            Err(_) => {
                failfast_error!("resolver of {}.{} panicked", object_type, field.name);
                Err(self.field_error("internal system error", field, path))
            }
        }
    }

    /// <https://spec.graphql.org/October2021/#CompleteValue()>
    fn complete_value<'a>(
        &'a self,
        parent_type: &'a Name,
        ty: &'a Type,
        value: Value,
        path: Path,
        fields: &'a [&'a Node<Field>],
    ) -> BoxFuture<'a, Result<Value, PropagateNull>> {
        async move {
            let field = fields[0];
            macro_rules! field_error {
                ($($arg: tt)+) => {
                    {
                        let error = self.field_error(format!($($arg)+), field, &path);
                        self.errors.lock().push(error);
                        return Err(PropagateNull);
                    }
                };
            }

            if value.is_null() {
                if ty.is_non_null() {
                    field_error!(
                        "Cannot return null for non-nullable field {parent_type}.{}",
                        field.name
                    )
                }
                return Ok(Value::Null);
            }

            let ty_name = match ty {
                Type::List(inner_ty) | Type::NonNullList(inner_ty) => {
                    let items = match value {
                        Value::Array(items) => items,
                        value => {
                            field_error!("Resolver returned {value}, expected a list for type {ty}")
                        }
                    };
                    let completed = join_all(items.into_iter().enumerate().map(|(index, item)| {
                        let path = path.join(index);
                        async move {
                            let result = self
                                .complete_value(parent_type, inner_ty, item, path, fields)
                                .await;
                            // a failing item is nullified when its type allows it
                            try_nullify(inner_ty, result)
                        }
                    }))
                    .await;
                    // otherwise the whole list is
                    return completed
                        .into_iter()
                        .collect::<Result<Vec<_>, _>>()
                        .map(Value::Array);
                }
                Type::Named(name) | Type::NonNullNamed(name) => name,
            };

            let Some(ty_def) = self.schema.schema().types.get(ty_name) else {
                field_error!("Undefined type {ty_name}")
            };
            let object_type = match ty_def {
                ExtendedType::InputObject(_) => {
                    field_error!("Field with input object type {ty_name}")
                }
                ExtendedType::Enum(enum_def) => {
                    if !value
                        .as_str()
                        .is_some_and(|str| enum_def.values.contains_key(str))
                    {
                        field_error!("Resolver returned {value}, expected enum {ty_name}")
                    }
                    return Ok(value);
                }
                ExtendedType::Scalar(_) => {
                    return match ty_name.as_str() {
                        "Int" => match value.as_i64() {
                            Some(int) if i32::try_from(int).is_ok() => Ok(value),
                            Some(_) => {
                                field_error!("Resolver returned {value} which overflows Int")
                            }
                            None => field_error!("Resolver returned {value}, expected Int"),
                        },
                        "Float" => {
                            if !value.is_number() {
                                field_error!("Resolver returned {value}, expected Float")
                            }
                            Ok(value)
                        }
                        "String" => {
                            if !value.is_string() {
                                field_error!("Resolver returned {value}, expected String")
                            }
                            Ok(value)
                        }
                        "Boolean" => {
                            if !value.is_boolean() {
                                field_error!("Resolver returned {value}, expected Boolean")
                            }
                            Ok(value)
                        }
                        "ID" => {
                            if value.is_string() {
                                Ok(value)
                            } else if let Some(id) = value.as_i64() {
                                Ok(Value::from(id.to_string()))
                            } else {
                                field_error!("Resolver returned {value}, expected ID")
                            }
                        }
                        // custom scalars are passed through as-is
                        _ => Ok(value),
                    };
                }
                ExtendedType::Object(_) => {
                    if !value.is_object() {
                        field_error!(
                            "Resolver returned a leaf value but expected an object for type {ty_name}"
                        )
                    }
                    ty_name
                }
                ExtendedType::Interface(_) | ExtendedType::Union(_) => {
                    let Some(object_type) = value
                        .as_object()
                        .and_then(|object| object.get("__typename"))
                        .and_then(|typename| typename.as_str())
                        .and_then(|typename| self.schema.schema().get_object(typename))
                    else {
                        field_error!(
                            "Resolver returned {value} which does not name an object type \
                             of abstract type {ty_name} in __typename"
                        )
                    };
                    if !self
                        .schema
                        .schema()
                        .is_subtype(ty_name, object_type.name.as_str())
                    {
                        field_error!(
                            "Resolver returned an object of type {} which is not a possible type of {ty_name}",
                            object_type.name
                        )
                    }
                    &object_type.name
                }
            };

            self.execute_selection_set(
                object_type,
                Arc::new(value),
                path,
                fields
                    .iter()
                    .flat_map(|field| &field.selection_set.selections)
                    .collect(),
                false,
            )
            .await
            .map(Value::Object)
        }
        .boxed()
    }

    /// Coerces the arguments of `field`, applying defaults of omitted arguments.
    fn coerce_arguments(&self, field: &Field) -> Object {
        let mut arguments = Object::new();
        for definition in &field.definition.arguments {
            let given = field
                .arguments
                .iter()
                .find(|argument| argument.name == definition.name)
                .map(|argument| argument.value.as_ref());
            let value = match given {
                // an unset variable falls back to the argument default
                Some(InputValue::Variable(variable))
                    if !self.operation.variables.contains_key(variable.as_str()) =>
                {
                    definition
                        .default_value
                        .as_ref()
                        .map(|default| self.input_value(default))
                }
                Some(value) => Some(self.input_value(value)),
                None => definition
                    .default_value
                    .as_ref()
                    .map(|default| self.input_value(default)),
            };
            if let Some(value) = value {
                arguments.insert(definition.name.as_str(), value);
            }
        }
        arguments
    }

    fn input_value(&self, value: &InputValue) -> Value {
        match value {
            InputValue::Null => Value::Null,
            InputValue::Enum(name) => Value::from(name.as_str()),
            InputValue::Variable(variable) => self
                .operation
                .variables
                .get(variable.as_str())
                .cloned()
                .unwrap_or_default(),
            InputValue::String(string) => Value::from(string.as_str()),
            InputValue::Float(float) => float
                .try_to_f64()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_default(),
            InputValue::Int(int) => match int.try_to_i32() {
                Ok(int) => Value::from(int),
                Err(_) => int
                    .try_to_f64()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or_default(),
            },
            InputValue::Boolean(boolean) => Value::Bool(*boolean),
            InputValue::List(items) => {
                Value::Array(items.iter().map(|item| self.input_value(item)).collect())
            }
            InputValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, value)| (ByteString::from(name.as_str()), self.input_value(value)))
                    .collect(),
            ),
        }
    }

    /// A field error located at `field` in the document.
    fn field_error(&self, message: impl Into<String>, field: &Node<Field>, path: &Path) -> Error {
        let mut error = Error::from(GraphQLError::new(
            message,
            field.location(),
            &self.operation.document.sources,
        ));
        error.path = Some(path.clone());
        error
    }
}

/// The end of the field chain: the registered resolver, or a read of the field name
/// from the parent object.
fn resolver_service(resolver: Option<Arc<dyn Resolver>>) -> field::BoxService {
    BoxCloneService::new(service_fn(move |request: field::Request| {
        let resolver = resolver.clone();
        async move {
            let context = request.context.clone();
            let value = match resolver {
                Some(resolver) => resolver.resolve(request).await?,
                None => request
                    .parent
                    .as_object()
                    .and_then(|parent| parent.get(request.field.field_name.as_str()))
                    .cloned()
                    .unwrap_or_default(),
            };
            Ok::<_, BoxError>(
                field::Response::builder()
                    .value(value)
                    .context(context)
                    .build(),
            )
        }
    }))
}
