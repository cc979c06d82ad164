//! A validated schema together with the resolvers of its fields.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use apollo_compiler::validation::Valid;
use apollo_compiler::Schema;
use futures::future::BoxFuture;
use tower::BoxError;

use crate::error::SchemaError;
use crate::json_ext::Value;
use crate::services::field;

/// Computes the value of one field.
///
/// Implemented for any `Fn(field::Request) -> impl Future<Output = Result<Value, BoxError>>`.
/// The returned value is completed against the field type by the executor: objects are
/// further resolved field by field, leaves are checked against their scalar or enum type.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, request: field::Request) -> BoxFuture<'static, Result<Value, BoxError>>;
}

impl<F, Fut> Resolver for F
where
    F: Fn(field::Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    fn resolve(&self, request: field::Request) -> BoxFuture<'static, Result<Value, BoxError>> {
        Box::pin(self(request))
    }
}

/// A schema ready to execute operations.
///
/// Fields without a registered resolver read their value from the parent object, under
/// the field name.
#[derive(Clone)]
pub struct ExecutableSchema {
    schema: Arc<Valid<Schema>>,
    resolvers: HashMap<String, HashMap<String, Arc<dyn Resolver>>>,
}

impl ExecutableSchema {
    pub fn new(schema: Valid<Schema>) -> Self {
        Self {
            schema: Arc::new(schema),
            resolvers: HashMap::new(),
        }
    }

    /// Parses and validates SDL.
    pub fn parse(sdl: &str) -> Result<Self, SchemaError> {
        let schema = Schema::parse_and_validate(sdl, "schema.graphql")
            .map_err(|with_errors| SchemaError::Invalid(with_errors.errors.to_string()))?;
        Ok(Self::new(schema))
    }

    /// Registers the resolver of `type_name.field_name`, replacing any previous one.
    pub fn resolver<F, Fut>(
        mut self,
        type_name: &str,
        field_name: &str,
        resolver: F,
    ) -> Result<Self, SchemaError>
    where
        F: Fn(field::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        self.add_resolver(type_name, field_name, Arc::new(resolver))?;
        Ok(self)
    }

    /// Registers a resolver implemented as a type.
    pub fn add_resolver(
        &mut self,
        type_name: &str,
        field_name: &str,
        resolver: Arc<dyn Resolver>,
    ) -> Result<(), SchemaError> {
        if self.schema.type_field(type_name, field_name).is_err() {
            return Err(SchemaError::UnknownField {
                type_name: type_name.to_string(),
                field_name: field_name.to_string(),
            });
        }
        self.resolvers
            .entry(type_name.to_string())
            .or_default()
            .insert(field_name.to_string(), resolver);
        Ok(())
    }

    pub fn schema(&self) -> &Arc<Valid<Schema>> {
        &self.schema
    }

    pub(crate) fn resolver_for(
        &self,
        type_name: &str,
        field_name: &str,
    ) -> Option<&Arc<dyn Resolver>> {
        self.resolvers
            .get(type_name)
            .and_then(|fields| fields.get(field_name))
    }
}

impl fmt::Debug for ExecutableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut resolvers = self
            .resolvers
            .iter()
            .flat_map(|(ty, fields)| fields.keys().map(move |field| format!("{ty}.{field}")))
            .collect::<Vec<_>>();
        resolvers.sort();
        f.debug_struct("ExecutableSchema")
            .field("resolvers", &resolvers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDL: &str = "type Query { name: String }";

    #[test]
    fn invalid_sdl() {
        let err = ExecutableSchema::parse("type Query { name: Missing }").unwrap_err();
        assert!(matches!(err, SchemaError::Invalid(_)));
    }

    #[test]
    fn resolvers_must_target_existing_fields() {
        let err = ExecutableSchema::parse(SDL)
            .unwrap()
            .resolver("Query", "nope", |_req| async { Ok(Value::Null) })
            .unwrap_err();
        assert_eq!(err.to_string(), "type Query has no field nope");
    }

    #[test]
    fn registered_resolvers_are_found() {
        let schema = ExecutableSchema::parse(SDL)
            .unwrap()
            .resolver("Query", "name", |_req| async { Ok(Value::from("test")) })
            .unwrap();
        assert!(schema.resolver_for("Query", "name").is_some());
        assert!(schema.resolver_for("Query", "other").is_none());
        assert_eq!(
            format!("{schema:?}"),
            r#"ExecutableSchema { resolvers: ["Query.name"], .. }"#
        );
    }
}
