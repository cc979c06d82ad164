use std::any::Any;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Any type that is Clone, Send, Sync and 'static can be stored in the context.
pub trait ContextValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> ContextValue for T {}

/// How far a request progressed through the pipeline.
///
/// A fatal error jumps straight to [`PipelineState::Sent`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PipelineState {
    #[default]
    Received,
    TransportMatched,
    DocumentResolved,
    OperationSelected,
    Authorized,
    VariablesCoerced,
    Executing,
    ResponseAssembled,
    Sent,
}

/// A thread-safe, per-request context that stores values by type.
///
/// Every stage of one request (transports, the three middleware chains and the
/// resolvers) sees the same context, so middleware can hand data to later middleware
/// and resolvers. Values are cloned when retrieved; wrap expensive types in an `Arc`.
#[derive(Clone, Default)]
pub struct Context {
    entries: Arc<DashMap<TypeId, Arc<dyn Any + Send + Sync + 'static>>>,
    state: Arc<Mutex<PipelineState>>,
}

impl Context {
    /// Creates a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a value from the context by type.
    pub fn get<T: ContextValue>(&self) -> Option<T> {
        let type_id = TypeId::of::<T>();
        self.entries
            .get(&type_id)
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    /// Inserts a value into the context, returning the previous value of that type.
    pub fn insert<T: ContextValue>(&self, value: T) -> Option<T> {
        let type_id = TypeId::of::<T>();
        self.entries
            .insert(type_id, Arc::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|previous| (*previous).clone())
    }

    /// Removes a value from the context.
    pub fn remove<T: ContextValue>(&self) -> Option<T> {
        let type_id = TypeId::of::<T>();
        self.entries
            .remove(&type_id)
            .and_then(|(_, previous)| previous.downcast::<T>().ok())
            .map(|previous| (*previous).clone())
    }

    pub fn contains<T: ContextValue>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// The last pipeline state this request reached.
    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub(crate) fn transition(&self, state: PipelineState) {
        let mut current = self.state.lock();
        tracing::trace!(from = ?*current, to = ?state, "pipeline state transition");
        *current = state;
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("entries", &self.entries.len())
            .field("state", &self.state())
            .finish()
    }
}
