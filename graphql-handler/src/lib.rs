//! A transport-agnostic GraphQL request pipeline.
//!
//! Requests are matched to a transport, resolved to a validated document (through a
//! pluggable cache), authorized against the transport's operation-kind policy and then
//! executed through three layers of user-installable middleware.

#![cfg_attr(feature = "failfast", allow(unreachable_code))]
#![warn(unreachable_pub)]

macro_rules! failfast_error {
    ($($tokens:tt)+) => {{
        tracing::error!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

mod apq;
pub mod cache;
pub mod configuration;
mod context;
pub mod error;
mod executor;
pub mod graphql;
pub mod json_ext;
pub mod middleware;
mod query_cache;
pub mod schema;
mod server;
pub mod services;

pub use apq::PersistedQueryHit;
pub use configuration::Configuration;
pub use context::Context;
pub use context::PipelineState;
pub use executor::OperationContext;
pub use query_cache::Document;
pub use schema::ExecutableSchema;
pub use server::Server;
pub use services::transport::OperationKind;
pub use services::transport::OperationKinds;
pub use services::transport::RawRequest;
pub use services::transport::Transport;
