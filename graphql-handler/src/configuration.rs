//! Server configuration.
//!
//! Can be created through `serde::Deserialize` from various formats, or from YAML with
//! [`str::parse`].

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use displaydoc::Display;
use schemars::gen::SchemaSettings;
use schemars::schema::RootSchema;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::apq;
use crate::services::transport::DEFAULT_MAX_BODY_SIZE;
use crate::services::transport::DEFAULT_MAX_UPLOAD_SIZE;

/// Configuration error.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// could not parse configuration: {0}
    InvalidYaml(#[from] serde_yaml::Error),

    /// {message}: {error}
    InvalidConfiguration {
        /// What was being checked.
        message: &'static str,
        /// Why it failed.
        error: String,
    },
}

/// The configuration of a [`Server`](crate::Server) built with
/// [`Server::new_default`](crate::Server::new_default).
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Cache of parsed and validated query documents
    pub query_cache: QueryCache,

    /// Automatic persisted queries
    pub persisted_queries: PersistedQueries,

    /// Request limits
    pub limits: Limits,

    /// Default transports to enable
    pub transports: Transports,

    /// Multipart requests
    pub multipart: Multipart,
}

impl Configuration {
    /// Checks the constraints serde cannot express.
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        if self.query_cache.capacity == Some(0) {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "invalid query_cache.capacity",
                error: "capacity must be greater than 0, leave it unset for an unbounded cache"
                    .to_string(),
            });
        }
        if self.persisted_queries.enabled && self.persisted_queries.capacity == 0 {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "invalid persisted_queries.capacity",
                error: "capacity must be greater than 0".to_string(),
            });
        }
        if self.limits.max_body_size == 0 {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "invalid limits.max_body_size",
                error: "the limit must be greater than 0".to_string(),
            });
        }
        Ok(self)
    }
}

impl FromStr for Configuration {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Configuration::default());
        }
        serde_yaml::from_str::<Configuration>(s)?.validate()
    }
}

/// Generate a JSON schema for the configuration.
pub fn generate_config_schema() -> RootSchema {
    let settings = SchemaSettings::draft07().with(|s| {
        s.option_nullable = true;
        s.option_add_null_type = false;
        s.inline_subschemas = true;
    });
    settings.into_generator().into_root_schema_for::<Configuration>()
}

/// Query document cache configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct QueryCache {
    /// Maximum number of documents kept, least recently used first out.
    /// Unbounded when unset.
    pub capacity: Option<usize>,
}

impl QueryCache {
    pub(crate) fn bound(&self) -> Option<NonZeroUsize> {
        self.capacity.and_then(NonZeroUsize::new)
    }
}

/// Automatic persisted queries configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct PersistedQueries {
    /// Activates automatic persisted queries (enabled by default)
    pub enabled: bool,

    /// Maximum number of persisted queries kept
    pub capacity: usize,
}

impl Default for PersistedQueries {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: apq::DEFAULT_CAPACITY,
        }
    }
}

/// Request limits
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Limits {
    /// Maximum size of a request body in bytes; defaults to 2MiB
    pub max_body_size: usize,

    /// Deadline of a request in human-readable format (e.g. `30s`). Requests running
    /// past it are cancelled. No deadline when unset.
    #[serde(with = "humantime_serde")]
    #[schemars(with = "Option<String>")]
    pub request_timeout: Option<Duration>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            request_timeout: None,
        }
    }
}

/// Default transports, tried in the order GET, POST, multipart, OPTIONS
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Transports {
    /// Queries in the query string of `GET` requests
    pub get: bool,

    /// JSON bodies of `POST` requests
    pub post: bool,

    /// `multipart/form-data` bodies of `POST` requests, with file uploads
    pub multipart: bool,

    /// Answer `OPTIONS` requests with the allowed methods
    pub options: bool,
}

impl Default for Transports {
    fn default() -> Self {
        Self {
            get: true,
            post: true,
            multipart: true,
            options: true,
        }
    }
}

/// Multipart requests configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields, default)]
pub struct Multipart {
    /// Maximum size of a whole multipart request in bytes; defaults to 32MiB
    pub max_upload_size: usize,
}

impl Default for Multipart {
    fn default() -> Self {
        Self {
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }
}
