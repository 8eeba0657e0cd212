//! # deferred-graphql
//!
//! Batched GraphQL execution over document stores.
//!
//! ## Features
//!
//! - **Deferred Execution** - resolvers return loader placeholders, fetches
//!   are batched per drain round instead of per field
//! - **DataLoader** - request-scoped batch loading for N+1 prevention
//! - **Cursor Pagination** - Relay-style connections with multi-column cursors
//! - **Entity Binding** - root, link and child-table resolvers for a document store
//!
//! ## Usage
//!
//! ```rust,no_run
//! use deferred_graphql::{Executor, Schema};
//!
//! # fn example(schema: Schema) {
//! let executor = Executor::new(schema);
//! let response = executor.execute("{ users(first: 10) { totalCount } }");
//! # }
//! ```

pub mod binding;
pub mod config;
pub mod dataloaders;
pub mod datasource;
pub mod deferred;
pub mod executor;
pub mod filter;
pub mod middleware;
pub mod pagination;
pub mod resolver;
pub mod schema;
pub mod types;
pub mod validation;

pub use binding::{Backend, Bindings, EntityBinding};
pub use config::{ExecutorConfig, PaginationConfig};
pub use dataloaders::{BatchLoader, CachePolicy, DataLoader, LazyValue, LoaderKey, LoaderRegistry};
pub use datasource::{AllowAll, DataSource, MemorySource, PermissionGate, Row};
pub use deferred::{Deferred, Scheduler, Step};
pub use executor::{execute, Executor, Response};
pub use filter::{Condition, Operator};
pub use middleware::{DisableIntrospection, Middleware};
pub use pagination::{
    Connection, ConnectionArgs, CursorCodec, CursorPaginator, Edge, PageInfo, PageRequest,
    SortDirection, SortSpec,
};
pub use resolver::{Arguments, Data, FieldInfo, FieldValue, Lazy, ResolverContext};
pub use schema::{Field, InputValue, MetaType, Object, Schema, SchemaBuilder, TypeRef};
pub use types::DateTime;

use thiserror::Error;

/// GraphQL errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphQLError {
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("{0}")]
    PaginationError(String),

    #[error("No permission for {}", permission_target(.kind, .key))]
    PermissionDenied { kind: String, key: Option<String> },

    #[error("Data source error: {0}")]
    DataSource(String),

    #[error("Batch load failed: {0}")]
    BatchLoad(String),

    #[error("{0}")]
    Resolver(String),

    #[error("Cannot return null for non-nullable field {parent_type}.{field}.")]
    NonNullViolation { parent_type: String, field: String },

    #[error("{0}")]
    InvalidValue(String),

    #[error("{0}")]
    Query(String),

    #[error("Schema error: {0}")]
    Schema(String),
}

fn permission_target(kind: &str, key: &Option<String>) -> String {
    match key {
        Some(key) => format!("{kind} {key}"),
        None => kind.to_string(),
    }
}

impl GraphQLError {
    /// Shorthand for resolver-raised errors.
    pub fn resolver(message: impl Into<String>) -> Self {
        Self::Resolver(message.into())
    }
}

/// Result type for GraphQL operations
pub type Result<T> = std::result::Result<T, GraphQLError>;
