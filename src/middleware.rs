//! Resolver middleware
//!
//! Middleware registered on an [`Executor`](crate::Executor) wraps every
//! field resolution, outermost first, and can reject a document before
//! execution starts.
//!
//! ```rust,no_run
//! use deferred_graphql::middleware::{DisableIntrospection, Middleware, Next};
//! use deferred_graphql::{Executor, FieldValue, ResolverContext, Schema};
//!
//! struct Trace;
//!
//! impl Middleware for Trace {
//!     fn resolve(&self, ctx: &ResolverContext<'_>, next: Next<'_>) -> deferred_graphql::Result<FieldValue> {
//!         tracing::trace!(field = ctx.info.field_name, "resolving");
//!         next.run(ctx)
//!     }
//! }
//!
//! # fn example(schema: Schema) {
//! let executor = Executor::new(schema).middleware(DisableIntrospection).middleware(Trace);
//! # }
//! ```

use std::sync::Arc;

use async_graphql::parser::types::ExecutableDocument;
use async_graphql::ServerError;

use crate::resolver::{FieldValue, ResolverContext};
use crate::{validation, Result};

pub trait Middleware: Send + Sync {
    /// Runs once per request, after parsing. An error rejects the request.
    fn check_document(&self, _document: &ExecutableDocument) -> std::result::Result<(), ServerError> {
        Ok(())
    }

    /// Runs for every field that has a schema definition. Call `next.run`
    /// to continue with the rest of the chain and the field's resolver.
    fn resolve(&self, ctx: &ResolverContext<'_>, next: Next<'_>) -> Result<FieldValue> {
        next.run(ctx)
    }
}

type Resolve<'n> = dyn Fn(&ResolverContext<'_>) -> Result<FieldValue> + 'n;

/// The remainder of the middleware chain for one field.
pub struct Next<'n> {
    chain: &'n [Arc<dyn Middleware>],
    resolver: &'n Resolve<'n>,
}

impl<'n> Next<'n> {
    pub(crate) fn new(chain: &'n [Arc<dyn Middleware>], resolver: &'n Resolve<'n>) -> Self {
        Self { chain, resolver }
    }

    pub fn run(self, ctx: &ResolverContext<'_>) -> Result<FieldValue> {
        match self.chain.split_first() {
            Some((first, rest)) => first.resolve(
                ctx,
                Next {
                    chain: rest,
                    resolver: self.resolver,
                },
            ),
            None => (self.resolver)(ctx),
        }
    }
}

/// Rejects any request that selects `__schema` or `__type`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisableIntrospection;

impl Middleware for DisableIntrospection {
    fn check_document(&self, document: &ExecutableDocument) -> std::result::Result<(), ServerError> {
        validation::check_introspection(document)
    }
}
