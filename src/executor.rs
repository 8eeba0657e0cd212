//! Deferred execution
//!
//! Walks the selection tree like a standard GraphQL executor, with one
//! addition: a resolver may return a [`Lazy`] loader placeholder. Completion
//! of that subtree is suspended behind a [`Deferred`] value and the pair is
//! queued. Once the walk returns, the queue is drained in rounds:
//!
//! 1. every queued placeholder is fetched (each loader dispatches all of
//!    its pending keys in one batch on the first fetch),
//! 2. the loaders' cache policy is applied,
//! 3. every deferred value is settled, which resumes completion and may
//!    queue new placeholders for the next round.
//!
//! Fetching the whole round before settling any of it keeps keys registered
//! by resumed subtrees out of the current batch, so a chain of placeholders
//! of depth D resolves in exactly D rounds.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::convert::Infallible;
use std::rc::Rc;
use std::sync::Arc;

use async_graphql::parser::types::{
    Directive, DocumentOperations, ExecutableDocument, Field as FieldNode, FragmentDefinition,
    OperationDefinition, OperationType, Selection, SelectionSet,
};
use async_graphql::{Name, PathSegment, Pos, Positioned, Request, ServerError, Value, Variables};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::deferred::{join_all, Deferred, Scheduler, State, Step};
use crate::middleware::{Middleware, Next};
use crate::resolver::{Arguments, Data, FieldInfo, FieldValue, Lazy, RequestScope, ResolverContext};
use crate::schema::{AbstractType, Field, MetaType, Object, Schema, TypeRef};
use crate::types::serialize_enum;
use crate::validation;
use crate::GraphQLError;

/// Execution result: `data` is absent when execution never started.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ServerError>,
}

impl Response {
    fn from_error(error: ServerError) -> Self {
        Self {
            data: None,
            errors: vec![error],
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_json(self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Executes requests against a schema.
///
/// Cheap to share behind an `Arc`; every request gets its own loader
/// registry and deferred queue.
pub struct Executor {
    schema: Arc<Schema>,
    config: ExecutorConfig,
    data: Data,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Executor {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema: Arc::new(schema),
            config: ExecutorConfig::default(),
            data: Data::default(),
            middleware: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Make `value` available to every request through `ResolverContext::data`.
    pub fn data<D: Any + Send + Sync>(mut self, value: D) -> Self {
        self.data.insert(value);
        self
    }

    /// Append `middleware` to the chain. The first one added runs outermost.
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn execute(&self, request: impl Into<Request>) -> Response {
        self.execute_with_data(request, Data::default())
    }

    /// Execute with additional per-request data; it shadows executor data of
    /// the same type.
    pub fn execute_with_data(&self, request: impl Into<Request>, data: Data) -> Response {
        let request = request.into();
        run(
            &self.schema,
            &self.config,
            &self.data,
            &self.middleware,
            data,
            &request.query,
            &request.variables,
            request.operation_name.as_deref(),
        )
    }

    /// Run a request on tokio's blocking pool.
    pub async fn execute_blocking(self: Arc<Self>, request: impl Into<Request>, data: Data) -> Response {
        let request = request.into();
        match tokio::task::spawn_blocking(move || self.execute_with_data(request, data)).await {
            Ok(response) => response,
            Err(e) => Response::from_error(ServerError::new(format!("execution task failed: {}", e), None)),
        }
    }
}

/// Synchronous entry point with default configuration.
pub fn execute(schema: &Schema, query: &str, variables: Variables, operation_name: Option<&str>) -> Response {
    run(
        schema,
        &ExecutorConfig::default(),
        &Data::default(),
        &[],
        Data::default(),
        query,
        &variables,
        operation_name,
    )
}

#[tracing::instrument(level = "debug", skip_all, fields(operation = operation_name.unwrap_or("anonymous")))]
fn run(
    schema: &Schema,
    config: &ExecutorConfig,
    shared: &Data,
    middleware: &[Arc<dyn Middleware>],
    request_data: Data,
    query: &str,
    variables: &Variables,
    operation_name: Option<&str>,
) -> Response {
    let document = match async_graphql::parser::parse_query(query) {
        Ok(document) => document,
        Err(e) => return Response::from_error(e.into()),
    };
    if let Some(max_depth) = config.max_depth {
        if let Err(e) = validation::check_depth(&document, max_depth) {
            return Response::from_error(e);
        }
    }
    for layer in middleware {
        if let Err(e) = layer.check_document(&document) {
            return Response::from_error(e);
        }
    }
    let operation = match select_operation(&document, operation_name) {
        Ok(operation) => operation,
        Err(e) => return Response::from_error(ServerError::new(e.to_string(), None)),
    };
    let variables = match coerce_variables(&operation.node, variables) {
        Ok(variables) => variables,
        Err(e) => return Response::from_error(ServerError::new(e.to_string(), Some(operation.pos))),
    };

    let scope = RequestScope::new(config, shared, request_data);
    let context = ExecutionContext::new(schema, &document.fragments, &variables, &scope, middleware);
    context.execute_operation(operation)
}

fn select_operation<'d>(
    document: &'d ExecutableDocument,
    operation_name: Option<&str>,
) -> crate::Result<&'d Positioned<OperationDefinition>> {
    match (&document.operations, operation_name) {
        (DocumentOperations::Single(operation), _) => Ok(operation),
        (DocumentOperations::Multiple(operations), Some(name)) => operations
            .get(name)
            .ok_or_else(|| GraphQLError::Query(format!("Unknown operation named '{}'.", name))),
        (DocumentOperations::Multiple(operations), None) if operations.len() == 1 => operations
            .values()
            .next()
            .ok_or_else(|| GraphQLError::Query("Document contains no operation.".to_string())),
        (DocumentOperations::Multiple(_), None) => Err(GraphQLError::Query(
            "Must provide operation name if query contains multiple operations.".to_string(),
        )),
    }
}

fn coerce_variables(operation: &OperationDefinition, provided: &Variables) -> crate::Result<BTreeMap<Name, Value>> {
    let mut coerced = BTreeMap::new();
    for definition in &operation.variable_definitions {
        let definition = &definition.node;
        let name = &definition.name.node;
        let value = provided
            .get(name)
            .cloned()
            .or_else(|| definition.default_value.as_ref().map(|d| d.node.clone()));
        match value {
            Some(Value::Null) | None if !definition.var_type.node.nullable => {
                return Err(GraphQLError::Query(format!(
                    "Variable '${}' of required type '{}' was not provided.",
                    name, definition.var_type.node
                )))
            }
            Some(value) => {
                coerced.insert(name.clone(), value);
            }
            None => {}
        }
    }
    Ok(coerced)
}

/// A failed completion. `Raw` errors still need a location; `Located` ones
/// already carry the path of the field that produced them and are on their
/// way up to the nearest nullable parent.
#[derive(Debug, Clone)]
enum Failure {
    Raw(GraphQLError),
    Located(ServerError),
}

impl Failure {
    fn locate(self, pos: Option<Pos>, path: &[PathSegment]) -> ServerError {
        match self {
            Failure::Located(error) => error,
            Failure::Raw(error) => {
                let mut located = ServerError::new(error.to_string(), pos);
                located.path = path.to_vec();
                located
            }
        }
    }
}

impl From<GraphQLError> for Failure {
    fn from(error: GraphQLError) -> Self {
        Failure::Raw(error)
    }
}

type Completion<'a> = Result<Step<'a, Value, Failure>, Failure>;
type FieldNodes<'a> = IndexMap<String, Vec<&'a Positioned<FieldNode>>>;

/// A field set or list under construction. Once a non-null failure
/// discards it, errors from anywhere below it are dropped: its parent has
/// already been nulled and reported.
struct Branch {
    abandoned: Cell<bool>,
    parent: Option<Rc<Branch>>,
}

impl Branch {
    fn abandon(&self) {
        self.abandoned.set(true);
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned.get() || self.parent.as_ref().is_some_and(|parent| parent.is_abandoned())
    }
}

struct ExecState<'a> {
    scheduler: Scheduler<'a>,
    pending: RefCell<Vec<(Deferred<'a, Value, Failure>, Lazy)>>,
    errors: RefCell<Vec<ServerError>>,
}

/// Per-operation execution state. Clones share the queue and error list,
/// so continuations can carry their own handle.
#[derive(Clone)]
struct ExecutionContext<'a> {
    schema: &'a Schema,
    fragments: &'a HashMap<Name, Positioned<FragmentDefinition>>,
    variables: &'a BTreeMap<Name, Value>,
    scope: &'a RequestScope<'a>,
    middleware: &'a [Arc<dyn Middleware>],
    state: Rc<ExecState<'a>>,
    branch: Rc<Branch>,
}

impl<'a> ExecutionContext<'a> {
    fn new(
        schema: &'a Schema,
        fragments: &'a HashMap<Name, Positioned<FragmentDefinition>>,
        variables: &'a BTreeMap<Name, Value>,
        scope: &'a RequestScope<'a>,
        middleware: &'a [Arc<dyn Middleware>],
    ) -> Self {
        Self {
            schema,
            fragments,
            variables,
            scope,
            middleware,
            state: Rc::new(ExecState {
                scheduler: Scheduler::new(),
                pending: RefCell::new(Vec::new()),
                errors: RefCell::new(Vec::new()),
            }),
            branch: Rc::new(Branch {
                abandoned: Cell::new(false),
                parent: None,
            }),
        }
    }

    fn nested(&self) -> Self {
        Self {
            branch: Rc::new(Branch {
                abandoned: Cell::new(false),
                parent: Some(self.branch.clone()),
            }),
            ..self.clone()
        }
    }

    fn execute_operation(&self, operation: &'a Positioned<OperationDefinition>) -> Response {
        let operation_type = operation.node.ty;
        let Some(root_type) = self.schema.root_type(operation_type) else {
            let kind = match operation_type {
                OperationType::Query => "query",
                OperationType::Mutation => "mutation",
                OperationType::Subscription => "subscription",
            };
            return Response::from_error(ServerError::new(
                format!("Schema is not configured to execute {} operation.", kind),
                Some(operation.pos),
            ));
        };

        let mut fields = IndexMap::new();
        self.collect_fields(&root_type.name, &operation.node.selection_set.node, &mut fields, &mut HashSet::new());

        let root_value = Value::Object(IndexMap::new());
        let result = if operation_type == OperationType::Mutation {
            self.execute_fields_serially(root_type, &root_value, &[], fields)
        } else {
            self.execute_fields(root_type, &root_value, &[], fields)
        };
        self.drain();

        let data = match result {
            Ok(Step::Ready(value)) => value,
            Ok(Step::Chain(deferred)) => match deferred.state() {
                State::Resolved(value) => value,
                State::Rejected(failure) => {
                    self.record(failure.locate(None, &[]));
                    Value::Null
                }
                State::Pending => {
                    self.record(ServerError::new("operation finished with unresolved values", None));
                    Value::Null
                }
            },
            Err(failure) => {
                self.record(failure.locate(None, &[]));
                Value::Null
            }
        };

        Response {
            data: Some(data),
            errors: std::mem::take(&mut *self.state.errors.borrow_mut()),
        }
    }

    fn record(&self, error: ServerError) {
        if self.branch.is_abandoned() {
            debug!(message = %error.message, "dropping error below an abandoned branch");
            return;
        }
        self.state.errors.borrow_mut().push(error);
    }

    /// Fetch and settle queued placeholders until none are left.
    fn drain(&self) {
        let max_rounds = self.scope.config.max_drain_rounds;
        let mut round = 0;
        loop {
            self.state.scheduler.run_until_idle();
            let batch = std::mem::take(&mut *self.state.pending.borrow_mut());
            if batch.is_empty() {
                return;
            }
            round += 1;

            if round > max_rounds {
                warn!(round, pending = batch.len(), "drain round limit reached");
                let error = GraphQLError::Query(format!("Exceeded the limit of {} drain rounds.", max_rounds));
                for (deferred, _) in batch {
                    deferred.reject(Failure::Raw(error.clone()));
                }
                continue;
            }

            debug!(round, pending = batch.len(), "drain round");
            let (deferreds, lazies): (Vec<_>, Vec<_>) = batch.into_iter().unzip();
            let outcomes: Vec<_> = lazies.into_iter().map(Lazy::fetch).collect();
            // Before settling: keys loaded by resumed subtrees must find an
            // evicted cache and register for the next round's batch.
            self.scope.loaders.finish_round();
            for (deferred, outcome) in deferreds.into_iter().zip(outcomes) {
                match outcome {
                    Ok(value) => deferred.resolve(value),
                    Err(error) => deferred.reject(Failure::Raw(error)),
                }
            }
        }
    }

    fn execute_fields(
        &self,
        parent_type: &'a Object,
        source: &Value,
        path: &[PathSegment],
        fields: FieldNodes<'a>,
    ) -> Completion<'a> {
        let set = self.nested();
        let mut keys = Vec::with_capacity(fields.len());
        let mut steps = Vec::with_capacity(fields.len());
        let mut deferred = false;
        for (response_key, nodes) in fields {
            let field_path = child_path(path, PathSegment::Field(response_key.clone()));
            match set.execute_field(parent_type, source, nodes, field_path) {
                Ok(Some(step)) => {
                    deferred |= matches!(step, Step::Chain(_));
                    keys.push(Name::new(response_key));
                    steps.push(step);
                }
                Ok(None) => {}
                Err(failure) => {
                    set.branch.abandon();
                    return Err(failure);
                }
            }
        }

        if !deferred {
            let values = steps.into_iter().filter_map(|step| match step {
                Step::Ready(value) => Some(value),
                Step::Chain(_) => None,
            });
            return Ok(Step::Ready(Value::Object(keys.into_iter().zip(values).collect())));
        }
        let branch = set.branch.clone();
        Ok(Step::Chain(join_all(&self.state.scheduler, steps).then(
            move |values| Ok(Step::Ready(Value::Object(keys.into_iter().zip(values).collect()))),
            move |failure| {
                branch.abandon();
                Err(failure)
            },
        )))
    }

    /// Mutation root fields: one at a time, each fully drained before the
    /// next starts.
    fn execute_fields_serially(
        &self,
        parent_type: &'a Object,
        source: &Value,
        path: &[PathSegment],
        fields: FieldNodes<'a>,
    ) -> Completion<'a> {
        let mut results = IndexMap::with_capacity(fields.len());
        for (response_key, nodes) in fields {
            let field_path = child_path(path, PathSegment::Field(response_key.clone()));
            let Some(step) = self.execute_field(parent_type, source, nodes, field_path)? else {
                continue;
            };
            self.drain();
            let value = match step {
                Step::Ready(value) => value,
                Step::Chain(deferred) => match deferred.state() {
                    State::Resolved(value) => value,
                    State::Rejected(failure) => return Err(failure),
                    State::Pending => Value::Null,
                },
            };
            results.insert(Name::new(response_key), value);
        }
        Ok(Step::Ready(Value::Object(results)))
    }

    /// `None` when the field is not defined on the parent type; the error is
    /// recorded and siblings still execute.
    fn execute_field(
        &self,
        parent_type: &'a Object,
        source: &Value,
        nodes: Vec<&'a Positioned<FieldNode>>,
        path: Vec<PathSegment>,
    ) -> Result<Option<Step<'a, Value, Failure>>, Failure> {
        let Some(first) = nodes.first().copied() else {
            return Ok(None);
        };
        let field_name = first.node.name.node.as_str();
        if field_name == "__typename" {
            return Ok(Some(Step::Ready(Value::String(parent_type.name.clone()))));
        }
        let Some(field) = parent_type.fields.get(field_name) else {
            let mut error = ServerError::new(
                format!("Cannot query field '{}' on type '{}'.", field_name, parent_type.name),
                Some(first.pos),
            );
            error.path = path;
            self.record(error);
            return Ok(None);
        };

        let info = Rc::new(FieldInfo {
            field_name: &field.name,
            parent_type: &parent_type.name,
            return_type: &field.ty,
            path,
            nodes,
            fragments: self.fragments,
        });

        let completed = self
            .coerce_arguments(field, first)
            .and_then(|args| self.resolve_field(field, source, &args, &info))
            .map_err(Failure::Raw)
            .and_then(|result| self.complete_value(&field.ty, &info, &info.path, result));

        let step = match completed {
            Ok(Step::Chain(deferred)) => {
                let context = self.clone();
                let info = info.clone();
                Step::Chain(deferred.then(
                    |value| Ok(Step::Ready(value)),
                    move |failure| {
                        context
                            .handle_field_error(failure, info.return_type, info.position(), &info.path)
                            .map(Step::Ready)
                    },
                ))
            }
            Ok(ready) => ready,
            Err(failure) => Step::Ready(self.handle_field_error(failure, &field.ty, info.position(), &info.path)?),
        };
        Ok(Some(step))
    }

    fn resolve_field(
        &self,
        field: &Field,
        source: &Value,
        args: &Arguments,
        info: &FieldInfo<'a>,
    ) -> crate::Result<FieldValue> {
        let ctx = ResolverContext {
            parent: source,
            args,
            info,
            scope: self.scope,
        };
        Next::new(self.middleware, &|ctx: &ResolverContext<'_>| call_resolver(field, ctx)).run(&ctx)
    }

    /// Nullable positions swallow the error (recorded, value becomes
    /// `null`); non-null positions pass it up to the parent.
    fn handle_field_error(
        &self,
        failure: Failure,
        return_type: &TypeRef,
        pos: Option<Pos>,
        path: &[PathSegment],
    ) -> Result<Value, Failure> {
        let error = failure.locate(pos, path);
        if return_type.is_non_null() {
            return Err(Failure::Located(error));
        }
        self.record(error);
        Ok(Value::Null)
    }

    fn complete_value(
        &self,
        return_type: &'a TypeRef,
        info: &Rc<FieldInfo<'a>>,
        path: &[PathSegment],
        result: FieldValue,
    ) -> Completion<'a> {
        if let TypeRef::NonNull(inner) = return_type {
            let non_null = || {
                Failure::Raw(GraphQLError::NonNullViolation {
                    parent_type: info.parent_type.to_string(),
                    field: info.field_name.to_string(),
                })
            };
            return match self.complete_value(inner, info, path, result)? {
                Step::Ready(Value::Null) => Err(non_null()),
                Step::Ready(value) => Ok(Step::Ready(value)),
                Step::Chain(deferred) => {
                    let parent_type = info.parent_type.to_string();
                    let field = info.field_name.to_string();
                    Ok(Step::Chain(deferred.then(
                        move |value| match value {
                            Value::Null => Err(Failure::Raw(GraphQLError::NonNullViolation { parent_type, field })),
                            value => Ok(Step::Ready(value)),
                        },
                        Err,
                    )))
                }
            };
        }

        let result = match result {
            FieldValue::Value(Value::Null) => return Ok(Step::Ready(Value::Null)),
            FieldValue::Lazy(lazy) => return Ok(self.defer(return_type, info, path, lazy)),
            result => result,
        };

        match return_type {
            TypeRef::List(item_type) => self.complete_list_value(item_type, info, path, result),
            TypeRef::NonNull(inner) => self.complete_value(inner, info, path, result),
            TypeRef::Named(type_name) => {
                let value = match result {
                    FieldValue::Value(value) => value,
                    _ => {
                        return Err(Failure::Raw(GraphQLError::InvalidValue(format!(
                            "Expected a single value for field '{}.{}', found a list.",
                            info.parent_type, info.field_name
                        ))))
                    }
                };
                match self.schema.get_type(type_name) {
                    Some(MetaType::Scalar { kind, .. }) => Ok(Step::Ready(kind.serialize(&value)?)),
                    Some(MetaType::Enum { name, values }) => Ok(Step::Ready(serialize_enum(name, values, &value)?)),
                    Some(MetaType::Object(object)) => self.complete_object_value(object, info, path, &value),
                    Some(MetaType::Interface(abstract_type)) | Some(MetaType::Union(abstract_type)) => {
                        self.complete_abstract_value(abstract_type, info, path, &value)
                    }
                    Some(MetaType::InputObject { .. }) | None => Err(Failure::Raw(GraphQLError::Schema(format!(
                        "Cannot complete value of unexpected output type '{}'.",
                        type_name
                    )))),
                }
            }
        }
    }

    /// Queue `lazy` and return the completion of its eventual value.
    fn defer(
        &self,
        return_type: &'a TypeRef,
        info: &Rc<FieldInfo<'a>>,
        path: &[PathSegment],
        lazy: Lazy,
    ) -> Step<'a, Value, Failure> {
        let deferred = Deferred::new(&self.state.scheduler);
        self.state.pending.borrow_mut().push((deferred.clone(), lazy));

        let context = self.clone();
        let info = info.clone();
        let path = path.to_vec();
        Step::Chain(deferred.then(
            move |value| context.complete_value(return_type, &info, &path, FieldValue::Value(value)),
            Err,
        ))
    }

    fn complete_list_value(
        &self,
        item_type: &'a TypeRef,
        info: &Rc<FieldInfo<'a>>,
        path: &[PathSegment],
        result: FieldValue,
    ) -> Completion<'a> {
        let items = match result {
            FieldValue::List(items) => items,
            FieldValue::Value(Value::List(values)) => values.into_iter().map(FieldValue::Value).collect(),
            _ => {
                return Err(Failure::Raw(GraphQLError::InvalidValue(format!(
                    "Expected Iterable, but did not find one for field '{}.{}'.",
                    info.parent_type, info.field_name
                ))))
            }
        };

        let set = self.nested();
        let mut steps = Vec::with_capacity(items.len());
        let mut deferred = false;
        for (index, item) in items.into_iter().enumerate() {
            let item_path = child_path(path, PathSegment::Index(index));
            let step = match set.complete_value(item_type, info, &item_path, item) {
                Ok(Step::Chain(pending)) => {
                    deferred = true;
                    let context = set.clone();
                    let pos = info.position();
                    Step::Chain(pending.then(
                        |value| Ok(Step::Ready(value)),
                        move |failure| {
                            context
                                .handle_field_error(failure, item_type, pos, &item_path)
                                .map(Step::Ready)
                        },
                    ))
                }
                Ok(ready) => ready,
                Err(failure) => match set.handle_field_error(failure, item_type, info.position(), &item_path) {
                    Ok(value) => Step::Ready(value),
                    Err(failure) => {
                        set.branch.abandon();
                        return Err(failure);
                    }
                },
            };
            steps.push(step);
        }

        if !deferred {
            let values = steps
                .into_iter()
                .filter_map(|step| match step {
                    Step::Ready(value) => Some(value),
                    Step::Chain(_) => None,
                })
                .collect();
            return Ok(Step::Ready(Value::List(values)));
        }
        let branch = set.branch.clone();
        Ok(Step::Chain(join_all(&self.state.scheduler, steps).then(
            |values| Ok(Step::Ready(Value::List(values))),
            move |failure| {
                branch.abandon();
                Err(failure)
            },
        )))
    }

    fn complete_abstract_value(
        &self,
        abstract_type: &'a AbstractType,
        info: &Rc<FieldInfo<'a>>,
        path: &[PathSegment],
        value: &Value,
    ) -> Completion<'a> {
        let runtime_type = match &abstract_type.resolve_type {
            Some(resolve_type) => resolve_type(value),
            None => match value {
                Value::Object(map) => match map.get("__typename") {
                    Some(Value::String(name)) => Some(name.clone()),
                    _ => None,
                },
                _ => None,
            },
        };
        let Some(runtime_type) = runtime_type else {
            return Err(Failure::Raw(GraphQLError::InvalidValue(format!(
                "Abstract type '{}' must resolve to an Object type at runtime for field '{}.{}'.",
                abstract_type.name, info.parent_type, info.field_name
            ))));
        };
        let object = self
            .schema
            .object(&runtime_type)
            .filter(|_| self.schema.is_possible_type(&abstract_type.name, &runtime_type))
            .ok_or_else(|| {
                Failure::Raw(GraphQLError::InvalidValue(format!(
                    "Runtime Object type '{}' is not a possible type for '{}'.",
                    runtime_type, abstract_type.name
                )))
            })?;
        self.complete_object_value(object, info, path, value)
    }

    fn complete_object_value(
        &self,
        object: &'a Object,
        info: &Rc<FieldInfo<'a>>,
        path: &[PathSegment],
        value: &Value,
    ) -> Completion<'a> {
        let mut fields = IndexMap::new();
        let mut visited = HashSet::new();
        for node in &info.nodes {
            self.collect_fields(&object.name, &node.node.selection_set.node, &mut fields, &mut visited);
        }
        self.execute_fields(object, value, path, fields)
    }

    fn collect_fields(
        &self,
        type_name: &str,
        selection_set: &'a SelectionSet,
        fields: &mut FieldNodes<'a>,
        visited: &mut HashSet<&'a str>,
    ) {
        for selection in &selection_set.items {
            match &selection.node {
                Selection::Field(field) => {
                    if !self.should_include(&field.node.directives) {
                        continue;
                    }
                    fields
                        .entry(field.node.response_key().node.to_string())
                        .or_default()
                        .push(field);
                }
                Selection::FragmentSpread(spread) => {
                    if !self.should_include(&spread.node.directives) {
                        continue;
                    }
                    let name = spread.node.fragment_name.node.as_str();
                    if !visited.insert(name) {
                        continue;
                    }
                    let Some(fragment) = self.fragments.get(name) else {
                        continue;
                    };
                    if !self.type_condition_applies(type_name, &fragment.node.type_condition.node.on.node) {
                        continue;
                    }
                    self.collect_fields(type_name, &fragment.node.selection_set.node, fields, visited);
                }
                Selection::InlineFragment(inline) => {
                    if !self.should_include(&inline.node.directives) {
                        continue;
                    }
                    if let Some(condition) = &inline.node.type_condition {
                        if !self.type_condition_applies(type_name, &condition.node.on.node) {
                            continue;
                        }
                    }
                    self.collect_fields(type_name, &inline.node.selection_set.node, fields, visited);
                }
            }
        }
    }

    fn type_condition_applies(&self, type_name: &str, condition: &str) -> bool {
        condition == type_name || self.schema.is_possible_type(condition, type_name)
    }

    fn should_include(&self, directives: &[Positioned<Directive>]) -> bool {
        for directive in directives {
            let name = directive.node.name.node.as_str();
            if name != "skip" && name != "include" {
                continue;
            }
            let condition = directive
                .node
                .get_argument("if")
                .map(|value| value.node.clone().into_const_with(self.variable_lookup()));
            let flag = matches!(condition, Some(Ok(Value::Boolean(true))));
            if (name == "skip" && flag) || (name == "include" && !flag) {
                return false;
            }
        }
        true
    }

    fn variable_lookup(&self) -> impl FnMut(Name) -> Result<Value, Infallible> + '_ {
        |name| Ok(self.variables.get(&name).cloned().unwrap_or(Value::Null))
    }

    fn coerce_arguments(&self, field: &Field, node: &Positioned<FieldNode>) -> crate::Result<Arguments> {
        let mut args = IndexMap::new();
        for (name, definition) in &field.args {
            let value = match node.node.get_argument(name) {
                Some(value) => match value.node.clone().into_const_with(self.variable_lookup()) {
                    Ok(value) => Some(value),
                    Err(never) => match never {},
                },
                None => definition.default_value.clone(),
            };
            match value {
                Some(Value::Null) if definition.ty.is_non_null() => {
                    return Err(GraphQLError::InvalidValue(format!(
                        "Argument '{}' of non-null type '{}' must not be null.",
                        name, definition.ty
                    )))
                }
                Some(value) => {
                    args.insert(Name::new(name), value);
                }
                None if definition.ty.is_non_null() => {
                    return Err(GraphQLError::InvalidValue(format!(
                        "Argument '{}' of required type '{}' was not provided.",
                        name, definition.ty
                    )))
                }
                None => {}
            }
        }
        Ok(Arguments::new(args))
    }
}

fn call_resolver(field: &Field, ctx: &ResolverContext<'_>) -> crate::Result<FieldValue> {
    match &field.resolver {
        Some(resolver) => resolver(ctx),
        None => Ok(match ctx.parent {
            Value::Object(map) => map.get(field.name.as_str()).cloned().unwrap_or(Value::Null).into(),
            _ => FieldValue::null(),
        }),
    }
}

fn child_path(path: &[PathSegment], segment: PathSegment) -> Vec<PathSegment> {
    let mut child = Vec::with_capacity(path.len() + 1);
    child.extend_from_slice(path);
    child.push(segment);
    child
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataloaders::{DataLoader, LoaderKey};
    use crate::middleware::{DisableIntrospection, Middleware, Next};
    use crate::schema::InputValue;
    use crate::CachePolicy;
    use std::sync::Mutex;

    /// Shared fixture store: user key -> (name, best friend key).
    #[derive(Default)]
    struct Store {
        users: Mutex<HashMap<String, (String, Option<String>)>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl Store {
        fn seeded() -> Arc<Self> {
            let store = Store::default();
            {
                let mut users = store.users.lock().unwrap();
                users.insert("X".into(), ("Xavier".into(), Some("Y".into())));
                users.insert("Y".into(), ("Yara".into(), Some("Z".into())));
                users.insert("Z".into(), ("Zed".into(), None));
            }
            Arc::new(store)
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }

        fn load(&self, keys: &[String]) -> crate::Result<Vec<Value>> {
            self.calls.lock().unwrap().push(keys.to_vec());
            let users = self.users.lock().unwrap();
            if keys.iter().any(|k| k == "BROKEN") {
                return Err(GraphQLError::DataSource("store offline".into()));
            }
            Ok(keys
                .iter()
                .map(|key| match users.get(key) {
                    Some((name, friend)) => {
                        let mut row = IndexMap::new();
                        row.insert(Name::new("key"), Value::from(key.as_str()));
                        row.insert(Name::new("name"), Value::from(name.as_str()));
                        row.insert(
                            Name::new("friend"),
                            friend.as_deref().map(Value::from).unwrap_or(Value::Null),
                        );
                        Value::Object(row)
                    }
                    None => Value::Null,
                })
                .collect())
        }
    }

    fn user_loader(ctx: &ResolverContext<'_>) -> crate::Result<DataLoader<String, Value>> {
        let store = ctx.data::<Arc<Store>>()?.clone();
        ctx.loader(LoaderKey::new("User"), move || {
            DataLoader::from_fn(move |keys: &[String]| store.load(keys))
        })
    }

    fn load_user(ctx: &ResolverContext<'_>, key: Option<String>) -> crate::Result<FieldValue> {
        match key {
            Some(key) => Ok(user_loader(ctx)?.load(key).into()),
            None => Ok(FieldValue::null()),
        }
    }

    fn schema() -> Schema {
        let key_arg = || InputValue::new("key", TypeRef::named_nn("ID"));
        Schema::build("Query")
            .mutation("Mutation")
            .register(
                Object::new("Query")
                    .field(
                        Field::new("user", TypeRef::named("User"))
                            .argument(key_arg())
                            .resolver(|ctx| load_user(ctx, ctx.args.string("key")?)),
                    )
                    .field(
                        Field::new("strictUser", TypeRef::named_nn("User"))
                            .argument(key_arg())
                            .resolver(|ctx| load_user(ctx, ctx.args.string("key")?)),
                    )
                    .field(
                        Field::new("users", TypeRef::named_list("User"))
                            .argument(InputValue::new("keys", TypeRef::named_nn_list_nn("ID")))
                            .resolver(|ctx| {
                                let loader = user_loader(ctx)?;
                                let keys = match ctx.args.get("keys") {
                                    Some(Value::List(keys)) => keys.clone(),
                                    _ => Vec::new(),
                                };
                                Ok(FieldValue::list(keys.into_iter().map(|key| match key {
                                    Value::String(key) => loader.load(key).into(),
                                    _ => FieldValue::null(),
                                })))
                            }),
                    )
                    .field(
                        Field::new("greeting", TypeRef::named_nn("String"))
                            .argument(InputValue::new("name", TypeRef::named("String")).default_value("world"))
                            .resolver(|ctx| {
                                let name = ctx.args.string("name")?.unwrap_or_default();
                                Ok(FieldValue::value(format!("hello {}", name)))
                            }),
                    )
                    .field(
                        Field::new("failing", TypeRef::named("String"))
                            .resolver(|_ctx| Err(GraphQLError::resolver("resolver exploded"))),
                    )
                    .field(
                        Field::new("strictFailing", TypeRef::named_nn("String"))
                            .resolver(|_ctx| Err(GraphQLError::resolver("strict resolver exploded"))),
                    )
                    .field(Field::new("node", TypeRef::named("Node")).resolver(|_ctx| {
                        let mut row = IndexMap::new();
                        row.insert(Name::new("__typename"), Value::from("User"));
                        row.insert(Name::new("key"), Value::from("X"));
                        row.insert(Name::new("name"), Value::from("Xavier"));
                        Ok(FieldValue::value(Value::Object(row)))
                    })),
            )
            .register(
                Object::new("Mutation").field(
                    Field::new("rename", TypeRef::named("User"))
                        .argument(key_arg())
                        .argument(InputValue::new("name", TypeRef::named_nn("String")))
                        .resolver(|ctx| {
                            let store = ctx.data::<Arc<Store>>()?;
                            let key = ctx.args.string("key")?.unwrap_or_default();
                            let name = ctx.args.string("name")?.unwrap_or_default();
                            if let Some(user) = store.users.lock().unwrap().get_mut(&key) {
                                user.0 = name;
                            }
                            load_user(ctx, Some(key))
                        }),
                ),
            )
            .register(MetaType::Interface(
                crate::schema::AbstractType::new("Node").field(Field::new("key", TypeRef::named_nn("ID"))),
            ))
            .register(
                Object::new("User")
                    .implement("Node")
                    .field(Field::new("key", TypeRef::named_nn("ID")))
                    .field(Field::new("name", TypeRef::named_nn("String")))
                    .field(Field::new("bestFriend", TypeRef::named("User")).resolver(|ctx| {
                        let key = match ctx.parent_field("friend") {
                            Value::String(key) => Some(key.clone()),
                            _ => None,
                        };
                        load_user(ctx, key)
                    }))
                    .field(Field::new("strictFriend", TypeRef::named_nn("User")).resolver(|ctx| {
                        let key = match ctx.parent_field("friend") {
                            Value::String(key) => Some(key.clone()),
                            _ => None,
                        };
                        load_user(ctx, key)
                    }))
                    .field(
                        Field::new("rival", TypeRef::named("User"))
                            .resolver(|ctx| load_user(ctx, Some("BROKEN".to_string()))),
                    ),
            )
            .finish()
            .unwrap()
    }

    fn executor(store: &Arc<Store>) -> Executor {
        Executor::new(schema()).data(store.clone())
    }

    fn json(response: Response) -> serde_json::Value {
        response.into_json().unwrap()
    }

    #[test]
    fn test_sibling_loads_are_batched() {
        let store = Store::seeded();
        let response = executor(&store).execute(r#"{ a: user(key: "X") { name } b: user(key: "Y") { name } }"#);

        assert!(response.is_ok(), "{:?}", response.errors);
        assert_eq!(
            json(response),
            serde_json::json!({ "data": { "a": { "name": "Xavier" }, "b": { "name": "Yara" } } })
        );
        let calls = store.calls();
        assert_eq!(calls.len(), 1);
        let mut keys = calls[0].clone();
        keys.sort();
        assert_eq!(keys, vec!["X".to_string(), "Y".to_string()]);
    }

    #[test]
    fn test_nested_loads_take_one_round_per_level() {
        let store = Store::seeded();
        let response = executor(&store).execute(
            r#"{ users(keys: ["X", "Y"]) { name bestFriend { name bestFriend { name bestFriend { name } } } } }"#,
        );

        assert!(response.is_ok(), "{:?}", response.errors);
        assert_eq!(
            json(response),
            serde_json::json!({ "data": { "users": [
                { "name": "Xavier", "bestFriend": { "name": "Yara", "bestFriend": { "name": "Zed", "bestFriend": null } } },
                { "name": "Yara", "bestFriend": { "name": "Zed", "bestFriend": null } },
            ] } })
        );
        // Round 1: X, Y. Round 2: Y, Z. Round 3: Z (X's grandchild).
        assert_eq!(store.calls().len(), 3);
    }

    #[test]
    fn test_batch_failure_is_isolated_to_its_fields() {
        let store = Store::seeded();
        let response = executor(&store).execute(r#"{ user(key: "BROKEN") { name } greeting }"#);

        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "Data source error: store offline");
        assert_eq!(response.errors[0].path, vec![PathSegment::Field("user".into())]);
        assert_eq!(
            response.data.unwrap().into_json().unwrap(),
            serde_json::json!({ "user": null, "greeting": "hello world" })
        );
    }

    #[test]
    fn test_batch_failure_fails_every_key_in_the_wave() {
        let store = Store::seeded();
        let response = executor(&store).execute(r#"{ a: user(key: "X") { name } b: user(key: "BROKEN") { name } }"#);

        assert_eq!(response.errors.len(), 2);
        assert_eq!(
            response.data.unwrap().into_json().unwrap(),
            serde_json::json!({ "a": null, "b": null })
        );
    }

    #[test]
    fn test_resolver_error_keeps_siblings() {
        let store = Store::seeded();
        let response = executor(&store).execute("{ failing greeting(name: \"you\") }");

        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "resolver exploded");
        assert_eq!(response.errors[0].locations.len(), 1);
        assert_eq!(
            response.data.unwrap().into_json().unwrap(),
            serde_json::json!({ "failing": null, "greeting": "hello you" })
        );
    }

    #[test]
    fn test_deferred_null_under_non_null_propagates() {
        let store = Store::seeded();
        let response =
            executor(&store).execute(r#"{ user(key: "Y") { name strictFriend { name strictFriend { name } } } }"#);

        // Z has no friend: Z.strictFriend fails, Y.strictFriend (non-null)
        // becomes null too, so the nearest nullable field is `user`.
        assert_eq!(response.errors.len(), 1);
        assert_eq!(
            response.errors[0].message,
            "Cannot return null for non-nullable field User.strictFriend."
        );
        assert_eq!(
            response.errors[0].path,
            vec![
                PathSegment::Field("user".into()),
                PathSegment::Field("strictFriend".into()),
                PathSegment::Field("strictFriend".into()),
            ]
        );
        assert_eq!(response.data.unwrap().into_json().unwrap(), serde_json::json!({ "user": null }));
    }

    #[test]
    fn test_non_null_root_field_nulls_data() {
        let store = Store::seeded();
        let response = executor(&store).execute(r#"{ strictUser(key: "nobody") { name } greeting }"#);

        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.data, Some(Value::Null));
    }

    #[test]
    fn test_fragments_directives_and_typename() {
        let store = Store::seeded();
        let query = r#"
            query Q($withName: Boolean!) {
                user(key: "X") { ...UserFields key @skip(if: true) }
                node { __typename ... on User { name @include(if: $withName) } }
            }
            fragment UserFields on User { __typename name }
        "#;
        let variables = Variables::from_json(serde_json::json!({ "withName": false }));
        let response = executor(&store).execute(Request::new(query).variables(variables));

        assert!(response.is_ok(), "{:?}", response.errors);
        assert_eq!(
            json(response),
            serde_json::json!({ "data": {
                "user": { "__typename": "User", "name": "Xavier" },
                "node": { "__typename": "User" },
            } })
        );
    }

    #[test]
    fn test_variables_and_defaults() {
        let store = Store::seeded();
        let executor = executor(&store);

        let query = "query Greet($name: String = \"there\") { greeting(name: $name) }";
        let response = executor.execute(query);
        assert_eq!(
            response.data.unwrap().into_json().unwrap(),
            serde_json::json!({ "greeting": "hello there" })
        );

        let response = executor.execute("query Find($key: ID!) { user(key: $key) { name } }");
        assert!(response.data.is_none());
        assert_eq!(
            response.errors[0].message,
            "Variable '$key' of required type 'ID!' was not provided."
        );
    }

    #[test]
    fn test_missing_required_argument_is_a_field_error() {
        let store = Store::seeded();
        let response = executor(&store).execute("{ user { name } }");
        assert_eq!(response.errors.len(), 1);
        assert_eq!(
            response.errors[0].message,
            "Argument 'key' of required type 'ID!' was not provided."
        );
        assert_eq!(response.data.unwrap().into_json().unwrap(), serde_json::json!({ "user": null }));
    }

    #[test]
    fn test_mutations_read_their_own_writes() {
        let store = Store::seeded();
        let response = executor(&store).execute(
            r#"mutation { first: rename(key: "X", name: "Xena") { name } second: rename(key: "X", name: "Xia") { name } }"#,
        );

        assert!(response.is_ok(), "{:?}", response.errors);
        assert_eq!(
            response.data.unwrap().into_json().unwrap(),
            serde_json::json!({ "first": { "name": "Xena" }, "second": { "name": "Xia" } })
        );
        assert_eq!(store.calls().len(), 2);
    }

    #[test]
    fn test_per_request_cache_keeps_first_read() {
        let store = Store::seeded();
        let executor = executor(&store).with_config(ExecutorConfig::default().cache_policy(CachePolicy::PerRequest));
        let response = executor.execute(
            r#"mutation { first: rename(key: "X", name: "Xena") { name } second: rename(key: "X", name: "Xia") { name } }"#,
        );

        assert_eq!(
            response.data.unwrap().into_json().unwrap(),
            serde_json::json!({ "first": { "name": "Xena" }, "second": { "name": "Xena" } })
        );
        assert_eq!(store.calls().len(), 1);
    }

    #[test]
    fn test_operation_selection() {
        let store = Store::seeded();
        let executor = executor(&store);
        let query = "query A { greeting } query B { greeting(name: \"b\") }";

        let response = executor.execute(Request::new(query).operation_name("B"));
        assert_eq!(
            response.data.unwrap().into_json().unwrap(),
            serde_json::json!({ "greeting": "hello b" })
        );

        let response = executor.execute(query);
        assert!(response.data.is_none());
        assert_eq!(
            response.errors[0].message,
            "Must provide operation name if query contains multiple operations."
        );

        let response = executor.execute(Request::new(query).operation_name("C"));
        assert_eq!(response.errors[0].message, "Unknown operation named 'C'.");
    }

    #[test]
    fn test_parse_and_depth_errors_have_no_data() {
        let store = Store::seeded();
        let response = executor(&store).execute("{ user(key: ");
        assert!(response.data.is_none());
        assert_eq!(response.errors.len(), 1);

        let limited = executor(&store).with_config(ExecutorConfig::default().max_depth(1));
        let response = limited.execute(r#"{ user(key: "X") { bestFriend { name } } }"#);
        assert!(response.data.is_none());
        assert_eq!(
            response.errors[0].message,
            "'anonymous' exceeds maximum operation depth of 1."
        );
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_reloads_after_round_share_one_batch() {
        let store = Store::seeded();
        let response = executor(&store).execute(
            r#"{ users(keys: ["X", "Y"]) { bestFriend { name } } y: user(key: "Y") { name } z: user(key: "Z") { name } }"#,
        );

        assert!(response.is_ok(), "{:?}", response.errors);
        assert_eq!(
            response.data.unwrap().into_json().unwrap(),
            serde_json::json!({
                "users": [{ "bestFriend": { "name": "Yara" } }, { "bestFriend": { "name": "Zed" } }],
                "y": { "name": "Yara" },
                "z": { "name": "Zed" },
            })
        );
        // Y and Z were fetched in round 1 and evicted; their second loads
        // still go out together.
        let calls: Vec<Vec<String>> = store
            .calls()
            .into_iter()
            .map(|mut keys| {
                keys.sort();
                keys
            })
            .collect();
        assert_eq!(
            calls,
            vec![
                vec!["X".to_string(), "Y".to_string(), "Z".to_string()],
                vec!["Y".to_string(), "Z".to_string()],
            ]
        );
    }

    #[test]
    fn test_unknown_fields_are_reported() {
        let store = Store::seeded();
        let response = executor(&store).execute(r#"{ bogus greeting user(key: "X") { nope name } }"#);

        assert_eq!(
            response.data.clone().unwrap().into_json().unwrap(),
            serde_json::json!({ "greeting": "hello world", "user": { "name": "Xavier" } })
        );
        let messages: Vec<_> = response.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Cannot query field 'bogus' on type 'Query'.",
                "Cannot query field 'nope' on type 'User'.",
            ]
        );
        assert_eq!(response.errors[0].path, vec![PathSegment::Field("bogus".into())]);
        assert_eq!(response.errors[0].locations.len(), 1);
        assert_eq!(
            response.errors[1].path,
            vec![PathSegment::Field("user".into()), PathSegment::Field("nope".into())]
        );
    }

    #[test]
    fn test_introspection_without_support_is_an_unknown_field() {
        let store = Store::seeded();
        let response = executor(&store).execute("{ __schema { queryType { name } } greeting }");
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "Cannot query field '__schema' on type 'Query'.");
        assert_eq!(
            response.data.unwrap().into_json().unwrap(),
            serde_json::json!({ "greeting": "hello world" })
        );
    }

    #[test]
    fn test_disable_introspection_rejects_before_execution() {
        let store = Store::seeded();
        let executor = executor(&store).middleware(DisableIntrospection);

        let response = executor.execute(r#"{ user(key: "X") { name } __type(name: "User") { name } }"#);
        assert!(response.data.is_none());
        assert_eq!(
            response.errors[0].message,
            "GraphQL introspection has been disabled, but the requested query contained the field '__type'."
        );
        assert!(store.calls().is_empty());

        let response = executor.execute(r#"{ user(key: "X") { __typename name } }"#);
        assert!(response.is_ok(), "{:?}", response.errors);
    }

    /// Appends its tag to every string a resolver produces.
    struct Tag(&'static str);

    impl Middleware for Tag {
        fn resolve(&self, ctx: &ResolverContext<'_>, next: Next<'_>) -> crate::Result<FieldValue> {
            Ok(match next.run(ctx)? {
                FieldValue::Value(Value::String(s)) => FieldValue::value(format!("{}{}", s, self.0)),
                other => other,
            })
        }
    }

    struct Deny(&'static str);

    impl Middleware for Deny {
        fn resolve(&self, ctx: &ResolverContext<'_>, next: Next<'_>) -> crate::Result<FieldValue> {
            if ctx.info.field_name == self.0 {
                return Err(GraphQLError::resolver(format!("{} is not available", self.0)));
            }
            next.run(ctx)
        }
    }

    #[test]
    fn test_middleware_wraps_resolvers_outermost_first() {
        let store = Store::seeded();
        let executor = executor(&store).middleware(Tag("-outer")).middleware(Tag("-inner"));
        let response = executor.execute(r#"{ greeting user(key: "Z") { name } }"#);

        assert!(response.is_ok(), "{:?}", response.errors);
        // `name` has no resolver of its own and still goes through the chain.
        assert_eq!(
            response.data.unwrap().into_json().unwrap(),
            serde_json::json!({
                "greeting": "hello world-inner-outer",
                "user": { "name": "Zed-inner-outer" },
            })
        );
    }

    #[test]
    fn test_middleware_can_short_circuit_a_field() {
        let store = Store::seeded();
        let executor = executor(&store).middleware(Deny("user"));
        let response = executor.execute(r#"{ user(key: "X") { name } greeting }"#);

        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "user is not available");
        assert_eq!(
            response.data.unwrap().into_json().unwrap(),
            serde_json::json!({ "user": null, "greeting": "hello world" })
        );
        assert!(store.calls().is_empty());
    }

    /// Remembers the selection below every field that has one.
    #[derive(Default)]
    struct Selections(Mutex<Vec<(String, Vec<String>)>>);

    impl Middleware for Arc<Selections> {
        fn resolve(&self, ctx: &ResolverContext<'_>, next: Next<'_>) -> crate::Result<FieldValue> {
            let selected = ctx.info.selected_fields();
            if !selected.is_empty() {
                self.0.lock().unwrap().push((
                    ctx.info.path_key(),
                    selected.into_iter().map(str::to_string).collect(),
                ));
            }
            next.run(ctx)
        }
    }

    #[test]
    fn test_field_info_exposes_selection_and_path_key() {
        let store = Store::seeded();
        let selections = Arc::new(Selections::default());
        let executor = executor(&store).middleware(selections.clone());
        let response = executor.execute(
            r#"{ users(keys: ["X", "Y"]) { ...Named bestFriend { key name } } } fragment Named on User { name key }"#,
        );
        assert!(response.is_ok(), "{:?}", response.errors);

        let seen = selections.0.lock().unwrap().clone();
        let owned = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        assert_eq!(
            seen,
            vec![
                ("users".to_string(), owned(&["name", "key", "bestFriend"])),
                ("users.bestFriend".to_string(), owned(&["key", "name"])),
                ("users.bestFriend".to_string(), owned(&["key", "name"])),
            ]
        );
    }

    #[test]
    fn test_sibling_of_failed_non_null_field_reports_nothing() {
        let store = Store::seeded();
        let response = executor(&store).execute(r#"{ user(key: "BROKEN") { name } strictFailing }"#);

        // `user` was already queued when its sibling nulled `data`; its
        // batch still runs, but its failure has no place in the response.
        assert_eq!(response.data, Some(Value::Null));
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "strict resolver exploded");
        assert_eq!(response.errors[0].path, vec![PathSegment::Field("strictFailing".into())]);
        assert_eq!(store.calls(), vec![vec!["BROKEN".to_string()]]);
    }

    #[test]
    fn test_abandoned_subtree_drops_later_errors() {
        let store = Store::seeded();
        let response = executor(&store).execute(
            r#"{ user(key: "Y") { strictFriend { strictFriend { name } } bestFriend { rival { name } } } }"#,
        );

        // Round 2 nulls `user` through the non-null chain; the rival batch
        // fails in round 3 below the discarded object.
        assert_eq!(response.errors.len(), 1);
        assert_eq!(
            response.errors[0].message,
            "Cannot return null for non-nullable field User.strictFriend."
        );
        assert_eq!(response.data.unwrap().into_json().unwrap(), serde_json::json!({ "user": null }));
        assert_eq!(store.calls().len(), 3);
    }

    #[test]
    fn test_free_function_entry_point() {
        let response = execute(&schema(), "{ greeting }", Variables::default(), None);
        assert_eq!(
            json(response),
            serde_json::json!({ "data": { "greeting": "hello world" } })
        );
    }

    #[tokio::test]
    async fn test_execute_blocking() {
        let store = Store::seeded();
        let executor = Arc::new(executor(&store));
        let response = executor
            .execute_blocking(r#"{ user(key: "Z") { name } }"#, Data::default())
            .await;
        assert_eq!(
            json(response),
            serde_json::json!({ "data": { "user": { "name": "Zed" } } })
        );
    }

    #[test]
    fn test_request_data_on_blocking_pool() {
        let store = Store::seeded();
        let executor = Arc::new(Executor::new(schema()));
        let data = Data::default().with(store.clone());
        let response = tokio_test::block_on(executor.execute_blocking(r#"{ user(key: "Y") { name } }"#, data));
        assert_eq!(
            json(response),
            serde_json::json!({ "data": { "user": { "name": "Yara" } } })
        );
        assert_eq!(store.calls(), vec![vec!["Y".to_string()]]);
    }
}
