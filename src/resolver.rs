//! What resolvers receive and what they may return.

use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use async_graphql::parser::types::{Field as FieldNode, FragmentDefinition, Selection, SelectionSet};
use async_graphql::{Name, PathSegment, Pos, Positioned, Value};
use indexmap::IndexMap;

use crate::config::ExecutorConfig;
use crate::dataloaders::{DataLoader, LazyValue, LoaderKey, LoaderRegistry};
use crate::schema::TypeRef;
use crate::{GraphQLError, Result};

pub type ResolverFn = Arc<dyn Fn(&ResolverContext<'_>) -> Result<FieldValue> + Send + Sync>;

/// Type-erased loader placeholder.
pub trait LazyLoad {
    fn fetch(&self) -> Result<Value>;
}

impl<K, V> LazyLoad for LazyValue<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + Into<Value> + 'static,
{
    fn fetch(&self) -> Result<Value> {
        self.get().map(Into::into)
    }
}

type MapFn = Box<dyn FnOnce(Value) -> Result<Value>>;

/// A value that will be produced by a loader during the next drain round.
pub struct Lazy {
    source: Box<dyn LazyLoad>,
    map: Option<MapFn>,
}

impl Lazy {
    pub fn new(source: impl LazyLoad + 'static) -> Self {
        Self {
            source: Box::new(source),
            map: None,
        }
    }

    /// Transform the loaded value before it is completed.
    pub fn map<F>(self, f: F) -> Self
    where
        F: FnOnce(Value) -> Result<Value> + 'static,
    {
        let map: MapFn = match self.map {
            Some(previous) => Box::new(move |value| f(previous(value)?)),
            None => Box::new(f),
        };
        Self {
            source: self.source,
            map: Some(map),
        }
    }

    pub fn fetch(self) -> Result<Value> {
        let value = self.source.fetch()?;
        match self.map {
            Some(map) => map(value),
            None => Ok(value),
        }
    }
}

/// Resolver output.
pub enum FieldValue {
    Value(Value),
    /// List whose items may themselves be lazy.
    List(Vec<FieldValue>),
    Lazy(Lazy),
}

impl FieldValue {
    pub fn null() -> Self {
        FieldValue::Value(Value::Null)
    }

    pub fn value(value: impl Into<Value>) -> Self {
        FieldValue::Value(value.into())
    }

    pub fn list(items: impl IntoIterator<Item = FieldValue>) -> Self {
        FieldValue::List(items.into_iter().collect())
    }

    pub fn lazy(source: impl LazyLoad + 'static) -> Self {
        FieldValue::Lazy(Lazy::new(source))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Value(Value::Null))
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Value(value)
    }
}

impl From<Lazy> for FieldValue {
    fn from(lazy: Lazy) -> Self {
        FieldValue::Lazy(lazy)
    }
}

impl<K, V> From<LazyValue<K, V>> for FieldValue
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + Into<Value> + 'static,
{
    fn from(lazy: LazyValue<K, V>) -> Self {
        FieldValue::lazy(lazy)
    }
}

/// Coerced field arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments(IndexMap<Name, Value>);

impl Arguments {
    pub fn new(values: IndexMap<Name, Value>) -> Self {
        Self(values)
    }

    /// Argument value; explicit `null` reads as absent.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !matches!(v, Value::Null))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn string(&self, name: &str) -> Result<Option<String>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Enum(e)) => Ok(Some(e.to_string())),
            Some(other) => Err(GraphQLError::InvalidValue(format!(
                "Argument `{}` must be a string, got {}.",
                name, other
            ))),
        }
    }

    pub fn int(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Number(n)) if n.is_i64() => Ok(n.as_i64()),
            Some(other) => Err(GraphQLError::InvalidValue(format!(
                "Argument `{}` must be an integer, got {}.",
                name, other
            ))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(Name, Value)> for Arguments {
    fn from_iter<T: IntoIterator<Item = (Name, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Typed values made available to resolvers, keyed by type.
#[derive(Default, Clone)]
pub struct Data(HashMap<TypeId, Arc<dyn Any + Send + Sync>>);

impl Data {
    pub fn insert<D: Any + Send + Sync>(&mut self, value: D) {
        self.0.insert(TypeId::of::<D>(), Arc::new(value));
    }

    pub fn with<D: Any + Send + Sync>(mut self, value: D) -> Self {
        self.insert(value);
        self
    }

    pub fn get<D: Any + Send + Sync>(&self) -> Option<&D> {
        self.0.get(&TypeId::of::<D>()).and_then(|v| v.downcast_ref::<D>())
    }
}

/// Request-scoped state shared by every resolver call of one execution.
pub(crate) struct RequestScope<'a> {
    pub(crate) loaders: LoaderRegistry,
    pub(crate) config: &'a ExecutorConfig,
    shared: &'a Data,
    request: Data,
}

impl<'a> RequestScope<'a> {
    pub(crate) fn new(config: &'a ExecutorConfig, shared: &'a Data, request: Data) -> Self {
        Self {
            loaders: LoaderRegistry::new(config.cache_policy),
            config,
            shared,
            request,
        }
    }

    fn data<D: Any + Send + Sync>(&self) -> Option<&D> {
        self.request.get::<D>().or_else(|| self.shared.get::<D>())
    }
}

/// Static and positional facts about the field being resolved.
pub struct FieldInfo<'a> {
    pub field_name: &'a str,
    pub parent_type: &'a str,
    pub return_type: &'a TypeRef,
    pub path: Vec<PathSegment>,
    pub(crate) nodes: Vec<&'a Positioned<FieldNode>>,
    pub(crate) fragments: &'a HashMap<Name, Positioned<FragmentDefinition>>,
}

impl<'a> FieldInfo<'a> {
    /// Location of the first field node in the query.
    pub fn position(&self) -> Option<Pos> {
        self.nodes.first().map(|node| node.pos)
    }

    /// Names of the fields selected directly below this one, fragments
    /// expanded, in query order.
    pub fn selected_fields(&self) -> Vec<&'a str> {
        let mut names = Vec::new();
        let mut visited = HashSet::new();
        for node in &self.nodes {
            self.collect_names(&node.node.selection_set.node, &mut names, &mut visited);
        }
        names
    }

    fn collect_names(&self, set: &'a SelectionSet, names: &mut Vec<&'a str>, visited: &mut HashSet<&'a str>) {
        for selection in &set.items {
            match &selection.node {
                Selection::Field(field) => {
                    let name = field.node.name.node.as_str();
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let fragment_name = spread.node.fragment_name.node.as_str();
                    if !visited.insert(fragment_name) {
                        continue;
                    }
                    if let Some(fragment) = self.fragments.get(fragment_name) {
                        self.collect_names(&fragment.node.selection_set.node, names, visited);
                    }
                }
                Selection::InlineFragment(inline) => {
                    self.collect_names(&inline.node.selection_set.node, names, visited);
                }
            }
        }
    }

    /// Response path without list indices, e.g. `users.edges.node.owner`.
    /// Used to tell apart loaders for the same kind at different positions.
    pub fn path_key(&self) -> String {
        self.path
            .iter()
            .filter_map(|segment| match segment {
                PathSegment::Field(name) => Some(name.as_str()),
                PathSegment::Index(_) => None,
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Everything a resolver gets to see.
pub struct ResolverContext<'r> {
    pub parent: &'r Value,
    pub args: &'r Arguments,
    pub info: &'r FieldInfo<'r>,
    pub(crate) scope: &'r RequestScope<'r>,
}

impl<'r> ResolverContext<'r> {
    pub fn data_opt<D: Any + Send + Sync>(&self) -> Option<&'r D> {
        self.scope.data::<D>()
    }

    pub fn data<D: Any + Send + Sync>(&self) -> Result<&'r D> {
        self.data_opt::<D>()
            .ok_or_else(|| GraphQLError::Schema(format!("request data `{}` is not available", type_name::<D>())))
    }

    pub fn loaders(&self) -> &'r LoaderRegistry {
        &self.scope.loaders
    }

    /// Request-scoped loader for `key`, created on first use.
    pub fn loader<K, V, F>(&self, key: LoaderKey, create: F) -> Result<DataLoader<K, V>>
    where
        K: Eq + Hash + Clone + 'static,
        V: Clone + 'static,
        F: FnOnce() -> DataLoader<K, V>,
    {
        self.scope.loaders.get_or_insert_with(key, create)
    }

    pub fn config(&self) -> &'r ExecutorConfig {
        self.scope.config
    }

    /// Named value of the parent object, `Null` when absent.
    pub fn parent_field(&self, name: &str) -> &'r Value {
        static NULL: Value = Value::Null;
        match self.parent {
            Value::Object(map) => map.get(name).unwrap_or(&NULL),
            _ => &NULL,
        }
    }
}
