//! Resolvers for document-store entities.
//!
//! [`Bindings`] maps GraphQL object types to entity kinds once, at bind time.
//! [`Bindings::bind`] then fills the schema's resolver slots: root document
//! and connection fields on the query type, plus link fields, child tables
//! and plain document fields on every bound entity type. Resolvers find
//! their [`Backend`] in request data.

use std::collections::HashMap;
use std::sync::Arc;

use async_graphql::{Name, Value};
use indexmap::IndexMap;
use tracing::debug;

use crate::dataloaders::{DataLoader, LoaderKey};
use crate::datasource::{AllowAll, DataSource, PermissionGate, Row};
use crate::filter::Condition;
use crate::pagination::{ConnectionArgs, CursorPaginator, SortDirection, SortSpec};
use crate::resolver::{FieldValue, Lazy, ResolverContext};
use crate::schema::{Field, InputValue, MetaType, Object, Schema, TypeRef};
use crate::{GraphQLError, Result};

const DEFAULT_KEY_FIELD: &str = "name";

/// Storage and permission collaborators for bound resolvers.
#[derive(Clone)]
pub struct Backend {
    pub source: Arc<dyn DataSource>,
    pub permissions: Arc<dyn PermissionGate>,
}

impl Backend {
    /// Backend that allows every read.
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Self {
            source,
            permissions: Arc::new(AllowAll),
        }
    }

    pub fn with_permissions(mut self, permissions: impl PermissionGate + 'static) -> Self {
        self.permissions = Arc::new(permissions);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    /// Target kind is fixed.
    To(String),
    /// Target kind is read from another field of the parent row.
    Dynamic(String),
}

/// How one GraphQL object type maps onto stored documents.
#[derive(Debug, Clone)]
pub struct EntityBinding {
    type_name: String,
    kind: String,
    key_field: String,
    root_field: Option<String>,
    connection_field: Option<String>,
    links: IndexMap<String, Link>,
    child_tables: IndexMap<String, String>,
}

impl EntityBinding {
    pub fn new(type_name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            kind: kind.into(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
            root_field: None,
            connection_field: None,
            links: IndexMap::new(),
            child_tables: IndexMap::new(),
        }
    }

    /// Column holding the document key. Defaults to `name`.
    pub fn key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = field.into();
        self
    }

    /// Query field returning one document by key, e.g. `User(name: ID)`.
    pub fn root(mut self, field: impl Into<String>) -> Self {
        self.root_field = Some(field.into());
        self
    }

    /// Query field returning a connection over all documents, e.g. `Users`.
    pub fn connection(mut self, field: impl Into<String>) -> Self {
        self.connection_field = Some(field.into());
        self
    }

    /// `field` holds the key of a `target` document.
    pub fn link(mut self, field: impl Into<String>, target: impl Into<String>) -> Self {
        self.links.insert(field.into(), Link::To(target.into()));
        self
    }

    /// `field` holds a document key whose kind is stored in `kind_field`.
    pub fn dynamic_link(mut self, field: impl Into<String>, kind_field: impl Into<String>) -> Self {
        self.links.insert(field.into(), Link::Dynamic(kind_field.into()));
        self
    }

    /// `field` lists the `child` rows whose `parent` is this document,
    /// ordered by `idx`.
    pub fn child_table(mut self, field: impl Into<String>, child: impl Into<String>) -> Self {
        self.child_tables.insert(field.into(), child.into());
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

/// Kind facts shared by resolvers of every bound type.
#[derive(Debug, Default)]
struct Kinds {
    key_fields: HashMap<String, String>,
    type_names: HashMap<String, String>,
}

impl Kinds {
    fn key_field(&self, kind: &str) -> &str {
        self.key_fields.get(kind).map(String::as_str).unwrap_or(DEFAULT_KEY_FIELD)
    }
}

/// Dispatch table from GraphQL type name to entity binding.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entities: IndexMap<String, EntityBinding>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, binding: EntityBinding) -> Self {
        self.entities.insert(binding.type_name.clone(), binding);
        self
    }

    pub fn get(&self, type_name: &str) -> Option<&EntityBinding> {
        self.entities.get(type_name)
    }

    /// Install resolvers for every bound entity.
    ///
    /// Link and child table fields are always (re)bound. Other fields of an
    /// entity type get the document resolver unless they already have one.
    pub fn bind(&self, schema: &mut Schema) -> Result<()> {
        let kinds = Arc::new(Kinds {
            key_fields: self
                .entities
                .values()
                .map(|e| (e.kind.clone(), e.key_field.clone()))
                .collect(),
            type_names: self
                .entities
                .values()
                .map(|e| (e.kind.clone(), e.type_name.clone()))
                .collect(),
        });
        let query_type = schema.query_type().to_string();

        for entity in self.entities.values() {
            let fields: Vec<String> = schema
                .object(&entity.type_name)
                .ok_or_else(|| {
                    GraphQLError::Schema(format!("bound type `{}` is not an object type", entity.type_name))
                })?
                .fields
                .keys()
                .cloned()
                .collect();

            if let Some(root) = &entity.root_field {
                let kind = entity.kind.clone();
                let key_field = entity.key_field.clone();
                schema.set_resolver(&query_type, root, move |ctx| resolve_document(ctx, &kind, &key_field))?;
            }
            if let Some(connection) = &entity.connection_field {
                let kind = entity.kind.clone();
                schema.set_resolver(&query_type, connection, move |ctx| resolve_connection(ctx, &kind))?;
            }

            for field in fields {
                if field == entity.key_field {
                    continue;
                }

                if let Some(link) = entity.links.get(&field) {
                    let (link, name, kinds) = (link.clone(), field.clone(), kinds.clone());
                    schema.set_resolver(&entity.type_name, &field, move |ctx| {
                        resolve_link(ctx, &link, &name, &kinds)
                    })?;
                    continue;
                }

                if let Some(child) = entity.child_tables.get(&field) {
                    let table = ChildTable {
                        child: child.clone(),
                        parent: entity.kind.clone(),
                        field: field.clone(),
                    };
                    let key_field = entity.key_field.clone();
                    schema.set_resolver(&entity.type_name, &field, move |ctx| {
                        resolve_child_table(ctx, &table, &key_field)
                    })?;
                    continue;
                }

                // `owner__name` reads the raw key behind link `owner`.
                if let Some(linked) = field.strip_suffix("__name").filter(|f| entity.links.contains_key(*f)) {
                    let linked = linked.to_string();
                    schema.set_resolver(&entity.type_name, &field, move |ctx| {
                        Ok(FieldValue::value(ctx.parent_field(&linked).clone()))
                    })?;
                    continue;
                }

                let bound = schema
                    .field(&entity.type_name, &field)
                    .map_or(false, |f| f.resolver.is_some());
                if bound {
                    continue;
                }
                let kind = entity.kind.clone();
                let key_field = entity.key_field.clone();
                let name = field.clone();
                schema.set_resolver(&entity.type_name, &field, move |ctx| {
                    resolve_document_field(ctx, &kind, &key_field, &name)
                })?;
            }

            debug!(
                type_name = %entity.type_name,
                kind = %entity.kind,
                links = entity.links.len(),
                child_tables = entity.child_tables.len(),
                "bound entity"
            );
        }
        Ok(())
    }
}

struct ChildTable {
    child: String,
    parent: String,
    field: String,
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Enum(name) => Some(name.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Request-scoped loader returning documents of `kind` by key, `null` for
/// missing keys.
fn document_loader(
    ctx: &ResolverContext<'_>,
    backend: &Backend,
    kind: &str,
    key_field: &str,
) -> Result<DataLoader<String, Value>> {
    let source = backend.source.clone();
    let loaded_kind = kind.to_string();
    let key_field = key_field.to_string();
    ctx.loader(LoaderKey::new(kind), move || {
        DataLoader::from_fn(move |keys: &[String]| {
            let mut found: HashMap<String, Row> = source
                .get_by_keys(&loaded_kind, keys)?
                .into_iter()
                .filter_map(|row| Some((key_string(row.get(key_field.as_str())?)?, row)))
                .collect();
            Ok(keys
                .iter()
                .map(|key| found.remove(key).map(Value::Object).unwrap_or(Value::Null))
                .collect())
        })
    })
}

fn resolve_document(ctx: &ResolverContext<'_>, kind: &str, key_field: &str) -> Result<FieldValue> {
    let Some(key) = ctx.args.string(key_field)? else {
        return Ok(FieldValue::null());
    };
    let backend = ctx.data::<Backend>()?;
    backend.permissions.check_read(kind, Some(&key))?;
    Ok(document_loader(ctx, backend, kind, key_field)?.load(key).into())
}

fn resolve_connection(ctx: &ResolverContext<'_>, kind: &str) -> Result<FieldValue> {
    let backend = ctx.data::<Backend>()?;
    backend.permissions.check_read(kind, None)?;
    let args = ConnectionArgs::from_arguments(ctx.args)?;
    let connection = CursorPaginator::new(kind)
        .config(ctx.config().pagination.clone())
        .resolve(backend.source.as_ref(), &args)?;
    Ok(FieldValue::value(connection.into_value()))
}

fn resolve_link(ctx: &ResolverContext<'_>, link: &Link, field: &str, kinds: &Kinds) -> Result<FieldValue> {
    let kind = match link {
        Link::To(kind) => Some(kind.clone()),
        Link::Dynamic(kind_field) => key_string(ctx.parent_field(kind_field)),
    };
    let (Some(kind), Some(key)) = (kind, key_string(ctx.parent_field(field))) else {
        return Ok(FieldValue::null());
    };

    let backend = ctx.data::<Backend>()?;
    backend.permissions.check_read(&kind, Some(&key))?;
    let load = document_loader(ctx, backend, &kind, kinds.key_field(&kind))?.load(key);

    // Dynamic targets may complete through an interface or union.
    match (link, kinds.type_names.get(&kind)) {
        (Link::Dynamic(_), Some(type_name)) => {
            let type_name = type_name.clone();
            Ok(Lazy::new(load)
                .map(move |document| {
                    Ok(match document {
                        Value::Object(mut map) => {
                            map.entry(Name::new("__typename"))
                                .or_insert_with(|| Value::String(type_name));
                            Value::Object(map)
                        }
                        other => other,
                    })
                })
                .into())
        }
        _ => Ok(load.into()),
    }
}

fn resolve_child_table(ctx: &ResolverContext<'_>, table: &ChildTable, key_field: &str) -> Result<FieldValue> {
    let Some(parent_key) = key_string(ctx.parent_field(key_field)) else {
        return Ok(FieldValue::list([]));
    };
    let backend = ctx.data::<Backend>()?;
    let source = backend.source.clone();
    let (child, parent, field) = (table.child.clone(), table.parent.clone(), table.field.clone());

    let loader_key = LoaderKey::new(format!("{}:{}:{}", table.child, table.parent, table.field));
    let loader = ctx.loader(loader_key, move || {
        DataLoader::from_fn(move |keys: &[String]| {
            let filters = [
                Condition::one_of("parent", keys.iter().map(|k| Value::from(k.as_str())).collect()),
                Condition::eq("parenttype", parent.as_str()),
                Condition::eq("parentfield", field.as_str()),
            ];
            let rows = source.list_rows(&child, &filters, &SortSpec::new(["idx"], SortDirection::Asc), None)?;

            let mut grouped: IndexMap<String, Vec<Value>> = keys.iter().map(|k| (k.clone(), Vec::new())).collect();
            for row in rows {
                let owner = row.get("parent").and_then(key_string);
                if let Some(children) = owner.and_then(|key| grouped.get_mut(&key)) {
                    children.push(Value::Object(row));
                }
            }
            Ok(grouped.into_values().map(Value::List).collect())
        })
    })?;
    Ok(loader.load(parent_key).into())
}

/// Value from the parent row when it carries the column, otherwise read from
/// the full document after a per-document permission check.
fn resolve_document_field(ctx: &ResolverContext<'_>, kind: &str, key_field: &str, field: &str) -> Result<FieldValue> {
    if let Value::Object(row) = ctx.parent {
        if let Some(value) = row.get(field) {
            return Ok(FieldValue::value(value.clone()));
        }
    }
    let Some(key) = key_string(ctx.parent_field(key_field)) else {
        return Ok(FieldValue::null());
    };

    let backend = ctx.data::<Backend>()?;
    backend.permissions.check_read(kind, Some(&key))?;
    let field = field.to_string();
    let lazy = Lazy::new(document_loader(ctx, backend, kind, key_field)?.load(key)).map(move |document| {
        Ok(match document {
            Value::Object(mut map) => map.swap_remove(field.as_str()).unwrap_or(Value::Null),
            _ => Value::Null,
        })
    });
    Ok(lazy.into())
}

/// Query field `name` returning a connection over `entity_type`, with the
/// standard `first`, `last`, `after`, `before`, `filter` and `sortBy`
/// arguments.
pub fn connection_field(name: impl Into<String>, entity_type: &str) -> Field {
    Field::new(name, TypeRef::named_nn(format!("{}CountableConnection", entity_type)))
        .argument(InputValue::new("first", TypeRef::named("Int")))
        .argument(InputValue::new("last", TypeRef::named("Int")))
        .argument(InputValue::new("after", TypeRef::named("String")))
        .argument(InputValue::new("before", TypeRef::named("String")))
        .argument(InputValue::new("filter", TypeRef::named_list("DBFilterInput")))
        .argument(InputValue::new("sortBy", TypeRef::named("SortingInput")))
}

/// `<Type>CountableConnection` and `<Type>CountableEdge`.
pub fn connection_types(entity_type: &str) -> Vec<MetaType> {
    let connection = Object::new(format!("{}CountableConnection", entity_type))
        .field(Field::new("totalCount", TypeRef::named_nn("Int")))
        .field(Field::new("pageInfo", TypeRef::named_nn("PageInfo")))
        .field(Field::new(
            "edges",
            TypeRef::named_nn_list_nn(format!("{}CountableEdge", entity_type)),
        ));
    let edge = Object::new(format!("{}CountableEdge", entity_type))
        .field(Field::new("cursor", TypeRef::named_nn("String")))
        .field(Field::new("node", TypeRef::named_nn(entity_type)));
    vec![connection.into(), edge.into()]
}

/// Types shared by every connection: `PageInfo`, the filter and sort inputs
/// and their enums.
pub fn pagination_types() -> Vec<MetaType> {
    let page_info = Object::new("PageInfo")
        .field(Field::new("hasNextPage", TypeRef::named_nn("Boolean")))
        .field(Field::new("hasPreviousPage", TypeRef::named_nn("Boolean")))
        .field(Field::new("startCursor", TypeRef::named("String")))
        .field(Field::new("endCursor", TypeRef::named("String")));
    vec![
        page_info.into(),
        MetaType::input_object("DBFilterInput"),
        MetaType::input_object("SortingInput"),
        MetaType::enumeration("DBFilterOperator", ["EQ", "NEQ", "LT", "GT", "LTE", "GTE", "LIKE", "NOT_LIKE"]),
        MetaType::enumeration("SortDirection", ["ASC", "DESC"]),
    ]
}
