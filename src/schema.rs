//! Compiled schema: named types, fields and their resolver slots.
//!
//! There is no SDL parser here. Schemas are assembled with [`SchemaBuilder`]
//! (or produced by a generator upstream) and checked once by
//! [`SchemaBuilder::finish`].

use std::fmt;
use std::sync::Arc;

use async_graphql::parser::types::OperationType;
use async_graphql::Value;
use indexmap::IndexMap;

use crate::resolver::{FieldValue, ResolverContext, ResolverFn};
use crate::types::ScalarKind;
use crate::{GraphQLError, Result};

/// Picks the concrete object type for a value of an interface or union.
pub type TypeResolverFn = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Output type reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Named(String),
    NonNull(Box<TypeRef>),
    List(Box<TypeRef>),
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        TypeRef::Named(name.into())
    }

    /// `Name!`
    pub fn named_nn(name: impl Into<String>) -> Self {
        TypeRef::NonNull(Box::new(TypeRef::named(name)))
    }

    /// `[Name]`
    pub fn named_list(name: impl Into<String>) -> Self {
        TypeRef::List(Box::new(TypeRef::named(name)))
    }

    /// `[Name!]!`
    pub fn named_nn_list_nn(name: impl Into<String>) -> Self {
        TypeRef::NonNull(Box::new(TypeRef::List(Box::new(TypeRef::named_nn(name)))))
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, TypeRef::NonNull(_))
    }

    /// The innermost named type.
    pub fn type_name(&self) -> &str {
        match self {
            TypeRef::Named(name) => name,
            TypeRef::NonNull(inner) | TypeRef::List(inner) => inner.type_name(),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Named(name) => f.write_str(name),
            TypeRef::NonNull(inner) => write!(f, "{}!", inner),
            TypeRef::List(inner) => write!(f, "[{}]", inner),
        }
    }
}

/// Declared argument of a field.
#[derive(Debug, Clone)]
pub struct InputValue {
    pub name: String,
    pub ty: TypeRef,
    pub default_value: Option<Value>,
}

impl InputValue {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
            default_value: None,
        }
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }
}

/// Output field with a replaceable resolver.
#[derive(Clone)]
pub struct Field {
    pub name: String,
    pub ty: TypeRef,
    pub args: IndexMap<String, InputValue>,
    pub resolver: Option<ResolverFn>,
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("args", &self.args)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

impl Field {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            name: name.into(),
            ty,
            args: IndexMap::new(),
            resolver: None,
        }
    }

    pub fn argument(mut self, arg: InputValue) -> Self {
        self.args.insert(arg.name.clone(), arg);
        self
    }

    pub fn resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&ResolverContext<'_>) -> Result<FieldValue> + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(resolver));
        self
    }
}

#[derive(Debug, Clone)]
pub struct Object {
    pub name: String,
    pub fields: IndexMap<String, Field>,
    pub interfaces: Vec<String>,
}

impl Object {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: IndexMap::new(),
            interfaces: Vec::new(),
        }
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    pub fn implement(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }
}

/// Interface or union.
#[derive(Clone)]
pub struct AbstractType {
    pub name: String,
    /// Interface fields; empty for unions.
    pub fields: IndexMap<String, Field>,
    /// Union members; implementors are discovered from objects for interfaces.
    pub members: Vec<String>,
    pub resolve_type: Option<TypeResolverFn>,
}

impl fmt::Debug for AbstractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbstractType")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("members", &self.members)
            .finish()
    }
}

impl AbstractType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: IndexMap::new(),
            members: Vec::new(),
            resolve_type: None,
        }
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    pub fn member(mut self, name: impl Into<String>) -> Self {
        self.members.push(name.into());
        self
    }

    pub fn resolve_type<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.resolve_type = Some(Arc::new(f));
        self
    }
}

#[derive(Debug, Clone)]
pub enum MetaType {
    Scalar { name: String, kind: ScalarKind },
    Enum { name: String, values: Vec<String> },
    Object(Object),
    Interface(AbstractType),
    Union(AbstractType),
    /// Input objects only need to exist by name; argument values are passed
    /// to resolvers as coerced values.
    InputObject { name: String },
}

impl MetaType {
    pub fn enumeration<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MetaType::Enum {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn input_object(name: impl Into<String>) -> Self {
        MetaType::InputObject { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            MetaType::Scalar { name, .. } | MetaType::Enum { name, .. } | MetaType::InputObject { name } => name,
            MetaType::Object(object) => &object.name,
            MetaType::Interface(abstract_type) | MetaType::Union(abstract_type) => &abstract_type.name,
        }
    }

    fn fields(&self) -> Option<&IndexMap<String, Field>> {
        match self {
            MetaType::Object(object) => Some(&object.fields),
            MetaType::Interface(interface) => Some(&interface.fields),
            _ => None,
        }
    }

    fn fields_mut(&mut self) -> Option<&mut IndexMap<String, Field>> {
        match self {
            MetaType::Object(object) => Some(&mut object.fields),
            MetaType::Interface(interface) => Some(&mut interface.fields),
            _ => None,
        }
    }
}

impl From<Object> for MetaType {
    fn from(object: Object) -> Self {
        MetaType::Object(object)
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    types: IndexMap<String, MetaType>,
    query_type: String,
    mutation_type: Option<String>,
}

impl Schema {
    pub fn build(query_type: impl Into<String>) -> SchemaBuilder {
        let mut types = IndexMap::new();
        for kind in ScalarKind::BUILTINS {
            types.insert(
                kind.type_name().to_string(),
                MetaType::Scalar {
                    name: kind.type_name().to_string(),
                    kind,
                },
            );
        }
        SchemaBuilder {
            schema: Schema {
                types,
                query_type: query_type.into(),
                mutation_type: None,
            },
        }
    }

    pub fn get_type(&self, name: &str) -> Option<&MetaType> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &MetaType> {
        self.types.values()
    }

    pub fn object(&self, name: &str) -> Option<&Object> {
        match self.types.get(name) {
            Some(MetaType::Object(object)) => Some(object),
            _ => None,
        }
    }

    pub fn query_type(&self) -> &str {
        &self.query_type
    }

    pub fn mutation_type(&self) -> Option<&str> {
        self.mutation_type.as_deref()
    }

    /// Root object for an operation type.
    pub fn root_type(&self, operation: OperationType) -> Option<&Object> {
        match operation {
            OperationType::Query => self.object(&self.query_type),
            OperationType::Mutation => self.mutation_type.as_deref().and_then(|name| self.object(name)),
            OperationType::Subscription => None,
        }
    }

    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&Field> {
        self.types.get(type_name)?.fields()?.get(field_name)
    }

    /// Mutable access to a field, e.g. to fill its resolver slot.
    pub fn field_mut(&mut self, type_name: &str, field_name: &str) -> Option<&mut Field> {
        self.types.get_mut(type_name)?.fields_mut()?.get_mut(field_name)
    }

    pub fn set_resolver<F>(&mut self, type_name: &str, field_name: &str, resolver: F) -> Result<()>
    where
        F: Fn(&ResolverContext<'_>) -> Result<FieldValue> + Send + Sync + 'static,
    {
        let field = self.field_mut(type_name, field_name).ok_or_else(|| {
            GraphQLError::Schema(format!("unknown field {}.{}", type_name, field_name))
        })?;
        field.resolver = Some(Arc::new(resolver));
        Ok(())
    }

    /// Object types a value of `abstract_type` may have at runtime.
    pub fn possible_types(&self, abstract_type: &str) -> Vec<&str> {
        match self.types.get(abstract_type) {
            Some(MetaType::Union(union)) => union.members.iter().map(String::as_str).collect(),
            Some(MetaType::Interface(_)) => self
                .types
                .values()
                .filter_map(|ty| match ty {
                    MetaType::Object(object) if object.interfaces.iter().any(|i| i == abstract_type) => {
                        Some(object.name.as_str())
                    }
                    _ => None,
                })
                .collect(),
            Some(MetaType::Object(object)) => vec![object.name.as_str()],
            _ => Vec::new(),
        }
    }

    pub fn is_possible_type(&self, abstract_type: &str, object_type: &str) -> bool {
        abstract_type == object_type || self.possible_types(abstract_type).contains(&object_type)
    }
}

pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    pub fn mutation(mut self, name: impl Into<String>) -> Self {
        self.schema.mutation_type = Some(name.into());
        self
    }

    pub fn register(mut self, ty: impl Into<MetaType>) -> Self {
        let ty = ty.into();
        self.schema.types.insert(ty.name().to_string(), ty);
        self
    }

    /// Check that root types are objects and every referenced type exists.
    pub fn finish(self) -> Result<Schema> {
        let schema = self.schema;

        if schema.object(&schema.query_type).is_none() {
            return Err(GraphQLError::Schema(format!(
                "query root `{}` is not a registered object type",
                schema.query_type
            )));
        }
        if let Some(mutation) = &schema.mutation_type {
            if schema.object(mutation).is_none() {
                return Err(GraphQLError::Schema(format!(
                    "mutation root `{}` is not a registered object type",
                    mutation
                )));
            }
        }

        for ty in schema.types.values() {
            if let Some(fields) = ty.fields() {
                for field in fields.values() {
                    let referenced = std::iter::once(&field.ty).chain(field.args.values().map(|a| &a.ty));
                    for type_ref in referenced {
                        if !schema.types.contains_key(type_ref.type_name()) {
                            return Err(GraphQLError::Schema(format!(
                                "{}.{} references unknown type `{}`",
                                ty.name(),
                                field.name,
                                type_ref.type_name()
                            )));
                        }
                    }
                }
            }
            if let MetaType::Union(union) = ty {
                for member in &union.members {
                    if schema.object(member).is_none() {
                        return Err(GraphQLError::Schema(format!(
                            "union {} member `{}` is not an object type",
                            union.name, member
                        )));
                    }
                }
            }
        }

        Ok(schema)
    }
}
