//! Relay-style cursor pagination
//!
//! [`CursorPaginator`] turns connection arguments into a boundary predicate
//! over the sort columns, fetches one row more than requested to detect
//! further pages, and encodes each row's sort values as its cursor.

use std::fmt;

use async_graphql::{Name, Value};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PaginationConfig;
use crate::datasource::{DataSource, Row};
use crate::filter::{field_value, Condition, Operator};
use crate::resolver::Arguments;
use crate::{GraphQLError, Result};

/// Page information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

impl PageInfo {
    pub fn to_value(&self) -> Value {
        let cursor = |c: &Option<String>| c.clone().map(Value::String).unwrap_or(Value::Null);
        let mut map = IndexMap::new();
        map.insert(Name::new("hasNextPage"), Value::Boolean(self.has_next_page));
        map.insert(Name::new("hasPreviousPage"), Value::Boolean(self.has_previous_page));
        map.insert(Name::new("startCursor"), cursor(&self.start_cursor));
        map.insert(Name::new("endCursor"), cursor(&self.end_cursor));
        Value::Object(map)
    }
}

/// Edge in a connection
#[derive(Debug, Clone, PartialEq)]
pub struct Edge<T> {
    pub cursor: String,
    pub node: T,
}

/// Connection (paginated result)
#[derive(Debug, Clone, PartialEq)]
pub struct Connection<T> {
    pub total_count: usize,
    pub edges: Vec<Edge<T>>,
    pub page_info: PageInfo,
}

impl<T> Connection<T> {
    /// Create new connection
    pub fn new(total_count: usize, edges: Vec<Edge<T>>, has_next: bool, has_previous: bool) -> Self {
        let start_cursor = edges.first().map(|e| e.cursor.clone());
        let end_cursor = edges.last().map(|e| e.cursor.clone());

        Self {
            total_count,
            edges,
            page_info: PageInfo {
                has_next_page: has_next,
                has_previous_page: has_previous,
                start_cursor,
                end_cursor,
            },
        }
    }

    /// Create empty connection
    pub fn empty() -> Self {
        Self::new(0, Vec::new(), false, false)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.edges.iter().map(|e| &e.node)
    }

    /// `{totalCount, pageInfo, edges: [{cursor, node}]}` with nodes
    /// converted by `node`.
    pub fn into_value_with(self, mut node: impl FnMut(T) -> Value) -> Value {
        let edges = self
            .edges
            .into_iter()
            .map(|edge| {
                let mut map = IndexMap::new();
                map.insert(Name::new("cursor"), Value::String(edge.cursor));
                map.insert(Name::new("node"), node(edge.node));
                Value::Object(map)
            })
            .collect();

        let mut map = IndexMap::new();
        map.insert(Name::new("totalCount"), Value::from(self.total_count as u64));
        map.insert(Name::new("pageInfo"), self.page_info.to_value());
        map.insert(Name::new("edges"), Value::List(edges));
        Value::Object(map)
    }
}

impl Connection<Row> {
    pub fn into_value(self) -> Value {
        self.into_value_with(Value::Object)
    }
}

/// Cursor encoding/decoding
pub struct CursorCodec;

impl CursorCodec {
    /// Encode cursor to base64
    pub fn encode(value: &str) -> String {
        BASE64.encode(value.as_bytes())
    }

    /// Decode cursor from base64
    pub fn decode(cursor: &str) -> Result<String> {
        let bytes = BASE64
            .decode(cursor.as_bytes())
            .map_err(|e| GraphQLError::InvalidCursor(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| GraphQLError::InvalidCursor(e.to_string()))
    }

    /// Encode structured cursor (e.g., timestamp + ID)
    pub fn encode_structured<T: Serialize>(value: &T) -> Result<String> {
        let json = serde_json::to_string(value).map_err(|e| GraphQLError::InvalidCursor(e.to_string()))?;
        Ok(Self::encode(&json))
    }

    /// Decode structured cursor
    pub fn decode_structured<T: for<'de> Deserialize<'de>>(cursor: &str) -> Result<T> {
        let json = Self::decode(cursor)?;
        serde_json::from_str(&json).map_err(|e| GraphQLError::InvalidCursor(e.to_string()))
    }

    /// Cursor for a row: base64 of the JSON array of its sort values.
    pub fn encode_values(values: &[Value]) -> Result<String> {
        Self::encode_structured(&values)
    }

    /// Sort values of a cursor, which must hold exactly `arity` of them.
    pub fn decode_values(cursor: &str, arity: usize) -> Result<Vec<Value>> {
        let values: Vec<Value> = Self::decode_structured(cursor)?;
        if values.len() != arity {
            return Err(GraphQLError::InvalidCursor(format!(
                "expected {} sort values, found {}",
                arity,
                values.len()
            )));
        }
        Ok(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    /// Case-insensitive `asc` / `desc`.
    pub fn parse(direction: &str) -> Result<Self> {
        match direction.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(GraphQLError::PaginationError(format!(
                "Unknown sort direction `{}`.",
                other
            ))),
        }
    }

    pub fn flip(self) -> Self {
        match self {
            SortDirection::Asc => SortDirection::Desc,
            SortDirection::Desc => SortDirection::Asc,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// Ordered sort columns sharing one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub fields: Vec<String>,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new<I, S>(fields: I, direction: SortDirection) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            direction,
        }
    }

    /// `modified desc`, the default for top-level documents.
    pub fn top_level() -> Self {
        Self::new(["modified"], SortDirection::Desc)
    }

    /// `idx, modified asc`, the default for ordered child rows.
    pub fn ordered() -> Self {
        Self::new(["idx", "modified"], SortDirection::Asc)
    }

    /// Sort values of `row`, in column order.
    pub fn values_of(&self, row: &Row) -> Vec<Value> {
        self.fields.iter().map(|f| field_value(row, f).clone()).collect()
    }
}

impl fmt::Display for SortSpec {
    /// `ORDER BY` clause body, e.g. `idx asc, modified asc`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}", field, self.direction.as_sql())?;
        }
        Ok(())
    }
}

/// Connection arguments
///
/// Follows the Relay Cursor Connections Specification:
/// https://relay.dev/graphql/connections.htm
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionArgs {
    /// Number of items to return (forward pagination)
    pub first: Option<i64>,

    /// Cursor to start from (forward pagination)
    pub after: Option<String>,

    /// Number of items to return (backward pagination)
    pub last: Option<i64>,

    /// Cursor to start from (backward pagination)
    pub before: Option<String>,

    pub filter: Vec<Condition>,

    /// Overrides the paginator's default sort.
    pub sort: Option<SortSpec>,
}

impl ConnectionArgs {
    pub fn first(n: i64) -> Self {
        Self {
            first: Some(n),
            ..Self::default()
        }
    }

    pub fn last(n: i64) -> Self {
        Self {
            last: Some(n),
            ..Self::default()
        }
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.after = Some(cursor.into());
        self
    }

    pub fn before(mut self, cursor: impl Into<String>) -> Self {
        self.before = Some(cursor.into());
        self
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.filter.push(condition);
        self
    }

    pub fn sort_by(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Read `first`, `last`, `after`, `before`, `filter` and `sortBy`.
    ///
    /// `filter` is a list of `{fieldname, operator, value}` objects.
    /// `sortBy.field` is a column name (lower-cased) or a list of column
    /// names; `sortBy.direction` defaults to ascending.
    pub fn from_arguments(args: &Arguments) -> Result<Self> {
        let filter = match args.get("filter") {
            None => Vec::new(),
            Some(Value::List(items)) => items.iter().map(parse_filter).collect::<Result<_>>()?,
            Some(other) => {
                return Err(GraphQLError::PaginationError(format!(
                    "Argument `filter` must be a list, got {}.",
                    other
                )))
            }
        };

        Ok(Self {
            first: args.int("first")?,
            after: args.string("after")?,
            last: args.int("last")?,
            before: args.string("before")?,
            filter,
            sort: args.get("sortBy").map(parse_sort).transpose()?.flatten(),
        })
    }

    /// Check argument combinations. Runs before anything is fetched.
    pub fn validate(&self, config: &PaginationConfig) -> Result<()> {
        let error = |message: &str| Err(GraphQLError::PaginationError(message.to_string()));

        if self.first.is_none() && self.last.is_none() {
            return error("Argument `first` or `last` should be specified");
        }
        if matches!(self.first, Some(n) if n <= 0) {
            return error("Argument `first` must be a positive integer.");
        }
        if matches!(self.last, Some(n) if n <= 0) {
            return error("Argument `last` must be a positive integer.");
        }
        if self.first.is_some() && self.last.is_some() {
            return error("Argument `last` cannot be combined with `first`.");
        }
        if self.first.is_some() && self.before.is_some() {
            return error("Argument `first` cannot be combined with `before`.");
        }
        if self.last.is_some() && self.after.is_some() {
            return error("Argument `last` cannot be combined with `after`.");
        }
        if let Some(max) = config.max_page_size {
            let name = if self.first.is_some() { "first" } else { "last" };
            if self.requested_count() > max {
                return Err(GraphQLError::PaginationError(format!(
                    "Argument `{}` cannot exceed {}.",
                    name, max
                )));
            }
        }
        Ok(())
    }

    /// Page size asked for; zero when the arguments are invalid.
    pub fn requested_count(&self) -> usize {
        self.first
            .or(self.last)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0)
    }
}

fn parse_filter(item: &Value) -> Result<Condition> {
    let Value::Object(map) = item else {
        return Err(GraphQLError::PaginationError(format!(
            "Filter must be an object with `fieldname`, `operator` and `value`, got {}.",
            item
        )));
    };
    let fieldname = match map.get("fieldname") {
        Some(Value::String(name)) => name.clone(),
        _ => return Err(GraphQLError::PaginationError("Filter is missing `fieldname`.".to_string())),
    };
    let op = match map.get("operator") {
        Some(Value::Enum(name)) => Operator::parse(name)?,
        Some(Value::String(name)) => Operator::parse(name)?,
        _ => return Err(GraphQLError::PaginationError("Filter is missing `operator`.".to_string())),
    };
    let value = map.get("value").cloned().unwrap_or(Value::Null);
    Ok(Condition::compare(fieldname, op, value))
}

/// `None` when `sortBy` names no field.
fn parse_sort(input: &Value) -> Result<Option<SortSpec>> {
    let Value::Object(map) = input else {
        return Ok(None);
    };
    let fields = match map.get("field") {
        Some(Value::String(field)) if !field.is_empty() => vec![field.to_lowercase()],
        Some(Value::Enum(field)) => vec![field.to_lowercase()],
        Some(Value::List(fields)) if !fields.is_empty() => fields
            .iter()
            .map(|f| match f {
                Value::String(s) => Ok(s.clone()),
                Value::Enum(name) => Ok(name.to_string()),
                other => Err(GraphQLError::PaginationError(format!(
                    "Sort field must be a string, got {}.",
                    other
                ))),
            })
            .collect::<Result<_>>()?,
        _ => return Ok(None),
    };
    let direction = match map.get("direction") {
        Some(Value::Enum(name)) => SortDirection::parse(name)?,
        Some(Value::String(name)) => SortDirection::parse(name)?,
        _ => SortDirection::Asc,
    };
    Ok(Some(SortSpec { fields, direction }))
}

/// What the fetch step is asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub kind: String,
    pub filters: Vec<Condition>,
    /// Effective sort: flipped when paging backward.
    pub sort: SortSpec,
    /// Requested count plus one.
    pub limit: usize,
}

type CountFn = Box<dyn Fn(&str, &[Condition]) -> Result<usize>>;
type FetchFn = Box<dyn Fn(&PageRequest) -> Result<Vec<Row>>>;

struct Overrides {
    count: CountFn,
    fetch: FetchFn,
}

/// Connection resolver for one entity kind.
pub struct CursorPaginator {
    kind: String,
    predefined: Vec<Condition>,
    default_sort: SortSpec,
    config: PaginationConfig,
    overrides: Option<Overrides>,
}

impl CursorPaginator {
    /// Paginator sorted by `modified desc` unless the caller asks otherwise.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            predefined: Vec::new(),
            default_sort: SortSpec::top_level(),
            config: PaginationConfig::default(),
            overrides: None,
        }
    }

    /// Base filters, always applied in addition to the caller's.
    pub fn filters(mut self, filters: Vec<Condition>) -> Self {
        self.predefined = filters;
        self
    }

    /// Use the ordered child-row default sort (`idx, modified asc`).
    pub fn ordered(mut self) -> Self {
        self.default_sort = SortSpec::ordered();
        self
    }

    pub fn default_sort(mut self, sort: SortSpec) -> Self {
        self.default_sort = sort;
        self
    }

    pub fn config(mut self, config: PaginationConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the data source for counting and fetching, e.g. for computed
    /// kinds. Both are required together.
    pub fn with_overrides<C, F>(mut self, count: C, fetch: F) -> Self
    where
        C: Fn(&str, &[Condition]) -> Result<usize> + 'static,
        F: Fn(&PageRequest) -> Result<Vec<Row>> + 'static,
    {
        self.overrides = Some(Overrides {
            count: Box::new(count),
            fetch: Box::new(fetch),
        });
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Resolve one page.
    pub fn resolve(&self, source: &dyn DataSource, args: &ConnectionArgs) -> Result<Connection<Row>> {
        args.validate(&self.config)?;
        let requested = args.requested_count();

        let mut filters = args.filter.clone();
        filters.extend(self.predefined.iter().cloned());

        let sort = args.sort.clone().unwrap_or_else(|| self.default_sort.clone());
        let sort_direction = sort.direction;
        let direction = if args.last.is_some() { sort_direction.flip() } else { sort_direction };

        // Counted before the cursor boundary is added.
        let total_count = self.count(source, &filters)?;

        let mut has_next_page = false;
        let mut has_previous_page = false;
        if let Some(cursor) = args.after.as_deref().or(args.before.as_deref()) {
            let values = CursorCodec::decode_values(cursor, sort.fields.len())?;
            let forward = args.after.is_some();
            let op = match (forward, sort_direction) {
                (true, SortDirection::Asc) | (false, SortDirection::Desc) => Operator::Gt,
                (true, SortDirection::Desc) | (false, SortDirection::Asc) => Operator::Lt,
            };
            filters.push(cursor_condition(&sort.fields, op, &values));
            if forward {
                has_previous_page = true;
            } else {
                has_next_page = true;
            }
        }

        let request = PageRequest {
            kind: self.kind.clone(),
            filters,
            sort: SortSpec {
                fields: sort.fields.clone(),
                direction,
            },
            limit: requested + 1,
        };
        let mut rows = self.fetch(source, &request)?;
        debug!(kind = %self.kind, total_count, fetched = rows.len(), sort = %request.sort, "paginated fetch");

        let has_more = rows.len() > requested;
        rows.truncate(requested);
        if direction != sort_direction {
            rows.reverse();
            has_previous_page |= has_more;
        } else {
            has_next_page |= has_more;
        }

        let edges = rows
            .into_iter()
            .map(|row| {
                let cursor = CursorCodec::encode_values(&sort.values_of(&row))?;
                Ok(Edge { cursor, node: row })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Connection::new(total_count, edges, has_next_page, has_previous_page))
    }

    fn count(&self, source: &dyn DataSource, filters: &[Condition]) -> Result<usize> {
        match &self.overrides {
            Some(overrides) => (overrides.count)(&self.kind, filters),
            None => source.count_rows(&self.kind, filters),
        }
    }

    fn fetch(&self, source: &dyn DataSource, request: &PageRequest) -> Result<Vec<Row>> {
        match &self.overrides {
            Some(overrides) => (overrides.fetch)(request),
            None => source.list_rows(&request.kind, &request.filters, &request.sort, Some(request.limit)),
        }
    }
}

/// Rows strictly beyond the cursor `values` in the direction of `op`
/// (`Gt` or `Lt`) over `fields`.
///
/// One branch per column: every earlier column equals its cursor value and
/// this column passes `op`. NULL sorts after every value, so with `Gt` a
/// NULL column passes and a NULL cursor value has nothing beyond it; with
/// `Lt` a NULL cursor value is passed by every non-null column.
pub fn cursor_condition(fields: &[String], op: Operator, values: &[Value]) -> Condition {
    let mut branches = Vec::with_capacity(fields.len());
    for (index, (field, value)) in fields.iter().zip(values).enumerate() {
        let is_null = matches!(value, Value::Null);
        if is_null && op == Operator::Gt {
            continue;
        }

        let mut parts: Vec<Condition> = fields[..index]
            .iter()
            .zip(values)
            .map(|(prior, value)| match value {
                Value::Null => Condition::IsNull(prior.clone()),
                value => Condition::eq(prior.clone(), value.clone()),
            })
            .collect();
        parts.push(if op == Operator::Gt {
            Condition::Or(vec![
                Condition::compare(field.clone(), Operator::Gt, value.clone()),
                Condition::IsNull(field.clone()),
            ])
        } else if is_null {
            Condition::IsNotNull(field.clone())
        } else {
            Condition::compare(field.clone(), op, value.clone())
        });
        branches.push(Condition::And(parts));
    }
    Condition::Or(branches)
}
