//! Data source and permission collaborators.
//!
//! The executor never talks to storage directly. Resolvers and loaders go
//! through [`DataSource`] and ask [`PermissionGate`] before reading.

use std::collections::HashMap;
use std::sync::RwLock;

use async_graphql::{Name, Value};
use indexmap::IndexMap;

use crate::filter::{compare_values, field_value, Condition};
use crate::pagination::{SortDirection, SortSpec};
use crate::{GraphQLError, Result};

/// One record as column name -> value.
pub type Row = IndexMap<Name, Value>;

/// Tabular document storage.
pub trait DataSource: Send + Sync {
    /// Rows of `kind` matching every condition, ordered by `sort`, at most
    /// `limit` of them.
    fn list_rows(&self, kind: &str, filters: &[Condition], sort: &SortSpec, limit: Option<usize>) -> Result<Vec<Row>>;

    fn count_rows(&self, kind: &str, filters: &[Condition]) -> Result<usize>;

    /// Rows whose key column is one of `keys`, in any order.
    fn get_by_keys(&self, kind: &str, keys: &[String]) -> Result<Vec<Row>>;
}

/// Read permission check. Returns `Err(PermissionDenied)` to refuse.
pub trait PermissionGate: Send + Sync {
    fn check_read(&self, kind: &str, key: Option<&str>) -> Result<()>;
}

/// Grants every read.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionGate for AllowAll {
    fn check_read(&self, _kind: &str, _key: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// In-memory [`DataSource`], keyed by a configurable key column.
#[derive(Debug)]
pub struct MemorySource {
    key_field: String,
    tables: RwLock<HashMap<String, Vec<Row>>>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new("name")
    }
}

impl MemorySource {
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace (by key) a row.
    pub fn insert(&self, kind: &str, row: Row) -> Result<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| GraphQLError::DataSource("memory source lock poisoned".to_string()))?;
        let table = tables.entry(kind.to_string()).or_default();
        let key = row.get(self.key_field.as_str()).cloned();
        match key.and_then(|key| table.iter().position(|r| r.get(self.key_field.as_str()) == Some(&key))) {
            Some(index) => table[index] = row,
            None => table.push(row),
        }
        Ok(())
    }

    /// Set one column of an existing row.
    pub fn set_value(&self, kind: &str, key: &str, field: &str, value: Value) -> Result<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| GraphQLError::DataSource("memory source lock poisoned".to_string()))?;
        let row = tables
            .get_mut(kind)
            .and_then(|table| {
                table
                    .iter_mut()
                    .find(|r| r.get(self.key_field.as_str()) == Some(&Value::from(key)))
            })
            .ok_or_else(|| GraphQLError::DataSource(format!("{} {} not found", kind, key)))?;
        row.insert(Name::new(field), value);
        Ok(())
    }

    fn matching(&self, kind: &str, filters: &[Condition]) -> Result<Vec<Row>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| GraphQLError::DataSource("memory source lock poisoned".to_string()))?;
        Ok(tables
            .get(kind)
            .map(|table| {
                table
                    .iter()
                    .filter(|row| filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl DataSource for MemorySource {
    fn list_rows(&self, kind: &str, filters: &[Condition], sort: &SortSpec, limit: Option<usize>) -> Result<Vec<Row>> {
        let mut rows = self.matching(kind, filters)?;
        rows.sort_by(|a, b| {
            sort.fields
                .iter()
                .map(|field| {
                    let ordering = compare_values(field_value(a, field), field_value(b, field));
                    match sort.direction {
                        SortDirection::Asc => ordering,
                        SortDirection::Desc => ordering.reverse(),
                    }
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    fn count_rows(&self, kind: &str, filters: &[Condition]) -> Result<usize> {
        Ok(self.matching(kind, filters)?.len())
    }

    fn get_by_keys(&self, kind: &str, keys: &[String]) -> Result<Vec<Row>> {
        let values = keys.iter().map(|k| Value::from(k.as_str())).collect();
        self.matching(kind, &[Condition::one_of(self.key_field.as_str(), values)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, modified: &str) -> Row {
        let mut row = Row::new();
        row.insert(Name::new("name"), Value::from(name));
        row.insert(Name::new("modified"), Value::from(modified));
        row
    }

    fn source() -> MemorySource {
        let source = MemorySource::default();
        for (name, modified) in [("a", "2024-01-01"), ("b", "2024-01-03"), ("c", "2024-01-02")] {
            source.insert("User", user(name, modified)).unwrap();
        }
        source
    }

    #[test]
    fn test_list_rows_sorts_and_limits() {
        let rows = source()
            .list_rows("User", &[], &SortSpec::new(["modified"], SortDirection::Desc), Some(2))
            .unwrap();
        let names: Vec<_> = rows.iter().map(|r| r["name"].clone()).collect();
        assert_eq!(names, vec![Value::from("b"), Value::from("c")]);
    }

    #[test]
    fn test_count_applies_filters() {
        let count = source()
            .count_rows("User", &[Condition::compare("modified", crate::Operator::Gt, "2024-01-01")])
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(source().count_rows("Missing", &[]).unwrap(), 0);
    }

    #[test]
    fn test_insert_replaces_by_key() {
        let source = source();
        source.insert("User", user("a", "2025-01-01")).unwrap();
        assert_eq!(source.count_rows("User", &[]).unwrap(), 3);
        let rows = source.get_by_keys("User", &["a".to_string()]).unwrap();
        assert_eq!(rows[0]["modified"], Value::from("2025-01-01"));
    }

    #[test]
    fn test_set_value() {
        let source = source();
        source.set_value("User", "b", "full_name", Value::from("Bea")).unwrap();
        let rows = source.get_by_keys("User", &["b".to_string()]).unwrap();
        assert_eq!(rows[0]["full_name"], Value::from("Bea"));
        assert!(source.set_value("User", "zz", "full_name", Value::Null).is_err());
    }
}
