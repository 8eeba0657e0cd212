//! Pre-execution document checks.

use std::collections::HashMap;

use async_graphql::parser::types::{
    DocumentOperations, ExecutableDocument, FragmentDefinition, OperationDefinition, Selection,
    SelectionSet,
};
use async_graphql::{Name, Pos, Positioned, ServerError};
use indexmap::IndexMap;

type Fragments = HashMap<Name, Positioned<FragmentDefinition>>;

fn operations(document: &ExecutableDocument) -> Vec<(String, &Positioned<OperationDefinition>)> {
    match &document.operations {
        DocumentOperations::Single(operation) => vec![("anonymous".to_string(), operation)],
        DocumentOperations::Multiple(operations) => operations
            .iter()
            .map(|(name, operation)| (name.to_string(), operation))
            .collect(),
    }
}

/// Reject any operation nested deeper than `max_depth` levels.
///
/// A field only counts when it has a sub-selection; fragment spreads are
/// expanded in place and introspection fields (`__*`) are not counted.
pub fn check_depth(document: &ExecutableDocument, max_depth: usize) -> Result<(), ServerError> {
    for (name, operation) in operations(document) {
        let mut crawler = DepthCrawler {
            fragments: &document.fragments,
            max_depth,
            visiting: Vec::new(),
        };
        if let Err(pos) = crawler.selection_set(&operation.node.selection_set.node, 0) {
            return Err(ServerError::new(
                format!("'{}' exceeds maximum operation depth of {}.", name, max_depth),
                Some(pos),
            ));
        }
    }
    Ok(())
}

/// Depth of every operation in the document, by operation name.
pub fn operation_depths(document: &ExecutableDocument) -> IndexMap<String, usize> {
    operations(document)
        .into_iter()
        .map(|(name, operation)| {
            let mut crawler = DepthCrawler {
                fragments: &document.fragments,
                max_depth: usize::MAX,
                visiting: Vec::new(),
            };
            let depth = crawler
                .selection_set(&operation.node.selection_set.node, 0)
                .unwrap_or(usize::MAX);
            (name, depth)
        })
        .collect()
}

/// Reject documents that select `__schema` or `__type` anywhere, fragments
/// included.
pub fn check_introspection(document: &ExecutableDocument) -> Result<(), ServerError> {
    let sets = operations(document)
        .into_iter()
        .map(|(_, operation)| &operation.node.selection_set.node)
        .chain(document.fragments.values().map(|fragment| &fragment.node.selection_set.node));
    for set in sets {
        if let Some((name, pos)) = find_schema_field(set) {
            return Err(ServerError::new(
                format!(
                    "GraphQL introspection has been disabled, but the requested query contained the field '{}'.",
                    name
                ),
                Some(pos),
            ));
        }
    }
    Ok(())
}

fn find_schema_field(set: &SelectionSet) -> Option<(&str, Pos)> {
    set.items.iter().find_map(|selection| match &selection.node {
        Selection::Field(field) => {
            let name = field.node.name.node.as_str();
            if name == "__schema" || name == "__type" {
                Some((name, field.pos))
            } else {
                find_schema_field(&field.node.selection_set.node)
            }
        }
        Selection::InlineFragment(inline) => find_schema_field(&inline.node.selection_set.node),
        Selection::FragmentSpread(_) => None,
    })
}

struct DepthCrawler<'d> {
    fragments: &'d Fragments,
    max_depth: usize,
    /// Fragments on the current path; a cycle would otherwise recurse forever.
    visiting: Vec<&'d str>,
}

impl<'d> DepthCrawler<'d> {
    fn selection_set(&mut self, set: &'d SelectionSet, depth: usize) -> Result<usize, Pos> {
        let mut deepest = 0;
        for selection in &set.items {
            let found = match &selection.node {
                Selection::Field(field) => {
                    if depth > self.max_depth {
                        return Err(field.pos);
                    }
                    let field = &field.node;
                    if field.name.node.starts_with("__") || field.selection_set.node.items.is_empty() {
                        0
                    } else {
                        1 + self.selection_set(&field.selection_set.node, depth + 1)?
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let name = spread.node.fragment_name.node.as_str();
                    match self.fragments.get(name) {
                        Some(fragment) if !self.visiting.contains(&name) => {
                            self.visiting.push(name);
                            let found = self.selection_set(&fragment.node.selection_set.node, depth);
                            self.visiting.pop();
                            found?
                        }
                        _ => 0,
                    }
                }
                Selection::InlineFragment(inline) => self.selection_set(&inline.node.selection_set.node, depth)?,
            };
            deepest = deepest.max(found);
        }
        Ok(deepest)
    }
}
