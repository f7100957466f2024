//! Resolution of a set of tables into one inheritance chain.

use std::collections::HashSet;

use beanmodel_core::{Error, Result};
use beanmodel_schema::SchemaFacts;

/// Link a set of tables into one straight inheritance chain, root first.
///
/// Each supplied table is walked upward to its root; every walked path must
/// be a prefix of the longest one, otherwise the tables sit on diverging
/// branches (sibling children of one parent, unsupported multiple
/// inheritance) and resolution fails with
/// [`Error::InheritanceResolution`].
pub fn resolve_table_group(schema: &SchemaFacts, tables: &[String]) -> Result<Vec<String>> {
    if tables.is_empty() {
        return Err(Error::InheritanceResolution(
            "no tables supplied".to_string(),
        ));
    }

    let mut paths = Vec::with_capacity(tables.len());
    for table in tables {
        paths.push(ancestor_path(schema, table)?);
    }
    paths.sort_by_key(|p| p.len());

    let longest = paths.pop().unwrap_or_default();
    for path in &paths {
        if !longest.starts_with(path) {
            return Err(Error::InheritanceResolution(format!(
                "tables [{}] do not form one inheritance line",
                tables.join(", ")
            )));
        }
    }
    Ok(longest)
}

/// The root-to-table chain for a single table.
fn ancestor_path(schema: &SchemaFacts, table: &str) -> Result<Vec<String>> {
    // Validate the table exists before walking.
    schema.table_facts(table)?;

    let mut path = vec![table.to_string()];
    let mut seen: HashSet<String> = HashSet::from([table.to_string()]);
    let mut current = table.to_string();
    while let Some(parent) = schema.parent_of(&current) {
        if !seen.insert(parent.to_string()) {
            return Err(Error::InheritanceResolution(format!(
                "inheritance cycle through table '{}'",
                parent
            )));
        }
        path.push(parent.to_string());
        current = parent.to_string();
    }
    path.reverse();
    Ok(path)
}
