//! Table, column, key, and inheritance facts.

use beanmodel_core::{Result, SchemaError, SchemaErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::convert::TypeConverter;

/// SQL column type, as reported by the introspection collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    /// Boolean (may be stored as an integer by the driver)
    Bool,
    /// 64-bit signed integer
    Int,
    /// 64-bit floating point
    Float,
    /// Text string
    Text,
    /// Binary data
    Bytes,
}

/// Facts about one column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnFacts {
    /// Column name.
    pub name: String,
    /// Declared SQL type.
    pub sql_type: SqlType,
}

/// A foreign-key definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name, unique within its table.
    pub name: String,
    /// Referencing columns on the local table, in order.
    pub local_columns: Vec<String>,
    /// The referenced table.
    pub foreign_table: String,
    /// Referenced columns on the foreign table, in order.
    pub foreign_columns: Vec<String>,
}

/// Facts about one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFacts {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnFacts>,
    /// Primary-key column names.
    pub primary_key: Vec<String>,
    /// Foreign keys declared on this table.
    pub foreign_keys: Vec<ForeignKey>,
    /// Parent table in a single-line inheritance chain, if any.
    pub parent: Option<String>,
    /// Child tables, derived when the schema is assembled.
    #[serde(default)]
    pub children: Vec<String>,
    /// Whether this is a junction/pivot table.
    pub pivot: bool,
}

impl TableFacts {
    /// Start building facts for a table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            parent: None,
            children: Vec::new(),
            pivot: false,
        }
    }

    /// Add a column.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        self.columns.push(ColumnFacts {
            name: name.into(),
            sql_type,
        });
        self
    }

    /// Set the primary-key columns.
    #[must_use]
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Add a single-column foreign key.
    #[must_use]
    pub fn foreign_key(
        mut self,
        name: impl Into<String>,
        local: &str,
        foreign_table: &str,
        foreign: &str,
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            name: name.into(),
            local_columns: vec![local.to_string()],
            foreign_table: foreign_table.to_string(),
            foreign_columns: vec![foreign.to_string()],
        });
        self
    }

    /// Set the parent table for inheritance.
    #[must_use]
    pub fn inherits(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Mark this table as a junction/pivot table.
    #[must_use]
    pub fn pivot(mut self) -> Self {
        self.pivot = true;
        self
    }

    /// Look up a column by name.
    pub fn column_facts(&self, name: &str) -> Option<&ColumnFacts> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether a column is part of the primary key.
    pub fn is_pk_column(&self, name: &str) -> bool {
        self.primary_key.iter().any(|c| c == name)
    }
}

/// Read-only schema facts for a whole database.
///
/// Keyed by table name; lookups that reference a missing table fail with a
/// [`SchemaError`] rather than panicking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaFacts {
    tables: BTreeMap<String, TableFacts>,
}

impl SchemaFacts {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table, deriving child links from its `parent` setting.
    #[must_use]
    pub fn table(mut self, facts: TableFacts) -> Self {
        if let Some(parent) = facts.parent.clone() {
            if let Some(parent_facts) = self.tables.get_mut(&parent) {
                if !parent_facts.children.contains(&facts.name) {
                    parent_facts.children.push(facts.name.clone());
                }
            } else {
                tracing::warn!(
                    table = %facts.name,
                    parent = %parent,
                    "table declares a parent that is not (yet) in the schema"
                );
            }
        }
        // Re-link any previously added tables that name this one as parent.
        let mut facts = facts;
        for other in self.tables.values() {
            if other.parent.as_deref() == Some(facts.name.as_str())
                && !facts.children.contains(&other.name)
            {
                facts.children.push(other.name.clone());
            }
        }
        self.tables.insert(facts.name.clone(), facts);
        self
    }

    /// All table names, sorted.
    pub fn tables(&self) -> impl Iterator<Item = &TableFacts> {
        self.tables.values()
    }

    /// Look up a table, failing with `TableNotFound`.
    pub fn table_facts(&self, name: &str) -> Result<&TableFacts> {
        self.tables.get(name).ok_or_else(|| {
            SchemaError::new(
                SchemaErrorKind::TableNotFound,
                format!("unknown table '{}'", name),
            )
            .into()
        })
    }

    /// Whether a table exists.
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Primary-key columns for a table.
    ///
    /// A table without a primary key is never supported; this fails with
    /// `MissingPrimaryKey` rather than returning an empty slice.
    pub fn primary_key(&self, table: &str) -> Result<&[String]> {
        let facts = self.table_facts(table)?;
        if facts.primary_key.is_empty() {
            return Err(SchemaError::new(
                SchemaErrorKind::MissingPrimaryKey,
                format!("table '{}' has no primary key", table),
            )
            .into());
        }
        Ok(&facts.primary_key)
    }

    /// Look up a foreign key by name.
    pub fn foreign_key(&self, table: &str, name: &str) -> Result<&ForeignKey> {
        let facts = self.table_facts(table)?;
        facts
            .foreign_keys
            .iter()
            .find(|fk| fk.name == name)
            .ok_or_else(|| {
                SchemaError::new(
                    SchemaErrorKind::ForeignKeyNotFound,
                    format!("table '{}' has no foreign key '{}'", table, name),
                )
                .into()
            })
    }

    /// Parent table in the inheritance chain, if any.
    pub fn parent_of(&self, table: &str) -> Option<&str> {
        self.tables
            .get(table)
            .and_then(|t| t.parent.as_deref())
    }

    /// Child tables in the inheritance chain.
    pub fn children_of(&self, table: &str) -> &[String] {
        self.tables
            .get(table)
            .map_or(&[], |t| t.children.as_slice())
    }

    /// Whether a table is a junction/pivot table.
    pub fn is_pivot(&self, table: &str) -> bool {
        self.tables.get(table).is_some_and(|t| t.pivot)
    }

    /// Every (table, foreign key) in the schema that references `target`.
    pub fn foreign_keys_into(&self, target: &str) -> Vec<(&TableFacts, &ForeignKey)> {
        let mut found = Vec::new();
        for facts in self.tables.values() {
            for fk in &facts.foreign_keys {
                if fk.foreign_table == target {
                    found.push((facts, fk));
                }
            }
        }
        found
    }

    /// The type converter for a table.
    pub fn converter(&self, table: &str) -> Result<TypeConverter<'_>> {
        Ok(TypeConverter::new(self.table_facts(table)?))
    }
}
