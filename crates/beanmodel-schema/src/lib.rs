//! Schema metadata facts for BeanModel Rust.
//!
//! `beanmodel-schema` is a read-only view over table, column, primary-key,
//! foreign-key, and inheritance metadata. The metadata itself comes from an
//! external introspection collaborator; this crate only holds and indexes
//! the facts the persistence runtime needs:
//!
//! - primary-key columns per table (a table without one is never supported)
//! - foreign-key definitions, by name and by referenced table
//! - parent/child links for single-line table inheritance
//! - pivot-table detection for many-to-many relationships
//! - a per-table [`TypeConverter`] between values and stored representation

pub mod convert;
pub mod facts;

pub use convert::TypeConverter;
pub use facts::{ColumnFacts, ForeignKey, SchemaFacts, SqlType, TableFacts};
