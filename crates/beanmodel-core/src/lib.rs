//! Core types and traits for BeanModel Rust.
//!
//! `beanmodel-core` contains the pieces every other crate builds on:
//!
//! - [`Value`] - dynamically-typed SQL values for parameter binding and results
//! - [`Row`] / [`ColumnInfo`] - query result rows with shared column metadata
//! - [`Error`] - the error taxonomy for the whole persistence runtime
//! - [`Driver`] - the synchronous database driver boundary
//!
//! The driver itself (SQL execution, transactions, identifier quoting) is an
//! external collaborator: this crate only defines the trait it must satisfy.

pub mod driver;
pub mod error;
pub mod row;
pub mod value;

pub use driver::{Driver, quote_ident, within_transaction};
pub use error::{DriverError, Error, Result, SchemaError, SchemaErrorKind};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
