//! Dynamic query planning for BeanModel Rust.
//!
//! `beanmodel-query` turns a target table, a [`FilterBag`], an order spec,
//! and a set of additional join tables into executable SQL plus parameters:
//!
//! - [`FilterBag`]: the closed union of accepted filter inputs, compiled
//!   to a WHERE clause with bound parameters.
//! - [`OrderBy`]: validated ORDER BY parsing, with an explicit unchecked
//!   escape hatch for raw fragments.
//! - [`resolve_table_group`]: links tables into one inheritance chain.
//! - [`QueryPlanner`]: assembles the select, its decoding map, a derived
//!   count query, and an embeddable primary-key sub-select.
//!
//! Plans execute through the `Driver` trait from `beanmodel-core`; decoding
//! the resulting rows into beans is the session layer's job.

pub mod filter;
pub mod inheritance;
pub mod order;
pub mod plan;
pub mod planner;

pub use filter::{FilterBag, FilterValue};
pub use inheritance::resolve_table_group;
pub use order::{OrderBy, OrderTerm};
pub use plan::{ColumnDescriptor, QueryPlan, SelectShape, derive_count, number_placeholders};
pub use planner::QueryPlanner;
