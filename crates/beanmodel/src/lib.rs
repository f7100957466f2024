//! BeanModel Rust - a small object-relational persistence runtime.
//!
//! BeanModel manages logical entities ("beans") over relational rows:
//!
//! - Lazy loading with a per-session identity map (one bean per key)
//! - Table-per-class inheritance chains treated as one logical bean
//! - A unit of work flushing saves and deletes as single transactions
//! - Many-to-many links recorded in memory and flushed with their bean
//! - A dynamic query planner with filter bags, validated ORDER BY, and
//!   derived count queries
//!
//! It sits between generated accessor code above and a synchronous database
//! driver below; both are collaborators, not part of this crate.
//!
//! # Quick Start
//!
//! ```ignore
//! use beanmodel::prelude::*;
//!
//! fn example(driver: Arc<dyn Driver>, schema: SchemaFacts) -> Result<()> {
//!     let session = Session::new(driver, schema);
//!
//!     // Create and save
//!     let author = session.create("author")?;
//!     author.set("name", Value::from("Ada"), None)?;
//!     session.save(&author)?;
//!
//!     // Query
//!     let finder = Finder::new(&session);
//!     let books = finder.find(
//!         "book",
//!         &Filter::equality([("status", Value::from("published"))]),
//!         &OrderBy::parse("title")?,
//!         &[],
//!         FetchMode::Buffered,
//!     )?;
//!     for book in books.iter()? {
//!         println!("{:?}", book.get("title", None)?);
//!     }
//!
//!     // Navigate and link
//!     let book = books.get(0)?;
//!     book.set_ref("fk_book_author", Some(&author), None)?;
//!     author.add_relationship("author_book", &book)?;
//!     session.save(&author)?;
//!     Ok(())
//! }
//! ```

pub mod finder;
pub mod result;

pub use beanmodel_core::{
    ColumnInfo, Driver, DriverError, Error, FromValue, Result, Row, SchemaError, SchemaErrorKind,
    Value, quote_ident,
};
pub use beanmodel_query::{FilterValue, OrderBy, OrderTerm};
pub use beanmodel_schema::{
    ColumnFacts, ForeignKey, SchemaFacts, SqlType, TableFacts, TypeConverter,
};
pub use beanmodel_session::{
    Bean, IdentityMap, LinkStatus, OwnedCollection, RelationshipLedger, RowPhase, RowState,
    Session, SessionCore, WeakBean,
};

pub use finder::{Filter, Finder};
pub use result::{FetchMode, Page, ResultIter, ResultSet};

/// Commonly used imports.
pub mod prelude {
    pub use crate::{
        Bean, Driver, Error, FetchMode, Filter, Finder, OrderBy, Page, Result, ResultSet,
        RowPhase, SchemaFacts, Session, SqlType, TableFacts, Value,
    };
    pub use std::sync::Arc;
}
