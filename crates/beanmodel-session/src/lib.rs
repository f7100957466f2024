//! Bean lifecycle, identity map, and unit of work for BeanModel Rust.
//!
//! `beanmodel-session` is the stateful heart of the runtime:
//!
//! - [`RowState`] / [`RowPhase`] - the per-row lifecycle state machine
//! - [`Bean`] - one logical object spanning an inheritance chain of rows
//! - [`IdentityMap`] - weak `(table, key)` map guaranteeing one live row
//!   per key within a session
//! - [`RelationshipLedger`] - in-memory many-to-many link bookkeeping,
//!   flushed with the owning bean
//! - the unit of work - save and delete as single transactions
//!
//! A [`Session`] is a single logical execution context: callers serialize
//! access to it, and all driver calls are synchronous.

pub mod bean;
pub mod identity_map;
pub mod ledger;
pub mod row_state;
pub mod unit_of_work;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use beanmodel_core::{Driver, Error, Result, SchemaError, SchemaErrorKind, Value};
use beanmodel_query::resolve_table_group;
use beanmodel_schema::SchemaFacts;

pub use bean::{Bean, BeanInner, WeakBean};
pub use identity_map::{IdentityMap, SWEEP_EVERY, key_hash};
pub use ledger::{LinkStatus, OwnedCollection, RelationshipLedger};
pub use row_state::{RefSlot, RowPhase, RowState, SharedRow};

/// Shared session state: the driver, the schema facts, and the identity
/// map. Beans hold an `Arc` of this.
pub struct SessionCore {
    pub driver: Arc<dyn Driver>,
    pub schema: SchemaFacts,
    pub identity: RwLock<IdentityMap>,
}

/// One persistence session.
///
/// A session is one logical execution context: it takes no internal
/// responsibility for concurrent callers, and every database operation
/// blocks on the driver.
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    pub fn new(driver: Arc<dyn Driver>, schema: SchemaFacts) -> Self {
        Self {
            core: Arc::new(SessionCore {
                driver,
                schema,
                identity: RwLock::new(IdentityMap::new()),
            }),
        }
    }

    pub fn core(&self) -> &Arc<SessionCore> {
        &self.core
    }

    pub fn schema(&self) -> &SchemaFacts {
        &self.core.schema
    }

    pub fn driver(&self) -> Arc<dyn Driver> {
        self.core.driver.clone()
    }

    /// A fresh bean for `table`, spanning its whole inheritance chain,
    /// every row New.
    pub fn create(&self, table: &str) -> Result<Bean> {
        let chain = resolve_table_group(&self.core.schema, &[table.to_string()])?;
        let rows = chain
            .iter()
            .map(|t| Arc::new(RwLock::new(RowState::new_row(t))) as SharedRow)
            .collect();
        Ok(Bean::from_rows(rows, Some(self.core.clone())))
    }

    /// A bean for a row known to exist, fetched lazily on first read.
    ///
    /// `pk` is keyed by `table`'s primary-key columns. Within one session
    /// the same key always yields the same bean instance.
    pub fn reference(&self, table: &str, pk: BTreeMap<String, Value>) -> Result<Bean> {
        materialize(&self.core, table, pk)
    }

    /// Attach a detached bean; its rows become New and save will insert
    /// them. Attaching an already-attached bean is an error.
    pub fn attach(&self, bean: &Bean) -> Result<()> {
        bean.attach(&self.core)
    }

    /// Save a bean and its recorded links in one transaction.
    pub fn save(&self, bean: &Bean) -> Result<()> {
        unit_of_work::save(&self.core, bean)
    }

    /// Delete a bean (and its link rows) in one transaction. Dependents
    /// are left alone; active incoming keys surface as driver errors.
    pub fn delete(&self, bean: &Bean) -> Result<()> {
        unit_of_work::delete(&self.core, bean)
    }

    /// Delete a bean after transitively deleting everything that
    /// references it.
    pub fn delete_cascade(&self, bean: &Bean) -> Result<()> {
        unit_of_work::delete_cascade(&self.core, bean)
    }
}

/// Resolve `(table, pk)` to its bean, honoring the identity map.
///
/// A live row for the key resolves to its existing owning bean. Otherwise
/// NotLoaded placeholder rows are allocated for the whole chain and
/// registered, and a new bean assembled around them.
pub fn materialize(
    core: &Arc<SessionCore>,
    table: &str,
    pk: BTreeMap<String, Value>,
) -> Result<Bean> {
    let chain = resolve_table_group(&core.schema, &[table.to_string()])?;
    let deep_cols = core.schema.primary_key(table)?.to_vec();
    let mut values = Vec::with_capacity(deep_cols.len());
    for col in &deep_cols {
        values.push(pk.get(col).cloned().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "missing primary-key value for '{}.{}'",
                table, col
            ))
        })?);
    }

    {
        let identity = core.identity.read().expect("lock poisoned");
        if let Some(row) = identity.get(table, key_hash(&pk)) {
            if let Some(inner) = row.read().expect("lock poisoned").owner.upgrade() {
                return Ok(Bean { inner });
            }
        }
    }

    let mut rows: Vec<SharedRow> = Vec::with_capacity(chain.len());
    for t in &chain {
        let t_cols = core.schema.primary_key(t)?.to_vec();
        if t_cols.len() != values.len() {
            return Err(SchemaError::new(
                SchemaErrorKind::Invalid,
                format!(
                    "tables '{}' and '{}' share an inheritance line but their \
                     primary keys differ in arity",
                    t, table
                ),
            )
            .into());
        }
        let t_pk: BTreeMap<String, Value> =
            t_cols.into_iter().zip(values.iter().cloned()).collect();
        let hash = key_hash(&t_pk);
        let existing = core.identity.read().expect("lock poisoned").get(t, hash);
        let row = match existing {
            Some(row) => row,
            None => {
                let row: SharedRow = Arc::new(RwLock::new(RowState::placeholder(t, t_pk)));
                core.identity
                    .write()
                    .expect("lock poisoned")
                    .register(t, hash, &row);
                row
            }
        };
        rows.push(row);
    }
    extend_with_subclass_rows(core, &mut rows)?;
    Ok(Bean::from_rows(rows, Some(core.clone())))
}

/// Extend a chain of rows downward through the subclass tree.
///
/// A row referenced through its parent table may physically belong to a
/// subclass; each child table is probed for the shared key and a hit
/// deepens the chain, repeatedly. Found subclass rows come from the
/// identity map when live, otherwise fresh NotLoaded placeholders are
/// registered. Deletes then span the whole physical chain and subclass
/// columns stay reachable.
pub fn extend_with_subclass_rows(
    core: &Arc<SessionCore>,
    rows: &mut Vec<SharedRow>,
) -> Result<()> {
    let (mut table, pk) = match rows.last() {
        Some(last) => {
            let guard = last.read().expect("lock poisoned");
            (guard.table.clone(), guard.pk.clone())
        }
        None => return Ok(()),
    };
    if pk.is_empty() || pk.values().any(Value::is_null) {
        return Ok(());
    }
    let mut values = Vec::with_capacity(pk.len());
    for col in core.schema.primary_key(&table)? {
        values.push(pk.get(col).cloned().unwrap_or(Value::Null));
    }
    let q = |name: &str| core.driver.quote_identifier(name);
    'descend: loop {
        for child in core.schema.children_of(&table) {
            let child_cols = core.schema.primary_key(child)?.to_vec();
            if child_cols.len() != values.len() {
                continue;
            }
            let select_list = child_cols
                .iter()
                .map(|c| q(c))
                .collect::<Vec<_>>()
                .join(", ");
            let mut where_parts = Vec::with_capacity(child_cols.len());
            for (i, col) in child_cols.iter().enumerate() {
                where_parts.push(format!("{} = {}", q(col), core.driver.placeholder(i + 1)));
            }
            let sql = format!(
                "SELECT {} FROM {} WHERE {}",
                select_list,
                q(child),
                where_parts.join(" AND ")
            );
            if core.driver.query_one(&sql, &values)?.is_none() {
                continue;
            }
            let child_pk: BTreeMap<String, Value> =
                child_cols.into_iter().zip(values.iter().cloned()).collect();
            let hash = key_hash(&child_pk);
            let existing = core.identity.read().expect("lock poisoned").get(child, hash);
            let row = match existing {
                Some(row) => row,
                None => {
                    let row: SharedRow =
                        Arc::new(RwLock::new(RowState::placeholder(child, child_pk)));
                    core.identity
                        .write()
                        .expect("lock poisoned")
                        .register(child, hash, &row);
                    row
                }
            };
            tracing::debug!(table = %table, child = %child, "chain extends downward");
            rows.push(row);
            table = child.clone();
            continue 'descend;
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beanmodel_core::{DriverError, Row};
    use beanmodel_schema::{SqlType, TableFacts};
    use std::sync::Mutex;

    // =========================================================================
    // Mock driver
    // =========================================================================

    #[derive(Default)]
    struct MockState {
        log: Vec<(String, Vec<Value>)>,
        responses: Vec<(String, Vec<Row>)>,
        next_id: i64,
        fail_on: Option<String>,
    }

    #[derive(Default)]
    struct MockDriver {
        state: Mutex<MockState>,
    }

    impl MockDriver {
        fn new() -> Self {
            Self::default()
        }

        /// Serve `rows` for any query whose SQL contains `needle`.
        fn respond(&self, needle: &str, rows: Vec<Row>) {
            self.state
                .lock()
                .expect("lock poisoned")
                .responses
                .push((needle.to_string(), rows));
        }

        fn fail_on(&self, needle: &str) {
            self.state.lock().expect("lock poisoned").fail_on = Some(needle.to_string());
        }

        fn log(&self) -> Vec<(String, Vec<Value>)> {
            self.state.lock().expect("lock poisoned").log.clone()
        }

        fn statements(&self) -> Vec<String> {
            self.log().into_iter().map(|(sql, _)| sql).collect()
        }
    }

    impl Driver for MockDriver {
        fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
            let mut state = self.state.lock().expect("lock poisoned");
            state.log.push((sql.to_string(), params.to_vec()));
            for (needle, rows) in &state.responses {
                if sql.contains(needle.as_str()) {
                    return Ok(rows.clone());
                }
            }
            Ok(Vec::new())
        }

        fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
            let mut state = self.state.lock().expect("lock poisoned");
            state.log.push((sql.to_string(), params.to_vec()));
            if let Some(needle) = &state.fail_on {
                if sql.contains(needle.as_str()) {
                    return Err(DriverError::new("constraint failed")
                        .with_sql(sql)
                        .constraint_violation()
                        .into());
                }
            }
            if sql.starts_with("INSERT") {
                state.next_id += 1;
            }
            Ok(1)
        }

        fn last_insert_id(&self) -> Result<i64> {
            Ok(self.state.lock().expect("lock poisoned").next_id)
        }

        fn begin(&self) -> Result<()> {
            self.state
                .lock()
                .expect("lock poisoned")
                .log
                .push(("BEGIN".to_string(), Vec::new()));
            Ok(())
        }

        fn commit(&self) -> Result<()> {
            self.state
                .lock()
                .expect("lock poisoned")
                .log
                .push(("COMMIT".to_string(), Vec::new()));
            Ok(())
        }

        fn rollback(&self) -> Result<()> {
            self.state
                .lock()
                .expect("lock poisoned")
                .log
                .push(("ROLLBACK".to_string(), Vec::new()));
            Ok(())
        }
    }

    fn schema() -> SchemaFacts {
        SchemaFacts::new()
            .table(
                TableFacts::new("user")
                    .column("id", SqlType::Int)
                    .column("name", SqlType::Text)
                    .column("active", SqlType::Bool)
                    .primary_key(&["id"]),
            )
            .table(
                TableFacts::new("author")
                    .column("id", SqlType::Int)
                    .column("name", SqlType::Text)
                    .primary_key(&["id"]),
            )
            .table(
                TableFacts::new("book")
                    .column("id", SqlType::Int)
                    .column("title", SqlType::Text)
                    .column("author_id", SqlType::Int)
                    .primary_key(&["id"])
                    .foreign_key("fk_book_author", "author_id", "author", "id"),
            )
            .table(
                TableFacts::new("author_book")
                    .column("author_id", SqlType::Int)
                    .column("book_id", SqlType::Int)
                    .primary_key(&["author_id", "book_id"])
                    .foreign_key("fk_ab_author", "author_id", "author", "id")
                    .foreign_key("fk_ab_book", "book_id", "book", "id")
                    .pivot(),
            )
            .table(
                TableFacts::new("animal")
                    .column("id", SqlType::Int)
                    .column("name", SqlType::Text)
                    .primary_key(&["id"]),
            )
            .table(
                TableFacts::new("dog")
                    .column("id", SqlType::Int)
                    .column("breed", SqlType::Text)
                    .primary_key(&["id"])
                    .foreign_key("fk_dog_animal", "id", "animal", "id")
                    .inherits("animal"),
            )
            .table(
                TableFacts::new("node")
                    .column("id", SqlType::Int)
                    .column("parent_id", SqlType::Int)
                    .primary_key(&["id"])
                    .foreign_key("fk_node_parent", "parent_id", "node", "id"),
            )
    }

    fn session() -> (Arc<MockDriver>, Session) {
        let driver = Arc::new(MockDriver::new());
        let session = Session::new(driver.clone(), schema());
        (driver, session)
    }

    fn pk(id: i64) -> BTreeMap<String, Value> {
        BTreeMap::from([("id".to_string(), Value::Int(id))])
    }

    // =========================================================================
    // Save
    // =========================================================================

    #[test]
    fn save_inserts_and_assigns_the_generated_key() {
        let (driver, session) = session();
        let user = session.create("user").unwrap();
        user.set("name", Value::from("Ada"), None).unwrap();
        session.save(&user).unwrap();

        let statements = driver.statements();
        assert_eq!(
            statements,
            vec![
                "BEGIN".to_string(),
                "INSERT INTO \"user\" (\"name\") VALUES ($1)".to_string(),
                "COMMIT".to_string(),
            ]
        );
        assert_eq!(user.get("id", None).unwrap(), Value::Int(1));
        assert_eq!(user.phase(), RowPhase::Loaded);
    }

    #[test]
    fn bool_columns_are_stored_as_integers() {
        let (driver, session) = session();
        let user = session.create("user").unwrap();
        user.set("active", Value::Bool(true), None).unwrap();
        session.save(&user).unwrap();

        let log = driver.log();
        let insert = log.iter().find(|(sql, _)| sql.starts_with("INSERT")).unwrap();
        assert_eq!(insert.1, vec![Value::Int(1)]);
    }

    #[test]
    fn update_touches_only_dirty_columns() {
        let (driver, session) = session();
        let user = session.create("user").unwrap();
        user.set("name", Value::from("Ada"), None).unwrap();
        user.set("active", Value::Bool(true), None).unwrap();
        session.save(&user).unwrap();

        user.set("name", Value::from("Grace"), None).unwrap();
        assert_eq!(user.phase(), RowPhase::Dirty);
        session.save(&user).unwrap();

        let statements = driver.statements();
        let update = statements.iter().find(|s| s.starts_with("UPDATE")).unwrap();
        assert_eq!(
            update,
            "UPDATE \"user\" SET \"name\" = $1 WHERE \"id\" = $2"
        );
        assert_eq!(user.phase(), RowPhase::Loaded);
    }

    #[test]
    fn failed_save_rolls_back() {
        let (driver, session) = session();
        driver.fail_on("INSERT INTO \"user\"");
        let user = session.create("user").unwrap();
        user.set("name", Value::from("Ada"), None).unwrap();

        let err = session.save(&user).unwrap_err();
        assert!(err.is_constraint_violation());
        let statements = driver.statements();
        assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
    }

    // =========================================================================
    // Inheritance chains
    // =========================================================================

    #[test]
    fn chain_insert_goes_parent_first_and_shares_the_key() {
        let (driver, session) = session();
        let dog = session.create("dog").unwrap();
        dog.set("name", Value::from("Rex"), Some("animal")).unwrap();
        dog.set("breed", Value::from("collie"), None).unwrap();
        session.save(&dog).unwrap();

        let log = driver.log();
        let inserts: Vec<&(String, Vec<Value>)> = log
            .iter()
            .filter(|(sql, _)| sql.starts_with("INSERT"))
            .collect();
        assert_eq!(inserts.len(), 2);
        assert!(inserts[0].0.contains("\"animal\""));
        assert!(inserts[1].0.contains("\"dog\""));
        // The generated animal id rides along into the dog row.
        assert!(inserts[1].1.contains(&Value::Int(1)));
        assert_eq!(dog.get("id", None).unwrap(), Value::Int(1));
        assert_eq!(dog.get("id", Some("animal")).unwrap(), Value::Int(1));
    }

    #[test]
    fn chain_delete_goes_child_first() {
        let (driver, session) = session();
        let dog = session.create("dog").unwrap();
        dog.set("breed", Value::from("collie"), None).unwrap();
        session.save(&dog).unwrap();
        session.delete(&dog).unwrap();

        let deletes: Vec<String> = driver
            .statements()
            .into_iter()
            .filter(|s| s.starts_with("DELETE"))
            .collect();
        assert_eq!(deletes.len(), 2);
        assert!(deletes[0].contains("\"dog\""));
        assert!(deletes[1].contains("\"animal\""));
        assert_eq!(dog.phase(), RowPhase::Deleted);
    }

    #[test]
    fn parent_reference_spans_subclass_rows() {
        let (driver, session) = session();
        // The key physically has a dog row, so the chain deepens.
        driver.respond(
            "FROM \"dog\"",
            vec![Row::new(vec!["id".to_string()], vec![Value::Int(5)])],
        );
        let animal = session.reference("animal", pk(5)).unwrap();
        assert_eq!(
            animal.tables(),
            vec!["animal".to_string(), "dog".to_string()]
        );

        session.delete(&animal).unwrap();
        let deletes: Vec<String> = driver
            .statements()
            .into_iter()
            .filter(|s| s.starts_with("DELETE"))
            .collect();
        assert_eq!(
            deletes,
            vec![
                "DELETE FROM \"dog\" WHERE \"id\" = $1".to_string(),
                "DELETE FROM \"animal\" WHERE \"id\" = $1".to_string(),
            ]
        );
    }

    #[test]
    fn reference_without_a_subclass_row_stays_parent_only() {
        let (driver, session) = session();
        let animal = session.reference("animal", pk(6)).unwrap();
        assert_eq!(animal.tables(), vec!["animal".to_string()]);
        let probes = driver
            .statements()
            .into_iter()
            .filter(|s| s.contains("FROM \"dog\""))
            .count();
        assert_eq!(probes, 1);
    }

    // =========================================================================
    // References
    // =========================================================================

    #[test]
    fn referenced_new_bean_is_inserted_first() {
        let (driver, session) = session();
        let author = session.create("author").unwrap();
        author.set("name", Value::from("Ada"), None).unwrap();
        let book = session.create("book").unwrap();
        book.set("title", Value::from("Notes"), None).unwrap();
        book.set_ref("fk_book_author", Some(&author), None).unwrap();

        session.save(&book).unwrap();

        let log = driver.log();
        let inserts: Vec<&(String, Vec<Value>)> = log
            .iter()
            .filter(|(sql, _)| sql.starts_with("INSERT"))
            .collect();
        assert_eq!(inserts.len(), 2);
        assert!(inserts[0].0.contains("\"author\""));
        assert!(inserts[1].0.contains("\"book\""));
        // author's generated key appears in the book row
        assert!(inserts[1].1.contains(&Value::Int(1)));
        assert_eq!(book.get("author_id", None).unwrap(), Value::Int(1));
    }

    #[test]
    fn reference_to_deleted_bean_is_rejected() {
        let (_, session) = session();
        let author = session.create("author").unwrap();
        session.save(&author).unwrap();
        session.delete(&author).unwrap();

        let book = session.create("book").unwrap();
        book.set_ref("fk_book_author", Some(&author), None).unwrap();
        let err = session.save(&book).unwrap_err();
        assert!(matches!(err, Error::MissingReference(_)));
    }

    #[test]
    fn mutual_references_between_unsaved_beans_are_a_cycle() {
        let (_, session) = session();
        let a = session.create("node").unwrap();
        let b = session.create("node").unwrap();
        a.set_ref("fk_node_parent", Some(&b), None).unwrap();
        b.set_ref("fk_node_parent", Some(&a), None).unwrap();

        let err = session.save(&a).unwrap_err();
        assert!(matches!(err, Error::CyclicReference(_)));
    }

    #[test]
    fn get_ref_navigates_through_the_identity_map() {
        let (_, session) = session();
        let author = session.create("author").unwrap();
        session.save(&author).unwrap();

        let book = session.create("book").unwrap();
        book.set("author_id", Value::Int(1), None).unwrap();
        session.save(&book).unwrap();

        let target = book.get_ref("fk_book_author", None).unwrap().unwrap();
        assert_eq!(target, author);
    }

    // =========================================================================
    // Identity map
    // =========================================================================

    #[test]
    fn same_key_yields_the_same_bean_instance() {
        let (_, session) = session();
        let a = session.reference("user", pk(7)).unwrap();
        let b = session.reference("user", pk(7)).unwrap();
        assert_eq!(a, b);
        let c = session.reference("user", pk(8)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn lazy_load_fetches_once_and_surfaces_missing_rows() {
        let (driver, session) = session();
        driver.respond(
            "FROM \"user\"",
            vec![Row::new(
                vec!["id".to_string(), "name".to_string(), "active".to_string()],
                vec![Value::Int(7), Value::from("Ada"), Value::Int(1)],
            )],
        );
        let user = session.reference("user", pk(7)).unwrap();
        assert_eq!(user.phase(), RowPhase::NotLoaded);
        assert_eq!(user.get("name", None).unwrap(), Value::from("Ada"));
        // bool conversion on load
        assert_eq!(user.get("active", None).unwrap(), Value::Bool(true));
        assert_eq!(user.phase(), RowPhase::Loaded);
        let selects = driver
            .statements()
            .into_iter()
            .filter(|s| s.starts_with("SELECT"))
            .count();
        assert_eq!(selects, 1);

        let ghost = session.reference("author", pk(9)).unwrap();
        let err = ghost.get("name", None).unwrap_err();
        assert!(matches!(err, Error::NoBeanFound(_)));
    }

    // =========================================================================
    // Relationships
    // =========================================================================

    #[test]
    fn add_then_remove_before_save_writes_nothing() {
        let (driver, session) = session();
        let author = session.create("author").unwrap();
        session.save(&author).unwrap();
        let book = session.create("book").unwrap();
        session.save(&book).unwrap();

        author.add_relationship("author_book", &book).unwrap();
        author.remove_relationship("author_book", &book).unwrap();
        session.save(&author).unwrap();

        let pivot_writes = driver
            .statements()
            .into_iter()
            .filter(|s| {
                s.contains("\"author_book\"") && (s.starts_with("INSERT") || s.starts_with("DELETE"))
            })
            .count();
        assert_eq!(pivot_writes, 0);
    }

    #[test]
    fn persisted_link_removal_deletes_exactly_one_pivot_row() {
        let (driver, session) = session();
        let author = session.create("author").unwrap();
        session.save(&author).unwrap();
        let book = session.create("book").unwrap();
        session.save(&book).unwrap();

        author.add_relationship("author_book", &book).unwrap();
        session.save(&author).unwrap();
        assert!(author.has_relationship("author_book", &book).unwrap());

        author.remove_relationship("author_book", &book).unwrap();
        session.save(&author).unwrap();

        let statements = driver.statements();
        let inserts = statements
            .iter()
            .filter(|s| s.starts_with("INSERT INTO \"author_book\""))
            .count();
        let deletes = statements
            .iter()
            .filter(|s| s.starts_with("DELETE FROM \"author_book\""))
            .count();
        assert_eq!(inserts, 1);
        assert_eq!(deletes, 1);
        assert!(!author.has_relationship("author_book", &book).unwrap());
    }

    #[test]
    fn linking_an_unsaved_bean_saves_it_during_flush() {
        let (driver, session) = session();
        let author = session.create("author").unwrap();
        session.save(&author).unwrap();

        let book = session.create("book").unwrap();
        book.set("title", Value::from("Notes"), None).unwrap();
        author.add_relationship("author_book", &book).unwrap();
        session.save(&author).unwrap();

        let statements = driver.statements();
        let book_insert = statements
            .iter()
            .position(|s| s.starts_with("INSERT INTO \"book\""));
        let pivot_insert = statements
            .iter()
            .position(|s| s.starts_with("INSERT INTO \"author_book\""));
        assert!(book_insert.is_some());
        assert!(pivot_insert.is_some());
        assert!(book_insert < pivot_insert);
        assert_eq!(book.phase(), RowPhase::Loaded);
    }

    // =========================================================================
    // Delete and cascade
    // =========================================================================

    #[test]
    fn deleting_a_never_saved_bean_writes_nothing() {
        let (driver, session) = session();
        let user = session.create("user").unwrap();
        user.set("name", Value::from("Ada"), None).unwrap();
        session.delete(&user).unwrap();
        assert!(driver.statements().is_empty());
        assert_eq!(user.phase(), RowPhase::Deleted);
    }

    #[test]
    fn deleting_a_detached_bean_is_an_error() {
        let (_, session) = session();
        let user = session.create("user").unwrap();
        let copy = user.detached_copy();
        let err = session.delete(&copy).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn delete_without_cascade_surfaces_driver_constraint_errors() {
        let (driver, session) = session();
        let author = session.create("author").unwrap();
        session.save(&author).unwrap();
        driver.fail_on("DELETE FROM \"author\"");

        let err = session.delete(&author).unwrap_err();
        assert!(err.is_constraint_violation());
        assert_eq!(
            driver.statements().last().map(String::as_str),
            Some("ROLLBACK")
        );
    }

    #[test]
    fn cascade_deletes_dependents_before_the_bean() {
        let (driver, session) = session();
        let author = session.create("author").unwrap();
        session.save(&author).unwrap();
        // One book points at the author.
        driver.respond(
            "FROM \"book\"",
            vec![Row::new(vec!["id".to_string()], vec![Value::Int(42)])],
        );

        session.delete_cascade(&author).unwrap();

        let statements = driver.statements();
        let book_delete = statements
            .iter()
            .position(|s| s.starts_with("DELETE FROM \"book\""));
        let author_delete = statements
            .iter()
            .position(|s| s.starts_with("DELETE FROM \"author\""));
        assert!(book_delete.is_some());
        assert!(author_delete.is_some());
        assert!(book_delete < author_delete);
    }

    #[test]
    fn delete_clears_recorded_links_on_both_sides() {
        let (_, session) = session();
        let author = session.create("author").unwrap();
        session.save(&author).unwrap();
        let book = session.create("book").unwrap();
        session.save(&book).unwrap();

        author.add_relationship("author_book", &book).unwrap();
        session.save(&author).unwrap();
        assert!(author.has_relationship("author_book", &book).unwrap());

        session.delete(&book).unwrap();

        assert!(!author.has_relationship("author_book", &book).unwrap());
        assert!(author.related("author_book").unwrap().is_empty());
        assert!(!book.has_relationship("author_book", &author).unwrap());
    }

    // =========================================================================
    // Lifecycle odds and ends
    // =========================================================================

    #[test]
    fn detached_copy_can_be_attached_and_saved_as_new() {
        let (driver, session) = session();
        let user = session.create("user").unwrap();
        user.set("name", Value::from("Ada"), None).unwrap();
        session.save(&user).unwrap();

        let copy = user.detached_copy();
        assert_eq!(copy.phase(), RowPhase::Detached);
        assert_ne!(copy, user);
        session.attach(&copy).unwrap();
        session.save(&copy).unwrap();

        let inserts = driver
            .statements()
            .into_iter()
            .filter(|s| s.starts_with("INSERT INTO \"user\""))
            .count();
        assert_eq!(inserts, 2);
        assert_eq!(copy.get("id", None).unwrap(), Value::Int(2));
    }

    #[test]
    fn double_attach_is_an_error() {
        let (_, session) = session();
        let user = session.create("user").unwrap();
        let err = session.attach(&user).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn discard_changes_resets_to_not_loaded() {
        let (_, session) = session();
        let user = session.create("user").unwrap();
        user.set("name", Value::from("Ada"), None).unwrap();
        session.save(&user).unwrap();
        user.set("name", Value::from("Grace"), None).unwrap();

        user.discard_changes().unwrap();
        assert_eq!(user.phase(), RowPhase::NotLoaded);
    }
}
