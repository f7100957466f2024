//! The bean: one logical object spanning an inheritance chain of rows.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use beanmodel_core::{Error, Result, Value};

use crate::SessionCore;
use crate::ledger::{self, OwnedCollection, RelationshipLedger};
use crate::row_state::{RefSlot, RowPhase, SharedRow};

/// The shared state behind a [`Bean`] handle.
pub struct BeanInner {
    /// Row per chain table, strictly parent-first. All rows share the
    /// primary key once it is assigned.
    pub rows: Vec<SharedRow>,
    /// Many-to-many link bookkeeping.
    pub ledger: RelationshipLedger,
    /// Session this bean is attached to, if any.
    pub core: Option<Arc<SessionCore>>,
}

/// A handle to one persistent object.
///
/// `Clone` clones the handle, not the object: all clones observe the same
/// state, and equality is handle identity. Use [`Bean::detached_copy`] for
/// an independent copy.
#[derive(Clone)]
pub struct Bean {
    pub(crate) inner: Arc<RwLock<BeanInner>>,
}

/// A non-owning bean handle, used for mirror-side ledger entries.
#[derive(Clone, Default)]
pub struct WeakBean {
    pub(crate) inner: Weak<RwLock<BeanInner>>,
}

impl WeakBean {
    pub fn upgrade(&self) -> Option<Bean> {
        self.inner.upgrade().map(|inner| Bean { inner })
    }
}

impl PartialEq for Bean {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Bean {}

impl fmt::Debug for Bean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // No locking here: Debug must work mid-operation.
        f.debug_tuple("Bean").field(&Arc::as_ptr(&self.inner)).finish()
    }
}

impl Bean {
    /// Assemble a bean from its chain rows, parent-first.
    ///
    /// Rows without a live owner adopt this bean; rows that already belong
    /// to a live bean keep their owner.
    pub fn from_rows(rows: Vec<SharedRow>, core: Option<Arc<SessionCore>>) -> Bean {
        let bean = Bean {
            inner: Arc::new(RwLock::new(BeanInner {
                rows: rows.clone(),
                ledger: RelationshipLedger::new(),
                core,
            })),
        };
        for row in &rows {
            let mut guard = row.write().expect("lock poisoned");
            if guard.owner.upgrade().is_none() {
                guard.owner = Arc::downgrade(&bean.inner);
            }
        }
        bean
    }

    /// The live bean owning `row`, if any.
    pub fn owner_of(row: &SharedRow) -> Option<Bean> {
        row.read()
            .expect("lock poisoned")
            .owner
            .upgrade()
            .map(|inner| Bean { inner })
    }

    pub fn downgrade(&self) -> WeakBean {
        WeakBean {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The chain rows, parent-first.
    pub fn rows(&self) -> Vec<SharedRow> {
        self.inner.read().expect("lock poisoned").rows.clone()
    }

    /// The deepest (most specific) table of the chain.
    pub fn table(&self) -> String {
        self.rows()
            .last()
            .map(|r| r.read().expect("lock poisoned").table.clone())
            .unwrap_or_default()
    }

    /// All chain tables, parent-first.
    pub fn tables(&self) -> Vec<String> {
        self.rows()
            .iter()
            .map(|r| r.read().expect("lock poisoned").table.clone())
            .collect()
    }

    /// The lifecycle phase of the deepest row.
    pub fn phase(&self) -> RowPhase {
        self.rows()
            .last()
            .map(|r| r.read().expect("lock poisoned").phase)
            .unwrap_or(RowPhase::Detached)
    }

    /// The primary key of the deepest row.
    pub fn primary_key(&self) -> BTreeMap<String, Value> {
        self.rows()
            .last()
            .map(|r| r.read().expect("lock poisoned").pk.clone())
            .unwrap_or_default()
    }

    /// Whether every primary-key column has a value.
    pub fn primary_key_is_set(&self) -> bool {
        self.rows()
            .last()
            .is_some_and(|r| r.read().expect("lock poisoned").pk_is_set())
    }

    /// The primary key as held by a specific chain table's row.
    pub fn pk_for_table(&self, table: &str) -> Result<BTreeMap<String, Value>> {
        let row = self.row_for(Some(table))?;
        let guard = row.read().expect("lock poisoned");
        Ok(guard.pk.clone())
    }

    pub fn is_attached(&self) -> bool {
        self.inner.read().expect("lock poisoned").core.is_some()
    }

    pub(crate) fn session_core(&self) -> Option<Arc<SessionCore>> {
        self.inner.read().expect("lock poisoned").core.clone()
    }

    pub(crate) fn core(&self) -> Result<Arc<SessionCore>> {
        self.session_core().ok_or_else(|| {
            Error::InvalidOperation("bean is not attached to a session".to_string())
        })
    }

    /// Attach a detached bean to a session; every row moves to New.
    pub(crate) fn attach(&self, core: &Arc<SessionCore>) -> Result<()> {
        let rows = self.rows();
        for row in &rows {
            let guard = row.read().expect("lock poisoned");
            if guard.phase != RowPhase::Detached {
                return Err(Error::InvalidOperation(format!(
                    "bean is already attached (row '{}' is {:?})",
                    guard.table, guard.phase
                )));
            }
        }
        for row in &rows {
            row.write().expect("lock poisoned").phase = RowPhase::New;
        }
        self.inner.write().expect("lock poisoned").core = Some(core.clone());
        Ok(())
    }

    fn row_for(&self, table: Option<&str>) -> Result<SharedRow> {
        let inner = self.inner.read().expect("lock poisoned");
        match table {
            None => inner.rows.last().cloned().ok_or_else(|| {
                Error::InvalidOperation("bean has no rows".to_string())
            }),
            Some(t) => inner
                .rows
                .iter()
                .find(|r| r.read().expect("lock poisoned").table == t)
                .cloned()
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("bean spans no table '{}'", t))
                }),
        }
    }

    // =========================================================================
    // Column access
    // =========================================================================

    /// Read a column, `table` selecting the chain row (deepest when `None`).
    ///
    /// Reading a NotLoaded row fetches it by key first; a vanished row
    /// surfaces as [`Error::NoBeanFound`].
    pub fn get(&self, column: &str, table: Option<&str>) -> Result<Value> {
        let row = self.row_for(table)?;
        {
            let guard = row.read().expect("lock poisoned");
            if let Some(v) = guard.pk.get(column) {
                return Ok(v.clone());
            }
        }
        self.load_if_needed(&row)?;
        Ok(row.read().expect("lock poisoned").value(column))
    }

    /// Write a column. Loaded rows become Dirty; a NotLoaded row loads
    /// first so unmodified columns are not lost on flush.
    pub fn set(&self, column: &str, value: Value, table: Option<&str>) -> Result<()> {
        let row = self.row_for(table)?;
        {
            let guard = row.read().expect("lock poisoned");
            match guard.phase {
                RowPhase::Deleted => {
                    return Err(Error::InvalidOperation(format!(
                        "cannot modify deleted row '{}'",
                        guard.table
                    )));
                }
                RowPhase::Saving => {
                    return Err(Error::InvalidOperation(format!(
                        "cannot modify row '{}' while it is being saved",
                        guard.table
                    )));
                }
                _ => {}
            }
        }
        self.load_if_needed(&row)?;
        row.write().expect("lock poisoned").set_value(column, value);
        Ok(())
    }

    // =========================================================================
    // References (many-to-one)
    // =========================================================================

    /// Navigate a foreign key to its target bean.
    ///
    /// Returns the cached target if one was set or previously navigated;
    /// otherwise derives the target key from the local columns. Null local
    /// columns mean no target.
    pub fn get_ref(&self, fk_name: &str, table: Option<&str>) -> Result<Option<Bean>> {
        let row = self.row_for(table)?;
        {
            let guard = row.read().expect("lock poisoned");
            if let Some(slot) = guard.refs.get(fk_name) {
                if slot.dirty || slot.bean.is_some() {
                    return Ok(slot.bean.clone());
                }
            }
        }
        let Some(core) = self.session_core() else {
            return Ok(None);
        };
        let row_table = row.read().expect("lock poisoned").table.clone();
        let fk = core.schema.foreign_key(&row_table, fk_name)?.clone();
        self.load_if_needed(&row)?;

        let mut target_pk = BTreeMap::new();
        {
            let guard = row.read().expect("lock poisoned");
            for (local, foreign) in fk.local_columns.iter().zip(&fk.foreign_columns) {
                let v = guard.value(local);
                if v.is_null() {
                    return Ok(None);
                }
                target_pk.insert(foreign.clone(), v);
            }
        }
        let target = crate::materialize(&core, &fk.foreign_table, target_pk)?;
        row.write().expect("lock poisoned").refs.insert(
            fk_name.to_string(),
            RefSlot {
                bean: Some(target.clone()),
                dirty: false,
            },
        );
        Ok(Some(target))
    }

    /// Point a foreign key at another bean (or clear it with `None`).
    ///
    /// The local key columns are written at flush time, after the target
    /// has a primary key.
    pub fn set_ref(&self, fk_name: &str, target: Option<&Bean>, table: Option<&str>) -> Result<()> {
        let row = self.row_for(table)?;
        if let Some(core) = self.session_core() {
            let row_table = row.read().expect("lock poisoned").table.clone();
            core.schema.foreign_key(&row_table, fk_name)?;
        }
        let mut guard = row.write().expect("lock poisoned");
        if guard.phase == RowPhase::Deleted {
            return Err(Error::InvalidOperation(format!(
                "cannot modify deleted row '{}'",
                guard.table
            )));
        }
        guard.refs.insert(
            fk_name.to_string(),
            RefSlot {
                bean: target.cloned(),
                dirty: true,
            },
        );
        if guard.phase == RowPhase::Loaded {
            guard.phase = RowPhase::Dirty;
        }
        Ok(())
    }

    // =========================================================================
    // Relationships (many-to-many) and owned lists
    // =========================================================================

    /// Record a link through `pivot` to another bean. Nothing is written
    /// until save.
    pub fn add_relationship(&self, pivot: &str, other: &Bean) -> Result<()> {
        ledger::add_link(self, pivot, other)
    }

    /// Remove a link. A link that was never flushed cancels outright; a
    /// persisted link is deleted on the next save.
    pub fn remove_relationship(&self, pivot: &str, other: &Bean) -> Result<()> {
        ledger::remove_link(self.session_core().as_ref(), self, pivot, other)
    }

    pub fn has_relationship(&self, pivot: &str, other: &Bean) -> Result<bool> {
        ledger::has_link(self.session_core().as_ref(), self, pivot, other)
    }

    /// All beans linked through `pivot`, pending removals excluded.
    pub fn related(&self, pivot: &str) -> Result<Vec<Bean>> {
        ledger::linked_beans(self.session_core().as_ref(), self, pivot)
    }

    /// Replace the link set through `pivot` with exactly `beans`.
    pub fn set_relationships(&self, pivot: &str, beans: &[Bean]) -> Result<()> {
        ledger::set_links(self.session_core().as_ref(), self, pivot, beans)
    }

    /// The beans in `referencing_table` whose `fk_name` points here, as an
    /// overlay collection.
    pub fn owned(&self, referencing_table: &str, fk_name: &str) -> Result<OwnedCollection> {
        if let Some(core) = self.session_core() {
            core.schema.foreign_key(referencing_table, fk_name)?;
        }
        Ok(OwnedCollection::new(self, referencing_table, fk_name))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// An independent Detached copy: same column data, no key, no session,
    /// no cached references or links.
    pub fn detached_copy(&self) -> Bean {
        let rows = self
            .rows()
            .iter()
            .map(|r| {
                Arc::new(RwLock::new(
                    r.read().expect("lock poisoned").detached_copy(),
                ))
            })
            .collect();
        Bean::from_rows(rows, None)
    }

    /// Throw away unflushed changes on every row; the next read re-fetches.
    pub fn discard_changes(&self) -> Result<()> {
        let rows = self.rows();
        for row in &rows {
            let guard = row.read().expect("lock poisoned");
            if !matches!(
                guard.phase,
                RowPhase::Loaded | RowPhase::Dirty | RowPhase::NotLoaded
            ) {
                return Err(Error::InvalidOperation(format!(
                    "cannot discard changes on row '{}' in phase {:?}",
                    guard.table, guard.phase
                )));
            }
        }
        for row in &rows {
            row.write().expect("lock poisoned").discard_changes()?;
        }
        self.inner.write().expect("lock poisoned").ledger.clear_overlays();
        Ok(())
    }

    /// Fetch a NotLoaded row by its key.
    pub(crate) fn load_if_needed(&self, row: &SharedRow) -> Result<()> {
        let needs_load = row.read().expect("lock poisoned").phase == RowPhase::NotLoaded;
        if !needs_load {
            return Ok(());
        }
        let core = self.core()?;
        load_row(&core, row)
    }
}

/// Fetch one row by its persisted key and merge the result under any
/// staged writes.
pub(crate) fn load_row(core: &Arc<SessionCore>, row: &SharedRow) -> Result<()> {
    let (table, pk) = {
        let guard = row.read().expect("lock poisoned");
        (guard.table.clone(), guard.persisted_pk.clone())
    };
    let facts = core.schema.table_facts(&table)?;
    let converter = core.schema.converter(&table)?;
    let q = |name: &str| core.driver.quote_identifier(name);

    let select_list = facts
        .columns
        .iter()
        .map(|c| q(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let mut where_parts = Vec::with_capacity(pk.len());
    let mut params = Vec::with_capacity(pk.len());
    for (i, (col, val)) in pk.iter().enumerate() {
        where_parts.push(format!("{} = {}", q(col), core.driver.placeholder(i + 1)));
        params.push(val.clone());
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        select_list,
        q(&table),
        where_parts.join(" AND ")
    );
    tracing::debug!(table = %table, "lazy load");

    let fetched = core.driver.query_one(&sql, &params)?.ok_or_else(|| {
        Error::NoBeanFound(format!("no row in '{}' for key {:?}", table, pk))
    })?;

    let mut guard = row.write().expect("lock poisoned");
    for col in &facts.columns {
        if guard.pk.contains_key(&col.name) || guard.dirty.contains(&col.name) {
            continue;
        }
        let value = fetched.get_by_name(&col.name).cloned().unwrap_or(Value::Null);
        guard
            .columns
            .insert(col.name.clone(), converter.from_stored(&col.name, value));
    }
    guard.phase = if guard.dirty.is_empty() {
        RowPhase::Loaded
    } else {
        RowPhase::Dirty
    };
    Ok(())
}
