//! Per-table row lifecycle state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, Weak};

use beanmodel_core::{Error, Result, Value};

use crate::bean::{Bean, BeanInner};

/// A row shared between its owning bean and the identity map.
pub type SharedRow = Arc<RwLock<RowState>>;

/// The lifecycle phase of one table row.
///
/// Every phase transition goes through an explicit operation; there is no
/// other way to move between phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowPhase {
    /// Not attached to any session. Values can be staged but nothing
    /// touches the database.
    Detached,
    /// Attached, never inserted.
    New,
    /// Known to exist (primary key on hand), columns not yet fetched.
    NotLoaded,
    /// Reserved. No transition currently produces this phase.
    PartiallyLoaded,
    /// Columns fetched and unmodified.
    Loaded,
    /// At least one column or reference modified since the last flush.
    Dirty,
    /// Insert in flight. Re-entering a row in this phase during a save is
    /// a reference cycle.
    Saving,
    /// Removed. Terminal.
    Deleted,
}

/// A cached foreign-key target.
#[derive(Debug, Clone, Default)]
pub struct RefSlot {
    /// The target bean; `None` means the reference was explicitly cleared.
    pub bean: Option<Bean>,
    /// Whether the slot must be written out on the next flush.
    pub dirty: bool,
}

/// The state of one table row inside a bean.
///
/// Primary-key values live in `pk`, never duplicated into `columns`.
/// `persisted_pk` tracks the key as currently stored, so a key change is
/// flushed as an UPDATE against the old key and then rekeyed in the
/// identity map.
#[derive(Debug)]
pub struct RowState {
    pub table: String,
    pub phase: RowPhase,
    pub pk: BTreeMap<String, Value>,
    pub persisted_pk: BTreeMap<String, Value>,
    pub columns: BTreeMap<String, Value>,
    pub dirty: BTreeSet<String>,
    pub refs: BTreeMap<String, RefSlot>,
    /// The bean this row belongs to. Weak: the identity map and the bean
    /// both point at the row, the row never keeps its bean alive.
    pub owner: Weak<RwLock<BeanInner>>,
}

impl RowState {
    fn empty(table: &str, phase: RowPhase) -> Self {
        Self {
            table: table.to_string(),
            phase,
            pk: BTreeMap::new(),
            persisted_pk: BTreeMap::new(),
            columns: BTreeMap::new(),
            dirty: BTreeSet::new(),
            refs: BTreeMap::new(),
            owner: Weak::new(),
        }
    }

    /// A fresh attached row, to be inserted on the next save.
    pub fn new_row(table: &str) -> Self {
        Self::empty(table, RowPhase::New)
    }

    /// A detached row; staged values only.
    pub fn detached(table: &str) -> Self {
        Self::empty(table, RowPhase::Detached)
    }

    /// A placeholder for a row known by key but not yet fetched.
    pub fn placeholder(table: &str, pk: BTreeMap<String, Value>) -> Self {
        let mut state = Self::empty(table, RowPhase::NotLoaded);
        state.persisted_pk = pk.clone();
        state.pk = pk;
        state
    }

    /// A row built directly from fetched data.
    pub fn fetched(
        table: &str,
        pk: BTreeMap<String, Value>,
        columns: BTreeMap<String, Value>,
    ) -> Self {
        let mut state = Self::empty(table, RowPhase::Loaded);
        state.persisted_pk = pk.clone();
        state.pk = pk;
        state.columns = columns;
        state
    }

    /// Read one column; primary-key columns resolve from the key map.
    /// Unknown columns read as `Null`.
    pub fn value(&self, column: &str) -> Value {
        if let Some(v) = self.pk.get(column) {
            return v.clone();
        }
        self.columns.get(column).cloned().unwrap_or(Value::Null)
    }

    /// Write one column and mark it dirty. Loaded rows become Dirty.
    pub fn set_value(&mut self, column: &str, value: Value) {
        if self.pk.contains_key(column) {
            self.pk.insert(column.to_string(), value);
        } else {
            self.columns.insert(column.to_string(), value);
        }
        self.dirty.insert(column.to_string());
        if self.phase == RowPhase::Loaded {
            self.phase = RowPhase::Dirty;
        }
    }

    /// Whether every primary-key column has a non-null value.
    pub fn pk_is_set(&self) -> bool {
        !self.pk.is_empty() && self.pk.values().all(|v| !v.is_null())
    }

    /// Record a successful flush: the row now matches the database.
    pub fn mark_saved(&mut self) {
        self.persisted_pk = self.pk.clone();
        self.dirty.clear();
        for slot in self.refs.values_mut() {
            slot.dirty = false;
        }
        self.phase = RowPhase::Loaded;
    }

    /// Deep copy with no session identity: Detached, key values cleared,
    /// cached references dropped.
    pub fn detached_copy(&self) -> Self {
        Self {
            table: self.table.clone(),
            phase: RowPhase::Detached,
            pk: self.pk.keys().map(|k| (k.clone(), Value::Null)).collect(),
            persisted_pk: BTreeMap::new(),
            columns: self.columns.clone(),
            dirty: self.columns.keys().cloned().collect(),
            refs: BTreeMap::new(),
            owner: Weak::new(),
        }
    }

    /// Throw away unflushed changes and fall back to NotLoaded, so the
    /// next read re-fetches. Only Loaded, Dirty, and NotLoaded rows can be
    /// reset.
    pub fn discard_changes(&mut self) -> Result<()> {
        match self.phase {
            RowPhase::Loaded | RowPhase::Dirty | RowPhase::NotLoaded => {
                self.columns.clear();
                self.dirty.clear();
                self.refs.clear();
                self.pk = self.persisted_pk.clone();
                self.phase = RowPhase::NotLoaded;
                Ok(())
            }
            other => Err(Error::InvalidOperation(format!(
                "cannot discard changes on a row in phase {:?}",
                other
            ))),
        }
    }
}
