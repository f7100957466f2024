//! Many-to-many link bookkeeping and owned-list overlays.
//!
//! Every link is recorded on both beans: the side the call was made on
//! holds a strong handle to the remote bean (it must survive until flush),
//! the mirror side holds a weak one so link cycles never leak. Only the
//! strong, forward side is flushed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use beanmodel_core::{Error, Result, SchemaError, SchemaErrorKind, Value};
use beanmodel_schema::ForeignKey;

use crate::SessionCore;
use crate::bean::{Bean, WeakBean};
use crate::row_state::RowPhase;

/// The flush status of one recorded link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Recorded in memory, pivot row not yet written.
    PendingAdd,
    /// Pivot row exists and will be deleted on the next flush.
    PendingDelete,
    /// Pivot row exists and matches.
    Persisted,
}

/// A handle to the bean on the other end of a link.
#[derive(Clone)]
pub enum BeanLink {
    Strong(Bean),
    Weak(WeakBean),
}

impl BeanLink {
    fn upgrade(&self) -> Option<Bean> {
        match self {
            BeanLink::Strong(bean) => Some(bean.clone()),
            BeanLink::Weak(weak) => weak.upgrade(),
        }
    }
}

/// One recorded link through one pivot table.
#[derive(Clone)]
pub struct LedgerEntry {
    pub remote: BeanLink,
    pub status: LinkStatus,
    /// Mirror entries are skipped by flush; their forward twin lives on
    /// the other bean.
    pub reverse: bool,
}

#[derive(Default)]
struct OwnedOverlay {
    cache: Option<Vec<Bean>>,
    added: Vec<Bean>,
    removed: Vec<Bean>,
}

/// Per-bean link ledger, keyed by pivot table.
#[derive(Default)]
pub struct RelationshipLedger {
    entries: BTreeMap<String, Vec<LedgerEntry>>,
    loaded: BTreeSet<String>,
    owned: BTreeMap<(String, String), OwnedOverlay>,
}

impl RelationshipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(entry: &LedgerEntry, remote: &Bean) -> bool {
        entry.remote.upgrade().as_ref() == Some(remote)
    }

    fn status_of(&self, pivot: &str, remote: &Bean) -> Option<LinkStatus> {
        self.entries
            .get(pivot)?
            .iter()
            .find(|e| Self::matches(e, remote))
            .map(|e| e.status)
    }

    fn set_status_all(&mut self, pivot: &str, remote: &Bean, status: LinkStatus) {
        if let Some(entries) = self.entries.get_mut(pivot) {
            for entry in entries.iter_mut().filter(|e| Self::matches(e, remote)) {
                entry.status = status;
            }
        }
    }

    fn remove_all(&mut self, pivot: &str, remote: &Bean) {
        if let Some(entries) = self.entries.get_mut(pivot) {
            entries.retain(|e| !Self::matches(e, remote));
        }
    }

    fn push(&mut self, pivot: &str, entry: LedgerEntry) {
        self.entries.entry(pivot.to_string()).or_default().push(entry);
    }

    fn is_loaded(&self, pivot: &str) -> bool {
        self.loaded.contains(pivot)
    }

    fn mark_loaded(&mut self, pivot: &str) {
        self.loaded.insert(pivot.to_string());
    }

    fn pivots(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Forward entries only, with live remotes.
    fn forward(&self, pivot: &str) -> Vec<(Bean, LinkStatus)> {
        self.entries
            .get(pivot)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| !e.reverse)
                    .filter_map(|e| e.remote.upgrade().map(|b| (b, e.status)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live remotes across both flags, deduplicated.
    fn beans(&self, pivot: &str) -> Vec<(Bean, LinkStatus)> {
        let mut out: Vec<(Bean, LinkStatus)> = Vec::new();
        if let Some(entries) = self.entries.get(pivot) {
            for entry in entries {
                if let Some(bean) = entry.remote.upgrade() {
                    if !out.iter().any(|(b, _)| *b == bean) {
                        out.push((bean, entry.status));
                    }
                }
            }
        }
        out
    }

    pub(crate) fn clear_overlays(&mut self) {
        self.owned.clear();
    }

    fn owned_cache(&self, key: &(String, String)) -> Option<Vec<Bean>> {
        self.owned.get(key).and_then(|o| o.cache.clone())
    }

    fn owned_lists(&self, key: &(String, String)) -> (Vec<Bean>, Vec<Bean>) {
        self.owned
            .get(key)
            .map(|o| (o.added.clone(), o.removed.clone()))
            .unwrap_or_default()
    }
}

// =============================================================================
// Link operations
// =============================================================================

/// Record a link on both sides. Re-adding an existing link is a no-op;
/// re-adding one that is pending delete revives it.
///
/// Locks are taken one bean at a time, so self-links are fine.
pub(crate) fn add_link(a: &Bean, pivot: &str, b: &Bean) -> Result<()> {
    if let Some(core) = a.session_core() {
        core.schema.table_facts(pivot)?;
    }
    let already = {
        let mut inner = a.inner.write().expect("lock poisoned");
        match inner.ledger.status_of(pivot, b) {
            Some(LinkStatus::PendingDelete) => {
                inner.ledger.set_status_all(pivot, b, LinkStatus::Persisted);
                true
            }
            Some(_) => true,
            None => {
                inner.ledger.push(
                    pivot,
                    LedgerEntry {
                        remote: BeanLink::Strong(b.clone()),
                        status: LinkStatus::PendingAdd,
                        reverse: false,
                    },
                );
                false
            }
        }
    };
    let mut inner = b.inner.write().expect("lock poisoned");
    if already {
        if inner.ledger.status_of(pivot, a) == Some(LinkStatus::PendingDelete) {
            inner.ledger.set_status_all(pivot, a, LinkStatus::Persisted);
        }
    } else if inner.ledger.status_of(pivot, a).is_none() {
        inner.ledger.push(
            pivot,
            LedgerEntry {
                remote: BeanLink::Weak(a.downgrade()),
                status: LinkStatus::PendingAdd,
                reverse: true,
            },
        );
    }
    Ok(())
}

/// Remove a link on both sides. A never-persisted pending add cancels
/// outright; a persisted link flips to pending delete.
pub(crate) fn remove_link(
    core: Option<&Arc<SessionCore>>,
    a: &Bean,
    pivot: &str,
    b: &Bean,
) -> Result<()> {
    if let Some(core) = core {
        ensure_links_loaded(core, a, pivot)?;
    }
    let status = a
        .inner
        .read()
        .expect("lock poisoned")
        .ledger
        .status_of(pivot, b);
    match status {
        None | Some(LinkStatus::PendingDelete) => Ok(()),
        Some(LinkStatus::PendingAdd) => {
            a.inner
                .write()
                .expect("lock poisoned")
                .ledger
                .remove_all(pivot, b);
            b.inner
                .write()
                .expect("lock poisoned")
                .ledger
                .remove_all(pivot, a);
            Ok(())
        }
        Some(LinkStatus::Persisted) => {
            a.inner
                .write()
                .expect("lock poisoned")
                .ledger
                .set_status_all(pivot, b, LinkStatus::PendingDelete);
            b.inner
                .write()
                .expect("lock poisoned")
                .ledger
                .set_status_all(pivot, a, LinkStatus::PendingDelete);
            Ok(())
        }
    }
}

pub(crate) fn has_link(
    core: Option<&Arc<SessionCore>>,
    a: &Bean,
    pivot: &str,
    b: &Bean,
) -> Result<bool> {
    if let Some(core) = core {
        ensure_links_loaded(core, a, pivot)?;
    }
    let status = a
        .inner
        .read()
        .expect("lock poisoned")
        .ledger
        .status_of(pivot, b);
    Ok(matches!(
        status,
        Some(LinkStatus::PendingAdd | LinkStatus::Persisted)
    ))
}

pub(crate) fn linked_beans(
    core: Option<&Arc<SessionCore>>,
    a: &Bean,
    pivot: &str,
) -> Result<Vec<Bean>> {
    if let Some(core) = core {
        ensure_links_loaded(core, a, pivot)?;
    }
    let all = a.inner.read().expect("lock poisoned").ledger.beans(pivot);
    Ok(all
        .into_iter()
        .filter(|(_, status)| *status != LinkStatus::PendingDelete)
        .map(|(bean, _)| bean)
        .collect())
}

pub(crate) fn set_links(
    core: Option<&Arc<SessionCore>>,
    a: &Bean,
    pivot: &str,
    beans: &[Bean],
) -> Result<()> {
    let current = linked_beans(core, a, pivot)?;
    for old in &current {
        if !beans.contains(old) {
            remove_link(core, a, pivot, old)?;
        }
    }
    for new in beans {
        if !current.contains(new) {
            add_link(a, pivot, new)?;
        }
    }
    Ok(())
}

/// Drop every recorded link for a deleted bean, on both sides: the bean's
/// own ledger empties and remote beans lose their mirror entries. One bean
/// is locked at a time.
pub(crate) fn clear_all_links(bean: &Bean) {
    let drained: Vec<(String, Vec<Bean>)> = {
        let mut inner = bean.inner.write().expect("lock poisoned");
        let out = inner
            .ledger
            .pivots()
            .into_iter()
            .map(|pivot| {
                let remotes = inner
                    .ledger
                    .beans(&pivot)
                    .into_iter()
                    .map(|(remote, _)| remote)
                    .collect();
                (pivot, remotes)
            })
            .collect();
        inner.ledger.entries.clear();
        inner.ledger.owned.clear();
        out
    };
    for (pivot, remotes) in drained {
        for remote in remotes {
            if remote == *bean {
                continue;
            }
            remote
                .inner
                .write()
                .expect("lock poisoned")
                .ledger
                .remove_all(&pivot, bean);
        }
    }
}

/// Query the pivot table once per (bean, pivot) and seed Persisted entries.
/// Entries already in the ledger win over the read, so pending changes
/// survive a later fetch.
pub(crate) fn ensure_links_loaded(
    core: &Arc<SessionCore>,
    bean: &Bean,
    pivot: &str,
) -> Result<()> {
    if bean
        .inner
        .read()
        .expect("lock poisoned")
        .ledger
        .is_loaded(pivot)
    {
        return Ok(());
    }
    if !bean.primary_key_is_set() {
        // Never persisted; nothing to fetch.
        bean.inner
            .write()
            .expect("lock poisoned")
            .ledger
            .mark_loaded(pivot);
        return Ok(());
    }

    let tables = bean.tables();
    let (local_fk, remote_fk) = pivot_keys(core, &tables, pivot)?;
    let q = |name: &str| core.driver.quote_identifier(name);

    let select_list = remote_fk
        .local_columns
        .iter()
        .map(|c| q(c))
        .collect::<Vec<_>>()
        .join(", ");
    let local_pk = bean.pk_for_table(&local_fk.foreign_table)?;
    let mut where_parts = Vec::new();
    let mut params = Vec::new();
    for (i, (lc, fc)) in local_fk
        .local_columns
        .iter()
        .zip(&local_fk.foreign_columns)
        .enumerate()
    {
        where_parts.push(format!("{} = {}", q(lc), core.driver.placeholder(i + 1)));
        params.push(local_pk.get(fc).cloned().unwrap_or(Value::Null));
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        select_list,
        q(pivot),
        where_parts.join(" AND ")
    );
    tracing::debug!(pivot = %pivot, "loading links");
    let rows = core.driver.query(&sql, &params)?;

    for row in rows {
        let mut remote_pk = BTreeMap::new();
        for (lc, fc) in remote_fk.local_columns.iter().zip(&remote_fk.foreign_columns) {
            remote_pk.insert(
                fc.clone(),
                row.get_by_name(lc).cloned().unwrap_or(Value::Null),
            );
        }
        let remote = crate::materialize(core, &remote_fk.foreign_table, remote_pk)?;
        let known = bean
            .inner
            .read()
            .expect("lock poisoned")
            .ledger
            .status_of(pivot, &remote)
            .is_some();
        if known {
            continue;
        }
        bean.inner.write().expect("lock poisoned").ledger.push(
            pivot,
            LedgerEntry {
                remote: BeanLink::Strong(remote.clone()),
                status: LinkStatus::Persisted,
                reverse: false,
            },
        );
        let mut remote_inner = remote.inner.write().expect("lock poisoned");
        if remote_inner.ledger.status_of(pivot, bean).is_none() {
            remote_inner.ledger.push(
                pivot,
                LedgerEntry {
                    remote: BeanLink::Weak(bean.downgrade()),
                    status: LinkStatus::Persisted,
                    reverse: true,
                },
            );
        }
    }
    bean.inner
        .write()
        .expect("lock poisoned")
        .ledger
        .mark_loaded(pivot);
    Ok(())
}

/// Flush the forward side of every recorded link for `bean`. Runs inside
/// the save transaction.
pub(crate) fn flush_links(core: &Arc<SessionCore>, bean: &Bean) -> Result<()> {
    let pivots = bean.inner.read().expect("lock poisoned").ledger.pivots();
    let tables = bean.tables();
    for pivot in pivots {
        let entries = bean
            .inner
            .read()
            .expect("lock poisoned")
            .ledger
            .forward(&pivot);
        if entries.is_empty() {
            continue;
        }
        let (local_fk, remote_fk) = pivot_keys(core, &tables, &pivot)?;
        for (remote, status) in entries {
            match status {
                LinkStatus::Persisted => {}
                LinkStatus::PendingAdd => {
                    match remote.phase() {
                        RowPhase::New | RowPhase::Detached => {
                            crate::unit_of_work::save_bean(core, &remote)?;
                        }
                        RowPhase::Deleted => {
                            return Err(Error::MissingReference(format!(
                                "link through '{}' targets a deleted bean",
                                pivot
                            )));
                        }
                        _ => {}
                    }
                    insert_pivot_row(core, &pivot, bean, &local_fk, &remote, &remote_fk)?;
                    bean.inner
                        .write()
                        .expect("lock poisoned")
                        .ledger
                        .set_status_all(&pivot, &remote, LinkStatus::Persisted);
                    remote
                        .inner
                        .write()
                        .expect("lock poisoned")
                        .ledger
                        .set_status_all(&pivot, bean, LinkStatus::Persisted);
                }
                LinkStatus::PendingDelete => {
                    delete_pivot_row(core, &pivot, bean, &local_fk, &remote, &remote_fk)?;
                    bean.inner
                        .write()
                        .expect("lock poisoned")
                        .ledger
                        .remove_all(&pivot, &remote);
                    remote
                        .inner
                        .write()
                        .expect("lock poisoned")
                        .ledger
                        .remove_all(&pivot, bean);
                }
            }
        }
    }
    Ok(())
}

fn insert_pivot_row(
    core: &Arc<SessionCore>,
    pivot: &str,
    bean: &Bean,
    local_fk: &ForeignKey,
    remote: &Bean,
    remote_fk: &ForeignKey,
) -> Result<()> {
    let q = |name: &str| core.driver.quote_identifier(name);
    let mut columns = Vec::new();
    let mut params = Vec::new();
    for (lc, value) in pivot_side(bean, local_fk)? {
        columns.push(q(&lc));
        params.push(value);
    }
    for (lc, value) in pivot_side(remote, remote_fk)? {
        columns.push(q(&lc));
        params.push(value);
    }
    let placeholders = (1..=params.len())
        .map(|i| core.driver.placeholder(i))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        q(pivot),
        columns.join(", "),
        placeholders
    );
    core.driver.execute(&sql, &params)?;
    Ok(())
}

fn delete_pivot_row(
    core: &Arc<SessionCore>,
    pivot: &str,
    bean: &Bean,
    local_fk: &ForeignKey,
    remote: &Bean,
    remote_fk: &ForeignKey,
) -> Result<()> {
    let q = |name: &str| core.driver.quote_identifier(name);
    let mut parts = Vec::new();
    let mut params = Vec::new();
    for (lc, value) in pivot_side(bean, local_fk)? {
        parts.push(format!("{} = {}", q(&lc), core.driver.placeholder(params.len() + 1)));
        params.push(value);
    }
    for (lc, value) in pivot_side(remote, remote_fk)? {
        parts.push(format!("{} = {}", q(&lc), core.driver.placeholder(params.len() + 1)));
        params.push(value);
    }
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        q(pivot),
        parts.join(" AND ")
    );
    core.driver.execute(&sql, &params)?;
    Ok(())
}

/// The pivot columns and values for one side of a link.
fn pivot_side(bean: &Bean, fk: &ForeignKey) -> Result<Vec<(String, Value)>> {
    let pk = bean.pk_for_table(&fk.foreign_table)?;
    fk.local_columns
        .iter()
        .zip(&fk.foreign_columns)
        .map(|(lc, fc)| {
            pk.get(fc)
                .cloned()
                .filter(|v| !v.is_null())
                .map(|v| (lc.clone(), v))
                .ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "bean has no value for key column '{}' required by pivot key '{}'",
                        fc, fk.name
                    ))
                })
        })
        .collect()
}

/// The two pivot foreign keys: the one into the bean's own chain, and the
/// one pointing at the remote side. Self-referential pivots resolve to
/// their two distinct keys.
fn pivot_keys(
    core: &Arc<SessionCore>,
    bean_tables: &[String],
    pivot: &str,
) -> Result<(ForeignKey, ForeignKey)> {
    let facts = core.schema.table_facts(pivot)?;
    let local = facts
        .foreign_keys
        .iter()
        .find(|fk| bean_tables.contains(&fk.foreign_table))
        .ok_or_else(|| {
            SchemaError::new(
                SchemaErrorKind::ForeignKeyNotFound,
                format!(
                    "pivot '{}' has no foreign key into [{}]",
                    pivot,
                    bean_tables.join(", ")
                ),
            )
        })?;
    let remote = facts
        .foreign_keys
        .iter()
        .find(|fk| fk.name != local.name)
        .ok_or_else(|| {
            SchemaError::new(
                SchemaErrorKind::ForeignKeyNotFound,
                format!("pivot '{}' needs two foreign keys", pivot),
            )
        })?;
    Ok((local.clone(), remote.clone()))
}

// =============================================================================
// Owned lists (reverse one-to-many)
// =============================================================================

/// A view of the beans in one table whose foreign key points at an owner
/// bean, with in-memory add/remove overlays.
///
/// The underlying query runs lazily, once; [`OwnedCollection::to_vec`]
/// applies the overlay without mutating the cached result. Overlays are
/// bookkeeping only, they do not rewrite foreign keys on flush.
pub struct OwnedCollection {
    owner: Bean,
    table: String,
    fk: String,
}

impl OwnedCollection {
    pub(crate) fn new(owner: &Bean, table: &str, fk: &str) -> Self {
        Self {
            owner: owner.clone(),
            table: table.to_string(),
            fk: fk.to_string(),
        }
    }

    fn key(&self) -> (String, String) {
        (self.table.clone(), self.fk.clone())
    }

    /// Overlay an addition. Beans already present are not duplicated.
    pub fn add(&self, bean: &Bean) {
        let key = self.key();
        let mut inner = self.owner.inner.write().expect("lock poisoned");
        let overlay = inner.ledger.owned.entry(key).or_default();
        overlay.removed.retain(|b| b != bean);
        if !overlay.added.contains(bean) {
            overlay.added.push(bean.clone());
        }
    }

    /// Overlay a removal. Removing an absent bean is a no-op.
    pub fn remove(&self, bean: &Bean) {
        let key = self.key();
        let mut inner = self.owner.inner.write().expect("lock poisoned");
        let overlay = inner.ledger.owned.entry(key).or_default();
        if overlay.added.contains(bean) {
            overlay.added.retain(|b| b != bean);
        } else if !overlay.removed.contains(bean) {
            overlay.removed.push(bean.clone());
        }
    }

    /// The collection with the overlay applied.
    pub fn to_vec(&self) -> Result<Vec<Bean>> {
        let key = self.key();
        let cached = self
            .owner
            .inner
            .read()
            .expect("lock poisoned")
            .ledger
            .owned_cache(&key);
        let base = match cached {
            Some(base) => base,
            None => {
                let fetched = self.fetch()?;
                let mut inner = self.owner.inner.write().expect("lock poisoned");
                inner.ledger.owned.entry(key.clone()).or_default().cache =
                    Some(fetched.clone());
                fetched
            }
        };
        let (added, removed) = self
            .owner
            .inner
            .read()
            .expect("lock poisoned")
            .ledger
            .owned_lists(&key);
        let mut out = base;
        out.retain(|b| !removed.contains(b));
        for bean in added {
            if !out.contains(&bean) {
                out.push(bean);
            }
        }
        Ok(out)
    }

    fn fetch(&self) -> Result<Vec<Bean>> {
        let Some(core) = self.owner.session_core() else {
            return Ok(Vec::new());
        };
        if !self.owner.primary_key_is_set() {
            return Ok(Vec::new());
        }
        let fk = core.schema.foreign_key(&self.table, &self.fk)?.clone();
        let pk_cols = core.schema.primary_key(&self.table)?.to_vec();
        let owner_pk = self.owner.pk_for_table(&fk.foreign_table)?;
        let q = |name: &str| core.driver.quote_identifier(name);

        let select_list = pk_cols.iter().map(|c| q(c)).collect::<Vec<_>>().join(", ");
        let mut where_parts = Vec::new();
        let mut params = Vec::new();
        for (i, (lc, fc)) in fk.local_columns.iter().zip(&fk.foreign_columns).enumerate() {
            where_parts.push(format!("{} = {}", q(lc), core.driver.placeholder(i + 1)));
            params.push(owner_pk.get(fc).cloned().unwrap_or(Value::Null));
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            select_list,
            q(&self.table),
            where_parts.join(" AND ")
        );
        let rows = core.driver.query(&sql, &params)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut pk = BTreeMap::new();
            for col in &pk_cols {
                pk.insert(
                    col.clone(),
                    row.get_by_name(col).cloned().unwrap_or(Value::Null),
                );
            }
            out.push(crate::materialize(&core, &self.table, pk)?);
        }
        Ok(out)
    }
}
