//! Save and delete as atomic units of work.
//!
//! Every entry point wraps its whole body, including recursive saves of
//! referenced beans and the link-ledger flush, in one driver transaction.
//! Partial failure rolls everything back; mixed table states never escape.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use beanmodel_core::{Error, Result, Value, within_transaction};

use crate::SessionCore;
use crate::bean::Bean;
use crate::identity_map::key_hash;
use crate::ledger;
use crate::row_state::{RowPhase, SharedRow};

/// Save a bean: rows parent-first, then the link ledger, in one
/// transaction. Detached beans attach implicitly.
pub(crate) fn save(core: &Arc<SessionCore>, bean: &Bean) -> Result<()> {
    if !bean.is_attached() {
        bean.attach(core)?;
    }
    within_transaction(core.driver.as_ref(), || {
        save_bean(core, bean)?;
        ledger::flush_links(core, bean)
    })
}

/// Flush one bean's rows, parent to child, reusing the first generated key
/// down the chain. Also reached recursively for referenced beans and from
/// the ledger flush; runs inside the caller's transaction.
#[tracing::instrument(skip_all, fields(table = %bean.table()))]
pub(crate) fn save_bean(core: &Arc<SessionCore>, bean: &Bean) -> Result<()> {
    if !bean.is_attached() {
        bean.attach(core)?;
    }
    let rows = bean.rows();
    let mut chain_pk: Option<Vec<Value>> = None;
    for row in &rows {
        let (table, phase) = {
            let guard = row.read().expect("lock poisoned");
            (guard.table.clone(), guard.phase)
        };
        match phase {
            RowPhase::Saving => {
                return Err(Error::CyclicReference(format!(
                    "row '{}' is already being saved",
                    table
                )));
            }
            RowPhase::New => insert_row(core, row, &table, &mut chain_pk)?,
            RowPhase::Dirty => {
                update_row(core, row, &table)?;
                chain_pk = Some(pk_values(core, row, &table)?);
            }
            RowPhase::Loaded | RowPhase::NotLoaded | RowPhase::PartiallyLoaded => {
                chain_pk = Some(pk_values(core, row, &table)?);
            }
            RowPhase::Deleted => {
                return Err(Error::InvalidOperation(format!(
                    "cannot save deleted row '{}'",
                    table
                )));
            }
            RowPhase::Detached => {
                return Err(Error::InvalidOperation(format!(
                    "row '{}' is detached",
                    table
                )));
            }
        }
    }
    Ok(())
}

fn pk_values(core: &Arc<SessionCore>, row: &SharedRow, table: &str) -> Result<Vec<Value>> {
    let pk_cols = core.schema.primary_key(table)?;
    let guard = row.read().expect("lock poisoned");
    Ok(pk_cols
        .iter()
        .map(|c| guard.pk.get(c).cloned().unwrap_or(Value::Null))
        .collect())
}

fn insert_row(
    core: &Arc<SessionCore>,
    row: &SharedRow,
    table: &str,
    chain_pk: &mut Option<Vec<Value>>,
) -> Result<()> {
    row.write().expect("lock poisoned").phase = RowPhase::Saving;
    let outcome = insert_row_inner(core, row, table, chain_pk);
    if outcome.is_err() {
        // Retryable after rollback.
        row.write().expect("lock poisoned").phase = RowPhase::New;
    }
    outcome
}

fn insert_row_inner(
    core: &Arc<SessionCore>,
    row: &SharedRow,
    table: &str,
    chain_pk: &mut Option<Vec<Value>>,
) -> Result<()> {
    resolve_references(core, row, table, false)?;

    let pk_cols = core.schema.primary_key(table)?.to_vec();
    if let Some(parent) = chain_pk.as_ref() {
        let mut guard = row.write().expect("lock poisoned");
        for (col, val) in pk_cols.iter().zip(parent) {
            guard.pk.insert(col.clone(), val.clone());
        }
    }

    let (columns, pk) = {
        let guard = row.read().expect("lock poisoned");
        (guard.columns.clone(), guard.pk.clone())
    };
    let converter = core.schema.converter(table)?;
    let q = |name: &str| core.driver.quote_identifier(name);

    let mut names = Vec::new();
    let mut params = Vec::new();
    for (col, val) in &columns {
        names.push(q(col));
        params.push(converter.to_stored(col, val.clone()));
    }
    let pk_known =
        pk.len() == pk_cols.len() && !pk.is_empty() && pk.values().all(|v| !v.is_null());
    if pk_known {
        for (col, val) in &pk {
            names.push(q(col));
            params.push(converter.to_stored(col, val.clone()));
        }
    }

    let sql = if names.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", q(table))
    } else {
        let placeholders = (1..=params.len())
            .map(|i| core.driver.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            q(table),
            names.join(", "),
            placeholders
        )
    };
    tracing::debug!(table = %table, "insert");
    core.driver.execute(&sql, &params)?;

    let mut assigned = pk;
    if !pk_known {
        if pk_cols.len() == 1 {
            let id = core.driver.last_insert_id()?;
            assigned.insert(pk_cols[0].clone(), Value::Int(id));
        } else {
            return Err(Error::InvalidOperation(format!(
                "table '{}' has a composite primary key; assign it before saving",
                table
            )));
        }
    }
    {
        let mut guard = row.write().expect("lock poisoned");
        guard.pk = assigned.clone();
        guard.mark_saved();
    }
    core.identity
        .write()
        .expect("lock poisoned")
        .register(table, key_hash(&assigned), row);
    *chain_pk = Some(
        pk_cols
            .iter()
            .map(|c| assigned.get(c).cloned().unwrap_or(Value::Null))
            .collect(),
    );
    Ok(())
}

fn update_row(core: &Arc<SessionCore>, row: &SharedRow, table: &str) -> Result<()> {
    resolve_references(core, row, table, true)?;

    let (columns, dirty, pk, persisted_pk) = {
        let guard = row.read().expect("lock poisoned");
        (
            guard.columns.clone(),
            guard.dirty.clone(),
            guard.pk.clone(),
            guard.persisted_pk.clone(),
        )
    };
    if dirty.is_empty() {
        row.write().expect("lock poisoned").mark_saved();
        return Ok(());
    }
    let converter = core.schema.converter(table)?;
    let q = |name: &str| core.driver.quote_identifier(name);

    let mut sets = Vec::new();
    let mut params = Vec::new();
    for col in &dirty {
        let value = pk
            .get(col)
            .or_else(|| columns.get(col))
            .cloned()
            .unwrap_or(Value::Null);
        sets.push(format!(
            "{} = {}",
            q(col),
            core.driver.placeholder(params.len() + 1)
        ));
        params.push(converter.to_stored(col, value));
    }
    let mut wheres = Vec::new();
    for (col, val) in &persisted_pk {
        wheres.push(format!(
            "{} = {}",
            q(col),
            core.driver.placeholder(params.len() + 1)
        ));
        params.push(converter.to_stored(col, val.clone()));
    }
    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        q(table),
        sets.join(", "),
        wheres.join(" AND ")
    );
    tracing::debug!(table = %table, dirty = dirty.len(), "update");
    core.driver.execute(&sql, &params)?;

    if pk != persisted_pk {
        core.identity.write().expect("lock poisoned").rekey(
            table,
            key_hash(&persisted_pk),
            key_hash(&pk),
        );
    }
    row.write().expect("lock poisoned").mark_saved();
    Ok(())
}

/// Write out the dirty reference slots of one row, saving unsaved targets
/// first so their generated keys exist before the local columns are set.
fn resolve_references(
    core: &Arc<SessionCore>,
    row: &SharedRow,
    table: &str,
    only_dirty: bool,
) -> Result<()> {
    let slots: Vec<(String, Option<Bean>)> = {
        let guard = row.read().expect("lock poisoned");
        guard
            .refs
            .iter()
            .filter(|(_, s)| if only_dirty { s.dirty } else { s.dirty || s.bean.is_some() })
            .map(|(k, s)| (k.clone(), s.bean.clone()))
            .collect()
    };
    for (fk_name, target) in slots {
        let fk = core.schema.foreign_key(table, &fk_name)?.clone();
        match target {
            None => {
                let mut guard = row.write().expect("lock poisoned");
                for lc in &fk.local_columns {
                    guard.columns.insert(lc.clone(), Value::Null);
                    guard.dirty.insert(lc.clone());
                }
            }
            Some(target) => {
                match target.phase() {
                    RowPhase::Deleted => {
                        return Err(Error::MissingReference(format!(
                            "reference '{}' targets a deleted bean",
                            fk_name
                        )));
                    }
                    RowPhase::New | RowPhase::Detached => save_bean(core, &target)?,
                    RowPhase::Saving => {
                        if !target.primary_key_is_set() {
                            return Err(Error::CyclicReference(format!(
                                "save cycle through reference '{}'",
                                fk_name
                            )));
                        }
                    }
                    _ => {}
                }
                let target_pk = target.pk_for_table(&fk.foreign_table)?;
                let mut guard = row.write().expect("lock poisoned");
                for (lc, fc) in fk.local_columns.iter().zip(&fk.foreign_columns) {
                    let v = target_pk.get(fc).cloned().unwrap_or(Value::Null);
                    guard.columns.insert(lc.clone(), v);
                    guard.dirty.insert(lc.clone());
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Delete
// =============================================================================

enum Disposition {
    Detached,
    AlreadyDeleted,
    NeverPersisted,
    Persisted,
}

fn classify(bean: &Bean) -> Result<Disposition> {
    let rows = bean.rows();
    if rows.is_empty() {
        return Err(Error::InvalidOperation("bean has no rows".to_string()));
    }
    let phases: Vec<RowPhase> = rows
        .iter()
        .map(|r| r.read().expect("lock poisoned").phase)
        .collect();
    if phases.contains(&RowPhase::Detached) {
        return Ok(Disposition::Detached);
    }
    if phases.iter().all(|p| *p == RowPhase::Deleted) {
        return Ok(Disposition::AlreadyDeleted);
    }
    if phases.iter().all(|p| *p == RowPhase::New) {
        return Ok(Disposition::NeverPersisted);
    }
    Ok(Disposition::Persisted)
}

fn discard_new(bean: &Bean) {
    for row in bean.rows() {
        row.write().expect("lock poisoned").phase = RowPhase::Deleted;
    }
}

/// Delete a bean: its pivot rows, then its chain rows child-first, in one
/// transaction. Never-inserted beans are simply dropped from pending work;
/// deleting a Detached bean is an error and a Deleted one a no-op.
pub(crate) fn delete(core: &Arc<SessionCore>, bean: &Bean) -> Result<()> {
    match classify(bean)? {
        Disposition::Detached => Err(Error::InvalidOperation(
            "cannot delete a detached bean".to_string(),
        )),
        Disposition::AlreadyDeleted => Ok(()),
        Disposition::NeverPersisted => {
            discard_new(bean);
            Ok(())
        }
        Disposition::Persisted => {
            within_transaction(core.driver.as_ref(), || delete_rows(core, bean))
        }
    }
}

/// Delete a bean and, first, everything that references it, transitively.
/// Inheritance links within a chain are structure, not ownership, and are
/// not followed.
pub(crate) fn delete_cascade(core: &Arc<SessionCore>, bean: &Bean) -> Result<()> {
    match classify(bean)? {
        Disposition::Detached => Err(Error::InvalidOperation(
            "cannot delete a detached bean".to_string(),
        )),
        Disposition::AlreadyDeleted => Ok(()),
        Disposition::NeverPersisted => {
            discard_new(bean);
            Ok(())
        }
        Disposition::Persisted => within_transaction(core.driver.as_ref(), || {
            let mut visited = HashSet::new();
            cascade(core, bean, &mut visited)
        }),
    }
}

fn cascade(
    core: &Arc<SessionCore>,
    bean: &Bean,
    visited: &mut HashSet<(String, u64)>,
) -> Result<()> {
    let key = (bean.table(), key_hash(&bean.primary_key()));
    if !visited.insert(key) {
        return Ok(());
    }
    let tables = bean.tables();
    let q = |name: &str| core.driver.quote_identifier(name);

    for table in &tables {
        for (facts, fk) in core.schema.foreign_keys_into(table) {
            if core.schema.is_pivot(&facts.name) {
                continue;
            }
            if facts.parent.as_deref() == Some(fk.foreign_table.as_str())
                && fk.local_columns == facts.primary_key
            {
                continue;
            }
            let pk_cols = core.schema.primary_key(&facts.name)?.to_vec();
            let source_pk = bean.pk_for_table(&fk.foreign_table)?;
            let select_list = pk_cols.iter().map(|c| q(c)).collect::<Vec<_>>().join(", ");
            let mut where_parts = Vec::new();
            let mut params = Vec::new();
            for (i, (lc, fc)) in fk.local_columns.iter().zip(&fk.foreign_columns).enumerate() {
                where_parts.push(format!("{} = {}", q(lc), core.driver.placeholder(i + 1)));
                params.push(source_pk.get(fc).cloned().unwrap_or(Value::Null));
            }
            let sql = format!(
                "SELECT {} FROM {} WHERE {}",
                select_list,
                q(&facts.name),
                where_parts.join(" AND ")
            );
            let rows = core.driver.query(&sql, &params)?;
            for row in rows {
                let mut dep_pk = BTreeMap::new();
                for col in &pk_cols {
                    dep_pk.insert(
                        col.clone(),
                        row.get_by_name(col).cloned().unwrap_or(Value::Null),
                    );
                }
                let dependent = crate::materialize(core, &facts.name, dep_pk)?;
                cascade(core, &dependent, visited)?;
            }
        }
    }
    delete_rows(core, bean)
}

fn delete_rows(core: &Arc<SessionCore>, bean: &Bean) -> Result<()> {
    let tables = bean.tables();
    let q = |name: &str| core.driver.quote_identifier(name);

    // A bean's link rows go with it.
    for table in &tables {
        for (facts, fk) in core.schema.foreign_keys_into(table) {
            if !core.schema.is_pivot(&facts.name) {
                continue;
            }
            let pk = bean.pk_for_table(&fk.foreign_table)?;
            let mut where_parts = Vec::new();
            let mut params = Vec::new();
            for (i, (lc, fc)) in fk.local_columns.iter().zip(&fk.foreign_columns).enumerate() {
                where_parts.push(format!("{} = {}", q(lc), core.driver.placeholder(i + 1)));
                params.push(pk.get(fc).cloned().unwrap_or(Value::Null));
            }
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                q(&facts.name),
                where_parts.join(" AND ")
            );
            core.driver.execute(&sql, &params)?;
        }
    }

    // Chain rows child-first.
    for row in bean.rows().iter().rev() {
        let (table, persisted_pk) = {
            let guard = row.read().expect("lock poisoned");
            (guard.table.clone(), guard.persisted_pk.clone())
        };
        if persisted_pk.is_empty() {
            row.write().expect("lock poisoned").phase = RowPhase::Deleted;
            continue;
        }
        let converter = core.schema.converter(&table)?;
        let mut where_parts = Vec::new();
        let mut params = Vec::new();
        for (i, (col, val)) in persisted_pk.iter().enumerate() {
            where_parts.push(format!("{} = {}", q(col), core.driver.placeholder(i + 1)));
            params.push(converter.to_stored(col, val.clone()));
        }
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            q(&table),
            where_parts.join(" AND ")
        );
        tracing::debug!(table = %table, "delete");
        core.driver.execute(&sql, &params)?;
        core.identity
            .write()
            .expect("lock poisoned")
            .remove(&table, key_hash(&persisted_pk));
        row.write().expect("lock poisoned").phase = RowPhase::Deleted;
    }

    // Recorded links die with the bean, mirror entries included.
    ledger::clear_all_links(bean);
    Ok(())
}
