//! Query results: decoding, cursor and buffered result sets, pages.
//!
//! A select built by the planner aliases every column as
//! `g{group}__{table}__{column}`. Group 0 carries the iteration element's
//! inheritance chain; higher groups carry eagerly joined related chains.
//! Decoding turns group 0 into the returned bean and registers every other
//! group in the identity map so later navigation hits the cache instead of
//! the database.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use beanmodel_core::{Error, Result, Row, Value};
use beanmodel_query::{ColumnDescriptor, QueryPlan};
use beanmodel_session::{
    Bean, RowState, SessionCore, SharedRow, extend_with_subclass_rows, key_hash,
};

use crate::finder::Filter;

/// How a find materializes its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Single forward pass; iterating again re-executes the query, random
    /// access is an error.
    Cursor,
    /// Execute once and decode eagerly into an ordered list with random
    /// access and a re-query-free length.
    Buffered,
}

// =============================================================================
// Decoding
// =============================================================================

struct Decoded {
    bean: Option<Bean>,
    /// Strong references to every warmed-up row, so the weak identity-map
    /// entries survive as long as the result does.
    warm: Vec<SharedRow>,
}

/// Decode one physical row into its element bean plus warm-up rows.
fn decode_row(core: &Arc<SessionCore>, columns: &[ColumnDescriptor], row: &Row) -> Result<Decoded> {
    let mut decoded = Decoded {
        bean: None,
        warm: Vec::new(),
    };
    let group_count = columns.iter().map(|d| d.group + 1).max().unwrap_or(0);
    for group in 0..group_count {
        let members: Vec<&ColumnDescriptor> =
            columns.iter().filter(|d| d.group == group).collect();
        let Some(rows) = decode_group(core, &members, row)? else {
            continue;
        };
        if group == 0 {
            decoded.bean = Some(bean_for(core, rows)?);
        } else {
            decoded.warm.extend(rows);
        }
    }
    Ok(decoded)
}

/// Decode one table group; `None` when an outer join produced no row.
fn decode_group(
    core: &Arc<SessionCore>,
    members: &[&ColumnDescriptor],
    row: &Row,
) -> Result<Option<Vec<SharedRow>>> {
    // Chain tables in select-list order, parent-first.
    let mut tables: Vec<&str> = Vec::new();
    for desc in members {
        if !tables.contains(&desc.table.as_str()) {
            tables.push(&desc.table);
        }
    }

    let mut rows = Vec::with_capacity(tables.len());
    for (position, table) in tables.iter().enumerate() {
        let facts = core.schema.table_facts(table)?;
        let converter = core.schema.converter(table)?;
        let mut pk = BTreeMap::new();
        let mut values = BTreeMap::new();
        for desc in members.iter().filter(|d| d.table == *table) {
            let raw = row
                .get_by_name(&desc.alias)
                .cloned()
                .unwrap_or(Value::Null);
            let value = converter.from_stored(&desc.column, raw);
            if facts.is_pk_column(&desc.column) {
                pk.insert(desc.column.clone(), value);
            } else {
                values.insert(desc.column.clone(), value);
            }
        }
        // A fully null key on the anchor table means the outer join missed.
        if position == 0 && pk.values().all(Value::is_null) {
            return Ok(None);
        }

        let hash = key_hash(&pk);
        let existing = core
            .identity
            .read()
            .expect("lock poisoned")
            .get(table, hash);
        let shared = match existing {
            // Already loaded wins over re-fetched data.
            Some(shared) => shared,
            None => {
                let shared: SharedRow = Arc::new(RwLock::new(RowState::fetched(table, pk, values)));
                core.identity
                    .write()
                    .expect("lock poisoned")
                    .register(table, hash, &shared);
                shared
            }
        };
        rows.push(shared);
    }
    Ok(Some(rows))
}

/// The bean owning a decoded chain: the live owner if the rows already
/// belong to one, otherwise a fresh bean adopting them. New beans first
/// deepen their chain through any physically present subclass rows.
fn bean_for(core: &Arc<SessionCore>, rows: Vec<SharedRow>) -> Result<Bean> {
    if let Some(owner) = rows.last().and_then(Bean::owner_of) {
        return Ok(owner);
    }
    let mut rows = rows;
    extend_with_subclass_rows(core, &mut rows)?;
    Ok(Bean::from_rows(rows, Some(core.clone())))
}

fn run_select(
    core: &Arc<SessionCore>,
    sql: &str,
    params: &[Value],
    columns: &[ColumnDescriptor],
) -> Result<(Vec<Bean>, Vec<SharedRow>)> {
    let rows = core.driver.query(sql, params)?;
    let mut beans = Vec::with_capacity(rows.len());
    let mut warm = Vec::new();
    for row in &rows {
        let mut decoded = decode_row(core, columns, row)?;
        if let Some(bean) = decoded.bean.take() {
            beans.push(bean);
        }
        warm.append(&mut decoded.warm);
    }
    tracing::debug!(beans = beans.len(), warmed = warm.len(), "decoded result");
    Ok((beans, warm))
}

fn run_count(core: &Arc<SessionCore>, sql: &str, params: &[Value]) -> Result<u64> {
    let row = core.driver.query_one(sql, params)?.ok_or_else(|| {
        Error::InvalidArgument("count query returned no rows".to_string())
    })?;
    let count: i64 = row.get_as(0)?;
    Ok(count.max(0) as u64)
}

// =============================================================================
// Result sets
// =============================================================================

/// The outcome of a find.
///
/// Buffered sets execute and decode at construction time. Cursor sets hold
/// only the compiled plan; every [`ResultSet::iter`] call re-executes it.
pub struct ResultSet {
    core: Arc<SessionCore>,
    plan: QueryPlan,
    mode: FetchMode,
    buffered: Option<Vec<Bean>>,
    _warm: Vec<SharedRow>,
    total: Option<u64>,
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("mode", &self.mode)
            .field("buffered_len", &self.buffered.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

impl ResultSet {
    pub(crate) fn new(core: Arc<SessionCore>, plan: QueryPlan, mode: FetchMode) -> Result<Self> {
        let (buffered, warm) = match mode {
            FetchMode::Cursor => (None, Vec::new()),
            FetchMode::Buffered => {
                let (beans, warm) = run_select(&core, &plan.sql, &plan.params, &plan.columns)?;
                (Some(beans), warm)
            }
        };
        Ok(Self {
            core,
            plan,
            mode,
            buffered,
            _warm: warm,
            total: None,
        })
    }

    pub fn mode(&self) -> FetchMode {
        self.mode
    }

    /// Iterate the result. A cursor re-executes the query; a buffered set
    /// walks its decoded list.
    pub fn iter(&self) -> Result<ResultIter> {
        match &self.buffered {
            Some(beans) => Ok(ResultIter {
                beans: beans.clone().into_iter(),
                _warm: Vec::new(),
            }),
            None => {
                let (beans, warm) =
                    run_select(&self.core, &self.plan.sql, &self.plan.params, &self.plan.columns)?;
                Ok(ResultIter {
                    beans: beans.into_iter(),
                    _warm: warm,
                })
            }
        }
    }

    /// Random access. Only buffered sets support it; a cursor fails with
    /// [`Error::InvalidOffset`], as does an out-of-range index.
    pub fn get(&self, index: usize) -> Result<Bean> {
        let Some(beans) = &self.buffered else {
            return Err(Error::InvalidOffset {
                offset: index,
                message: "random access requires a buffered result".to_string(),
            });
        };
        beans.get(index).cloned().ok_or_else(|| Error::InvalidOffset {
            offset: index,
            message: format!("result holds {} rows", beans.len()),
        })
    }

    /// The decoded length; `None` in cursor mode.
    pub fn len(&self) -> Option<usize> {
        self.buffered.as_ref().map(Vec::len)
    }

    pub fn is_empty(&self) -> Option<bool> {
        self.len().map(|n| n == 0)
    }

    /// The total matching row count, via the derived count query. Executed
    /// at most once per result set.
    pub fn total(&mut self) -> Result<u64> {
        if let Some(total) = self.total {
            return Ok(total);
        }
        let total = run_count(&self.core, &self.plan.count_sql, &self.plan.params)?;
        self.total = Some(total);
        Ok(total)
    }

    /// A window of the result as a [`Page`].
    ///
    /// A buffered set slices its decoded list; a cursor set compiles a
    /// windowed query that only runs when the page contents are read.
    pub fn take(&self, offset: usize, limit: usize) -> Page {
        let source = match &self.buffered {
            Some(beans) => {
                let end = offset.saturating_add(limit).min(beans.len());
                let window = beans.get(offset..end).unwrap_or(&[]).to_vec();
                PageSource::Slice(window)
            }
            None => PageSource::Query {
                sql: self.plan.sql_with_window(offset, limit),
                columns: self.plan.columns.clone(),
                fetched: None,
            },
        };
        Page {
            core: self.core.clone(),
            offset,
            limit,
            source,
            count_sql: self.plan.count_sql.clone(),
            params: self.plan.params.clone(),
            _warm: Vec::new(),
            total: None,
        }
    }

    /// This result as a filter on another find: primary key contained in
    /// this result's rows. Fails when the root table's primary key is
    /// composite.
    pub fn as_filter(&self) -> Result<Filter> {
        let sql = self.plan.subquery_sql.clone().ok_or_else(|| {
            Error::InvalidArgument(
                "a result over a composite primary key cannot be used as a filter".to_string(),
            )
        })?;
        Ok(Filter::SubQuery {
            sql,
            params: self.plan.params.clone(),
        })
    }
}

/// An owning iterator over decoded beans.
pub struct ResultIter {
    beans: std::vec::IntoIter<Bean>,
    _warm: Vec<SharedRow>,
}

impl Iterator for ResultIter {
    type Item = Bean;

    fn next(&mut self) -> Option<Bean> {
        self.beans.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.beans.size_hint()
    }
}

// =============================================================================
// Pages
// =============================================================================

enum PageSource {
    Query {
        sql: String,
        columns: Vec<ColumnDescriptor>,
        fetched: Option<Vec<Bean>>,
    },
    Slice(Vec<Bean>),
}

/// One window of a result, with a total count over the unwindowed set.
///
/// Contents and total are each fetched lazily and at most once; reading the
/// total never materializes the page contents.
pub struct Page {
    core: Arc<SessionCore>,
    offset: usize,
    limit: usize,
    source: PageSource,
    count_sql: String,
    params: Vec<Value>,
    _warm: Vec<SharedRow>,
    total: Option<u64>,
}

impl Page {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The beans in this window.
    pub fn beans(&mut self) -> Result<&[Bean]> {
        if let PageSource::Query {
            sql,
            columns,
            fetched,
        } = &mut self.source
        {
            if fetched.is_none() {
                let (beans, warm) = run_select(&self.core, sql, &self.params, columns)?;
                *fetched = Some(beans);
                self._warm = warm;
            }
        }
        match &self.source {
            PageSource::Slice(beans) => Ok(beans),
            PageSource::Query { fetched, .. } => {
                Ok(fetched.as_deref().unwrap_or(&[]))
            }
        }
    }

    /// The total row count of the unwindowed result. Executed at most once
    /// per page.
    pub fn total(&mut self) -> Result<u64> {
        if let Some(total) = self.total {
            return Ok(total);
        }
        let total = run_count(&self.core, &self.count_sql, &self.params)?;
        self.total = Some(total);
        Ok(total)
    }
}
