//! The find entry points and the caller-facing filter type.

use std::collections::BTreeMap;
use std::sync::Arc;

use beanmodel_core::{Error, Result, Value};
use beanmodel_query::{FilterBag, FilterValue, OrderBy, QueryPlanner};
use beanmodel_schema::SchemaFacts;
use beanmodel_session::{Bean, Session, SessionCore};

use crate::result::{FetchMode, ResultSet};

/// A caller-supplied filter, lowered into the planner's filter bag.
///
/// Closed by construction: anything not expressible here is not a filter.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Match everything.
    None,
    /// Column/value equality, AND-joined; a `Many` value becomes `IN`.
    Equality(BTreeMap<String, FilterValue>),
    /// A raw SQL fragment with positional parameters. Passed through
    /// verbatim; the caller owns its correctness.
    Raw { sql: String, params: Vec<Value> },
    /// Rows matching a bean's primary key, scoped to the bean's own table.
    Bean(Bean),
    /// Primary key contained in another result's rows. Built via
    /// [`crate::ResultSet::as_filter`].
    SubQuery { sql: String, params: Vec<Value> },
    /// Nested filters, AND-joined.
    And(Vec<Filter>),
}

impl Filter {
    /// An equality filter from column/value pairs.
    pub fn equality<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FilterValue>,
    {
        Filter::Equality(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Filter::Raw {
            sql: sql.into(),
            params,
        }
    }

    pub fn bean(bean: &Bean) -> Self {
        Filter::Bean(bean.clone())
    }

    /// Tables that bean filters predicate on; they must be in the join set
    /// for the compiled WHERE clause to reference them.
    fn bean_tables(&self) -> Vec<String> {
        match self {
            Filter::Bean(bean) => vec![bean.table()],
            Filter::And(filters) => filters.iter().flat_map(Filter::bean_tables).collect(),
            _ => Vec::new(),
        }
    }

    /// Lower into the planner's representation. `table` is the table being
    /// searched; sub-query filters bind to its primary key.
    fn lower(&self, schema: &SchemaFacts, table: &str) -> Result<FilterBag> {
        match self {
            Filter::None => Ok(FilterBag::None),
            Filter::Equality(map) => Ok(FilterBag::Equality(map.clone())),
            Filter::Raw { sql, params } => Ok(FilterBag::Raw {
                sql: sql.clone(),
                params: params.clone(),
            }),
            Filter::Bean(bean) => {
                if !bean.primary_key_is_set() {
                    return Err(Error::InvalidArgument(format!(
                        "bean for table '{}' used as a filter has no primary-key value",
                        bean.table()
                    )));
                }
                Ok(FilterBag::BeanKey {
                    table: bean.table(),
                    key: bean.primary_key(),
                })
            }
            Filter::SubQuery { sql, params } => {
                let pk = schema.primary_key(table)?;
                if pk.len() != 1 {
                    return Err(Error::InvalidArgument(format!(
                        "result filters need a single-column primary key on '{}'",
                        table
                    )));
                }
                Ok(FilterBag::SubQuery {
                    sql: sql.clone(),
                    params: params.clone(),
                    pk_column: pk[0].clone(),
                })
            }
            Filter::And(filters) => {
                let mut bags = Vec::with_capacity(filters.len());
                for filter in filters {
                    bags.push(filter.lower(schema, table)?);
                }
                Ok(FilterBag::And(bags))
            }
        }
    }
}

/// Query entry points over one session.
pub struct Finder {
    core: Arc<SessionCore>,
}

impl Finder {
    pub fn new(session: &Session) -> Self {
        Self {
            core: session.core().clone(),
        }
    }

    /// Find beans of `table` matching `filter`.
    ///
    /// `additional_tables` widens the fetch: tables on the element's
    /// inheritance line narrow it to rows present in all of them, foreign-key
    /// related tables are outer-joined and decoded into the identity map as
    /// a cache warm-up. Compilation fails before any SQL executes.
    #[tracing::instrument(skip_all, fields(table = table))]
    pub fn find(
        &self,
        table: &str,
        filter: &Filter,
        order: &OrderBy,
        additional_tables: &[&str],
        mode: FetchMode,
    ) -> Result<ResultSet> {
        let bag = filter.lower(&self.core.schema, table)?;
        let mut additional: Vec<String> = additional_tables
            .iter()
            .map(|t| (*t).to_string())
            .collect();
        // Bean filters predicate on their own table; join it even when the
        // caller did not list it, so compilation fails fast only for tables
        // that genuinely cannot be linked.
        for bean_table in filter.bean_tables() {
            if bean_table != table && !additional.contains(&bean_table) {
                additional.push(bean_table);
            }
        }
        let planner = QueryPlanner::new(&self.core.schema, self.core.driver.as_ref());
        let plan = planner.plan_find(table, &bag, order, &additional)?;
        ResultSet::new(self.core.clone(), plan, mode)
    }

    /// The single bean with this primary key.
    ///
    /// Zero matches fail with [`Error::NoBeanFound`], more than one with
    /// [`Error::DuplicateRow`].
    pub fn find_by_primary_key(
        &self,
        table: &str,
        pk: BTreeMap<String, Value>,
    ) -> Result<Bean> {
        let bag = FilterBag::BeanKey {
            table: table.to_string(),
            key: pk.clone(),
        };
        let planner = QueryPlanner::new(&self.core.schema, self.core.driver.as_ref());
        let plan = planner.plan_find(table, &bag, &OrderBy::none(), &[])?;
        let set = ResultSet::new(self.core.clone(), plan, FetchMode::Buffered)?;
        match set.len().unwrap_or(0) {
            0 => Err(Error::NoBeanFound(format!(
                "no '{}' row for key {:?}",
                table, pk
            ))),
            1 => set.get(0),
            n => Err(Error::DuplicateRow(format!(
                "{} '{}' rows for key {:?}",
                n, table, pk
            ))),
        }
    }

    /// The number of rows `find` would return, without fetching them.
    pub fn count(&self, table: &str, filter: &Filter) -> Result<u64> {
        let mut set = self.find(table, filter, &OrderBy::none(), &[], FetchMode::Cursor)?;
        set.total()
    }
}
