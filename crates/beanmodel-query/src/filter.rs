//! The filter bag: a closed union of everything `find` accepts as a filter.

use std::collections::BTreeMap;

use beanmodel_core::{Driver, Error, Result, Value};

/// A value on the right-hand side of an equality filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    /// `col = ?`
    One(Value),
    /// `col IN (?, ?, ...)`
    Many(Vec<Value>),
}

impl From<Value> for FilterValue {
    fn from(value: Value) -> Self {
        FilterValue::One(value)
    }
}

impl From<Vec<Value>> for FilterValue {
    fn from(values: Vec<Value>) -> Self {
        FilterValue::Many(values)
    }
}

/// Everything a `find` call accepts as a filter.
///
/// This is a closed union; each variant has fixed compilation rules and
/// anything that does not fit one of them is rejected before SQL is built.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterBag {
    /// No filter at all.
    None,
    /// Column/value equality, AND-joined. A `Many` value compiles to `IN`.
    Equality(BTreeMap<String, FilterValue>),
    /// A raw SQL fragment with its own positional parameters.
    ///
    /// Passed through verbatim; the caller owns its correctness.
    Raw {
        sql: String,
        params: Vec<Value>,
    },
    /// Equality on a specific bean's primary key, scoped to its own table.
    BeanKey {
        table: String,
        key: BTreeMap<String, Value>,
    },
    /// Primary key contained in a compiled sub-select.
    ///
    /// Only valid for single-column primary keys; the facade rejects
    /// composite keys before constructing this variant.
    SubQuery {
        sql: String,
        params: Vec<Value>,
        pk_column: String,
    },
    /// Nested bags, AND-joined.
    And(Vec<FilterBag>),
}

impl FilterBag {
    /// Build an equality bag from column/value pairs.
    pub fn equality<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FilterValue>,
    {
        FilterBag::Equality(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Whether this bag contributes no WHERE clause.
    pub fn is_empty(&self) -> bool {
        match self {
            FilterBag::None => true,
            FilterBag::Equality(map) => map.is_empty(),
            FilterBag::Raw { sql, .. } => sql.trim().is_empty(),
            FilterBag::And(bags) => bags.iter().all(FilterBag::is_empty),
            _ => false,
        }
    }

    /// Compile into a SQL fragment plus parameters.
    ///
    /// Parameter slots are rendered as `?` markers; the planner renumbers
    /// them into the driver's placeholder style once the full statement is
    /// assembled. Returns `None` when the bag is empty.
    pub fn compile(&self, driver: &dyn Driver) -> Result<Option<(String, Vec<Value>)>> {
        match self {
            FilterBag::None => Ok(None),
            FilterBag::Equality(map) => {
                if map.is_empty() {
                    return Ok(None);
                }
                let mut parts = Vec::with_capacity(map.len());
                let mut params = Vec::new();
                for (column, value) in map {
                    match value {
                        FilterValue::One(v) => {
                            parts.push(format!("{} = ?", driver.quote_identifier(column)));
                            params.push(v.clone());
                        }
                        FilterValue::Many(vs) => {
                            if vs.is_empty() {
                                return Err(Error::InvalidArgument(format!(
                                    "empty IN list for column '{}'",
                                    column
                                )));
                            }
                            let markers = vec!["?"; vs.len()].join(", ");
                            parts.push(format!(
                                "{} IN ({})",
                                driver.quote_identifier(column),
                                markers
                            ));
                            params.extend(vs.iter().cloned());
                        }
                    }
                }
                Ok(Some((parts.join(" AND "), params)))
            }
            FilterBag::Raw { sql, params } => {
                if sql.trim().is_empty() {
                    return Ok(None);
                }
                Ok(Some((format!("({})", sql.trim()), params.clone())))
            }
            FilterBag::BeanKey { table, key } => {
                if key.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "bean filter for table '{}' has no primary-key values",
                        table
                    )));
                }
                let mut parts = Vec::with_capacity(key.len());
                let mut params = Vec::new();
                for (column, value) in key {
                    parts.push(format!(
                        "{}.{} = ?",
                        driver.quote_identifier(table),
                        driver.quote_identifier(column)
                    ));
                    params.push(value.clone());
                }
                Ok(Some((parts.join(" AND "), params)))
            }
            FilterBag::SubQuery {
                sql,
                params,
                pk_column,
            } => Ok(Some((
                format!("{} IN ({})", driver.quote_identifier(pk_column), sql),
                params.clone(),
            ))),
            FilterBag::And(bags) => {
                let mut parts = Vec::new();
                let mut params = Vec::new();
                for bag in bags {
                    if let Some((sql, mut p)) = bag.compile(driver)? {
                        parts.push(format!("({})", sql));
                        params.append(&mut p);
                    }
                }
                if parts.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some((parts.join(" AND "), params)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beanmodel_core::Row;

    struct PlainDriver;

    impl Driver for PlainDriver {
        fn query(&self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }
        fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
            Ok(0)
        }
        fn last_insert_id(&self) -> Result<i64> {
            Ok(0)
        }
        fn begin(&self) -> Result<()> {
            Ok(())
        }
        fn commit(&self) -> Result<()> {
            Ok(())
        }
        fn rollback(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn equality_compiles_to_and_joined_predicates() {
        let bag = FilterBag::equality([
            ("status", Value::from("active")),
            ("age", Value::Int(30)),
        ]);
        let (sql, params) = bag.compile(&PlainDriver).unwrap().unwrap();
        assert_eq!(sql, "\"age\" = ? AND \"status\" = ?");
        assert_eq!(params, vec![Value::Int(30), Value::from("active")]);
    }

    #[test]
    fn many_compiles_to_in_list() {
        let bag = FilterBag::equality([(
            "id",
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        )]);
        let (sql, params) = bag.compile(&PlainDriver).unwrap().unwrap();
        assert_eq!(sql, "\"id\" IN (?, ?, ?)");
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn empty_in_list_is_rejected_before_sql_runs() {
        let bag = FilterBag::equality([("id", Vec::<Value>::new())]);
        let err = bag.compile(&PlainDriver).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn bean_key_is_table_scoped() {
        let bag = FilterBag::BeanKey {
            table: "author".to_string(),
            key: [("id".to_string(), Value::Int(7))].into_iter().collect(),
        };
        let (sql, params) = bag.compile(&PlainDriver).unwrap().unwrap();
        assert_eq!(sql, "\"author\".\"id\" = ?");
        assert_eq!(params, vec![Value::Int(7)]);
    }

    #[test]
    fn nested_bags_are_and_joined() {
        let bag = FilterBag::And(vec![
            FilterBag::equality([("status", Value::from("active"))]),
            FilterBag::Raw {
                sql: "age > ?".to_string(),
                params: vec![Value::Int(18)],
            },
            FilterBag::None,
        ]);
        let (sql, params) = bag.compile(&PlainDriver).unwrap().unwrap();
        assert_eq!(sql, "(\"status\" = ?) AND ((age > ?))");
        assert_eq!(params, vec![Value::from("active"), Value::Int(18)]);
    }

    #[test]
    fn empty_bags_produce_no_clause() {
        assert!(FilterBag::None.compile(&PlainDriver).unwrap().is_none());
        let blank = FilterBag::Raw {
            sql: "   ".to_string(),
            params: Vec::new(),
        };
        assert!(blank.compile(&PlainDriver).unwrap().is_none());
    }

    #[test]
    fn subquery_wraps_as_pk_in() {
        let bag = FilterBag::SubQuery {
            sql: "SELECT \"book\".\"author_id\" FROM \"book\" WHERE \"pages\" > ?".to_string(),
            params: vec![Value::Int(100)],
            pk_column: "id".to_string(),
        };
        let (sql, _) = bag.compile(&PlainDriver).unwrap().unwrap();
        assert!(sql.starts_with("\"id\" IN (SELECT"));
    }
}
