//! Compiled query plans and count-query derivation.

use beanmodel_core::Driver;

/// Where one select-list column lands when rows are decoded.
///
/// `group` 0 is the iteration element's inheritance chain; higher groups are
/// eagerly joined related chains, decoded for identity-map warm-up only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// The unique select-list alias, `g{group}__{table}__{column}`.
    pub alias: String,
    /// Source table.
    pub table: String,
    /// Source column.
    pub column: String,
    /// Table-group id.
    pub group: usize,
}

/// A fully compiled `find` query.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// The select statement, placeholders in the driver's style.
    pub sql: String,
    /// An equivalent count query over the same filtered set.
    pub count_sql: String,
    /// A single-column primary-key select over the same filtered set, in
    /// `?`-marker form so it can be embedded into another plan's WHERE
    /// clause. `None` when the root table has a composite primary key.
    pub subquery_sql: Option<String>,
    /// Parameters, shared by `sql` and `count_sql`.
    pub params: Vec<beanmodel_core::Value>,
    /// Decoding map for the select list, in select-list order.
    pub columns: Vec<ColumnDescriptor>,
}

impl QueryPlan {
    /// The select statement windowed to one page.
    pub fn sql_with_window(&self, offset: usize, limit: usize) -> String {
        format!("{} LIMIT {} OFFSET {}", self.sql, limit, offset)
    }
}

/// The shape of a compiled select, as count derivation needs to see it.
#[derive(Debug, Clone, Default)]
pub struct SelectShape {
    /// The rendered select list.
    pub select_list: String,
    /// Everything from `FROM` through `HAVING`, without `ORDER BY`.
    pub body: String,
    /// Whether the select is `DISTINCT`.
    pub distinct: bool,
    /// Rendered distinct columns, when `distinct` is set.
    pub distinct_columns: Vec<String>,
    /// Rendered `GROUP BY` columns.
    pub group_by: Vec<String>,
    /// Rendered `HAVING` predicate, if any.
    pub having: Option<String>,
}

impl SelectShape {
    /// Render the full select statement (without `ORDER BY`).
    pub fn render(&self) -> String {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&self.select_list);
        sql.push(' ');
        sql.push_str(&self.body);
        sql
    }
}

/// Derive a count query equivalent to a compiled select.
///
/// - no GROUP BY, no DISTINCT: `COUNT(*)` over the same body
/// - no GROUP BY, DISTINCT: `COUNT(DISTINCT <distinct columns>)`
/// - GROUP BY without HAVING: `COUNT(DISTINCT <group columns>)`
/// - GROUP BY with HAVING, or a driver without DISTINCT-count support:
///   wrap the whole select as `SELECT COUNT(*) FROM (<select>) AS t`
pub fn derive_count(shape: &SelectShape, driver: &dyn Driver) -> String {
    let wrap = || format!("SELECT COUNT(*) FROM ({}) AS t", shape.render());

    if shape.group_by.is_empty() {
        if !shape.distinct {
            return format!("SELECT COUNT(*) {}", shape.body);
        }
        if driver.supports_distinct_count() {
            return format!(
                "SELECT COUNT(DISTINCT {}) {}",
                shape.distinct_columns.join(", "),
                shape.body
            );
        }
        return wrap();
    }
    if shape.having.is_none() && driver.supports_distinct_count() {
        // The body still carries the GROUP BY clause; counting distinct
        // group columns over the ungrouped body gives the same number.
        let ungrouped = shape
            .body
            .split(" GROUP BY ")
            .next()
            .unwrap_or(&shape.body)
            .to_string();
        return format!(
            "SELECT COUNT(DISTINCT {}) {}",
            shape.group_by.join(", "),
            ungrouped
        );
    }
    wrap()
}

/// Renumber `?` markers into the driver's placeholder style.
///
/// Quoted string literals and quoted identifiers are scanned over, so a
/// `?` inside a raw fragment's literal survives untouched and does not
/// shift the numbering.
pub fn number_placeholders(sql: &str, driver: &dyn Driver) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut index = 0usize;
    let mut quote: Option<char> = None;
    for ch in sql.chars() {
        match quote {
            Some(open) => {
                out.push(ch);
                if ch == open {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    out.push(ch);
                }
                '?' => {
                    index += 1;
                    out.push_str(&driver.placeholder(index));
                }
                _ => out.push(ch),
            },
        }
    }
    out
}
