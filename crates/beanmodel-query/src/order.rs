//! ORDER BY parsing and validation.

use std::sync::LazyLock;

use beanmodel_core::{Driver, Error, Result};
use regex::Regex;

static IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// One term of an ORDER BY clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderTerm {
    /// A validated, optionally table-qualified column reference.
    Column {
        table: Option<String>,
        column: String,
        descending: bool,
    },
    /// A raw fragment accepted through the unchecked escape hatch.
    Unchecked(String),
}

/// A validated ORDER BY specification.
///
/// [`OrderBy::parse`] accepts only bare or table-qualified column references
/// with an optional direction keyword; anything else fails with
/// [`Error::InvalidArgument`] before SQL is built. [`OrderBy::unchecked`]
/// disables validation entirely and is injection-unsafe; never hand it
/// untrusted input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderBy {
    terms: Vec<OrderTerm>,
}

impl OrderBy {
    /// An empty specification (no ORDER BY clause).
    pub fn none() -> Self {
        Self::default()
    }

    /// Parse a comma-separated list of `[table.]column [ASC|DESC]` terms.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(Self::none());
        }
        let mut terms = Vec::new();
        for part in spec.split(',') {
            terms.push(Self::parse_term(part.trim())?);
        }
        Ok(Self { terms })
    }

    /// Accept a raw fragment without validation.
    pub fn unchecked(fragment: impl Into<String>) -> Self {
        Self {
            terms: vec![OrderTerm::Unchecked(fragment.into())],
        }
    }

    fn parse_term(term: &str) -> Result<OrderTerm> {
        let bad = |term: &str| {
            Error::InvalidArgument(format!(
                "order-by term '{}' is not a column reference; \
                 use the unchecked escape hatch for raw SQL",
                term
            ))
        };
        let mut words = term.split_whitespace();
        let Some(reference) = words.next() else {
            return Err(bad(term));
        };
        let descending = match words.next() {
            None => false,
            Some(dir) if dir.eq_ignore_ascii_case("asc") => false,
            Some(dir) if dir.eq_ignore_ascii_case("desc") => true,
            Some(_) => return Err(bad(term)),
        };
        if words.next().is_some() {
            return Err(bad(term));
        }
        let (table, column) = match reference.split_once('.') {
            Some((t, c)) => (Some(t), c),
            None => (None, reference),
        };
        if let Some(t) = table {
            if !IDENT.is_match(t) {
                return Err(bad(term));
            }
        }
        if !IDENT.is_match(column) {
            return Err(bad(term));
        }
        Ok(OrderTerm::Column {
            table: table.map(str::to_string),
            column: column.to_string(),
            descending,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> &[OrderTerm] {
        &self.terms
    }

    /// Tables referenced by qualified terms, for merging into the join set.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().filter_map(|t| match t {
            OrderTerm::Column {
                table: Some(table), ..
            } => Some(table.as_str()),
            _ => None,
        })
    }

    /// Render the clause body (without the `ORDER BY` keyword).
    pub fn render(&self, driver: &dyn Driver) -> String {
        self.terms
            .iter()
            .map(|term| match term {
                OrderTerm::Column {
                    table,
                    column,
                    descending,
                } => {
                    let mut out = match table {
                        Some(t) => format!(
                            "{}.{}",
                            driver.quote_identifier(t),
                            driver.quote_identifier(column)
                        ),
                        None => driver.quote_identifier(column),
                    };
                    if *descending {
                        out.push_str(" DESC");
                    }
                    out
                }
                OrderTerm::Unchecked(fragment) => fragment.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
