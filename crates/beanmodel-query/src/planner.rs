//! Compilation of `find` requests into executable plans.

use beanmodel_core::{Driver, Error, Result, SchemaError, SchemaErrorKind};
use beanmodel_schema::SchemaFacts;

use crate::filter::FilterBag;
use crate::inheritance::resolve_table_group;
use crate::order::OrderBy;
use crate::plan::{ColumnDescriptor, QueryPlan, SelectShape, derive_count, number_placeholders};

/// Compiles a target table, filter bag, order spec, and join set into a
/// [`QueryPlan`].
///
/// The target table is expanded to its full inheritance chain (table group
/// 0). Additional tables on the same inheritance line deepen that chain;
/// any other additional table becomes its own group, joined through a
/// foreign key and decoded purely as an identity-map warm-up. Tables that
/// appear only in the order spec are joined but never decoded.
pub struct QueryPlanner<'a> {
    schema: &'a SchemaFacts,
    driver: &'a dyn Driver,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(schema: &'a SchemaFacts, driver: &'a dyn Driver) -> Self {
        Self { schema, driver }
    }

    /// Compile a `find` request.
    ///
    /// Fails before any SQL executes: malformed filters surface as
    /// [`Error::InvalidArgument`], tables that cannot be joined likewise,
    /// and diverging inheritance branches as
    /// [`Error::InheritanceResolution`].
    #[tracing::instrument(skip_all, fields(table = table))]
    pub fn plan_find(
        &self,
        table: &str,
        filter: &FilterBag,
        order: &OrderBy,
        additional_tables: &[String],
    ) -> Result<QueryPlan> {
        let mut same_line = vec![table.to_string()];
        let mut related: Vec<String> = Vec::new();
        for extra in additional_tables {
            if same_line.contains(extra) || related.contains(extra) {
                continue;
            }
            self.schema.table_facts(extra)?;
            match resolve_table_group(self.schema, &[table.to_string(), extra.clone()]) {
                Ok(_) => same_line.push(extra.clone()),
                Err(Error::InheritanceResolution(_)) => related.push(extra.clone()),
                Err(err) => return Err(err),
            }
        }

        let mut groups: Vec<Vec<String>> = vec![resolve_table_group(self.schema, &same_line)?];
        for extra in &related {
            groups.push(resolve_table_group(self.schema, &[extra.clone()])?);
        }

        let q = |name: &str| self.driver.quote_identifier(name);

        // FROM and JOIN clauses. The element chain uses inner joins; every
        // other table is outer-joined so unrelated rows still come back.
        let root = groups[0][0].clone();
        let mut body = format!("FROM {}", q(&root));
        let mut joined: Vec<String> = vec![root.clone()];
        let element_chain = groups[0].clone();
        for pair in element_chain.windows(2) {
            let on = self.pk_join(&pair[0], &pair[1])?;
            body.push_str(&format!(" JOIN {} ON {}", q(&pair[1]), on));
            joined.push(pair[1].clone());
        }
        for chain in groups.iter().skip(1) {
            self.join_chain(chain, &mut body, &mut joined)?;
        }
        for order_table in order.tables() {
            if joined.iter().any(|t| t == order_table) {
                continue;
            }
            self.schema.table_facts(order_table)?;
            self.join_chain(&[order_table.to_string()], &mut body, &mut joined)?;
        }

        // Select list and decoding map.
        let mut select_items = Vec::new();
        let mut columns = Vec::new();
        for (group, chain) in groups.iter().enumerate() {
            for chain_table in chain {
                let facts = self.schema.table_facts(chain_table)?;
                for col in &facts.columns {
                    let alias = format!("g{}__{}__{}", group, chain_table, col.name);
                    select_items.push(format!(
                        "{}.{} AS {}",
                        q(chain_table),
                        q(&col.name),
                        q(&alias)
                    ));
                    columns.push(ColumnDescriptor {
                        alias,
                        table: chain_table.clone(),
                        column: col.name.clone(),
                        group,
                    });
                }
            }
        }

        let mut params = Vec::new();
        if let Some((where_sql, mut where_params)) = filter.compile(self.driver)? {
            body.push_str(" WHERE ");
            body.push_str(&where_sql);
            params.append(&mut where_params);
        }

        let shape = SelectShape {
            select_list: select_items.join(", "),
            body,
            ..SelectShape::default()
        };

        let mut sql = shape.render();
        if !order.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.render(self.driver));
        }

        let root_pk = self.schema.primary_key(&root)?;
        let subquery_sql = if root_pk.len() == 1 {
            Some(format!(
                "SELECT {}.{} {}",
                q(&root),
                q(&root_pk[0]),
                shape.body
            ))
        } else {
            None
        };

        tracing::debug!(sql = %sql, groups = groups.len(), "compiled find");
        Ok(QueryPlan {
            sql: number_placeholders(&sql, self.driver),
            count_sql: number_placeholders(&derive_count(&shape, self.driver), self.driver),
            subquery_sql,
            params,
            columns,
        })
    }

    /// Outer-join a chain of tables through a foreign key to the already
    /// joined set, then knit the rest of the chain on via shared keys.
    fn join_chain(
        &self,
        chain: &[String],
        body: &mut String,
        joined: &mut Vec<String>,
    ) -> Result<()> {
        let q = |name: &str| self.driver.quote_identifier(name);
        let (anchor, on) = self.link_clause(chain, joined)?;
        body.push_str(&format!(" LEFT JOIN {} ON {}", q(&anchor), on));
        joined.push(anchor.clone());
        for member in chain {
            if member == &anchor {
                continue;
            }
            let on = self.pk_join(&anchor, member)?;
            body.push_str(&format!(" LEFT JOIN {} ON {}", q(member), on));
            joined.push(member.clone());
        }
        Ok(())
    }

    /// Find a foreign key linking `chain` to the joined set, in either
    /// direction, and render its ON clause. The chain member carrying or
    /// targeted by the key becomes the anchor.
    fn link_clause(&self, chain: &[String], joined: &[String]) -> Result<(String, String)> {
        let q = |name: &str| self.driver.quote_identifier(name);
        let render = |local_table: &str, fk: &beanmodel_schema::ForeignKey| {
            fk.local_columns
                .iter()
                .zip(&fk.foreign_columns)
                .map(|(l, f)| {
                    format!(
                        "{}.{} = {}.{}",
                        q(local_table),
                        q(l),
                        q(&fk.foreign_table),
                        q(f)
                    )
                })
                .collect::<Vec<_>>()
                .join(" AND ")
        };

        for member in chain {
            let facts = self.schema.table_facts(member)?;
            for fk in &facts.foreign_keys {
                if joined.iter().any(|t| *t == fk.foreign_table) {
                    return Ok((member.clone(), render(member, fk)));
                }
            }
        }
        for already in joined {
            let facts = self.schema.table_facts(already)?;
            for fk in &facts.foreign_keys {
                if chain.iter().any(|t| *t == fk.foreign_table) {
                    return Ok((fk.foreign_table.clone(), render(already, fk)));
                }
            }
        }
        Err(Error::InvalidArgument(format!(
            "no foreign key links table '{}' to the fetched tables",
            chain.first().map(String::as_str).unwrap_or("?")
        )))
    }

    /// Join two inheritance-chain members on their shared primary key.
    fn pk_join(&self, left: &str, right: &str) -> Result<String> {
        let q = |name: &str| self.driver.quote_identifier(name);
        let left_pk = self.schema.primary_key(left)?;
        let right_pk = self.schema.primary_key(right)?;
        if left_pk.len() != right_pk.len() {
            return Err(SchemaError::new(
                SchemaErrorKind::Invalid,
                format!(
                    "tables '{}' and '{}' share an inheritance line but their \
                     primary keys differ in arity",
                    left, right
                ),
            )
            .into());
        }
        Ok(left_pk
            .iter()
            .zip(right_pk)
            .map(|(l, r)| format!("{}.{} = {}.{}", q(right), q(r), q(left), q(l)))
            .collect::<Vec<_>>()
            .join(" AND "))
    }
}
