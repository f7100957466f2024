//! Per-table conversion between runtime values and stored representation.

use beanmodel_core::Value;

use crate::facts::{SqlType, TableFacts};

/// Converts column values to and from the driver's stored representation.
///
/// Built from [`TableFacts`]; columns the schema does not know about pass
/// through unchanged.
#[derive(Debug, Clone, Copy)]
pub struct TypeConverter<'a> {
    facts: &'a TableFacts,
}

impl<'a> TypeConverter<'a> {
    pub fn new(facts: &'a TableFacts) -> Self {
        Self { facts }
    }

    /// Convert a runtime value into the form handed to the driver.
    ///
    /// Booleans are widened to integers because several engines have no
    /// native boolean storage class.
    pub fn to_stored(&self, column: &str, value: Value) -> Value {
        let Some(facts) = self.facts.column_facts(column) else {
            return value;
        };
        match (facts.sql_type, value) {
            (_, Value::Null) => Value::Null,
            (SqlType::Bool, Value::Bool(b)) => Value::Int(i64::from(b)),
            (SqlType::Int, Value::Bool(b)) => Value::Int(i64::from(b)),
            (SqlType::Float, Value::Int(i)) => Value::Float(i as f64),
            (_, other) => other,
        }
    }

    /// Convert a value read from the driver back into its runtime form.
    pub fn from_stored(&self, column: &str, value: Value) -> Value {
        let Some(facts) = self.facts.column_facts(column) else {
            return value;
        };
        match (facts.sql_type, value) {
            (_, Value::Null) => Value::Null,
            (SqlType::Bool, Value::Int(i)) => Value::Bool(i != 0),
            (SqlType::Bool, Value::Bool(b)) => Value::Bool(b),
            (SqlType::Float, Value::Int(i)) => Value::Float(i as f64),
            (_, other) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::TableFacts;

    fn user_table() -> TableFacts {
        TableFacts::new("user")
            .column("id", SqlType::Int)
            .column("active", SqlType::Bool)
            .column("score", SqlType::Float)
            .primary_key(&["id"])
    }

    #[test]
    fn bool_round_trips_through_int_storage() {
        let facts = user_table();
        let conv = TypeConverter::new(&facts);
        assert_eq!(conv.to_stored("active", Value::Bool(true)), Value::Int(1));
        assert_eq!(conv.from_stored("active", Value::Int(1)), Value::Bool(true));
        assert_eq!(conv.from_stored("active", Value::Int(0)), Value::Bool(false));
    }

    #[test]
    fn null_is_preserved() {
        let facts = user_table();
        let conv = TypeConverter::new(&facts);
        assert_eq!(conv.to_stored("active", Value::Null), Value::Null);
        assert_eq!(conv.from_stored("active", Value::Null), Value::Null);
    }

    #[test]
    fn int_widens_to_float_column() {
        let facts = user_table();
        let conv = TypeConverter::new(&facts);
        assert_eq!(conv.to_stored("score", Value::Int(3)), Value::Float(3.0));
    }

    #[test]
    fn unknown_columns_pass_through() {
        let facts = user_table();
        let conv = TypeConverter::new(&facts);
        assert_eq!(
            conv.to_stored("nickname", Value::Text("bo".into())),
            Value::Text("bo".into())
        );
    }
}
