//! A scripted driver and schema fixture shared by the integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use beanmodel::prelude::*;
use beanmodel::Row;

#[derive(Default)]
struct ScriptState {
    log: Vec<(String, Vec<Value>)>,
    responses: Vec<(String, Vec<Row>)>,
    next_id: i64,
}

/// A driver that answers queries from scripted responses and records every
/// statement it sees.
#[derive(Default)]
pub struct ScriptedDriver {
    state: Mutex<ScriptState>,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `rows` for any query whose SQL contains `needle`. Earlier
    /// registrations win.
    pub fn respond(&self, needle: &str, rows: Vec<Row>) {
        self.state
            .lock()
            .expect("lock poisoned")
            .responses
            .push((needle.to_string(), rows));
    }

    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("lock poisoned")
            .log
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }

    pub fn queries_containing(&self, needle: &str) -> usize {
        self.statements()
            .iter()
            .filter(|sql| sql.contains(needle))
            .count()
    }
}

impl Driver for ScriptedDriver {
    fn query(&self, sql: &str, params: &[Value]) -> beanmodel::Result<Vec<Row>> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.log.push((sql.to_string(), params.to_vec()));
        for (needle, rows) in &state.responses {
            if sql.contains(needle.as_str()) {
                return Ok(rows.clone());
            }
        }
        Ok(Vec::new())
    }

    fn execute(&self, sql: &str, params: &[Value]) -> beanmodel::Result<u64> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.log.push((sql.to_string(), params.to_vec()));
        if sql.starts_with("INSERT") {
            state.next_id += 1;
        }
        Ok(1)
    }

    fn last_insert_id(&self) -> beanmodel::Result<i64> {
        Ok(self.state.lock().expect("lock poisoned").next_id)
    }

    fn begin(&self) -> beanmodel::Result<()> {
        Ok(())
    }

    fn commit(&self) -> beanmodel::Result<()> {
        Ok(())
    }

    fn rollback(&self) -> beanmodel::Result<()> {
        Ok(())
    }
}

/// users, author/book (FK), author_book (pivot), animal/dog (inheritance).
pub fn schema() -> SchemaFacts {
    SchemaFacts::new()
        .table(
            TableFacts::new("users")
                .column("id", SqlType::Int)
                .column("name", SqlType::Text)
                .column("status", SqlType::Text)
                .primary_key(&["id"]),
        )
        .table(
            TableFacts::new("author")
                .column("id", SqlType::Int)
                .column("name", SqlType::Text)
                .primary_key(&["id"]),
        )
        .table(
            TableFacts::new("book")
                .column("id", SqlType::Int)
                .column("title", SqlType::Text)
                .column("author_id", SqlType::Int)
                .primary_key(&["id"])
                .foreign_key("fk_book_author", "author_id", "author", "id"),
        )
        .table(
            TableFacts::new("author_book")
                .column("author_id", SqlType::Int)
                .column("book_id", SqlType::Int)
                .primary_key(&["author_id", "book_id"])
                .foreign_key("fk_ab_author", "author_id", "author", "id")
                .foreign_key("fk_ab_book", "book_id", "book", "id")
                .pivot(),
        )
        .table(
            TableFacts::new("animal")
                .column("id", SqlType::Int)
                .column("name", SqlType::Text)
                .primary_key(&["id"]),
        )
        .table(
            TableFacts::new("dog")
                .column("id", SqlType::Int)
                .column("breed", SqlType::Text)
                .primary_key(&["id"])
                .foreign_key("fk_dog_animal", "id", "animal", "id")
                .inherits("animal"),
        )
}

pub fn session() -> (Arc<ScriptedDriver>, Session) {
    let driver = ScriptedDriver::new();
    let session = Session::new(driver.clone(), schema());
    (driver, session)
}

/// A decoded `users` result row in the planner's alias scheme.
pub fn user_row(id: i64, name: &str, status: &str) -> Row {
    Row::new(
        vec![
            "g0__users__id".to_string(),
            "g0__users__name".to_string(),
            "g0__users__status".to_string(),
        ],
        vec![Value::Int(id), Value::from(name), Value::from(status)],
    )
}

pub fn count_row(total: i64) -> Row {
    Row::new(vec!["count".to_string()], vec![Value::Int(total)])
}

pub fn pk(id: i64) -> BTreeMap<String, Value> {
    BTreeMap::from([("id".to_string(), Value::Int(id))])
}
