mod common;

use beanmodel::prelude::*;
use common::{count_row, pk, session, user_row};

#[test]
fn equality_filter_returns_only_matching_rows() {
    let (driver, session) = session();
    driver.respond(
        "WHERE \"status\" = $1",
        vec![
            user_row(1, "Ada", "active"),
            user_row(2, "Grace", "active"),
            user_row(3, "Edsger", "active"),
        ],
    );

    let finder = Finder::new(&session);
    let set = finder
        .find(
            "users",
            &Filter::equality([("status", Value::from("active"))]),
            &OrderBy::none(),
            &[],
            FetchMode::Buffered,
        )
        .unwrap();

    assert_eq!(set.len(), Some(3));
    for bean in set.iter().unwrap() {
        assert_eq!(bean.get("status", None).unwrap(), Value::from("active"));
    }
}

#[test]
fn validated_order_by_is_rendered_and_junk_is_rejected() {
    let (driver, session) = session();
    let finder = Finder::new(&session);

    let order = OrderBy::parse("name DESC").unwrap();
    let set = finder
        .find("users", &Filter::None, &order, &[], FetchMode::Cursor)
        .unwrap();
    set.iter().unwrap().for_each(drop);
    assert_eq!(driver.queries_containing("ORDER BY \"name\" DESC"), 1);

    let err = OrderBy::parse("RAND()").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn unchecked_order_by_passes_through_verbatim() {
    let (driver, session) = session();
    let finder = Finder::new(&session);
    let set = finder
        .find(
            "users",
            &Filter::None,
            &OrderBy::unchecked("RAND()"),
            &[],
            FetchMode::Cursor,
        )
        .unwrap();
    set.iter().unwrap().for_each(drop);
    assert_eq!(driver.queries_containing("ORDER BY RAND()"), 1);
}

#[test]
fn bean_filter_scopes_to_the_beans_own_table() {
    let (driver, session) = session();
    let author = session.create("author").unwrap();
    author.set("name", Value::from("Pam"), None).unwrap();
    session.save(&author).unwrap();

    let finder = Finder::new(&session);
    finder
        .find(
            "book",
            &Filter::bean(&author),
            &OrderBy::none(),
            &["author"],
            FetchMode::Buffered,
        )
        .unwrap();

    let select = driver
        .statements()
        .into_iter()
        .find(|s| s.starts_with("SELECT") && s.contains("FROM \"book\""))
        .unwrap();
    assert!(select.contains("LEFT JOIN \"author\""));
    assert!(select.contains("WHERE \"author\".\"id\" = $1"));
}

#[test]
fn bean_filters_join_their_table_automatically() {
    let (driver, session) = session();
    let author = session.create("author").unwrap();
    author.set("name", Value::from("Pam"), None).unwrap();
    session.save(&author).unwrap();

    let finder = Finder::new(&session);
    finder
        .find(
            "book",
            &Filter::bean(&author),
            &OrderBy::none(),
            &[],
            FetchMode::Buffered,
        )
        .unwrap();

    let select = driver
        .statements()
        .into_iter()
        .find(|s| s.starts_with("SELECT") && s.contains("FROM \"book\""))
        .unwrap();
    assert!(select.contains("LEFT JOIN \"author\""));
    assert!(select.contains("WHERE \"author\".\"id\" = $1"));
}

#[test]
fn bean_filter_without_a_key_fails_before_any_sql() {
    let (driver, session) = session();
    let author = session.create("author").unwrap();

    let finder = Finder::new(&session);
    let err = finder
        .find(
            "book",
            &Filter::bean(&author),
            &OrderBy::none(),
            &["author"],
            FetchMode::Buffered,
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(driver.statements().is_empty());
}

#[test]
fn a_result_set_filters_another_find() {
    let (driver, session) = session();
    driver.respond("COUNT", vec![count_row(0)]);
    let finder = Finder::new(&session);

    let actives = finder
        .find(
            "users",
            &Filter::equality([("status", Value::from("active"))]),
            &OrderBy::none(),
            &[],
            FetchMode::Cursor,
        )
        .unwrap();

    let filter = actives.as_filter().unwrap();
    let set = finder
        .find("users", &filter, &OrderBy::none(), &[], FetchMode::Buffered)
        .unwrap();
    drop(set);

    let select = driver
        .statements()
        .into_iter()
        .find(|s| s.contains(" IN (SELECT "))
        .unwrap();
    assert!(select.contains("WHERE \"id\" IN (SELECT \"users\".\"id\" FROM \"users\""));
    // The inner filter's parameter survives renumbering.
    assert!(select.contains("\"status\" = $1"));
}

#[test]
fn composite_key_results_cannot_become_filters() {
    let (_, session) = session();
    let finder = Finder::new(&session);
    let links = finder
        .find(
            "author_book",
            &Filter::None,
            &OrderBy::none(),
            &[],
            FetchMode::Cursor,
        )
        .unwrap();
    let err = links.as_filter().unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn find_by_primary_key_needs_exactly_one_row() {
    let (driver, session) = session();
    let finder = Finder::new(&session);

    let err = finder.find_by_primary_key("users", pk(1)).unwrap_err();
    assert!(matches!(err, Error::NoBeanFound(_)));

    driver.respond(
        "FROM \"users\"",
        vec![user_row(2, "Ada", "active"), user_row(3, "Ada", "active")],
    );
    let err = finder.find_by_primary_key("users", pk(2)).unwrap_err();
    assert!(matches!(err, Error::DuplicateRow(_)));
}

#[test]
fn find_by_primary_key_returns_the_loaded_bean() {
    let (driver, session) = session();
    driver.respond("FROM \"users\"", vec![user_row(7, "Ada", "active")]);
    let finder = Finder::new(&session);

    let bean = finder.find_by_primary_key("users", pk(7)).unwrap();
    assert_eq!(bean.get("id", None).unwrap(), Value::Int(7));
    assert_eq!(bean.get("name", None).unwrap(), Value::from("Ada"));
    assert_eq!(bean.phase(), RowPhase::Loaded);
}
