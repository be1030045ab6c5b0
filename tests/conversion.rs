//! Parameter encoding and result conversion through the facade.

mod common;

use chrono::{NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use common::{Mock, rows};
use serde_json::json;
use zero_pq::protocol::types::oid;
use zero_pq::{ConnectionOptions, ParserRegistry, Timestamp, Value, codec};

#[tokio::test(start_paused = true)]
async fn insert_then_select_json() {
    let mock = Mock::default();
    mock.result(
        "SELECT * FROM t",
        rows(
            &[("id", oid::INT4), ("name", oid::TEXT), ("data", oid::JSON)],
            &[&[Some("1"), Some("one"), Some("{\"one\":1}")]],
        ),
    );
    let conn = mock.connection();

    let inserted = conn
        .exec_params(
            "INSERT INTO t VALUES ($1, $2, $3)",
            &[1.into(), "one".into(), json!({"one": 1}).into()],
        )
        .unwrap();
    assert_eq!(inserted.await.unwrap().rows_affected(), Some(1));

    let result = conn.exec("SELECT * FROM t").unwrap().await.unwrap();
    let [row] = result.rows() else {
        panic!("expected one row, got {result:?}");
    };
    assert_eq!(row.get("id"), Some(&Value::Int(1)));
    assert_eq!(row.get("name").and_then(Value::as_str), Some("one"));
    assert_eq!(row.get("data").and_then(Value::as_json), Some(&json!({"one": 1})));

    assert_eq!(
        mock.log()[1],
        r#"start INSERT INTO t VALUES ($1, $2, $3) [1, one, {"one":1}]"#
    );
}

#[tokio::test(start_paused = true)]
async fn parameters_are_rendered_as_text() {
    let mock = Mock::default();
    let conn = mock.connection();
    let bc = NaiveDate::from_ymd_opt(-44, 3, 15)
        .and_then(|d| d.and_hms_milli_opt(12, 0, 0, 5))
        .unwrap()
        .and_utc();

    conn.exec_params(
        "SELECT $1, $2, $3, $4, $5",
        &[
            Value::Null,
            Value::Bytes(vec![0xde, 0xad]),
            Value::from(vec![Some("a b"), None, Some("")]),
            Timestamp::At(bc).into(),
            Timestamp::Infinity.into(),
        ],
    )
    .unwrap()
    .await
    .unwrap();

    assert_eq!(
        mock.log()[1],
        concat!(
            r#"start SELECT $1, $2, $3, $4, $5 "#,
            r#"[NULL, \xdead, {"a b",NULL,""}, 0045-03-15T12:00:00.005 BC, infinity]"#,
        )
    );
}

#[tokio::test(start_paused = true)]
async fn registry_changes_apply_to_later_results() {
    let mock = Mock::default();
    mock.result(
        "SELECT dates",
        rows(
            &[("d", oid::DATE), ("ds", oid::DATE_ARRAY), ("n", oid::INT4)],
            &[&[Some("1970-01-01"), Some("{2000-01-01,NULL,0001-01-01 BC}"), Some("7")]],
        ),
    );
    let registry = ParserRegistry::new();
    let conn = mock.connection_with(ConnectionOptions {
        registry: registry.clone(),
        ..Default::default()
    });

    let result = conn.exec("SELECT dates").unwrap().await.unwrap();
    let row = &result.rows()[0];
    assert_eq!(
        row.get("d"),
        Some(&Value::Timestamp(Timestamp::At(Utc.timestamp_opt(0, 0).unwrap())))
    );
    let ds = row.get("ds").and_then(Value::as_array).unwrap();
    assert_eq!(ds.len(), 3);
    assert!(ds[1].is_null());
    let bc = ds[2].as_timestamp().and_then(Timestamp::instant).unwrap();
    assert_eq!(chrono::Datelike::year(bc), 0);

    // dates become plain text again; integers are untouched
    let previous = registry.unregister(oid::DATE);
    assert!(previous.is_some());
    registry.register(oid::INT4, |v| Ok(Value::from(v.as_i64().unwrap_or(0) * 10)));
    let result = conn.exec("SELECT dates").unwrap().await.unwrap();
    let row = &result.rows()[0];
    assert_eq!(row.get("d").and_then(Value::as_str), Some("1970-01-01"));
    assert!(row.get("ds").and_then(Value::as_array).is_some());
    assert_eq!(row.get("n"), Some(&Value::Int(70)));

    if let Some(parser) = previous {
        registry.register_parser(oid::DATE, parser);
    }
    let result = conn.exec("SELECT dates").unwrap().await.unwrap();
    assert!(result.rows()[0].get("d").and_then(Value::as_timestamp).is_some());
}

#[test]
fn array_literals_survive_the_server_grammar() {
    let value = Value::from(vec![
        Value::from(vec![Value::from(1), Value::from(-2)]),
        Value::from(vec![Value::from("{x}"), Value::from("a,b")]),
        Value::from(vec![Value::from("say \"hi\""), Value::from("back\\slash")]),
        Value::from(vec![Value::Null, Value::from("NULL")]),
    ]);
    let literal = codec::sql_array(&value).unwrap();
    assert_eq!(
        literal,
        r#"{{1,-2},{"{x}","a,b"},{"say \"hi\"","back\\slash"},{NULL,"NULL"}}"#
    );

    let parsed = codec::parse_array(&literal, &|text| Ok(Value::from(text))).unwrap();
    let expected = Value::from(vec![
        Value::from(vec![Value::from("1"), Value::from("-2")]),
        Value::from(vec![Value::from("{x}"), Value::from("a,b")]),
        Value::from(vec![Value::from("say \"hi\""), Value::from("back\\slash")]),
        Value::from(vec![Value::Null, Value::from("NULL")]),
    ]);
    assert_eq!(parsed, expected);
    assert!(codec::sql_array(&Value::from(1)).is_err());
}

#[test]
fn dates_round_trip_at_the_edges() {
    let at = |y, m, d, ms| {
        let date = NaiveDate::from_ymd_opt(y, m, d).unwrap();
        Timestamp::At(date.and_time(NaiveTime::MIN).and_utc() + TimeDelta::milliseconds(ms))
    };
    let cases = [
        Timestamp::At(Utc.timestamp_opt(0, 0).unwrap()),
        at(1, 1, 1, 0),
        at(0, 12, 31, 86_399_999),
        at(-1000, 6, 1, 30_600_000),
        Timestamp::Infinity,
        Timestamp::NegInfinity,
    ];
    for ts in cases {
        let text = codec::encode_timestamp(&ts);
        assert_eq!(codec::parse_timestamp(&text).unwrap(), ts, "{text}");
    }
}

#[test]
fn escape_literal_matches_libpq() {
    assert_eq!(codec::escape_literal("it's"), "'it''s'");
    assert_eq!(codec::escape_literal(r"a\b"), r" E'a\\b'");
}
