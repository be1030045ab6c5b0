//! Ordering and lifecycle of queued operations.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Mock, server_error};
use zero_pq::{ConnectionOptions, Error, ErrorField, ErrorObserver, QueryResult};

#[tokio::test(start_paused = true)]
async fn completions_follow_submission_order() {
    let mock = Mock::default();
    mock.delay("SELECT slow", Duration::from_millis(50))
        .delay("SELECT medium", Duration::from_millis(20))
        .delay("SELECT fast", Duration::from_millis(1));
    let conn = mock.connection();

    let finished = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for command in ["SELECT slow", "SELECT fast", "SELECT medium", "SELECT fast"] {
        let finished = Arc::clone(&finished);
        let request = conn.exec(command).unwrap();
        handles.push(request.on_complete(move |result| {
            assert!(result.is_ok());
            finished.lock().unwrap().push(command);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(
        *finished.lock().unwrap(),
        ["SELECT slow", "SELECT fast", "SELECT medium", "SELECT fast"]
    );
    // never two commands in flight
    let log = mock.log();
    assert_eq!(
        log,
        [
            "connect",
            "start SELECT slow",
            "end SELECT slow",
            "start SELECT fast",
            "end SELECT fast",
            "start SELECT medium",
            "end SELECT medium",
            "start SELECT fast",
            "end SELECT fast",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn operations_run_without_being_awaited() {
    let mock = Mock::default();
    let conn = mock.connection();

    drop(conn.exec("SET a = 1").unwrap());
    drop(conn.exec("SET b = 2").unwrap());
    conn.exec("SELECT 1").unwrap().await.unwrap();

    assert_eq!(
        mock.log(),
        [
            "connect",
            "start SET a = 1",
            "end SET a = 1",
            "start SET b = 2",
            "end SET b = 2",
            "start SELECT 1",
            "end SELECT 1",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn work_submitted_while_connecting_waits_for_connect() {
    let mock = Mock::default();
    mock.connect_delay(Duration::from_millis(30));
    let conn = mock.connection();
    assert!(!conn.is_ready());

    let request = conn.exec("SELECT 1").unwrap();
    assert_eq!(request.await.unwrap(), QueryResult::Empty);
    assert!(conn.is_ready());
    assert_eq!(mock.log()[0], "connect");
}

#[tokio::test(start_paused = true)]
async fn failure_does_not_skip_later_operations() {
    let mock = Mock::default();
    mock.fail("SELECT broken", "42P01", "relation \"nope\" does not exist");
    let conn = mock.connection();

    let broken = conn.exec("SELECT broken").unwrap();
    let inserted = conn.exec("INSERT INTO t VALUES (1)").unwrap();

    let err = broken.await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("42P01"));
    assert_eq!(inserted.await.unwrap().rows_affected(), Some(1));
    assert!(!conn.is_closed());
}

#[tokio::test(start_paused = true)]
async fn error_fields_describe_the_latest_result() {
    let mock = Mock::default();
    mock.fail("SELECT broken", "42P01", "relation \"nope\" does not exist");
    let conn = mock.connection();

    conn.exec("SELECT broken").unwrap().await.unwrap_err();
    assert_eq!(conn.result_error_field(ErrorField::SqlState).as_deref(), Some("42P01"));
    let message_field = "MESSAGE_PRIMARY".parse::<ErrorField>().unwrap();
    assert_eq!(
        conn.result_error_field(message_field).as_deref(),
        Some("relation \"nope\" does not exist")
    );

    conn.exec("SELECT 1").unwrap().await.unwrap();
    assert_eq!(conn.result_error_field(ErrorField::SqlState), None);
    assert!(conn.last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn finish_fails_every_queued_operation() {
    let mock = Mock::default();
    mock.delay("SELECT pg_sleep(1)", Duration::from_secs(1));
    let conn = mock.connection();
    conn.ready().await.unwrap();

    let running = conn.exec("SELECT pg_sleep(1)").unwrap();
    let queued: Vec<_> = (0..3).map(|i| conn.exec(format!("SELECT {i}")).unwrap()).collect();
    tokio::task::yield_now().await;

    conn.finish();
    assert!(conn.is_closed());
    assert!(!conn.is_ready());

    assert!(matches!(running.await, Err(Error::Closed)));
    for request in queued {
        let err = request.await.unwrap_err();
        assert!(matches!(err, Error::Closed));
        assert_eq!(err.sqlstate(), Some("08003"));
    }

    // rejected synchronously from now on
    assert!(matches!(conn.exec("SELECT 1"), Err(Error::Closed)));
    assert!(matches!(conn.prepare("s", "SELECT 1"), Err(Error::Closed)));
    conn.finish();

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(mock.log().last().map(String::as_str), Some("close"));
}

#[tokio::test(start_paused = true)]
async fn connect_failure_is_reported_and_closes() {
    let mock = Mock::default();
    mock.refuse_connect(Error::Server(server_error("28P01", "password authentication failed")));

    let conn = mock.connection();
    let queued = conn.exec("SELECT 1").unwrap();
    let err = conn.ready().await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("28P01"));
    assert!(matches!(queued.await, Err(Error::Closed)));
    assert!(conn.is_closed());
    assert!(conn.exec("SELECT 1").is_err());
}

#[tokio::test(start_paused = true)]
async fn callback_panic_goes_to_observer() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let observer: Arc<dyn ErrorObserver> = Arc::new(move |e: &Error| {
        sink.lock().unwrap().push(e.to_string());
    });
    let mock = Mock::default();
    let conn = mock.connection_with(ConnectionOptions {
        observer,
        ..Default::default()
    });

    conn.exec("SELECT 1")
        .unwrap()
        .on_complete(|_| panic!("callback exploded"))
        .await
        .unwrap();
    // the queue keeps going
    assert!(conn.exec("SELECT 2").unwrap().await.is_ok());
    assert_eq!(*seen.lock().unwrap(), ["callback panicked: callback exploded"]);
}

#[tokio::test(start_paused = true)]
async fn prepared_statements_go_through_the_queue() {
    let mock = Mock::default();
    let conn = mock.connection();

    let prepared = conn.prepare("ins", "INSERT INTO t VALUES ($1, $2)").unwrap();
    let executed = conn
        .exec_prepared("ins", &[1.into(), zero_pq::Value::Null])
        .unwrap();
    prepared.await.unwrap();
    executed.await.unwrap();

    assert_eq!(
        mock.log()[1..],
        ["prepare ins INSERT INTO t VALUES ($1, $2)", "execute ins [1, NULL]"]
    );
}

#[tokio::test(start_paused = true)]
async fn clones_share_one_queue() {
    let mock = Mock::default();
    mock.delay("SELECT a", Duration::from_millis(10));
    let conn = mock.connection();
    let other = conn.clone();

    let a = conn.exec("SELECT a").unwrap();
    let b = other.exec("SELECT b").unwrap();
    let (a, b) = tokio::join!(a, b);
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(
        mock.log()[1..],
        ["start SELECT a", "end SELECT a", "start SELECT b", "end SELECT b"]
    );

    other.finish();
    assert!(conn.is_closed());
}
