//! Integration tests using wiremock to simulate a database server.

use clickhttp::retry::RetryPredicate;
use clickhttp::{Client, Error, Jitter, QuerySettings, RetryPolicy, StreamOptions, Value};
use flate2::{write::GzEncoder, Compression};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_string, header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn fast_retries(max_attempts: usize) -> RetryPolicy {
    RetryPolicy::default()
        .max_attempts(max_attempts)
        .initial_backoff(Duration::from_millis(5))
        .max_backoff(Duration::from_millis(20))
        .jitter(Jitter::None)
}

fn client_for(server: &MockServer) -> Client {
    Client::builder()
        .base_url(server.uri())
        .unwrap()
        .retry_policy(fast_retries(3))
        .build()
        .unwrap()
}

fn query_id_of(request: &Request) -> String {
    request
        .url
        .query_pairs()
        .find(|(k, _)| k == "query_id")
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn test_execute_decodes_compact_result() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(query_param("default_format", "JSONCompact"))
        .and(header("x-clickhouse-user", "reader"))
        .and(header("x-clickhouse-database", "analytics"))
        .and(body_string("SELECT id, name, tags, price FROM items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": [
                {"name": "id", "type": "UInt64"},
                {"name": "name", "type": "LowCardinality(String)"},
                {"name": "tags", "type": "Array(Nullable(String))"},
                {"name": "price", "type": "Decimal(10, 2)"}
            ],
            "data": [
                ["18446744073709551615", "widget", ["a", null], "12.50"],
                ["2", "gadget", [], "0.99"]
            ],
            "rows": 2,
            "statistics": {"elapsed": 0.0012, "rows_read": 2, "bytes_read": 64}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .username("reader")
        .database("analytics")
        .build()
        .unwrap();

    let result = client
        .execute(
            "SELECT id, name, tags, price FROM items",
            &QuerySettings::new().query_id("items-1"),
        )
        .await
        .unwrap();

    assert_eq!(result.columns(), ["id", "name", "tags", "price"]);
    assert_eq!(result.len(), 2);
    assert_eq!(result.query_id(), Some("items-1"));
    assert_eq!(result.statistics().unwrap().rows_read, 2);

    let first = result.first().unwrap();
    assert_eq!(first.get("id"), Some(&Value::UInt(u64::MAX as u128)));
    assert_eq!(first.get("name"), Some(&Value::from("widget")));
    assert_eq!(
        first.get("tags"),
        Some(&Value::Array(vec![Value::from("a"), Value::Null]))
    );
    assert_eq!(
        result.get(-1).unwrap().get("price").map(|v| v.to_string()),
        Some("0.99".to_string())
    );
}

#[tokio::test]
async fn test_execute_keeps_wide_decimals_and_named_tuples() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(query_param("output_format_json_quote_decimals", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"meta":[{"name":"d","type":"Decimal(18, 4)"},{"name":"t","type":"Tuple(a String, b UInt8)"}],
                "data":[[12345678901234.5678,{"a":"x","b":1}]],"rows":1}"#,
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let result = client
        .execute("SELECT d, t FROM ledger", &QuerySettings::default())
        .await
        .unwrap();

    let row = result.first().unwrap();
    assert_eq!(
        row.get("d"),
        Some(&Value::Decimal("12345678901234.5678".parse().unwrap()))
    );
    assert_eq!(
        row.get("t"),
        Some(&Value::Tuple(vec![Value::from("x"), Value::UInt(1)]))
    );
}

#[tokio::test]
async fn test_query_error_is_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(404)
                .insert_header("X-ClickHouse-Exception-Code", "60")
                .set_body_string(
                    "Code: 60. DB::Exception: Table default.missing does not exist. (UNKNOWN_TABLE)",
                ),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let result = client
        .execute("SELECT * FROM missing", &QuerySettings::default())
        .await;

    match result {
        Err(Error::Query {
            code,
            status,
            sql,
            message,
        }) => {
            assert_eq!(code, Some(60));
            assert_eq!(status.map(|s| s.as_u16()), Some(404));
            assert_eq!(sql, "SELECT * FROM missing");
            assert!(message.contains("UNKNOWN_TABLE"));
        }
        _ => panic!("Expected Query error, got {:?}", result),
    }
}

#[tokio::test]
async fn test_syntax_error_code_from_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "Code: 62. DB::Exception: Syntax error: failed at position 1 ('SELEC'). (SYNTAX_ERROR)",
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let err = client_for(&mock_server)
        .execute("SELEC 1", &QuerySettings::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(62));
    assert_eq!(err.status().map(|s| s.as_u16()), Some(400));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_retry_on_5xx_reuses_query_id() {
    let mock_server = MockServer::start().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();

    // First two requests fail with 503, third succeeds
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(move |req: &Request| {
            let mut seen = seen_clone.lock().unwrap();
            seen.push(query_id_of(req));
            if seen.len() < 3 {
                ResponseTemplate::new(503).set_body_string("Code: 202. DB::Exception: Too many simultaneous queries")
            } else {
                ResponseTemplate::new(200).set_body_json(json!({
                    "meta": [{"name": "x", "type": "UInt8"}],
                    "data": [[1]]
                }))
            }
        })
        .mount(&mock_server)
        .await;

    let result = client_for(&mock_server)
        .execute("SELECT 1 AS x", &QuerySettings::default())
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(!seen[0].is_empty());
    assert!(seen.iter().all(|id| id == &seen[0]));
    assert_eq!(result.query_id(), Some(seen[0].as_str()));
    assert_eq!(result.first().unwrap().get("x"), Some(&Value::UInt(1)));
}

#[tokio::test]
async fn test_retry_on_429() {
    let mock_server = MockServer::start().await;
    let attempt_count = Arc::new(AtomicUsize::new(0));
    let attempt_count_clone = attempt_count.clone();

    Mock::given(method("POST"))
        .respond_with(move |_req: &Request| {
            if attempt_count_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(429).set_body_string("Too many requests")
            } else {
                ResponseTemplate::new(200).set_body_string("")
            }
        })
        .mount(&mock_server)
        .await;

    let result = client_for(&mock_server)
        .execute("SELECT 1", &QuerySettings::default())
        .await
        .unwrap();

    assert!(result.is_empty());
    assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_exhausted_retries_return_last_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(500)
                .insert_header("X-ClickHouse-Exception-Code", "241")
                .set_body_string("Code: 241. DB::Exception: Memory limit (total) exceeded"),
        )
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .retry_policy(fast_retries(2))
        .build()
        .unwrap();

    let err = client
        .execute("SELECT count() FROM big", &QuerySettings::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(241));
    assert_eq!(err.status().map(|s| s.as_u16()), Some(500));
    assert_eq!(err.sql(), Some("SELECT count() FROM big"));
}

#[tokio::test]
async fn test_custom_retry_predicate() {
    let mock_server = MockServer::start().await;

    // Only retries on 503
    struct RetryOn503;
    impl RetryPredicate for RetryOn503 {
        fn should_retry(&self, error: &Error, _attempt: usize) -> bool {
            matches!(error.status(), Some(status) if status.as_u16() == 503)
        }
    }

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal error"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .retry_policy(fast_retries(5).predicate(RetryOn503))
        .build()
        .unwrap();

    let result = client.execute("SELECT 1", &QuerySettings::default()).await;
    assert!(matches!(result, Err(Error::Query { .. })));
}

#[tokio::test]
async fn test_exception_inside_successful_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"meta\": [{\"name\": \"x\", \"type\": \"UInt8\"}], \"data\": [[0],\nCode: 395. DB::Exception: Value passed to 'throwIf' function is non-zero",
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let err = client_for(&mock_server)
        .execute("SELECT throwIf(number = 1) FROM numbers(2)", &QuerySettings::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(395));
}

#[tokio::test]
async fn test_undecodable_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("1\tfoo\n"))
        .mount(&mock_server)
        .await;

    let result = client_for(&mock_server)
        .execute("SELECT 1, 'foo' FORMAT TSV", &QuerySettings::default())
        .await;

    match result {
        Err(Error::DeserializationFailed {
            raw_response,
            status,
            ..
        }) => {
            assert_eq!(status.as_u16(), 200);
            assert_eq!(raw_response, "1\tfoo\n");
        }
        _ => panic!("Expected DeserializationFailed, got {:?}", result),
    }
}

#[tokio::test]
async fn test_settings_sent_as_params() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(query_param("max_threads", "2"))
        .and(query_param("readonly", "1"))
        .and(query_param("database", "logs"))
        .and(query_param("query_id", "fixed"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .setting("max_threads", 8)
        .setting("readonly", 1)
        .build()
        .unwrap();

    let settings = QuerySettings::new()
        .setting("max_threads", 2)
        .database("logs")
        .query_id("fixed");
    let result = client.execute("SELECT 1", &settings).await.unwrap();
    assert!(result.is_empty());
}

#[derive(Serialize)]
struct Event {
    id: u64,
    name: String,
}

#[tokio::test]
async fn test_insert_json_each_row() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(query_param(
            "query",
            "INSERT INTO `analytics`.`events` (`id`, `name`) FORMAT JSONEachRow",
        ))
        .and(body_string(
            "{\"id\":1,\"name\":\"open\"}\n{\"id\":2,\"name\":\"it's \\\"quoted\\\"\"}\n",
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let rows = vec![
        Event {
            id: 1,
            name: "open".to_string(),
        },
        Event {
            id: 2,
            name: "it's \"quoted\"".to_string(),
        },
    ];

    let inserted = client_for(&mock_server)
        .insert("analytics.events", &rows, Some(&["id", "name"]))
        .await
        .unwrap();
    assert!(inserted);
}

#[tokio::test]
async fn test_insert_empty_rows_sends_nothing() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let rows: Vec<Event> = Vec::new();
    assert!(client_for(&mock_server)
        .insert("events", &rows, None)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_insert_failure_raises() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "Code: 16. DB::Exception: No such column nope in table default.events. (NO_SUCH_COLUMN_IN_TABLE)",
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    let rows = vec![json!({"nope": 1})];
    let err = client_for(&mock_server)
        .insert("events", &rows, None)
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(16));
    assert_eq!(err.sql(), Some("INSERT INTO `events` FORMAT JSONEachRow"));
}

#[tokio::test]
async fn test_stream_execute_rows() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(query_param("default_format", "JSONEachRow"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("{\"id\":1}\n{\"id\":2}\n{\"id\":3}\n"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let mut rows = client
        .stream_execute("SELECT number AS id FROM numbers(3)", StreamOptions::new())
        .await
        .unwrap();

    let mut ids = Vec::new();
    while let Some(row) = rows.next().await.unwrap() {
        ids.push(row.get("id").and_then(Value::as_i64).unwrap());
    }
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(rows.is_closed());

    // Streaming does not use the pool
    assert_eq!(client.pool_stats().total_checkouts, 0);
}

#[tokio::test]
async fn test_stream_execute_gzip() {
    let mock_server = MockServer::start().await;

    let body = gzip(b"{\"id\":1,\"name\":\"a\"}\n{\"id\":2,\"name\":\"b\"}");
    Mock::given(method("POST"))
        .and(query_param("enable_http_compression", "1"))
        .and(header("accept-encoding", "gzip"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Encoding", "gzip")
                .set_body_bytes(body),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .compression(true)
        .build()
        .unwrap();

    let rows: Vec<_> = client
        .stream_execute("SELECT id, name FROM t", StreamOptions::new())
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;

    let names: Vec<String> = rows
        .into_iter()
        .map(|row| row.unwrap().get("name").unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[tokio::test]
async fn test_execute_gzip_response() {
    let mock_server = MockServer::start().await;

    let body = gzip(
        json!({"meta": [{"name": "n", "type": "UInt64"}], "data": [["42"]]})
            .to_string()
            .as_bytes(),
    );
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Encoding", "gzip")
                .set_body_bytes(body),
        )
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .compression(true)
        .build()
        .unwrap();

    let result = client.execute("SELECT 42 AS n", &QuerySettings::default()).await.unwrap();
    assert_eq!(result.first().unwrap().get("n"), Some(&Value::UInt(42)));
}

#[tokio::test]
async fn test_stream_progress_and_batches() {
    let mock_server = MockServer::start().await;

    let body = concat!(
        "{\"progress\":{\"read_rows\":\"3\",\"read_bytes\":\"24\",\"total_rows_to_read\":\"3\"}}\n",
        "{\"row\":{\"n\":\"0\"}}\n",
        "{\"row\":{\"n\":\"1\"}}\n",
        "{\"row\":{\"n\":\"2\"}}\n",
    );
    Mock::given(method("POST"))
        .and(query_param("default_format", "JSONEachRowWithProgress"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(&mock_server)
        .await;

    let read_rows = Arc::new(AtomicUsize::new(0));
    let read_rows_clone = read_rows.clone();
    let options = StreamOptions::new().on_progress(move |progress| {
        read_rows_clone.store(progress.read_rows as usize, Ordering::SeqCst);
    });

    let mut rows = client_for(&mock_server)
        .stream_execute("SELECT number AS n FROM numbers(3)", options)
        .await
        .unwrap();

    assert_eq!(rows.next_batch(2).await.unwrap().len(), 2);
    assert_eq!(read_rows.load(Ordering::SeqCst), 3);
    let last = rows.next_batch(2).await.unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].get("n"), Some(&Value::from("2")));
    assert!(rows.next_batch(2).await.unwrap().is_empty());
    assert!(matches!(
        rows.next_batch(0).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_stream_mid_stream_exception() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"id\":1}\nCode: 241. DB::Exception: Memory limit (for query) exceeded. (MEMORY_LIMIT_EXCEEDED)\n",
        ))
        .mount(&mock_server)
        .await;

    let mut rows = client_for(&mock_server)
        .stream_execute("SELECT * FROM huge", StreamOptions::new())
        .await
        .unwrap();

    assert!(rows.next().await.unwrap().is_some());
    let err = rows.next().await.unwrap_err();
    assert_eq!(err.code(), Some(241));
    assert_eq!(err.sql(), Some("SELECT * FROM huge"));
    assert!(rows.is_closed());
    assert!(rows.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_stream_rejected_query() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("X-ClickHouse-Exception-Code", "497")
                .set_body_string("Code: 497. DB::Exception: Not enough privileges. (ACCESS_DENIED)"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let err = client_for(&mock_server)
        .stream_execute("SELECT * FROM secrets", StreamOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(497));
    assert_eq!(err.status().map(|s| s.as_u16()), Some(403));
}

#[tokio::test]
async fn test_stream_early_close() {
    let mock_server = MockServer::start().await;

    let body: String = (0..1000).map(|i| format!("{{\"n\":{}}}\n", i)).collect();
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&mock_server)
        .await;

    let mut rows = client_for(&mock_server)
        .stream_execute("SELECT number AS n FROM numbers(1000)", StreamOptions::new())
        .await
        .unwrap();

    assert!(rows.next().await.unwrap().is_some());
    rows.close();
    assert!(rows.is_closed());
    assert!(rows.next().await.unwrap().is_none());
    assert_eq!(rows.rows_yielded(), 1);
}

#[tokio::test]
async fn test_ping() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Ok.\n"))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    assert!(client.ping().await);
    assert_eq!(client.pool_stats().available, 1);

    let unreachable = Client::builder()
        .base_url("http://127.0.0.1:9")
        .unwrap()
        .connect_timeout(Duration::from_millis(200))
        .retry_policy(RetryPolicy::none())
        .build()
        .unwrap();
    assert!(!unreachable.ping().await);
    // A failed connection is not returned to the pool
    assert_eq!(unreachable.pool_stats().available, 0);
}

#[tokio::test]
async fn test_pool_stats_and_reuse() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .pool_size(3)
        .build()
        .unwrap();

    for _ in 0..4 {
        client
            .execute("CREATE TABLE IF NOT EXISTS t (x UInt8) ENGINE = Memory", &QuerySettings::default())
            .await
            .unwrap();
    }

    let stats = client.pool_stats();
    assert_eq!(stats.capacity, 3);
    assert_eq!(stats.total_created, 1);
    assert_eq!(stats.total_checkouts, 4);
    assert_eq!(stats.available, 1);
    assert_eq!(stats.in_use, 0);

    assert_eq!(client.cleanup_idle(Duration::from_secs(60)), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.cleanup_idle(Duration::from_millis(1)), 1);
    assert_eq!(client.pool_stats().available, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_queries_share_bounded_pool() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(20))
                .set_body_json(json!({"meta": [{"name": "x", "type": "UInt8"}], "data": [[1]]})),
        )
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .pool_size(2)
        .checkout_timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..7 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.execute("SELECT 1 AS x", &QuerySettings::default()).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().len(), 1);
    }

    let stats = client.pool_stats();
    assert!(stats.total_created <= 2);
    assert_eq!(stats.total_checkouts, 7);
    assert!(stats.available + stats.in_use <= 2);
}

#[tokio::test]
async fn test_pool_timeout() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .pool_size(1)
        .checkout_timeout(Duration::from_millis(50))
        .retry_policy(RetryPolicy::none())
        .build()
        .unwrap();

    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.execute("SELECT sleep(0.3)", &QuerySettings::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = client
        .execute("SELECT 1", &QuerySettings::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PoolTimeout { capacity: 1, .. }));
    assert!(err.is_retryable());
    assert!(slow.await.unwrap().is_ok());
    assert_eq!(client.pool_stats().total_timeouts, 1);
}

#[tokio::test]
async fn test_shutdown_rejects_queries() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    client.execute("SELECT 1", &QuerySettings::default()).await.unwrap();
    client.shutdown();

    assert_eq!(client.pool_stats().available, 0);
    let result = client.execute("SELECT 1", &QuerySettings::default()).await;
    assert!(matches!(result, Err(Error::PoolClosed)));
}

#[tokio::test]
async fn test_shared_registry() {
    let mut registry = clickhttp::types::TypeRegistry::with_defaults();
    registry.register("IPv4", |node, _| {
        Ok(clickhttp::types::Codec::new(
            node.to_string(),
            clickhttp::types::CodecKind::String { fixed_length: None },
        ))
    });
    let registry = Arc::new(registry);

    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": [{"name": "ip", "type": "IPv4"}, {"name": "v", "type": "IPv6"}],
            "data": [["10.0.0.1", "::1"]]
        })))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .registry(registry.clone())
        .build()
        .unwrap();

    let result = client
        .execute("SELECT ip, v FROM hosts", &QuerySettings::default())
        .await
        .unwrap();
    let row = result.first().unwrap();
    assert_eq!(row.get("ip"), Some(&Value::from("10.0.0.1")));
    assert_eq!(row.get("v"), Some(&Value::from("::1")));
    assert!(Arc::ptr_eq(client.registry(), &registry));
}
