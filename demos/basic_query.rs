//! Basic example: insert rows, query them back and stream a large result.
//!
//! Expects a server on `http://localhost:8123` (override with `CLICKHOUSE_URL`).
//!
//! Run with: `cargo run --example basic_query`

use clickhttp::{Client, Error, QuerySettings, StreamOptions};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct PageView {
    user_id: u64,
    url: String,
    duration_ms: u32,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter("clickhttp=debug,basic_query=info")
        .init();

    let url = std::env::var("CLICKHOUSE_URL").unwrap_or_else(|_| "http://localhost:8123".into());
    let client = Client::builder()
        .base_url(url)?
        .timeout(Duration::from_secs(30))
        .compression(true)
        .build()?;

    if !client.ping().await {
        eprintln!("Server is not reachable");
        return Ok(());
    }

    println!("=== Create and insert ===");
    client
        .execute(
            "CREATE TABLE IF NOT EXISTS page_views (user_id UInt64, url String, duration_ms UInt32) ENGINE = Memory",
            &QuerySettings::default(),
        )
        .await?;

    let views = vec![
        PageView {
            user_id: 1,
            url: "/".to_string(),
            duration_ms: 320,
        },
        PageView {
            user_id: 1,
            url: "/pricing".to_string(),
            duration_ms: 1450,
        },
        PageView {
            user_id: 2,
            url: "/docs".to_string(),
            duration_ms: 8800,
        },
    ];
    client.insert("page_views", &views, None).await?;

    println!("=== Batch query ===");
    let result = client
        .execute(
            "SELECT user_id, groupArray(url) AS urls, avg(duration_ms) AS avg_ms FROM page_views GROUP BY user_id ORDER BY user_id",
            &QuerySettings::default(),
        )
        .await?;
    for row in &result {
        println!("{:?}", row);
    }
    if let Some(stats) = result.statistics() {
        println!("Read {} rows in {:.4}s", stats.rows_read, stats.elapsed);
    }

    println!("=== Streaming ===");
    let options = StreamOptions::new().on_progress(|progress| {
        println!("progress: {}/{} rows", progress.read_rows, progress.total_rows_to_read);
    });
    let mut rows = client
        .stream_execute("SELECT number, toString(number) AS s FROM numbers(250000)", options)
        .await?;
    let mut total = 0;
    loop {
        let batch = rows.next_batch(50_000).await?;
        if batch.is_empty() {
            break;
        }
        total += batch.len();
    }
    println!("Streamed {} rows", total);

    println!("=== Pool ===");
    println!("{:?}", client.pool_stats());
    client.shutdown();

    Ok(())
}
