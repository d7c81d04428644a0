//! # clickhttp - a ClickHouse HTTP client
//!
//! clickhttp talks to ClickHouse over its HTTP interface. It translates between
//! Rust values and the server's nested column types, pools connections,
//! retries transient failures with backoff, and decodes both complete and
//! incrementally streamed results.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clickhttp::{Client, QuerySettings, StreamOptions};
//! use serde::Serialize;
//! use std::time::Duration;
//!
//! #[derive(Serialize)]
//! struct Visit {
//!     user_id: u64,
//!     url: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), clickhttp::Error> {
//!     let client = Client::builder()
//!         .base_url("http://localhost:8123")?
//!         .database("analytics")
//!         .timeout(Duration::from_secs(30))
//!         .build()?;
//!
//!     client
//!         .insert(
//!             "visits",
//!             &[Visit { user_id: 7, url: "/pricing".to_string() }],
//!             None,
//!         )
//!         .await?;
//!
//!     let result = client
//!         .execute("SELECT user_id, count() AS n FROM visits GROUP BY user_id", &QuerySettings::default())
//!         .await?;
//!     for row in &result {
//!         println!("{:?} -> {:?}", row.get("user_id"), row.get("n"));
//!     }
//!
//!     let mut rows = client
//!         .stream_execute("SELECT * FROM visits", StreamOptions::new())
//!         .await?;
//!     while let Some(row) = rows.next().await? {
//!         println!("{:?}", row);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Type system** - Parses declarations like `Array(Tuple(String, UInt64))` and builds codecs that cast, decode and encode values
//! - **Connection pooling** - Bounded pool with health and staleness checks and bounded-wait checkout
//! - **Retries** - Exponential backoff with selectable jitter; only transient failures are retried
//! - **Streaming** - Newline-delimited JSON decoded chunk by chunk, gzip included, in constant memory
//! - **Rich errors** - Query failures carry the HTTP status, server error code and SQL
//! - **Logging** - Structured logging with `tracing`
//!
//! ## Error Handling
//!
//! ```no_run
//! use clickhttp::{Client, Error, QuerySettings};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().build()?;
//! match client.execute("SELECT * FROM nope", &QuerySettings::default()).await {
//!     Ok(result) => println!("{} rows", result.len()),
//!     Err(Error::Query { code: Some(60), .. }) => eprintln!("table is missing"),
//!     Err(e) if e.is_retryable() => eprintln!("gave up on a transient failure: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Types
//!
//! ```
//! use clickhttp::types::{Codec, CodecKind, TypeRegistry};
//!
//! let mut registry = TypeRegistry::with_defaults();
//! // Treat IPv4 columns as plain strings.
//! registry.register("IPv4", |node, _registry| {
//!     Ok(Codec::new(node.to_string(), CodecKind::String { fixed_length: None }))
//! });
//! assert!(registry.lookup("Array(IPv4)").is_ok());
//! ```

mod client;
pub mod connection;
mod error;
pub mod pool;
mod result;
pub mod retry;
mod settings;
pub mod stream;
pub mod types;
mod value;

pub use client::{Client, ClientBuilder};
pub use error::{Error, Result};
pub use pool::PoolStats;
pub use result::{QueryResult, Statistics};
pub use retry::{Jitter, RetryPolicy, RetryPredicate};
pub use settings::QuerySettings;
pub use stream::{Progress, RowStream, StreamOptions};
pub use value::{Row, Value};
