//! The database client.
//!
//! The [`Client`] type is the main entry point. Use [`ClientBuilder`] to
//! configure and create clients.

use crate::{
    connection::{is_gzip, ConnectionConfig, HttpConnection, HttpResponse},
    error::{looks_like_exception, parse_exception_code},
    pool::{ConnectionPool, PoolStats},
    result::{CompactResponse, QueryResult},
    retry::RetryPolicy,
    settings::QuerySettings,
    stream::{NdjsonDecoder, RowStream, StreamOptions},
    types::TypeRegistry,
    Error, Result,
};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

const EXCEPTION_CODE_HEADER: &str = "x-clickhouse-exception-code";

/// Statements that never modify data and can be retried freely.
const READ_ONLY_KEYWORDS: [&str; 7] = [
    "SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXISTS", "EXPLAIN",
];

/// A client for the database's HTTP interface.
///
/// The client is designed to be reused and cloned; clones share one
/// connection pool, type registry and retry policy.
///
/// # Examples
///
/// ```no_run
/// use clickhttp::{Client, QuerySettings, RetryPolicy};
/// use serde::Serialize;
/// use std::time::Duration;
///
/// #[derive(Serialize)]
/// struct Event {
///     id: u64,
///     kind: String,
/// }
///
/// # async fn example() -> Result<(), clickhttp::Error> {
/// let client = Client::builder()
///     .base_url("http://localhost:8123")?
///     .database("analytics")
///     .pool_size(8)
///     .retry_policy(RetryPolicy::default().max_attempts(5))
///     .build()?;
///
/// client
///     .insert("events", &[Event { id: 1, kind: "click".to_string() }], None)
///     .await?;
///
/// let result = client
///     .execute("SELECT id, kind FROM events", &QuerySettings::default())
///     .await?;
/// for row in &result {
///     println!("{:?} {:?}", row.get("id"), row.get("kind"));
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Arc<ConnectionConfig>,
    pool: ConnectionPool<HttpConnection>,
    registry: Arc<TypeRegistry>,
    retry_policy: RetryPolicy,
    checkout_timeout: Duration,
    settings: BTreeMap<String, String>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.config.base_url.as_str())
            .field("pool", &self.inner.pool)
            .field("retry_policy", &self.inner.retry_policy)
            .finish()
    }
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Runs a statement and returns its decoded result.
    ///
    /// Read-only statements are retried on transient failures under the
    /// client's retry policy; other statements are retried with a warning.
    /// Every attempt carries the same query id.
    ///
    /// DDL and other statements without output return an empty result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] for a non-2xx status or a server exception in
    /// the body, transport and pool errors, and codec errors while decoding.
    pub async fn execute(&self, sql: &str, settings: &QuerySettings) -> Result<QueryResult> {
        let idempotent = is_read_only(sql);
        self.inner
            .retry_policy
            .with_retry(idempotent, settings.query_id.clone(), |query_id, attempt| {
                self.execute_once(sql, settings, query_id, attempt)
            })
            .await
    }

    async fn execute_once(
        &self,
        sql: &str,
        settings: &QuerySettings,
        query_id: String,
        attempt: usize,
    ) -> Result<QueryResult> {
        let mut params = settings.params(&self.inner.settings);
        params.push(("query_id".to_string(), query_id.clone()));
        params.push(("default_format".to_string(), "JSONCompact".to_string()));
        params.push((
            "output_format_json_quote_decimals".to_string(),
            "1".to_string(),
        ));

        let response = self
            .send(sql, &params, Bytes::from(sql.to_string()), attempt)
            .await?;
        let response = check_status(response, sql)?;

        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(QueryResult::empty().with_query_id(query_id));
        }

        let compact: CompactResponse = match serde_json::from_slice(&response.body) {
            Ok(compact) => compact,
            Err(e) => {
                let raw_response = response.text();
                if looks_like_exception(&raw_response) {
                    return Err(exception_error(&raw_response, response.status, sql));
                }
                tracing::error!(
                    error = %e,
                    raw_response = %raw_response,
                    "Failed to deserialize query result"
                );
                return Err(Error::DeserializationFailed {
                    raw_response,
                    serde_error: e.to_string(),
                    status: response.status,
                });
            }
        };

        if let Some(exception) = &compact.exception {
            return Err(exception_error(exception, response.status, sql));
        }

        QueryResult::from_compact(compact, &self.inner.registry, settings.deserialize)
            .map(|result| result.with_query_id(query_id))
    }

    /// Inserts rows into `table` in the `JSONEachRow` format.
    ///
    /// Each row is serialized as one JSON object; with `columns` given, only
    /// those columns are named in the statement. An empty `rows` slice
    /// returns `true` without contacting the server.
    ///
    /// Inserts are not idempotent: a retried insert may be applied twice
    /// unless the table deduplicates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for empty identifiers,
    /// [`Error::SerializationFailed`] if a row cannot be serialized, and the
    /// same errors as [`execute`](Self::execute) for the request itself.
    pub async fn insert<T: Serialize>(
        &self,
        table: &str,
        rows: &[T],
        columns: Option<&[&str]>,
    ) -> Result<bool> {
        if rows.is_empty() {
            return Ok(true);
        }

        let mut sql = format!("INSERT INTO {}", quote_table(table)?);
        if let Some(columns) = columns {
            let quoted = columns
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&format!(" ({})", quoted.join(", ")));
        }
        sql.push_str(" FORMAT JSONEachRow");

        let mut body = Vec::with_capacity(rows.len() * 64);
        for row in rows {
            serde_json::to_writer(&mut body, row)
                .map_err(|e| Error::SerializationFailed(e.to_string()))?;
            body.push(b'\n');
        }
        let body = Bytes::from(body);

        let base_params = QuerySettings::default().params(&self.inner.settings);
        tracing::debug!(table = table, rows = rows.len(), bytes = body.len(), "Inserting rows");

        self.inner
            .retry_policy
            .with_retry(false, None, |query_id, attempt| {
                let body = body.clone();
                let sql = sql.as_str();
                let mut params = base_params.clone();
                params.push(("query".to_string(), sql.to_string()));
                params.push(("query_id".to_string(), query_id));
                async move {
                    let response = self.send(sql, &params, body, attempt).await?;
                    check_status(response, sql)?;
                    Ok(true)
                }
            })
            .await
    }

    /// Runs a query and streams its rows as they arrive.
    ///
    /// The stream uses its own connection outside the pool, so abandoning it
    /// early never returns a half-read connection to the pool. Opening the
    /// stream is retried like [`execute`](Self::execute); failures after the
    /// first row are not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] if the server rejects the query, and transport
    /// errors from opening the connection.
    pub async fn stream_execute(&self, sql: &str, options: StreamOptions) -> Result<RowStream> {
        let StreamOptions { settings, progress } = options;
        let format = if progress.is_some() {
            "JSONEachRowWithProgress"
        } else {
            "JSONEachRow"
        };
        let base_params = settings.params(&self.inner.settings);

        let (conn, response) = self
            .inner
            .retry_policy
            .with_retry(is_read_only(sql), settings.query_id.clone(), |query_id, attempt| {
                let mut params = base_params.clone();
                params.push(("query_id".to_string(), query_id));
                params.push(("default_format".to_string(), format.to_string()));
                params.push((
                    "output_format_json_quote_decimals".to_string(),
                    "1".to_string(),
                ));
                self.open_stream(sql, params, attempt)
            })
            .await?;

        let mut decoder = NdjsonDecoder::new(sql);
        if is_gzip(response.headers()) {
            decoder = decoder.compressed();
        }
        if progress.is_some() {
            decoder = decoder.with_progress();
        }

        Ok(RowStream::new(conn, response, decoder, progress))
    }

    async fn open_stream(
        &self,
        sql: &str,
        params: Vec<(String, String)>,
        attempt: usize,
    ) -> Result<(HttpConnection, reqwest::Response)> {
        let mut conn = HttpConnection::open(Arc::clone(&self.inner.config))?;
        tracing::debug!(attempt = attempt, sql = sql, "Opening result stream");

        let response = conn
            .post_streaming("/", &params, sql.to_string(), &HeaderMap::new())
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok((conn, response));
        }

        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| conn.transport_error(e))?;
        let body = if is_gzip(&headers) {
            crate::connection::gunzip(&body)?
        } else {
            body
        };
        Err(status_error(
            &HttpResponse {
                status,
                headers,
                body,
            },
            sql,
        ))
    }

    /// Checks out a pooled connection, sends one statement and checks the
    /// connection back in.
    async fn send(
        &self,
        sql: &str,
        params: &[(String, String)],
        body: Bytes,
        attempt: usize,
    ) -> Result<HttpResponse> {
        let start_time = Instant::now();
        let mut conn = self.inner.pool.checkout(self.inner.checkout_timeout).await?;

        tracing::debug!(attempt = attempt, sql = sql, "Executing query");
        let result = conn.post("/", params, body, &HeaderMap::new()).await;
        self.inner.pool.checkin(Some(conn));
        let response = result?;

        tracing::info!(
            status = response.status.as_u16(),
            latency_ms = start_time.elapsed().as_millis(),
            attempt = attempt,
            "Received query response"
        );
        Ok(response)
    }

    /// Returns `true` if the server answers a ping.
    pub async fn ping(&self) -> bool {
        let result = self
            .inner
            .pool
            .with_connection(self.inner.checkout_timeout, |conn| {
                Box::pin(async move { Ok(conn.ping().await) })
            })
            .await;

        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ping could not acquire a connection");
            false
        })
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Closes pooled connections idle for longer than `max_idle`, returning
    /// how many were closed.
    pub fn cleanup_idle(&self, max_idle: Duration) -> usize {
        self.inner.pool.cleanup(max_idle)
    }

    /// Closes the connection pool. Queries issued afterwards fail with
    /// [`Error::PoolClosed`]; open row streams are unaffected.
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }

    /// The type registry used to decode results.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.inner.registry
    }
}

/// Passes 2xx responses through and turns anything else into a query error.
fn check_status(response: HttpResponse, sql: &str) -> Result<HttpResponse> {
    if response.status.is_success() {
        Ok(response)
    } else {
        Err(status_error(&response, sql))
    }
}

fn status_error(response: &HttpResponse, sql: &str) -> Error {
    let status = response.status;
    let message = response.text().trim().to_string();
    if status.is_client_error() {
        tracing::error!(status = status.as_u16(), response = %message, "Query rejected (4xx)");
    } else {
        tracing::warn!(status = status.as_u16(), response = %message, "Server error");
    }

    let code = response
        .headers
        .get(EXCEPTION_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| parse_exception_code(&message));

    Error::Query {
        message,
        code,
        status: Some(status),
        sql: sql.to_string(),
    }
}

/// A server exception reported inside an otherwise successful response.
fn exception_error(text: &str, status: StatusCode, sql: &str) -> Error {
    // The exception is appended after whatever output was already written.
    let message = match text.find("Code: ") {
        Some(start) => &text[start..],
        None => text,
    };
    tracing::error!(status = status.as_u16(), exception = %message.trim(), "Query failed mid-response");
    Error::Query {
        message: message.trim().to_string(),
        code: parse_exception_code(message),
        status: Some(status),
        sql: sql.to_string(),
    }
}

/// Returns `true` if `sql` starts with a keyword of a read-only statement.
pub(crate) fn is_read_only(sql: &str) -> bool {
    let mut rest = sql;
    loop {
        rest = rest.trim_start().trim_start_matches('(').trim_start();
        if let Some(comment) = rest.strip_prefix("--") {
            rest = comment.split_once('\n').map_or("", |(_, after)| after);
        } else if let Some(comment) = rest.strip_prefix("/*") {
            rest = comment.split_once("*/").map_or("", |(_, after)| after);
        } else {
            break;
        }
    }

    let keyword: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    READ_ONLY_KEYWORDS.contains(&keyword.as_str())
}

fn quote_identifier(name: &str) -> Result<String> {
    if name.trim().is_empty() {
        return Err(Error::InvalidArgument("identifier must not be empty".to_string()));
    }
    Ok(format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`")))
}

/// Quotes `table` or `database.table`.
fn quote_table(table: &str) -> Result<String> {
    match table.split_once('.') {
        Some((database, name)) => Ok(format!(
            "{}.{}",
            quote_identifier(database)?,
            quote_identifier(name)?
        )),
        None => quote_identifier(table),
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use clickhttp::{ClientBuilder, Jitter, RetryPolicy};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), clickhttp::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://clickhouse.internal:8443")?
///     .username("reader")
///     .password("secret")
///     .timeout(Duration::from_secs(30))
///     .compression(true)
///     .setting("max_execution_time", 60)
///     .retry_policy(
///         RetryPolicy::default()
///             .initial_backoff(Duration::from_millis(200))
///             .jitter(Jitter::Full),
///     )
///     .default_header("User-Agent", "my-app/1.0")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    username: Option<String>,
    password: Option<String>,
    database: Option<String>,
    default_headers: HeaderMap,
    settings: BTreeMap<String, String>,
    timeout: Duration,
    connect_timeout: Duration,
    pool_size: usize,
    checkout_timeout: Duration,
    idle_timeout: Duration,
    max_lifetime: Option<Duration>,
    compression: bool,
    retry_policy: RetryPolicy,
    registry: Option<Arc<TypeRegistry>>,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            username: None,
            password: None,
            database: None,
            default_headers: HeaderMap::new(),
            settings: BTreeMap::new(),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            pool_size: 5,
            checkout_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: None,
            compression: false,
            retry_policy: RetryPolicy::default(),
            registry: None,
        }
    }

    /// Sets the server URL. Defaults to `http://localhost:8123`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the default database for every query.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Adds a default header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Adds a server setting applied to every query. Per-query settings
    /// override it.
    pub fn setting(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.settings.insert(name.into(), value.to_string());
        self
    }

    /// Sets the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the maximum number of pooled connections.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Sets how long a query waits for a pooled connection.
    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    /// Sets how long a connection may sit idle before it is considered stale.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the age after which connections are replaced.
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Requests gzip-compressed responses.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Sets the retry policy for failed queries.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Uses a shared type registry, for example one with custom codecs.
    pub fn registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] for a non-HTTP URL, a zero pool
    /// size or timeout, or an invalid retry policy.
    pub fn build(self) -> Result<Client> {
        let base_url = match self.base_url {
            Some(url) => url,
            None => Url::parse("http://localhost:8123")?,
        };
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::ConfigurationError(format!(
                "Unsupported URL scheme: {}",
                base_url.scheme()
            )));
        }
        if self.pool_size == 0 {
            return Err(Error::ConfigurationError(
                "pool_size must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("timeout", self.timeout),
            ("connect_timeout", self.connect_timeout),
            ("checkout_timeout", self.checkout_timeout),
            ("idle_timeout", self.idle_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::ConfigurationError(format!("{} must be non-zero", name)));
            }
        }
        self.retry_policy.validate()?;

        let config = Arc::new(ConnectionConfig {
            base_url,
            username: self.username,
            password: self.password,
            database: self.database,
            connect_timeout: self.connect_timeout,
            request_timeout: self.timeout,
            idle_timeout: self.idle_timeout,
            max_lifetime: self.max_lifetime,
            compression: self.compression,
            default_headers: self.default_headers,
        });

        // Surface bad credentials now rather than on the first query.
        HttpConnection::open(Arc::clone(&config))?;

        let factory_config = Arc::clone(&config);
        let pool = ConnectionPool::new(self.pool_size, move || {
            let config = Arc::clone(&factory_config);
            Box::pin(async move { HttpConnection::open(config) })
        })?;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(TypeRegistry::with_defaults()));

        tracing::debug!(
            base_url = %config.base_url,
            pool_size = self.pool_size,
            "Built client"
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                pool,
                registry,
                retry_policy: self.retry_policy,
                checkout_timeout: self.checkout_timeout,
                settings: self.settings,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
