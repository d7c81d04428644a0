//! A single HTTP session against the database server.
//!
//! [`HttpConnection`] is what the pool hands out. Each one owns its own
//! `reqwest::Client` restricted to a single idle socket, so a checked-out
//! connection maps onto one keep-alive session.

use crate::{Error, Result};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// The lifecycle surface the pool needs from a connection.
pub trait Connection: Send + 'static {
    /// Returns `false` once a transport failure has been observed or the
    /// connection was disconnected.
    fn is_healthy(&self) -> bool;

    /// Returns `true` if the connection sat idle too long or outlived its
    /// maximum lifetime.
    fn is_stale(&self) -> bool;

    /// When the connection was last used.
    fn last_used(&self) -> Instant;

    /// Marks the connection as used now.
    fn touch(&mut self);

    /// Closes the connection. Later requests on it fail.
    fn disconnect(&mut self) -> Result<()>;
}

/// Settings shared by every connection a client opens.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub base_url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Idle time after which a connection is considered stale.
    pub idle_timeout: Duration,
    /// Age after which a connection is considered stale regardless of use.
    pub max_lifetime: Option<Duration>,
    /// Negotiate gzip-compressed responses.
    pub compression: bool,
    pub default_headers: HeaderMap,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("http://localhost:8123").expect("static URL is valid"),
            username: None,
            password: None,
            database: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: None,
            compression: false,
            default_headers: HeaderMap::new(),
        }
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// The body, already decompressed.
    pub body: Bytes,
}

impl HttpResponse {
    /// The body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One HTTP session.
pub struct HttpConnection {
    config: Arc<ConnectionConfig>,
    http: Option<reqwest::Client>,
    created_at: Instant,
    last_used: Instant,
    healthy: bool,
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("base_url", &self.config.base_url.as_str())
            .field("open", &self.http.is_some())
            .field("healthy", &self.healthy)
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

impl HttpConnection {
    /// Opens a new session. No request is made until the first call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] if credentials cannot be encoded
    /// as headers, or [`Error::Connection`] if the HTTP client cannot be built.
    pub fn open(config: Arc<ConnectionConfig>) -> Result<Self> {
        let mut headers = config.default_headers.clone();
        let auth = [
            ("x-clickhouse-user", config.username.as_deref()),
            ("x-clickhouse-key", config.password.as_deref()),
            ("x-clickhouse-database", config.database.as_deref()),
        ];
        for (name, value) in auth {
            if let Some(value) = value {
                let mut value = HeaderValue::try_from(value).map_err(|e| {
                    Error::ConfigurationError(format!("Invalid value for {}: {}", name, e))
                })?;
                if name == "x-clickhouse-key" {
                    value.set_sensitive(true);
                }
                headers.insert(HeaderName::from_static(name), value);
            }
        }
        if config.compression {
            headers.insert(
                http::header::ACCEPT_ENCODING,
                HeaderValue::from_static("gzip"),
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| Error::Connection(format!("Failed to build HTTP client: {}", e)))?;

        let now = Instant::now();
        tracing::debug!(base_url = %config.base_url, "Opened connection");

        Ok(Self {
            config,
            http: Some(http),
            created_at: now,
            last_used: now,
            healthy: true,
        })
    }

    /// The configuration this connection was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Builds the request URL for `path` with the given query parameters.
    ///
    /// `path` is appended to the base URL's own path, so a server mounted
    /// under a prefix (`http://proxy/clickhouse/`) keeps it.
    pub fn url(&self, path: &str, params: &[(String, String)]) -> Url {
        let mut url = self.config.base_url.clone();
        let joined = format!(
            "{}/{}",
            self.config.base_url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
            if self.config.compression {
                pairs.append_pair("enable_http_compression", "1");
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        url
    }

    /// Sends a GET request and buffers the response.
    pub async fn get(&mut self, path: &str, params: &[(String, String)]) -> Result<HttpResponse> {
        let url = self.url(path, params);
        let request = self.client()?.get(url);
        let response = self.send(request).await?;
        self.buffer(response).await
    }

    /// Sends a POST request and buffers the response.
    pub async fn post(
        &mut self,
        path: &str,
        params: &[(String, String)],
        body: impl Into<reqwest::Body>,
        headers: &HeaderMap,
    ) -> Result<HttpResponse> {
        let response = self.post_streaming(path, params, body, headers).await?;
        self.buffer(response).await
    }

    /// Sends a POST request and returns the live response, so its body can be
    /// pulled chunk by chunk. The body is returned as sent, without
    /// decompression.
    pub async fn post_streaming(
        &mut self,
        path: &str,
        params: &[(String, String)],
        body: impl Into<reqwest::Body>,
        headers: &HeaderMap,
    ) -> Result<reqwest::Response> {
        let url = self.url(path, params);
        let request = self.client()?.post(url).headers(headers.clone()).body(body);
        self.send(request).await
    }

    /// Checks that the server answers `GET /ping` with `Ok.`.
    pub async fn ping(&mut self) -> bool {
        match self.get("/ping", &[]).await {
            Ok(response) => response.status.is_success() && response.text().trim() == "Ok.",
            Err(e) => {
                tracing::debug!(error = %e, "Ping failed");
                false
            }
        }
    }

    fn client(&self) -> Result<&reqwest::Client> {
        self.http
            .as_ref()
            .ok_or_else(|| Error::Connection("connection is closed".to_string()))
    }

    async fn send(&mut self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        self.last_used = Instant::now();
        request.send().await.map_err(|e| self.transport_error(e))
    }

    async fn buffer(&mut self, response: reqwest::Response) -> Result<HttpResponse> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        let body = if is_gzip(&headers) { gunzip(&body)? } else { body };
        self.last_used = Instant::now();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    pub(crate) fn transport_error(&mut self, error: reqwest::Error) -> Error {
        self.healthy = false;
        if error.is_timeout() {
            Error::Timeout
        } else {
            Error::Network(error)
        }
    }
}

impl Connection for HttpConnection {
    fn is_healthy(&self) -> bool {
        self.healthy && self.http.is_some()
    }

    fn is_stale(&self) -> bool {
        self.last_used.elapsed() > self.config.idle_timeout
            || self
                .config
                .max_lifetime
                .is_some_and(|max| self.created_at.elapsed() > max)
    }

    fn last_used(&self) -> Instant {
        self.last_used
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    fn disconnect(&mut self) -> Result<()> {
        self.healthy = false;
        if self.http.take().is_some() {
            tracing::debug!(base_url = %self.config.base_url, "Closed connection");
        }
        Ok(())
    }
}

/// Returns `true` if the response declares a gzip content encoding.
pub(crate) fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

/// Decompresses a complete gzip body, accepting concatenated members.
pub(crate) fn gunzip(body: &[u8]) -> Result<Bytes> {
    let mut decoder = flate2::read::MultiGzDecoder::new(body);
    let mut out = Vec::with_capacity(body.len() * 4);
    decoder.read_to_end(&mut out).map_err(Error::Decompression)?;
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            username: Some("reader".to_string()),
            password: Some("secret".to_string()),
            database: Some("analytics".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_gunzip_concatenated_members() {
        let mut body = gzip(b"{\"id\":1}\n");
        body.extend(gzip(b"{\"id\":2}\n"));
        assert_eq!(&gunzip(&body).unwrap()[..], b"{\"id\":1}\n{\"id\":2}\n");
        assert!(matches!(gunzip(b"not gzip"), Err(Error::Decompression(_))));
    }

    #[test]
    fn test_url_building() {
        let conn = HttpConnection::open(Arc::new(config())).unwrap();
        let url = conn.url("/", &[("query_id".to_string(), "abc".to_string())]);
        assert_eq!(url.as_str(), "http://localhost:8123/?query_id=abc");
        assert_eq!(conn.url("/ping", &[]).as_str(), "http://localhost:8123/ping");

        let compressed = HttpConnection::open(Arc::new(ConnectionConfig {
            compression: true,
            ..config()
        }))
        .unwrap();
        assert_eq!(
            compressed.url("/", &[]).as_str(),
            "http://localhost:8123/?enable_http_compression=1"
        );
    }

    #[test]
    fn test_url_keeps_base_path_prefix() {
        let conn = HttpConnection::open(Arc::new(ConnectionConfig {
            base_url: Url::parse("http://proxy.internal:8080/clickhouse/").unwrap(),
            ..config()
        }))
        .unwrap();
        assert_eq!(
            conn.url("/", &[]).as_str(),
            "http://proxy.internal:8080/clickhouse/"
        );
        assert_eq!(
            conn.url("/ping", &[]).as_str(),
            "http://proxy.internal:8080/clickhouse/ping"
        );

        let bare = HttpConnection::open(Arc::new(ConnectionConfig {
            base_url: Url::parse("http://proxy.internal:8080/clickhouse").unwrap(),
            ..config()
        }))
        .unwrap();
        assert_eq!(
            bare.url("/ping", &[]).as_str(),
            "http://proxy.internal:8080/clickhouse/ping"
        );
    }

    #[test]
    fn test_staleness() {
        let mut conn = HttpConnection::open(Arc::new(ConnectionConfig {
            idle_timeout: Duration::from_millis(20),
            ..config()
        }))
        .unwrap();
        assert!(!conn.is_stale());
        std::thread::sleep(Duration::from_millis(40));
        assert!(conn.is_stale());
        conn.touch();
        assert!(!conn.is_stale());

        let aged = HttpConnection::open(Arc::new(ConnectionConfig {
            max_lifetime: Some(Duration::from_millis(10)),
            ..config()
        }))
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(aged.is_stale());
    }

    #[tokio::test]
    async fn test_disconnect_closes_session() {
        let mut conn = HttpConnection::open(Arc::new(config())).unwrap();
        assert!(conn.is_healthy());
        conn.disconnect().unwrap();
        assert!(!conn.is_healthy());
        assert!(matches!(conn.get("/ping", &[]).await, Err(Error::Connection(_))));
        assert!(!conn.ping().await);
    }

    #[test]
    fn test_rejects_unencodable_credentials() {
        let result = HttpConnection::open(Arc::new(ConnectionConfig {
            password: Some("line\nbreak".to_string()),
            ..config()
        }));
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }
}
