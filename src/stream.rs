//! Streaming results.
//!
//! Streamed queries return one JSON object per line. [`NdjsonDecoder`] turns
//! arbitrarily split (and optionally gzip-compressed) body chunks back into
//! records, holding no more than the current partial record plus the chunk
//! being processed. [`RowStream`] pulls chunks from the response only when the
//! decoder has no complete record left, so memory stays constant however
//! large the result is.
//!
//! # Examples
//!
//! ```
//! use clickhttp::stream::{NdjsonDecoder, Record};
//!
//! let mut decoder = NdjsonDecoder::new("SELECT id FROM t");
//! decoder.push(b"{\"id\":1}\n{\"id\"")?;
//! assert!(matches!(decoder.next_record()?, Some(Record::Row(_))));
//! assert!(decoder.next_record()?.is_none());
//!
//! decoder.push(b":2}")?;
//! decoder.finish()?;
//! assert!(matches!(decoder.next_record()?, Some(Record::Row(_))));
//! assert!(decoder.next_record()?.is_none());
//! # Ok::<(), clickhttp::Error>(())
//! ```

use crate::connection::{Connection, HttpConnection};
use crate::error::{looks_like_exception, parse_exception_code};
use crate::settings::QuerySettings;
use crate::value::{Row, Value};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use http::StatusCode;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value as JsonValue};
use std::io::Write;
use std::sync::Arc;

/// Server-reported progress of a running query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Progress {
    #[serde(default, deserialize_with = "lenient_u64")]
    pub read_rows: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub read_bytes: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub written_rows: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub written_bytes: u64,
    /// Estimated total, zero when unknown
    #[serde(default, deserialize_with = "lenient_u64")]
    pub total_rows_to_read: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub elapsed_ns: u64,
}

// Progress counters are 64-bit and arrive quoted.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("invalid counter {}", n))),
        JsonValue::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!("invalid counter {}", other))),
    }
}

/// One decoded line of a streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Row(Map<String, JsonValue>),
    Progress(Progress),
}

/// Incremental decoder for newline-delimited JSON.
#[derive(Debug)]
pub struct NdjsonDecoder {
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known to hold no newline.
    scanned: usize,
    gzip: Option<flate2::write::MultiGzDecoder<Vec<u8>>>,
    with_progress: bool,
    finished: bool,
    sql: String,
}

impl NdjsonDecoder {
    /// Creates a decoder for the response to `sql`, which is only used as
    /// context in errors.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            scanned: 0,
            gzip: None,
            with_progress: false,
            finished: false,
            sql: sql.into(),
        }
    }

    /// Treats incoming chunks as gzip data. Both a single gzip stream split at
    /// any byte and a sequence of independently compressed chunks decode.
    pub fn compressed(mut self) -> Self {
        self.gzip = Some(flate2::write::MultiGzDecoder::new(Vec::new()));
        self
    }

    /// Expects the `JSONEachRowWithProgress` layout, where rows are wrapped as
    /// `{"row": {...}}` and interleaved with `{"progress": {...}}` records.
    pub fn with_progress(mut self) -> Self {
        self.with_progress = true;
        self
    }

    /// Appends a chunk of the response body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decompression`] if the chunk is not valid gzip data.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        match &mut self.gzip {
            Some(decoder) => {
                decoder.write_all(chunk).map_err(Error::Decompression)?;
                decoder.flush().map_err(Error::Decompression)?;
                let inflated = std::mem::take(decoder.get_mut());
                self.buffer.extend_from_slice(&inflated);
            }
            None => self.buffer.extend_from_slice(chunk),
        }
        Ok(())
    }

    /// Marks the end of the body. A trailing record without a newline becomes
    /// available from [`next_record`](Self::next_record).
    pub fn finish(&mut self) -> Result<()> {
        if let Some(decoder) = &mut self.gzip {
            decoder.try_finish().map_err(Error::Decompression)?;
            let inflated = std::mem::take(decoder.get_mut());
            self.buffer.extend_from_slice(&inflated);
        }
        self.finished = true;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes held for the record still being received.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete record, or `None` if more input is needed
    /// (or, after [`finish`](Self::finish), if the body is exhausted).
    ///
    /// # Errors
    ///
    /// A record reporting a server exception yields [`Error::Query`]; a line
    /// that is not a JSON object yields [`Error::DeserializationFailed`].
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let line = match self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
                Some(offset) => {
                    let line = self.buffer.split_to(self.scanned + offset + 1).freeze();
                    self.scanned = 0;
                    line
                }
                None if self.finished && !self.buffer.is_empty() => {
                    self.scanned = 0;
                    self.buffer.split().freeze()
                }
                None => {
                    self.scanned = self.buffer.len();
                    return Ok(None);
                }
            };

            if let Some(record) = self.decode_line(&line)? {
                return Ok(Some(record));
            }
        }
    }

    fn decode_line(&self, line: &Bytes) -> Result<Option<Record>> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return Ok(None);
        }

        let json: JsonValue = match serde_json::from_slice(line) {
            Ok(json) => json,
            Err(e) => {
                let text = String::from_utf8_lossy(line);
                if looks_like_exception(&text) {
                    return Err(self.query_error(&text));
                }
                return Err(Error::DeserializationFailed {
                    raw_response: text.into_owned(),
                    serde_error: e.to_string(),
                    status: StatusCode::OK,
                });
            }
        };

        let mut object = match json {
            JsonValue::Object(object) => object,
            other => {
                return Err(Error::DeserializationFailed {
                    raw_response: other.to_string(),
                    serde_error: "expected a JSON object per line".to_string(),
                    status: StatusCode::OK,
                })
            }
        };

        if object.len() == 1 {
            if let Some(JsonValue::String(exception)) = object.get("exception") {
                return Err(self.query_error(exception));
            }
        }

        if !self.with_progress {
            return Ok(Some(Record::Row(object)));
        }

        if let Some(JsonValue::Object(row)) = object.remove("row") {
            return Ok(Some(Record::Row(row)));
        }
        if let Some(progress) = object.remove("progress") {
            let progress =
                serde_json::from_value(progress).map_err(|e| Error::DeserializationFailed {
                    raw_response: String::from_utf8_lossy(line).into_owned(),
                    serde_error: e.to_string(),
                    status: StatusCode::OK,
                })?;
            return Ok(Some(Record::Progress(progress)));
        }

        // Other envelope records (meta, totals, rows_before_limit...).
        tracing::debug!(keys = ?object.keys().collect::<Vec<_>>(), "Skipping stream record");
        Ok(None)
    }

    fn query_error(&self, text: &str) -> Error {
        Error::Query {
            message: text.trim().to_string(),
            code: parse_exception_code(text),
            status: None,
            sql: self.sql.clone(),
        }
    }
}

/// Invoked for every progress record of a streamed query.
pub type ProgressCallback = Box<dyn FnMut(&Progress) + Send>;

/// Options for [`Client::stream_execute`](crate::Client::stream_execute).
#[derive(Default)]
pub struct StreamOptions {
    pub settings: QuerySettings,
    pub(crate) progress: Option<ProgressCallback>,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(mut self, settings: QuerySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Requests progress records and hands each to `callback`.
    pub fn on_progress(mut self, callback: impl FnMut(&Progress) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions")
            .field("settings", &self.settings)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Rows of a streamed query, pulled on demand.
///
/// The stream owns a dedicated connection that is closed when the stream is
/// exhausted, fails, is [`close`](Self::close)d, or is dropped. Stopping early
/// does not read the rest of the response.
///
/// # Examples
///
/// ```no_run
/// use clickhttp::{Client, StreamOptions};
///
/// # async fn example() -> Result<(), clickhttp::Error> {
/// let client = Client::builder().build()?;
/// let mut rows = client
///     .stream_execute("SELECT number FROM system.numbers LIMIT 1000000", StreamOptions::new())
///     .await?;
///
/// loop {
///     let batch = rows.next_batch(10_000).await?;
///     if batch.is_empty() {
///         break;
///     }
///     println!("got {} rows", batch.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct RowStream {
    body: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    conn: HttpConnection,
    decoder: NdjsonDecoder,
    progress: Option<ProgressCallback>,
    columns: Option<Arc<[String]>>,
    rows_yielded: usize,
    closed: bool,
}

impl RowStream {
    pub(crate) fn new(
        conn: HttpConnection,
        response: reqwest::Response,
        decoder: NdjsonDecoder,
        progress: Option<ProgressCallback>,
    ) -> Self {
        Self {
            body: Some(response.bytes_stream().boxed()),
            conn,
            decoder,
            progress,
            columns: None,
            rows_yielded: 0,
            closed: false,
        }
    }

    /// Returns the next row, or `None` once the result is exhausted.
    ///
    /// # Errors
    ///
    /// A server exception reported mid-stream yields [`Error::Query`]; the
    /// stream is closed after any error.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        match self.advance().await {
            Ok(row) => Ok(row),
            Err(e) => {
                tracing::warn!(error = %e, rows = self.rows_yielded, "Row stream failed");
                self.close();
                Err(e)
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<Row>> {
        loop {
            if self.closed {
                return Ok(None);
            }

            match self.decoder.next_record()? {
                Some(Record::Row(object)) => {
                    self.rows_yielded += 1;
                    return Ok(Some(self.to_row(object)));
                }
                Some(Record::Progress(progress)) => {
                    if let Some(callback) = &mut self.progress {
                        callback(&progress);
                    }
                    continue;
                }
                None if self.decoder.is_finished() => {
                    tracing::debug!(rows = self.rows_yielded, "Row stream exhausted");
                    self.close();
                    return Ok(None);
                }
                None => {}
            }

            let chunk = match &mut self.body {
                Some(body) => body.next().await,
                None => None,
            };
            match chunk {
                Some(Ok(chunk)) => self.decoder.push(&chunk)?,
                Some(Err(e)) => return Err(self.conn.transport_error(e)),
                None => self.decoder.finish()?,
            }
        }
    }

    fn to_row(&mut self, object: Map<String, JsonValue>) -> Row {
        let columns = match &self.columns {
            Some(columns) if columns.iter().eq(object.keys()) => Arc::clone(columns),
            _ => {
                let columns: Arc<[String]> = object.keys().cloned().collect();
                self.columns = Some(Arc::clone(&columns));
                columns
            }
        };
        let values = object.values().map(Value::from_json).collect();
        Row::new(columns, values)
    }

    /// Returns up to `size` rows. The last batch may be shorter; an empty
    /// batch means the result is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `size` is zero, otherwise the
    /// same errors as [`next`](Self::next).
    pub async fn next_batch(&mut self, size: usize) -> Result<Vec<Row>> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "batch size must be at least 1".to_string(),
            ));
        }

        let mut batch = Vec::with_capacity(size);
        while batch.len() < size {
            match self.next().await? {
                Some(row) => batch.push(row),
                None => break,
            }
        }
        Ok(batch)
    }

    /// Adapts the stream into a [`futures::Stream`] of rows.
    pub fn into_stream(self) -> impl Stream<Item = Result<Row>> + Send {
        futures::stream::unfold(self, |mut rows| async move {
            match rows.next().await {
                Ok(Some(row)) => Some((Ok(row), rows)),
                Ok(None) => None,
                Err(e) => Some((Err(e), rows)),
            }
        })
    }

    /// Rows returned so far.
    pub fn rows_yielded(&self) -> usize {
        self.rows_yielded
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stops reading and closes the connection. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.body = None;
        if let Err(e) = self.conn.disconnect() {
            tracing::warn!(error = %e, "Failed to close streaming connection");
        }
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("rows_yielded", &self.rows_yielded)
            .field("buffered", &self.decoder.buffered())
            .field("closed", &self.closed)
            .finish()
    }
}
