//! Per-query settings.

use std::collections::BTreeMap;

/// Settings for an individual query.
///
/// Server settings are sent as URL query parameters alongside the statement,
/// on top of any defaults configured on the client.
///
/// # Examples
///
/// ```
/// use clickhttp::QuerySettings;
///
/// let settings = QuerySettings::new()
///     .database("analytics")
///     .query_id("nightly-rollup-42")
///     .setting("max_execution_time", 30)
///     .raw();
///
/// assert_eq!(settings.settings.get("max_execution_time").map(String::as_str), Some("30"));
/// assert!(!settings.deserialize);
/// ```
#[derive(Debug, Clone)]
pub struct QuerySettings {
    /// Database to run the query in, overriding the client default.
    pub database: Option<String>,

    /// Query id to send. When absent, one is generated and reused across
    /// retries of the same call.
    pub query_id: Option<String>,

    /// Server settings such as `max_execution_time`.
    pub settings: BTreeMap<String, String>,

    /// Whether result values are decoded through the column codecs.
    ///
    /// When `false`, values are returned as they arrived on the wire.
    pub deserialize: bool,
}

impl QuerySettings {
    /// Creates settings with no overrides and deserialization on.
    pub fn new() -> Self {
        Self {
            database: None,
            query_id: None,
            settings: BTreeMap::new(),
            deserialize: true,
        }
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    /// Adds a server setting.
    pub fn setting(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.settings.insert(name.into(), value.to_string());
        self
    }

    /// Adds multiple server settings.
    pub fn settings(mut self, settings: impl IntoIterator<Item = (String, String)>) -> Self {
        self.settings.extend(settings);
        self
    }

    /// Returns values without running them through the column codecs.
    pub fn raw(mut self) -> Self {
        self.deserialize = false;
        self
    }

    /// URL query parameters for these settings, after `defaults`.
    pub(crate) fn params(&self, defaults: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut merged = defaults.clone();
        merged.extend(self.settings.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut params: Vec<(String, String)> = merged.into_iter().collect();
        if let Some(database) = &self.database {
            params.push(("database".to_string(), database.clone()));
        }
        params
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self::new()
    }
}
