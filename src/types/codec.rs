//! Codecs: one per column type, moving values between host, wire and SQL forms.
//!
//! A [`Codec`] is a closed set of variants ([`CodecKind`]) built bottom-up by the
//! [`TypeRegistry`](super::TypeRegistry). Codecs are immutable once built and are
//! shared between threads behind an `Arc`.

use super::scanner::{is_null_token, quote, split_top_level, strip_delimiters, unquote};
use crate::value::{format_datetime, Value};
use crate::{Error, Result};
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

/// The date/time flavours ClickHouse distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalKind {
    /// Days since epoch, 1970-01-01 to 2149-06-06.
    Date,
    /// Extended-range date, 1900-01-01 to 2299-12-31.
    Date32,
    /// Whole seconds.
    DateTime,
    /// Sub-second ticks with the given number of fractional digits.
    DateTime64(u32),
}

/// What a codec does, with only the fields each variant needs.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecKind {
    Integer { bits: u32, signed: bool },
    Float { bits: u32 },
    Decimal { precision: u32, scale: u32 },
    /// `String`, or `FixedString(N)` when `fixed_length` is set.
    String { fixed_length: Option<usize> },
    Boolean,
    /// The timezone is carried for rendering only; values are wall-clock times.
    Temporal {
        kind: TemporalKind,
        timezone: Option<String>,
    },
    Uuid,
    Enum { bits: u32, entries: Vec<(String, i64)> },
    Array { element: Box<Codec> },
    Map { key: Box<Codec>, value: Box<Codec> },
    Tuple { elements: Vec<Codec> },
    Nullable { inner: Box<Codec> },
    LowCardinality { inner: Box<Codec> },
    /// Unrecognized types: values pass through untyped.
    Passthrough,
}

/// A value converter for one column type.
#[derive(Debug, Clone, PartialEq)]
pub struct Codec {
    type_name: String,
    kind: CodecKind,
}

impl Codec {
    pub fn new(type_name: impl Into<String>, kind: CodecKind) -> Self {
        Self {
            type_name: type_name.into(),
            kind,
        }
    }

    /// The type declaration this codec was built from.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn kind(&self) -> &CodecKind {
        &self.kind
    }

    /// Returns `true` if this codec accepts NULL as a regular value.
    pub fn is_nullable(&self) -> bool {
        match &self.kind {
            CodecKind::Nullable { .. } | CodecKind::Passthrough => true,
            CodecKind::LowCardinality { inner } => inner.is_nullable(),
            _ => false,
        }
    }

    fn mismatch(&self, value: &Value) -> Error {
        Error::type_cast(value.kind(), &self.type_name, value.to_sql_literal())
    }

    fn malformed(&self, text: &str) -> Error {
        Error::type_cast("wire", &self.type_name, format!("{:?}", text))
    }

    /// Converts a host value into this type's internal representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeCast`] on shape mismatch, integer overflow for the
    /// declared width, malformed UUIDs, decimals with too many integer digits,
    /// and unknown enum labels.
    ///
    /// # Examples
    ///
    /// ```
    /// use clickhttp::types::TypeRegistry;
    /// use clickhttp::Value;
    ///
    /// let registry = TypeRegistry::with_defaults();
    /// let codec = registry.lookup("UInt8").unwrap();
    /// assert_eq!(codec.cast(&Value::Int(200)).unwrap(), Value::UInt(200));
    /// assert!(codec.cast(&Value::Int(256)).is_err());
    /// ```
    pub fn cast(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        match &self.kind {
            CodecKind::Integer { bits, signed } => self.cast_integer(value, *bits, *signed),
            CodecKind::Float { bits } => {
                let f = match value {
                    Value::Float(f) => *f,
                    Value::Int(i) => *i as f64,
                    Value::UInt(u) => *u as f64,
                    Value::Decimal(d) => d.to_f64().ok_or_else(|| self.mismatch(value))?,
                    Value::String(s) => parse_float(s).ok_or_else(|| self.mismatch(value))?,
                    _ => return Err(self.mismatch(value)),
                };
                Ok(Value::Float(narrow_float(f, *bits)))
            }
            CodecKind::Decimal { precision, scale } => {
                let d = match value {
                    Value::Decimal(d) => *d,
                    Value::Int(i) => Decimal::from_i128(*i).ok_or_else(|| self.mismatch(value))?,
                    Value::UInt(u) => Decimal::from_u128(*u).ok_or_else(|| self.mismatch(value))?,
                    Value::Float(f) if f.is_finite() => {
                        parse_decimal(&f.to_string()).ok_or_else(|| self.mismatch(value))?
                    }
                    Value::String(s) => parse_decimal(s).ok_or_else(|| self.mismatch(value))?,
                    _ => return Err(self.mismatch(value)),
                };
                let d = d.round_dp_with_strategy(*scale, RoundingStrategy::ToZero);
                let allowed = precision.saturating_sub(*scale) as usize;
                if integer_digits(&d) > allowed {
                    return Err(self.mismatch(value));
                }
                Ok(Value::Decimal(d))
            }
            CodecKind::String { fixed_length } => {
                let s = match value {
                    Value::String(s) => s.clone(),
                    Value::Array(_) | Value::Tuple(_) | Value::Map(_) => {
                        return Err(self.mismatch(value))
                    }
                    other => other.to_string(),
                };
                match fixed_length {
                    Some(n) if s.len() > *n => Err(self.mismatch(value)),
                    _ => Ok(Value::String(s)),
                }
            }
            CodecKind::Boolean => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::Int(0) | Value::UInt(0) => Ok(Value::Bool(false)),
                Value::Int(1) | Value::UInt(1) => Ok(Value::Bool(true)),
                Value::String(s) => parse_bool(s)
                    .map(Value::Bool)
                    .ok_or_else(|| self.mismatch(value)),
                _ => Err(self.mismatch(value)),
            },
            CodecKind::Temporal { kind, .. } => self.cast_temporal(value, *kind),
            CodecKind::Uuid => match value {
                Value::Uuid(u) => Ok(Value::Uuid(*u)),
                Value::String(s) => Uuid::parse_str(s.trim())
                    .map(Value::Uuid)
                    .map_err(|_| self.mismatch(value)),
                _ => Err(self.mismatch(value)),
            },
            CodecKind::Enum { entries, .. } => {
                let label = match value {
                    Value::String(s) => entries.iter().find(|(label, _)| label == s),
                    Value::Int(_) | Value::UInt(_) => {
                        let n = value.as_i64().ok_or_else(|| self.mismatch(value))?;
                        entries.iter().find(|(_, v)| *v == n)
                    }
                    _ => None,
                };
                label
                    .map(|(label, _)| Value::String(label.clone()))
                    .ok_or_else(|| self.mismatch(value))
            }
            CodecKind::Array { element } => match value {
                Value::Array(items) | Value::Tuple(items) => items
                    .iter()
                    .map(|item| element.cast(item))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Array),
                _ => Err(self.mismatch(value)),
            },
            CodecKind::Tuple { elements } => match value {
                Value::Tuple(items) | Value::Array(items) if items.len() == elements.len() => {
                    elements
                        .iter()
                        .zip(items)
                        .map(|(codec, item)| codec.cast(item))
                        .collect::<Result<Vec<_>>>()
                        .map(Value::Tuple)
                }
                _ => Err(self.mismatch(value)),
            },
            CodecKind::Map { key, value: val } => match value {
                Value::Map(entries) => entries
                    .iter()
                    .map(|(k, v)| Ok((key.cast(k)?, val.cast(v)?)))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Map),
                _ => Err(self.mismatch(value)),
            },
            CodecKind::Nullable { inner } | CodecKind::LowCardinality { inner } => {
                inner.cast(value)
            }
            CodecKind::Passthrough => Ok(value.clone()),
        }
    }

    /// Decodes a value from the JSON wire form.
    ///
    /// JSON `null` decodes to [`Value::Null`] for every type. Composite types
    /// accept either JSON arrays/objects or their textual form as a string.
    pub fn deserialize(&self, wire: &JsonValue) -> Result<Value> {
        if wire.is_null() {
            return Ok(Value::Null);
        }

        match (&self.kind, wire) {
            (CodecKind::Nullable { .. }, JsonValue::String(s)) if s == "\\N" => Ok(Value::Null),
            (CodecKind::Nullable { inner } | CodecKind::LowCardinality { inner }, _) => {
                inner.deserialize(wire)
            }
            (CodecKind::Passthrough, _) => Ok(Value::from_json(wire)),

            (CodecKind::Array { element }, JsonValue::Array(items)) => items
                .iter()
                .map(|item| element.deserialize(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            (CodecKind::Tuple { elements }, JsonValue::Array(items))
                if items.len() == elements.len() =>
            {
                elements
                    .iter()
                    .zip(items)
                    .map(|(codec, item)| codec.deserialize(item))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Tuple)
            }
            // Named tuples come back as objects in field order.
            (CodecKind::Tuple { elements }, JsonValue::Object(fields))
                if fields.len() == elements.len() =>
            {
                elements
                    .iter()
                    .zip(fields.values())
                    .map(|(codec, item)| codec.deserialize(item))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Tuple)
            }
            (CodecKind::Map { key, value }, JsonValue::Object(entries)) => entries
                .iter()
                .map(|(k, v)| {
                    Ok((
                        key.deserialize(&JsonValue::String(k.clone()))?,
                        value.deserialize(v)?,
                    ))
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::Map),
            (
                CodecKind::Array { .. } | CodecKind::Tuple { .. } | CodecKind::Map { .. },
                JsonValue::String(s),
            ) => self.deserialize_text(s),
            (CodecKind::Array { .. } | CodecKind::Tuple { .. } | CodecKind::Map { .. }, _) => {
                Err(self.malformed(&wire.to_string()))
            }

            // Parse the number's own digits so wide decimals keep their scale.
            (CodecKind::Decimal { .. }, JsonValue::Number(n)) => self.parse_scalar(&n.to_string()),
            (CodecKind::String { fixed_length }, JsonValue::String(s)) => {
                Ok(Value::String(trim_fixed(s, *fixed_length)))
            }
            (_, JsonValue::String(s)) => self.parse_scalar(s),
            (_, other) => self.cast(&Value::from_json(other)),
        }
    }

    /// Decodes a value from its textual literal form, as found inside
    /// composite values (`'quoted'`, `NULL`, `[1, 2]`, `('a', 3)`, `{'k': 1}`).
    pub fn deserialize_text(&self, text: &str) -> Result<Value> {
        let text = text.trim();

        match &self.kind {
            CodecKind::Nullable { inner } => {
                if is_null_token(text) {
                    Ok(Value::Null)
                } else {
                    inner.deserialize_text(text)
                }
            }
            CodecKind::LowCardinality { inner } => inner.deserialize_text(text),
            CodecKind::Array { element } => {
                let inner = strip_delimiters(text, '[', ']').ok_or_else(|| self.malformed(text))?;
                split_top_level(inner, ',')
                    .ok_or_else(|| self.malformed(text))?
                    .into_iter()
                    .map(|item| element.deserialize_text(item))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Array)
            }
            CodecKind::Tuple { elements } => {
                let inner = strip_delimiters(text, '(', ')').ok_or_else(|| self.malformed(text))?;
                let items = split_top_level(inner, ',').ok_or_else(|| self.malformed(text))?;
                if items.len() != elements.len() {
                    return Err(self.malformed(text));
                }
                elements
                    .iter()
                    .zip(items)
                    .map(|(codec, item)| codec.deserialize_text(item))
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Tuple)
            }
            CodecKind::Map { key, value } => {
                let inner = strip_delimiters(text, '{', '}').ok_or_else(|| self.malformed(text))?;
                split_top_level(inner, ',')
                    .ok_or_else(|| self.malformed(text))?
                    .into_iter()
                    .map(|entry| {
                        let parts = split_top_level(entry, ':')
                            .filter(|parts| parts.len() == 2)
                            .ok_or_else(|| self.malformed(entry))?;
                        Ok((key.deserialize_text(parts[0])?, value.deserialize_text(parts[1])?))
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Map)
            }
            CodecKind::String { fixed_length } => {
                let s = unquote(text).unwrap_or_else(|| text.to_string());
                Ok(Value::String(trim_fixed(&s, *fixed_length)))
            }
            CodecKind::Passthrough => Ok(passthrough_text(text)),
            _ => match unquote(text) {
                Some(s) => self.parse_scalar(&s),
                None => self.parse_scalar(text),
            },
        }
    }

    /// Renders a host value as a SQL literal for this type.
    ///
    /// NULL renders as `NULL`; strings are quoted with quotes, backslashes and
    /// control characters escaped.
    pub fn serialize(&self, value: &Value) -> String {
        if value.is_null() {
            return "NULL".to_string();
        }

        match (&self.kind, value) {
            (CodecKind::Nullable { inner } | CodecKind::LowCardinality { inner }, v) => {
                inner.serialize(v)
            }
            (CodecKind::Temporal { kind, .. }, Value::DateTime(dt)) => match kind {
                TemporalKind::Date | TemporalKind::Date32 => {
                    quote(&dt.date().format("%Y-%m-%d").to_string())
                }
                TemporalKind::DateTime => quote(&format_datetime(dt, Some(0))),
                TemporalKind::DateTime64(p) => quote(&format_datetime(dt, Some(*p))),
            },
            (CodecKind::Enum { entries, .. }, Value::Int(_) | Value::UInt(_)) => {
                let n = value.as_i64();
                match entries.iter().find(|(_, v)| Some(*v) == n) {
                    Some((label, _)) => quote(label),
                    None => value.to_sql_literal(),
                }
            }
            (CodecKind::Array { element }, Value::Array(items) | Value::Tuple(items)) => {
                let body: Vec<String> = items.iter().map(|item| element.serialize(item)).collect();
                format!("[{}]", body.join(", "))
            }
            (CodecKind::Tuple { elements }, Value::Tuple(items) | Value::Array(items)) => {
                let body: Vec<String> = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| match elements.get(i) {
                        Some(codec) => codec.serialize(item),
                        None => item.to_sql_literal(),
                    })
                    .collect();
                format!("({})", body.join(", "))
            }
            (CodecKind::Map { key, value: val }, Value::Map(entries)) => {
                let body: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", key.serialize(k), val.serialize(v)))
                    .collect();
                format!("{{{}}}", body.join(", "))
            }
            (_, v) => v.to_sql_literal(),
        }
    }

    /// Parses an unquoted scalar string for the scalar variants.
    fn parse_scalar(&self, s: &str) -> Result<Value> {
        let trimmed = s.trim();
        match &self.kind {
            CodecKind::Integer { bits, signed } => {
                let value = parse_integer(trimmed).ok_or_else(|| self.malformed(s))?;
                self.cast_integer(&value, *bits, *signed)
            }
            CodecKind::Float { bits } => parse_float(trimmed)
                .map(|f| Value::Float(narrow_float(f, *bits)))
                .ok_or_else(|| self.malformed(s)),
            CodecKind::Decimal { .. } => match parse_decimal(trimmed) {
                Some(d) => Ok(Value::Decimal(d)),
                // Out of range for the host decimal: keep the digits.
                None if looks_numeric(trimmed) => Ok(Value::String(trimmed.to_string())),
                None => Err(self.malformed(s)),
            },
            CodecKind::Boolean => parse_bool(trimmed)
                .map(Value::Bool)
                .ok_or_else(|| self.malformed(s)),
            CodecKind::Temporal { kind, .. } => {
                let value = match parse_integer(trimmed) {
                    Some(ticks) => ticks,
                    None => Value::String(trimmed.to_string()),
                };
                self.cast_temporal(&value, *kind)
                    .map_err(|_| self.malformed(s))
            }
            CodecKind::Uuid => Uuid::parse_str(trimmed)
                .map(Value::Uuid)
                .map_err(|_| self.malformed(s)),
            CodecKind::Enum { entries, .. } => entries
                .iter()
                .find(|(label, _)| label == s)
                .or_else(|| {
                    let n = trimmed.parse::<i64>().ok()?;
                    entries.iter().find(|(_, v)| *v == n)
                })
                .map(|(label, _)| Value::String(label.clone()))
                .ok_or_else(|| self.malformed(s)),
            CodecKind::String { fixed_length } => Ok(Value::String(trim_fixed(s, *fixed_length))),
            _ => self.deserialize_text(s),
        }
    }

    fn cast_integer(&self, value: &Value, bits: u32, signed: bool) -> Result<Value> {
        let wide = match value {
            Value::Int(i) => *i,
            Value::UInt(u) => match i128::try_from(*u) {
                Ok(i) => i,
                // Only UInt128 can hold values past i128::MAX.
                Err(_) if !signed && bits == 128 => return Ok(Value::UInt(*u)),
                Err(_) => return Err(self.mismatch(value)),
            },
            Value::Bool(b) => *b as i128,
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 1.7e38 => *f as i128,
            Value::Decimal(d) if d.fract().is_zero() => {
                d.to_i128().ok_or_else(|| self.mismatch(value))?
            }
            Value::String(s) => match parse_integer(s.trim()) {
                Some(parsed) => return self.cast_integer(&parsed, bits, signed),
                None => return Err(self.mismatch(value)),
            },
            _ => return Err(self.mismatch(value)),
        };

        if signed {
            let (min, max) = if bits >= 128 {
                (i128::MIN, i128::MAX)
            } else {
                (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
            };
            if wide < min || wide > max {
                return Err(self.mismatch(value));
            }
            Ok(Value::Int(wide))
        } else {
            if wide < 0 {
                return Err(self.mismatch(value));
            }
            let wide = wide as u128;
            if bits < 128 && wide > (1u128 << bits) - 1 {
                return Err(self.mismatch(value));
            }
            Ok(Value::UInt(wide))
        }
    }

    fn cast_temporal(&self, value: &Value, kind: TemporalKind) -> Result<Value> {
        let is_date = matches!(kind, TemporalKind::Date | TemporalKind::Date32);
        let dt = match value {
            Value::DateTime(dt) => *dt,
            Value::Date(d) => d.and_time(chrono::NaiveTime::MIN),
            Value::String(s) => parse_datetime(s).ok_or_else(|| self.mismatch(value))?,
            Value::Int(_) | Value::UInt(_) => {
                let n = value.as_i64().ok_or_else(|| self.mismatch(value))?;
                from_integer(n, kind).ok_or_else(|| self.mismatch(value))?
            }
            _ => return Err(self.mismatch(value)),
        };

        let (min_year, max) = match kind {
            TemporalKind::Date => (1970, ymd(2149, 6, 6).and_hms_opt(23, 59, 59)),
            TemporalKind::DateTime => (1970, ymd(2106, 2, 7).and_hms_opt(6, 28, 15)),
            TemporalKind::Date32 | TemporalKind::DateTime64(_) => {
                (1900, ymd(2299, 12, 31).and_hms_nano_opt(23, 59, 59, 999_999_999))
            }
        };
        if dt.date() < ymd(min_year, 1, 1) || max.is_some_and(|max| dt > max) {
            return Err(self.mismatch(value));
        }

        if is_date {
            return Ok(Value::Date(dt.date()));
        }
        let precision = match kind {
            TemporalKind::DateTime64(p) => p.min(9),
            _ => 0,
        };
        Ok(Value::DateTime(truncate_nanos(dt, precision)))
    }
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

fn narrow_float(f: f64, bits: u32) -> f64 {
    if bits == 32 {
        f as f32 as f64
    } else {
        f
    }
}

fn parse_integer(s: &str) -> Option<Value> {
    if let Ok(i) = s.parse::<i128>() {
        return Some(Value::Int(i));
    }
    s.parse::<u128>().ok().map(Value::UInt)
}

fn parse_float(s: &str) -> Option<f64> {
    match s.trim().to_ascii_lowercase().as_str() {
        "nan" | "+nan" | "-nan" => Some(f64::NAN),
        "inf" | "+inf" | "infinity" => Some(f64::INFINITY),
        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

fn looks_numeric(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
}

fn integer_digits(d: &Decimal) -> usize {
    let int_part = d.trunc().abs();
    if int_part.is_zero() {
        0
    } else {
        int_part.to_string().len()
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "t" | "yes" => Some(true),
        "false" | "0" | "f" | "no" => Some(false),
        _ => None,
    }
}

fn trim_fixed(s: &str, fixed_length: Option<usize>) -> String {
    match fixed_length {
        Some(_) => s.trim_end_matches('\0').to_string(),
        None => s.to_string(),
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
    ];
    for format in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(dt);
        }
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(chrono::NaiveTime::MIN))
}

/// Interprets an integer as days (dates), seconds (`DateTime`) or ticks (`DateTime64`).
fn from_integer(n: i64, kind: TemporalKind) -> Option<NaiveDateTime> {
    match kind {
        TemporalKind::Date | TemporalKind::Date32 => {
            let days = chrono::Duration::try_days(n)?;
            ymd(1970, 1, 1)
                .checked_add_signed(days)
                .map(|d| d.and_time(chrono::NaiveTime::MIN))
        }
        TemporalKind::DateTime => chrono::DateTime::from_timestamp(n, 0).map(|dt| dt.naive_utc()),
        TemporalKind::DateTime64(p) => {
            let scale = 10i64.checked_pow(p.min(9))?;
            let secs = n.div_euclid(scale);
            let nanos = n.rem_euclid(scale) * 10i64.pow(9 - p.min(9));
            chrono::DateTime::from_timestamp(secs, nanos as u32).map(|dt| dt.naive_utc())
        }
    }
}

fn truncate_nanos(dt: NaiveDateTime, precision: u32) -> NaiveDateTime {
    let nanos = dt.nanosecond() % 1_000_000_000;
    let step = 10u32.pow(9 - precision);
    dt.with_nanosecond(nanos - nanos % step).unwrap_or(dt)
}

/// Best-effort decoding of a textual literal with no declared type.
fn passthrough_text(text: &str) -> Value {
    if is_null_token(text) {
        return Value::Null;
    }
    if let Some(s) = unquote(text) {
        return Value::String(s);
    }
    if let Some(inner) = strip_delimiters(text, '[', ']') {
        if let Some(items) = split_top_level(inner, ',') {
            return Value::Array(items.into_iter().map(passthrough_text).collect());
        }
    }
    if let Some(inner) = strip_delimiters(text, '(', ')') {
        if let Some(items) = split_top_level(inner, ',') {
            return Value::Tuple(items.into_iter().map(passthrough_text).collect());
        }
    }
    if let Some(value) = parse_integer(text) {
        return value;
    }
    match text.parse::<f64>() {
        Ok(f) => Value::Float(f),
        Err(_) => Value::String(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeRegistry;
    use serde_json::json;

    fn codec(type_name: &str) -> std::sync::Arc<Codec> {
        TypeRegistry::with_defaults().lookup(type_name).unwrap()
    }

    fn assert_round_trip(type_name: &str, value: Value) {
        let codec = codec(type_name);
        let cast = codec.cast(&value).unwrap();
        let literal = codec.serialize(&cast);
        let back = codec.deserialize_text(&literal).unwrap();
        assert_eq!(back, cast, "{} via {}", type_name, literal);
    }

    #[test]
    fn test_integer_ranges() {
        let c = codec("Int8");
        assert_eq!(c.cast(&Value::Int(-128)).unwrap(), Value::Int(-128));
        assert!(c.cast(&Value::Int(128)).is_err());
        assert!(c.cast(&Value::Int(-129)).is_err());

        let c = codec("UInt64");
        assert!(c.cast(&Value::Int(-1)).is_err());
        assert_eq!(
            c.cast(&Value::from("18446744073709551615")).unwrap(),
            Value::UInt(u64::MAX as u128)
        );
        assert!(c.cast(&Value::from("18446744073709551616")).is_err());

        let c = codec("UInt128");
        assert_eq!(c.cast(&Value::UInt(u128::MAX)).unwrap(), Value::UInt(u128::MAX));
        assert!(codec("Int128").cast(&Value::UInt(u128::MAX)).is_err());
    }

    #[test]
    fn test_integer_cast_errors_carry_context() {
        match codec("UInt8").cast(&Value::Int(300)) {
            Err(Error::TypeCast {
                from_type,
                to_type,
                value,
            }) => {
                assert_eq!(from_type, "Int");
                assert_eq!(to_type, "UInt8");
                assert_eq!(value, "300");
            }
            other => panic!("Expected TypeCast, got {:?}", other),
        }
        assert!(codec("Int32").cast(&Value::from("abc")).is_err());
        assert!(codec("Int32").cast(&Value::Float(1.5)).is_err());
    }

    #[test]
    fn test_integer_deserialize_quoted_and_numbers() {
        let c = codec("UInt64");
        assert_eq!(c.deserialize(&json!("42")).unwrap(), Value::UInt(42));
        assert_eq!(c.deserialize(&json!(42)).unwrap(), Value::UInt(42));
        assert_eq!(c.deserialize(&JsonValue::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_decimal_precision() {
        let c = codec("Decimal(5,2)");
        assert_eq!(
            c.cast(&Value::Float(123.45)).unwrap(),
            Value::Decimal(Decimal::from_str("123.45").unwrap())
        );
        assert!(matches!(
            c.cast(&Value::Float(1234.56)),
            Err(Error::TypeCast { .. })
        ));
        // Scale truncates toward zero.
        assert_eq!(
            c.cast(&Value::from("1.239")).unwrap(),
            Value::Decimal(Decimal::from_str("1.23").unwrap())
        );
        assert_eq!(
            c.cast(&Value::from("-999.999")).unwrap(),
            Value::Decimal(Decimal::from_str("-999.99").unwrap())
        );

        let c = codec("Decimal64(4)");
        assert_eq!(
            c.deserialize(&json!("12.3400")).unwrap(),
            Value::Decimal(Decimal::from_str("12.34").unwrap())
        );
    }

    #[test]
    fn test_decimal_from_unquoted_number_keeps_digits() {
        let wire: JsonValue = serde_json::from_str("12345678901234.5678").unwrap();
        assert_eq!(
            codec("Decimal(18, 4)").deserialize(&wire).unwrap(),
            Value::Decimal(Decimal::from_str("12345678901234.5678").unwrap())
        );

        let wire: JsonValue = serde_json::from_str("-0.0001").unwrap();
        assert_eq!(
            codec("Nullable(Decimal64(4))").deserialize(&wire).unwrap(),
            Value::Decimal(Decimal::from_str("-0.0001").unwrap())
        );
    }

    #[test]
    fn test_float_narrowing_and_specials() {
        let c = codec("Float32");
        assert_eq!(c.cast(&Value::Float(0.1)).unwrap(), Value::Float(0.1f32 as f64));
        let c = codec("Float64");
        assert_eq!(c.deserialize(&json!("inf")).unwrap(), Value::Float(f64::INFINITY));
        assert_eq!(c.serialize(&Value::Float(f64::NEG_INFINITY)), "-inf");
        match c.deserialize(&json!("nan")).unwrap() {
            Value::Float(f) => assert!(f.is_nan()),
            other => panic!("Expected NaN, got {:?}", other),
        }
    }

    #[test]
    fn test_string_escaping() {
        let c = codec("String");
        assert_eq!(c.serialize(&Value::from("a'b\\c\n")), "'a\\'b\\\\c\\n'");
        assert_eq!(c.serialize(&Value::Null), "NULL");
        assert_eq!(c.cast(&Value::Int(5)).unwrap(), Value::from("5"));
        assert!(c.cast(&Value::Array(vec![])).is_err());

        let c = codec("FixedString(3)");
        assert!(c.cast(&Value::from("abcd")).is_err());
        assert_eq!(c.deserialize(&json!("ab\u{0}")).unwrap(), Value::from("ab"));
    }

    #[test]
    fn test_uuid() {
        let c = codec("UUID");
        let id = "61f0c404-5cb3-11e7-907b-a6006ad3dba0";
        assert_eq!(
            c.cast(&Value::from(id)).unwrap(),
            Value::Uuid(Uuid::parse_str(id).unwrap())
        );
        assert!(c.cast(&Value::from("not-a-uuid")).is_err());
    }

    #[test]
    fn test_enum_auto_increment() {
        let c = codec("Enum8('active' = 1, 'inactive' = 2, 'pending')");
        match c.kind() {
            CodecKind::Enum { entries, .. } => {
                assert_eq!(entries[2], ("pending".to_string(), 3));
            }
            other => panic!("Expected Enum, got {:?}", other),
        }
        assert_eq!(c.cast(&Value::Int(3)).unwrap(), Value::from("pending"));
        assert_eq!(c.deserialize(&json!("inactive")).unwrap(), Value::from("inactive"));
        assert!(c.cast(&Value::from("archived")).is_err());
        assert_eq!(c.serialize(&Value::Int(1)), "'active'");
    }

    #[test]
    fn test_temporal() {
        let c = codec("DateTime64(3, 'UTC')");
        let parsed = c.deserialize(&json!("2024-05-06 07:08:09.123")).unwrap();
        let expected = ymd(2024, 5, 6).and_hms_milli_opt(7, 8, 9, 123).unwrap();
        assert_eq!(parsed, Value::DateTime(expected));
        assert_eq!(c.serialize(&parsed), "'2024-05-06 07:08:09.123'");
        assert_eq!(c.cast(&Value::Int(1_000)).unwrap(), Value::DateTime(
            ymd(1970, 1, 1).and_hms_opt(0, 0, 1).unwrap()
        ));

        let c = codec("Date");
        assert_eq!(c.deserialize(&json!("2024-05-06")).unwrap(), Value::Date(ymd(2024, 5, 6)));
        assert!(c.cast(&Value::Date(ymd(1969, 12, 31))).is_err());

        let c = codec("DateTime");
        let dt = ymd(2024, 1, 1).and_hms_nano_opt(1, 2, 3, 500).unwrap();
        assert_eq!(
            c.cast(&Value::DateTime(dt)).unwrap(),
            Value::DateTime(ymd(2024, 1, 1).and_hms_opt(1, 2, 3).unwrap())
        );
    }

    #[test]
    fn test_composite_text_forms() {
        let c = codec("Array(Tuple(String, UInt64))");
        let value = c.deserialize(&json!("[('a,b', 1), ('c]', 2)]")).unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Tuple(vec![Value::from("a,b"), Value::UInt(1)]),
                Value::Tuple(vec![Value::from("c]"), Value::UInt(2)]),
            ])
        );

        let json_form = c.deserialize(&json!([["a,b", "1"], ["c]", 2]])).unwrap();
        assert_eq!(json_form, value);

        let c = codec("Map(String, Array(Nullable(Int32)))");
        let value = c.deserialize(&json!("{'x': [1, NULL], 'y:z': []}")).unwrap();
        assert_eq!(
            value,
            Value::Map(vec![
                (Value::from("x"), Value::Array(vec![Value::Int(1), Value::Null])),
                (Value::from("y:z"), Value::Array(vec![])),
            ])
        );
        let from_object = c.deserialize(&json!({"x": [1, null], "y:z": []})).unwrap();
        assert_eq!(from_object, value);
    }

    #[test]
    fn test_nullable_and_low_cardinality() {
        let c = codec("Nullable(String)");
        assert_eq!(c.deserialize(&json!("\\N")).unwrap(), Value::Null);
        assert_eq!(c.deserialize_text("NULL").unwrap(), Value::Null);
        assert!(c.is_nullable());
        assert!(!codec("String").is_nullable());
        assert_eq!(codec("String").deserialize(&json!("\\N")).unwrap(), Value::from("\\N"));

        let c = codec("LowCardinality(Nullable(String))");
        assert!(c.is_nullable());
        assert_eq!(c.deserialize(&json!("abc")).unwrap(), Value::from("abc"));
    }

    #[test]
    fn test_malformed_composites() {
        let c = codec("Array(UInt8)");
        assert!(c.deserialize(&json!("[1, 2")).is_err());
        assert!(c.deserialize(&json!(5)).is_err());
        assert!(codec("Tuple(UInt8, UInt8)").deserialize(&json!([1])).is_err());
    }

    #[test]
    fn test_passthrough() {
        let c = codec("IPv4");
        assert_eq!(c.kind(), &CodecKind::Passthrough);
        assert_eq!(c.deserialize(&json!("127.0.0.1")).unwrap(), Value::from("127.0.0.1"));
        assert_eq!(c.cast(&Value::Int(1)).unwrap(), Value::Int(1));
        assert_eq!(
            c.deserialize_text("[1, 'a', NULL]").unwrap(),
            Value::Array(vec![Value::Int(1), Value::from("a"), Value::Null])
        );
    }

    #[test]
    fn test_round_trips() {
        assert_round_trip("Int32", Value::Int(-42));
        assert_round_trip("UInt256", Value::from("115792089237316195423570985008687907853269984665640564039457584007913129639935"));
        assert_round_trip("Float64", Value::Float(3.25));
        assert_round_trip("Float32", Value::Float(0.1));
        assert_round_trip("Decimal(10,3)", Value::from("-12.3456"));
        assert_round_trip("String", Value::from("quote ' backslash \\ tab \t"));
        assert_round_trip("Bool", Value::Bool(true));
        assert_round_trip("UUID", Value::from("61f0c404-5cb3-11e7-907b-a6006ad3dba0"));
        assert_round_trip("Date32", Value::from("1950-02-03"));
        assert_round_trip("DateTime64(6)", Value::from("2024-01-02 03:04:05.123456789"));
        assert_round_trip("Enum16('a' = -5, 'b')", Value::from("b"));
        assert_round_trip(
            "Array(Nullable(String))",
            Value::Array(vec![Value::from("x, y"), Value::Null]),
        );
        assert_round_trip(
            "Map(String, Tuple(UInt8, Array(String)))",
            Value::Map(vec![(
                Value::from("k"),
                Value::Tuple(vec![Value::Int(1), Value::Array(vec![Value::from("]")])]),
            )]),
        );
        assert_round_trip("LowCardinality(String)", Value::from("low"));
        assert_round_trip("Nullable(UInt8)", Value::Null);
    }
}
