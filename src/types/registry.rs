//! Name-to-factory registry that builds and caches codecs.

use super::codec::{Codec, CodecKind, TemporalKind};
use super::parser::{parse, TypeNode};
use super::scanner::unquote;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a codec for a parsed node. Composite factories build their
/// children through the registry first, so trees are assembled bottom-up.
pub type CodecFactory = Arc<dyn Fn(&TypeNode, &TypeRegistry) -> Result<Codec> + Send + Sync>;

/// Maps type names to codec factories and caches codecs per type string.
///
/// Register custom types while setting up, then share the registry (usually in
/// an `Arc`) between clients. Lookups are safe from any number of threads.
///
/// # Examples
///
/// ```
/// use clickhttp::types::TypeRegistry;
///
/// let registry = TypeRegistry::with_defaults();
/// let codec = registry.lookup("Array(Nullable(String))").unwrap();
/// assert_eq!(codec.type_name(), "Array(Nullable(String))");
/// ```
pub struct TypeRegistry {
    factories: HashMap<String, CodecFactory>,
    cache: RwLock<HashMap<String, Arc<Codec>>>,
}

impl TypeRegistry {
    /// Creates a registry with no factories; every type is passthrough.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry with all built-in ClickHouse types registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();

        for (name, bits, signed) in [
            ("Int8", 8, true),
            ("Int16", 16, true),
            ("Int32", 32, true),
            ("Int64", 64, true),
            ("Int128", 128, true),
            ("UInt8", 8, false),
            ("UInt16", 16, false),
            ("UInt32", 32, false),
            ("UInt64", 64, false),
            ("UInt128", 128, false),
        ] {
            registry.register(name, move |node, _| {
                simple(node, CodecKind::Integer { bits, signed })
            });
        }
        registry.register("Float32", |node, _| simple(node, CodecKind::Float { bits: 32 }));
        registry.register("Float64", |node, _| simple(node, CodecKind::Float { bits: 64 }));

        registry.register("Decimal", build_decimal);
        for (name, precision) in [
            ("Decimal32", 9),
            ("Decimal64", 18),
            ("Decimal128", 38),
            ("Decimal256", 76),
        ] {
            registry.register(name, move |node, _| {
                let scale = integer_arg(node, 0)?;
                decimal(node, precision, scale)
            });
        }

        registry.register("String", |node, _| {
            simple(node, CodecKind::String { fixed_length: None })
        });
        registry.register("FixedString", |node, _| {
            let length = integer_arg(node, 0)?;
            if node.args.len() != 1 || length == 0 {
                return Err(Error::invalid_type(node.to_string(), "expected one positive length"));
            }
            Ok(Codec::new(
                node.to_string(),
                CodecKind::String {
                    fixed_length: Some(length as usize),
                },
            ))
        });
        registry.register("Bool", |node, _| simple(node, CodecKind::Boolean));
        registry.register("Boolean", |node, _| simple(node, CodecKind::Boolean));
        registry.register("UUID", |node, _| simple(node, CodecKind::Uuid));

        registry.register("Date", |node, _| temporal(node, TemporalKind::Date, None));
        registry.register("Date32", |node, _| temporal(node, TemporalKind::Date32, None));
        registry.register("DateTime", |node, _| {
            let timezone = node.args.first().map(string_literal).transpose()?;
            if node.args.len() > 1 {
                return Err(Error::invalid_type(node.to_string(), "expected at most a timezone"));
            }
            temporal(node, TemporalKind::DateTime, timezone)
        });
        registry.register("DateTime64", |node, _| {
            let precision = integer_arg(node, 0)?;
            if precision > 9 || node.args.len() > 2 {
                return Err(Error::invalid_type(node.to_string(), "precision must be 0..=9"));
            }
            let timezone = node.args.get(1).map(string_literal).transpose()?;
            temporal(node, TemporalKind::DateTime64(precision), timezone)
        });

        registry.register("Enum8", |node, _| build_enum(node, 8));
        registry.register("Enum16", |node, _| build_enum(node, 16));
        registry.register("Enum", |node, _| build_enum(node, 16));

        registry.register("Array", |node, registry| {
            let [element] = children::<1>(node, registry)?;
            Ok(Codec::new(
                node.to_string(),
                CodecKind::Array {
                    element: Box::new(element),
                },
            ))
        });
        registry.register("Map", |node, registry| {
            let [key, value] = children::<2>(node, registry)?;
            Ok(Codec::new(
                node.to_string(),
                CodecKind::Map {
                    key: Box::new(key),
                    value: Box::new(value),
                },
            ))
        });
        registry.register("Tuple", |node, registry| {
            let elements = node
                .args
                .iter()
                .map(|arg| match arg.field {
                    Some(_) => registry.build(&TypeNode {
                        field: None,
                        ..arg.clone()
                    }),
                    None => registry.build(arg),
                })
                .collect::<Result<Vec<_>>>()?;
            if elements.is_empty() {
                return Err(Error::invalid_type(node.to_string(), "tuple needs elements"));
            }
            Ok(Codec::new(node.to_string(), CodecKind::Tuple { elements }))
        });
        registry.register("Nullable", |node, registry| {
            let [inner] = children::<1>(node, registry)?;
            Ok(Codec::new(
                node.to_string(),
                CodecKind::Nullable {
                    inner: Box::new(inner),
                },
            ))
        });
        registry.register("LowCardinality", |node, registry| {
            let [inner] = children::<1>(node, registry)?;
            Ok(Codec::new(
                node.to_string(),
                CodecKind::LowCardinality {
                    inner: Box::new(inner),
                },
            ))
        });

        registry
    }

    /// Registers (or replaces) the factory for a type name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&TypeNode, &TypeRegistry) -> Result<Codec> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self.cache.get_mut().clear();
    }

    /// Returns `true` if a factory is registered under `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Returns the codec for a type string, parsing and building it on first use.
    ///
    /// Unknown type names yield a passthrough codec rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] for malformed declarations and
    /// [`Error::InvalidType`] for known types with unusable arguments.
    pub fn lookup(&self, type_string: &str) -> Result<Arc<Codec>> {
        if let Some(codec) = self.cache.read().get(type_string) {
            return Ok(codec.clone());
        }

        let node = parse(type_string)?;
        let codec = Arc::new(self.build(&node)?);
        tracing::trace!(type_name = %type_string, "Built codec");

        let mut cache = self.cache.write();
        Ok(cache
            .entry(type_string.to_string())
            .or_insert(codec)
            .clone())
    }

    /// Builds a codec tree for an already-parsed node, without caching.
    pub fn build(&self, node: &TypeNode) -> Result<Codec> {
        match self.factories.get(&node.name) {
            Some(factory) => factory(node, self),
            None => Ok(Codec::new(node.to_string(), CodecKind::Passthrough)),
        }
    }

    /// Number of cached codecs.
    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("TypeRegistry")
            .field("types", &names)
            .field("cached", &self.cached_len())
            .finish()
    }
}

fn simple(node: &TypeNode, kind: CodecKind) -> Result<Codec> {
    if !node.args.is_empty() {
        return Err(Error::invalid_type(node.to_string(), "takes no arguments"));
    }
    Ok(Codec::new(node.to_string(), kind))
}

fn temporal(node: &TypeNode, kind: TemporalKind, timezone: Option<String>) -> Result<Codec> {
    if matches!(kind, TemporalKind::Date | TemporalKind::Date32) && !node.args.is_empty() {
        return Err(Error::invalid_type(node.to_string(), "takes no arguments"));
    }
    Ok(Codec::new(
        node.to_string(),
        CodecKind::Temporal { kind, timezone },
    ))
}

fn children<const N: usize>(node: &TypeNode, registry: &TypeRegistry) -> Result<[Codec; N]> {
    let built = node
        .args
        .iter()
        .map(|arg| registry.build(arg))
        .collect::<Result<Vec<_>>>()?;
    built.try_into().map_err(|_: Vec<Codec>| {
        Error::invalid_type(node.to_string(), format!("expected {} type arguments", N))
    })
}

fn integer_arg(node: &TypeNode, index: usize) -> Result<u32> {
    node.args
        .get(index)
        .and_then(TypeNode::as_integer)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| {
            Error::invalid_type(
                node.to_string(),
                format!("argument {} must be a non-negative integer", index + 1),
            )
        })
}

fn string_literal(node: &TypeNode) -> Result<String> {
    if node.is_string_literal() {
        if let Some(s) = unquote(&node.name) {
            return Ok(s);
        }
    }
    Err(Error::invalid_type(node.name.clone(), "expected a quoted string"))
}

fn build_decimal(node: &TypeNode, _: &TypeRegistry) -> Result<Codec> {
    let precision = integer_arg(node, 0)?;
    let scale = if node.args.len() > 1 {
        integer_arg(node, 1)?
    } else {
        0
    };
    if node.args.len() > 2 {
        return Err(Error::invalid_type(node.to_string(), "expected (precision, scale)"));
    }
    decimal(node, precision, scale)
}

fn decimal(node: &TypeNode, precision: u32, scale: u32) -> Result<Codec> {
    if precision == 0 || precision > 76 || scale > precision {
        return Err(Error::invalid_type(
            node.to_string(),
            format!("precision {} / scale {} out of range", precision, scale),
        ));
    }
    Ok(Codec::new(
        node.to_string(),
        CodecKind::Decimal { precision, scale },
    ))
}

/// Enum entries are explicit (`'a' = 5`) or auto-numbered. Numbering starts at
/// 1 until an explicit value appears; after that it continues from the largest
/// explicit value seen plus one.
fn build_enum(node: &TypeNode, bits: u32) -> Result<Codec> {
    if node.args.is_empty() {
        return Err(Error::invalid_type(node.to_string(), "enum needs entries"));
    }
    let (min, max) = if bits == 8 {
        (i8::MIN as i64, i8::MAX as i64)
    } else {
        (i16::MIN as i64, i16::MAX as i64)
    };

    let mut next: i64 = 1;
    let mut max_explicit: Option<i64> = None;
    let mut entries = Vec::with_capacity(node.args.len());
    for arg in &node.args {
        let label = string_literal(arg)?;
        let value = arg.value.unwrap_or(next);
        if value < min || value > max {
            return Err(Error::invalid_type(
                node.to_string(),
                format!("value {} for '{}' does not fit Enum{}", value, label, bits),
            ));
        }
        if entries.iter().any(|(existing, _)| *existing == label) {
            return Err(Error::invalid_type(
                node.to_string(),
                format!("duplicate label '{}'", label),
            ));
        }
        match arg.value {
            Some(explicit) => {
                let highest = max_explicit.map_or(explicit, |seen| seen.max(explicit));
                max_explicit = Some(highest);
                next = highest + 1;
            }
            None => next = value + 1,
        }
        entries.push((label, value));
    }

    Ok(Codec::new(node.to_string(), CodecKind::Enum { bits, entries }))
}
