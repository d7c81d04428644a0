//! The ClickHouse type system: declaration parser, codecs and registry.
//!
//! A type string such as `Array(Tuple(String, UInt64))` is parsed into a
//! [`TypeNode`] tree, which the [`TypeRegistry`] turns into a [`Codec`] tree.

mod codec;
mod parser;
mod registry;
pub(crate) mod scanner;

pub use codec::{Codec, CodecKind, TemporalKind};
pub use parser::{parse, ParseError, TypeNode};
pub use registry::{CodecFactory, TypeRegistry};
