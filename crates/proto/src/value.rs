//! Typed configuration values.
//!
//! Every value stored by settled is a [`Value`]: a tagged scalar or a
//! heterogeneous array of values. The tag travels with the value both on the
//! wire (as the serde variant, in declaration order) and on disk (as the tag
//! names defined by [`ValueKind::as_tag`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type tag of a configuration [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
	/// No value. Branch nodes and removal notifications carry this tag.
	Empty,
	/// Boolean.
	Bool,
	/// Signed 16-bit integer.
	Int16,
	/// Unsigned 16-bit integer.
	Uint16,
	/// Signed 32-bit integer.
	Int,
	/// Unsigned 32-bit integer.
	Uint,
	/// Signed 64-bit integer.
	Int64,
	/// Unsigned 64-bit integer.
	Uint64,
	/// Double-precision float.
	Double,
	/// UTF-8 string.
	String,
	/// Heterogeneous array; each element carries its own tag.
	Array,
}

impl ValueKind {
	/// The on-disk tag name for this kind.
	#[must_use]
	pub const fn as_tag(self) -> &'static str {
		match self {
			Self::Empty => "empty",
			Self::Bool => "bool",
			Self::Int16 => "int16",
			Self::Uint16 => "uint16",
			Self::Int => "int",
			Self::Uint => "uint",
			Self::Int64 => "int64",
			Self::Uint64 => "uint64",
			Self::Double => "double",
			Self::String => "string",
			Self::Array => "array",
		}
	}

	/// Parses an on-disk tag name.
	#[must_use]
	pub fn from_tag(tag: &str) -> Option<Self> {
		Some(match tag {
			"empty" => Self::Empty,
			"bool" => Self::Bool,
			"int16" => Self::Int16,
			"uint16" => Self::Uint16,
			"int" => Self::Int,
			"uint" => Self::Uint,
			"int64" => Self::Int64,
			"uint64" => Self::Uint64,
			"double" => Self::Double,
			"string" => Self::String,
			"array" => Self::Array,
			_ => return None,
		})
	}

	/// Whether values of this kind carry a scalar literal.
	#[must_use]
	pub const fn is_scalar(self) -> bool {
		!matches!(self, Self::Empty | Self::Array)
	}
}

/// A configuration value.
///
/// Equality is tag-equal and content-equal; arrays compare element-wise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
	/// No value.
	Empty,
	/// Boolean.
	Bool(bool),
	/// Signed 16-bit integer.
	Int16(i16),
	/// Unsigned 16-bit integer.
	Uint16(u16),
	/// Signed 32-bit integer.
	Int(i32),
	/// Unsigned 32-bit integer.
	Uint(u32),
	/// Signed 64-bit integer.
	Int64(i64),
	/// Unsigned 64-bit integer.
	Uint64(u64),
	/// Double-precision float.
	Double(f64),
	/// UTF-8 string.
	String(String),
	/// Heterogeneous array.
	Array(Vec<Value>),
}

/// Failure to parse a scalar literal into a [`Value`] of a given kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {} literal: {input:?}", kind.as_tag())]
pub struct ValueParseError {
	/// The kind the literal was parsed as.
	pub kind: ValueKind,
	/// The offending input.
	pub input: String,
}

impl Value {
	/// The type tag of this value.
	#[must_use]
	pub const fn kind(&self) -> ValueKind {
		match self {
			Self::Empty => ValueKind::Empty,
			Self::Bool(_) => ValueKind::Bool,
			Self::Int16(_) => ValueKind::Int16,
			Self::Uint16(_) => ValueKind::Uint16,
			Self::Int(_) => ValueKind::Int,
			Self::Uint(_) => ValueKind::Uint,
			Self::Int64(_) => ValueKind::Int64,
			Self::Uint64(_) => ValueKind::Uint64,
			Self::Double(_) => ValueKind::Double,
			Self::String(_) => ValueKind::String,
			Self::Array(_) => ValueKind::Array,
		}
	}

	/// True for [`Value::Empty`].
	#[must_use]
	pub const fn is_empty(&self) -> bool {
		matches!(self, Self::Empty)
	}

	/// Renders a scalar value as its on-disk literal.
	///
	/// Returns `None` for `Empty` and `Array`, which have no scalar literal.
	#[must_use]
	pub fn to_literal(&self) -> Option<String> {
		match self {
			Self::Empty | Self::Array(_) => None,
			Self::Bool(b) => Some(if *b { "true".into() } else { "false".into() }),
			Self::Int16(n) => Some(n.to_string()),
			Self::Uint16(n) => Some(n.to_string()),
			Self::Int(n) => Some(n.to_string()),
			Self::Uint(n) => Some(n.to_string()),
			Self::Int64(n) => Some(n.to_string()),
			Self::Uint64(n) => Some(n.to_string()),
			Self::Double(d) => Some(d.to_string()),
			Self::String(s) => Some(s.clone()),
		}
	}

	/// Parses an on-disk literal into a value of the given kind.
	///
	/// `Empty` ignores the literal; `Array` has no literal form and fails.
	pub fn from_literal(kind: ValueKind, input: &str) -> Result<Self, ValueParseError> {
		let err = || ValueParseError {
			kind,
			input: input.to_string(),
		};
		Ok(match kind {
			ValueKind::Empty => Self::Empty,
			ValueKind::Array => return Err(err()),
			ValueKind::Bool => match input {
				"true" => Self::Bool(true),
				"false" => Self::Bool(false),
				_ => return Err(err()),
			},
			ValueKind::Int16 => Self::Int16(input.parse().map_err(|_| err())?),
			ValueKind::Uint16 => Self::Uint16(input.parse().map_err(|_| err())?),
			ValueKind::Int => Self::Int(input.parse().map_err(|_| err())?),
			ValueKind::Uint => Self::Uint(input.parse().map_err(|_| err())?),
			ValueKind::Int64 => Self::Int64(input.parse().map_err(|_| err())?),
			ValueKind::Uint64 => Self::Uint64(input.parse().map_err(|_| err())?),
			ValueKind::Double => Self::Double(input.parse().map_err(|_| err())?),
			ValueKind::String => Self::String(input.to_string()),
		})
	}

	/// Attempts to represent this value with the `target` tag.
	///
	/// Same-tag values copy. Integers convert when the payload fits the target
	/// range; doubles convert to integers only when the conversion is exact.
	/// Strings parse to numerics and booleans, and scalars render to strings.
	/// Anything else is not coercible.
	#[must_use]
	pub fn coerce(&self, target: ValueKind) -> Option<Value> {
		if self.kind() == target {
			return Some(self.clone());
		}

		match target {
			ValueKind::Empty | ValueKind::Array => None,
			ValueKind::String => self.to_literal().map(Value::String),
			ValueKind::Bool => match self {
				Self::String(s) => Self::from_literal(ValueKind::Bool, s).ok(),
				_ => None,
			},
			ValueKind::Double => match self {
				Self::String(s) => Self::from_literal(ValueKind::Double, s).ok(),
				_ => self.as_i128().map(|n| Value::Double(n as f64)),
			},
			ValueKind::Int16 => self.coerce_integer(target, |n| i16::try_from(n).ok().map(Value::Int16)),
			ValueKind::Uint16 => self.coerce_integer(target, |n| u16::try_from(n).ok().map(Value::Uint16)),
			ValueKind::Int => self.coerce_integer(target, |n| i32::try_from(n).ok().map(Value::Int)),
			ValueKind::Uint => self.coerce_integer(target, |n| u32::try_from(n).ok().map(Value::Uint)),
			ValueKind::Int64 => self.coerce_integer(target, |n| i64::try_from(n).ok().map(Value::Int64)),
			ValueKind::Uint64 => self.coerce_integer(target, |n| u64::try_from(n).ok().map(Value::Uint64)),
		}
	}

	fn coerce_integer(
		&self,
		target: ValueKind,
		narrow: impl Fn(i128) -> Option<Value>,
	) -> Option<Value> {
		match self {
			Self::String(s) => Self::from_literal(target, s).ok(),
			Self::Double(d) => {
				// Only exact conversions; truncation would be lossy.
				if d.fract() == 0.0 && d.is_finite() {
					narrow(*d as i128)
				} else {
					None
				}
			}
			_ => self.as_i128().and_then(narrow),
		}
	}

	fn as_i128(&self) -> Option<i128> {
		match self {
			Self::Int16(n) => Some(i128::from(*n)),
			Self::Uint16(n) => Some(i128::from(*n)),
			Self::Int(n) => Some(i128::from(*n)),
			Self::Uint(n) => Some(i128::from(*n)),
			Self::Int64(n) => Some(i128::from(*n)),
			Self::Uint64(n) => Some(i128::from(*n)),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn literal_round_trip() {
		let scalars = [
			Value::Bool(true),
			Value::Bool(false),
			Value::Int16(-12345),
			Value::Uint16(54321),
			Value::Int(-42),
			Value::Uint(42),
			Value::Int64(-5_000_000_000),
			Value::Uint64(42_000_000_000),
			Value::Double(42.4242),
			Value::String("test string".into()),
		];
		for v in scalars {
			let literal = v.to_literal().expect("scalar has a literal");
			assert_eq!(Value::from_literal(v.kind(), &literal), Ok(v));
		}
	}

	#[test]
	fn empty_and_array_have_no_literal() {
		assert_eq!(Value::Empty.to_literal(), None);
		assert_eq!(Value::Array(vec![Value::Bool(true)]).to_literal(), None);
		assert!(Value::from_literal(ValueKind::Array, "x").is_err());
	}

	#[test]
	fn bad_literals_fail() {
		assert!(Value::from_literal(ValueKind::Bool, "TRUE").is_err());
		assert!(Value::from_literal(ValueKind::Int, "forty-two").is_err());
		assert!(Value::from_literal(ValueKind::Uint, "-1").is_err());
	}

	#[test]
	fn widening_succeeds() {
		assert_eq!(
			Value::Int(7).coerce(ValueKind::Int64),
			Some(Value::Int64(7))
		);
		assert_eq!(
			Value::Uint16(9).coerce(ValueKind::Uint64),
			Some(Value::Uint64(9))
		);
		assert_eq!(
			Value::Int(-3).coerce(ValueKind::Double),
			Some(Value::Double(-3.0))
		);
	}

	#[test]
	fn narrowing_checks_range() {
		assert_eq!(
			Value::Int64(1).coerce(ValueKind::Int),
			Some(Value::Int(1))
		);
		assert_eq!(Value::Int64(i64::from(i32::MAX) + 1).coerce(ValueKind::Int), None);
		assert_eq!(Value::Int(-1).coerce(ValueKind::Uint), None);
	}

	#[test]
	fn double_to_integer_must_be_exact() {
		assert_eq!(
			Value::Double(8.0).coerce(ValueKind::Int),
			Some(Value::Int(8))
		);
		assert_eq!(Value::Double(8.5).coerce(ValueKind::Int), None);
	}

	#[test]
	fn string_coercions() {
		assert_eq!(
			Value::String("17".into()).coerce(ValueKind::Int),
			Some(Value::Int(17))
		);
		assert_eq!(
			Value::Int(17).coerce(ValueKind::String),
			Some(Value::String("17".into()))
		);
		assert_eq!(
			Value::String("true".into()).coerce(ValueKind::Bool),
			Some(Value::Bool(true))
		);
		assert_eq!(Value::String("maybe".into()).coerce(ValueKind::Bool), None);
	}

	#[test]
	fn array_equality_is_element_wise() {
		let a = Value::Array(vec![Value::Bool(true), Value::Int64(5_000_000_000)]);
		let b = Value::Array(vec![Value::Bool(true), Value::Int64(5_000_000_000)]);
		let c = Value::Array(vec![Value::Bool(true), Value::Uint64(5_000_000_000)]);
		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	#[test]
	fn tag_names_round_trip() {
		for kind in [
			ValueKind::Empty,
			ValueKind::Bool,
			ValueKind::Int16,
			ValueKind::Uint16,
			ValueKind::Int,
			ValueKind::Uint,
			ValueKind::Int64,
			ValueKind::Uint64,
			ValueKind::Double,
			ValueKind::String,
			ValueKind::Array,
		] {
			assert_eq!(ValueKind::from_tag(kind.as_tag()), Some(kind));
		}
		assert_eq!(ValueKind::from_tag("float"), None);
	}
}
