//! Validation of channel names and property paths.
//!
//! The rules are byte-oriented: names are ASCII and anything outside the
//! permitted set is rejected, including multi-byte UTF-8 sequences.
//!
//! A property path is a non-empty slash-prefixed string like `/a/b/c` with no
//! empty segments and no trailing slash. A channel name is a single non-empty
//! segment without slashes.

use crate::errors::Error;

fn is_channel_byte(b: u8) -> bool {
	b.is_ascii_alphanumeric()
		|| matches!(
			b,
			b'_' | b'-' | b':' | b'.' | b',' | b'[' | b']' | b'{' | b'}' | b'|'
		)
}

fn is_property_byte(b: u8) -> bool {
	is_channel_byte(b) || matches!(b, b'/' | b'<' | b'>')
}

/// Checks a property path against the naming grammar.
pub fn validate_property(property: &str) -> Result<(), Error> {
	let bytes = property.as_bytes();

	if bytes.first() != Some(&b'/') {
		return Err(Error::InvalidProperty {
			message: "property names must start with a '/' character".into(),
		});
	}
	if bytes.len() == 1 {
		return Err(Error::InvalidProperty {
			message: "the root element ('/') is not a valid property name".into(),
		});
	}

	for (i, &b) in bytes.iter().enumerate().skip(1) {
		if !is_property_byte(b) {
			return Err(Error::InvalidProperty {
				message: "property names can only include the ASCII characters A-Z, a-z, 0-9, \
				          '_', '-', ':', '.', ',', '[', ']', '{', '}', '<' and '>', as well as \
				          '/' as a separator"
					.into(),
			});
		}
		if b == b'/' && bytes[i - 1] == b'/' {
			return Err(Error::InvalidProperty {
				message: "property names cannot have two or more consecutive '/' characters"
					.into(),
			});
		}
	}

	if bytes.last() == Some(&b'/') {
		return Err(Error::InvalidProperty {
			message: "property names cannot end with a '/' character".into(),
		});
	}

	Ok(())
}

/// Checks a property base against the naming grammar.
///
/// The empty string and `/` are accepted as wildcards meaning the whole
/// channel; anything else must be a valid property path.
pub fn validate_property_base(base: &str) -> Result<(), Error> {
	if base.is_empty() || base == "/" {
		return Ok(());
	}
	validate_property(base)
}

/// Checks a channel name against the naming grammar.
pub fn validate_channel(channel: &str) -> Result<(), Error> {
	if channel.is_empty() {
		return Err(Error::InvalidChannel {
			message: "channel name cannot be an empty string".into(),
		});
	}

	if !channel.bytes().all(is_channel_byte) {
		return Err(Error::InvalidChannel {
			message: "channel names can only include the ASCII characters A-Z, a-z, 0-9, '{', \
			          '}', '|', ']', '[', ':', ',', '.', '_', and '-'"
				.into(),
		});
	}

	Ok(())
}

/// True when `property` is a well-formed property path.
#[must_use]
pub fn is_valid_property(property: &str) -> bool {
	validate_property(property).is_ok()
}

/// True when `channel` is a well-formed channel name.
#[must_use]
pub fn is_valid_channel(channel: &str) -> bool {
	validate_channel(channel).is_ok()
}
