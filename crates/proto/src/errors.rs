//! Error taxonomy shared by the daemon and the client library.
//!
//! The same enum serves as the in-process error type and as the wire error
//! payload, so a failure reported by a backend reaches the client unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by settled operations, on both sides of the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Error {
	/// Generic failure that fits no other category.
	#[error("{0}")]
	Unknown(String),

	/// The channel has no configuration data in any backend.
	#[error("channel \"{channel}\" does not exist")]
	ChannelNotFound {
		/// The channel that was requested.
		channel: String,
	},

	/// The property does not exist on the channel.
	#[error("property \"{property}\" does not exist on channel \"{channel}\"")]
	PropertyNotFound {
		/// The channel that was consulted.
		channel: String,
		/// The property that was requested.
		property: String,
	},

	/// A backend failed to read its store.
	#[error("failed to read configuration data: {message}")]
	ReadFailure {
		/// Description of the failure.
		message: String,
	},

	/// A backend failed to persist its store.
	#[error("failed to write configuration data: {message}")]
	WriteFailure {
		/// Description of the failure.
		message: String,
	},

	/// The property is locked by system policy.
	#[error("permission denied while modifying property \"{property}\" on channel \"{channel}\"")]
	PermissionDenied {
		/// The channel the write targeted.
		channel: String,
		/// The locked property.
		property: String,
	},

	/// A bug or a broken transport.
	#[error("internal error: {message}")]
	InternalError {
		/// Description of the failure.
		message: String,
	},

	/// No backend could be initialized; the daemon refuses to start.
	#[error("no backends could be started")]
	NoBackend,

	/// The property name violates the naming grammar.
	#[error("{message}")]
	InvalidProperty {
		/// Human-readable description of the violation.
		message: String,
	},

	/// The channel name violates the naming grammar.
	#[error("{message}")]
	InvalidChannel {
		/// Human-readable description of the violation.
		message: String,
	},
}

impl Error {
	/// Shorthand for [`Error::InternalError`].
	pub fn internal(message: impl Into<String>) -> Self {
		Self::InternalError {
			message: message.into(),
		}
	}

	/// Shorthand for [`Error::ReadFailure`].
	pub fn read_failure(message: impl ToString) -> Self {
		Self::ReadFailure {
			message: message.to_string(),
		}
	}

	/// Shorthand for [`Error::WriteFailure`].
	pub fn write_failure(message: impl ToString) -> Self {
		Self::WriteFailure {
			message: message.to_string(),
		}
	}

	/// True for the two "the key simply isn't there" errors.
	///
	/// These are recoverable in contexts that only need to know whether a
	/// value exists, such as the speculative prior-value lookup before a
	/// cached write.
	#[must_use]
	pub const fn is_not_found(&self) -> bool {
		matches!(
			self,
			Self::ChannelNotFound { .. } | Self::PropertyNotFound { .. }
		)
	}
}
