//! Wire types for the settled IPC protocol.
//!
//! This module defines the data structures exchanged between client sessions
//! and the settled daemon: requests against the configuration store, their
//! responses, and the asynchronous change events the daemon broadcasts to
//! subscribed sessions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::value::Value;

/// Unique identifier for requests and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Classification of frames transmitted over the IPC socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IpcFrame {
	/// A request from a client to the daemon.
	Request(Request),
	/// A response from the daemon to a client.
	Response(Response),
	/// An async event from the daemon to a subscribed client.
	Event(Event),
}

/// A request from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	/// Unique identifier for this request.
	pub id: RequestId,
	/// The request payload.
	pub payload: RequestPayload,
}

impl Request {
	/// Create a new request with a placeholder ID.
	///
	/// The transport assigns the real ID when the request is sent.
	#[must_use]
	pub fn new(payload: RequestPayload) -> Self {
		Self {
			id: RequestId(0),
			payload,
		}
	}
}

/// Request payload variants: the daemon's method surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestPayload {
	/// Store `value` at `property` on `channel`.
	SetProperty {
		/// Target channel.
		channel: String,
		/// Target property path.
		property: String,
		/// The value to store.
		value: Value,
	},
	/// Read the effective value of `property` on `channel`.
	GetProperty {
		/// Target channel.
		channel: String,
		/// Target property path.
		property: String,
	},
	/// Read every property under `property_base` on `channel`.
	///
	/// An empty string or `/` means the whole channel.
	GetAllProperties {
		/// Target channel.
		channel: String,
		/// Subtree to read, or a wildcard.
		property_base: String,
	},
	/// Check whether `property` exists on `channel`.
	PropertyExists {
		/// Target channel.
		channel: String,
		/// Target property path.
		property: String,
	},
	/// Remove `property` (and, if `recursive`, its subtree) from the
	/// writable layer of every backend.
	ResetProperty {
		/// Target channel.
		channel: String,
		/// Property path, or a wildcard base for a recursive reset.
		property: String,
		/// Whether to reset the whole subtree.
		recursive: bool,
	},
	/// List every channel known to any backend.
	ListChannels,
	/// Check whether `property` is locked by system policy.
	IsPropertyLocked {
		/// Target channel.
		channel: String,
		/// Target property path.
		property: String,
	},
	/// Subscribe this session to change events.
	Subscribe,
}

/// A response from the daemon to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	/// The request this responds to.
	pub request_id: RequestId,
	/// The response payload when successful.
	pub payload: Option<ResponsePayload>,
	/// The error when the request failed.
	pub error: Option<Error>,
}

/// Response payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
	/// The operation completed and returns nothing.
	Done,
	/// A single property value.
	Value(Value),
	/// A map of property paths to values.
	Properties(BTreeMap<String, Value>),
	/// Whether the property exists.
	Exists(bool),
	/// Whether the property is locked.
	Locked(bool),
	/// The known channel names.
	Channels(Vec<String>),
	/// Subscription acknowledged.
	Subscribed,
}

/// Async event from the daemon to a subscribed client (no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
	/// The effective value of a property changed.
	PropertyChanged {
		/// The channel the property lives on.
		channel: String,
		/// The property path.
		property: String,
		/// The new effective value.
		value: Value,
	},
	/// A property disappeared from every backend.
	PropertyRemoved {
		/// The channel the property lived on.
		channel: String,
		/// The property path.
		property: String,
	},
}

impl Event {
	/// The channel this event concerns.
	#[must_use]
	pub fn channel(&self) -> &str {
		match self {
			Self::PropertyChanged { channel, .. } | Self::PropertyRemoved { channel, .. } => {
				channel
			}
		}
	}
}
