//! The configuration backend interface.
//!
//! A backend is a pluggable storage implementation. The daemon owns an
//! ordered list of them and multiplexes every request across that list; see
//! [`crate::core::DaemonCore`] for the routing policy.
//!
//! Backends report effective-value changes through a registered callback.
//! The callback runs synchronously inside the mutating call, after the
//! in-memory store has been updated; the daemon defers the actual event
//! emission to a later scheduler turn.

use std::collections::BTreeMap;

use settled_proto::errors::Error;
use settled_proto::value::Value;

/// Callback invoked with `(channel, property)` after a user-facing set or
/// reset changes the effective value of a property.
pub type ChangeCallback = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Operations a configuration store must expose to the daemon.
///
/// Name validation happens at the daemon boundary; implementations may assume
/// channel names and property paths are well formed.
pub trait Backend: Send {
	/// The identifier this backend registers under.
	fn id(&self) -> &'static str;

	/// Performs any setup the backend needs before serving requests.
	///
	/// The daemon drops backends whose initialization fails; if none survive
	/// it refuses to start.
	fn initialize(&mut self) -> Result<(), Error>;

	/// Stores `value` at `property` on `channel`, creating the property (and
	/// the channel) as needed.
	///
	/// Fails with [`Error::PermissionDenied`] when a read-only layer locks
	/// the property.
	fn set(&mut self, channel: &str, property: &str, value: Value) -> Result<(), Error>;

	/// Reads the effective value of `property` on `channel`.
	fn get(&mut self, channel: &str, property: &str) -> Result<Value, Error>;

	/// Reads every property under `property_base` on `channel`.
	///
	/// An empty string or `/` for `property_base` means the whole channel.
	fn get_all(
		&mut self,
		channel: &str,
		property_base: &str,
	) -> Result<BTreeMap<String, Value>, Error>;

	/// Whether `property` currently has a value on `channel`.
	fn exists(&mut self, channel: &str, property: &str) -> Result<bool, Error>;

	/// Removes `property` from the writable layer of `channel`.
	///
	/// With `recursive`, the whole subtree under `property` goes too, and an
	/// empty string or `/` resets the entire channel. Resetting a property
	/// the writable layer does not carry is a no-op; a read-only layer may
	/// still provide a default afterwards.
	fn reset(&mut self, channel: &str, property: &str, recursive: bool) -> Result<(), Error>;

	/// Lists every channel this backend has data for.
	///
	/// The daemon takes care of de-duplicating across layers and backends.
	fn list_channels(&mut self) -> Result<Vec<String>, Error>;

	/// Whether `property` on `channel` is locked by system policy.
	fn is_property_locked(&mut self, channel: &str, property: &str) -> Result<bool, Error>;

	/// Persists any dirty state to storage.
	fn flush(&mut self) -> Result<(), Error>;

	/// Registers the change callback. Replaces any previous registration.
	fn register_change_callback(&mut self, callback: ChangeCallback);
}
