//! Typed channel facade.
//!
//! A [`Channel`] wraps a [`Cache`] with typed getters and setters. Typed
//! getters never fail: a property that is absent, or present but not
//! coercible to the requested type, yields the caller's default. Anything
//! that needs real error reporting goes through the untyped
//! [`Channel::get_property`]/[`Channel::set_property`] pair.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use settled_proto::errors::Error;
use settled_proto::types::{RequestPayload, ResponsePayload};
use settled_proto::value::{Value, ValueKind};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{Cache, PropertyEvent};
use crate::client::Client;

static NAMED_STRUCTS: OnceLock<Mutex<HashMap<String, Vec<ValueKind>>>> = OnceLock::new();

/// Registers a named struct for [`Channel::get_named_struct`] and
/// [`Channel::set_named_struct`].
///
/// A named struct is an ordered list of member types, stored on the wire as
/// a heterogeneous array. The first registration of a name wins.
pub fn register_named_struct(struct_name: &str, member_kinds: &[ValueKind]) {
	let registry = NAMED_STRUCTS.get_or_init(Default::default);
	let mut registry = registry.lock().unwrap();
	if registry.contains_key(struct_name) {
		warn!(struct_name, "named struct is already registered");
		return;
	}
	registry.insert(struct_name.to_string(), member_kinds.to_vec());
}

fn named_struct(struct_name: &str) -> Option<Vec<ValueKind>> {
	NAMED_STRUCTS
		.get()
		.and_then(|registry| registry.lock().unwrap().get(struct_name).cloned())
}

/// Typed access to the properties of one channel.
pub struct Channel {
	client: Client,
	cache: Arc<Cache>,
	property_base: Option<String>,
}

impl Channel {
	/// Opens a channel with its own cache.
	#[must_use]
	pub fn new(client: &Client, channel_name: &str) -> Self {
		Self {
			client: client.clone(),
			cache: Arc::new(Cache::new(client.clone(), channel_name)),
			property_base: None,
		}
	}

	/// Opens a channel whose property arguments are all relative to
	/// `property_base`, and warms the cache with that subtree.
	pub async fn with_property_base(
		client: &Client,
		channel_name: &str,
		property_base: &str,
	) -> Self {
		let channel = Self {
			client: client.clone(),
			cache: Arc::new(Cache::new(client.clone(), channel_name)),
			property_base: Some(property_base.trim_end_matches('/').to_string()),
		};
		if let Err(e) = channel.cache.prefetch(property_base).await {
			debug!(channel = channel_name, property_base, error = %e, "prefetch failed");
		}
		channel
	}

	pub(crate) fn from_parts(client: Client, cache: Arc<Cache>) -> Self {
		Self {
			client,
			cache,
			property_base: None,
		}
	}

	/// The channel name.
	#[must_use]
	pub fn name(&self) -> &str {
		self.cache.channel_name()
	}

	/// A fresh subscription to this channel's local change events.
	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<PropertyEvent> {
		self.cache.subscribe()
	}

	fn resolve(&self, property: &str) -> String {
		match &self.property_base {
			Some(base) => format!("{base}{property}"),
			None => property.to_string(),
		}
	}

	/// Whether `property` currently has a value.
	pub async fn has_property(&self, property: &str) -> bool {
		let full = self.resolve(property);
		matches!(self.cache.lookup(&full).await, Ok(Some(_)))
	}

	/// Whether `property` is locked by system policy.
	///
	/// Errors read as "not locked".
	pub async fn is_property_locked(&self, property: &str) -> bool {
		let full = self.resolve(property);
		let result = self
			.client
			.call(RequestPayload::IsPropertyLocked {
				channel: self.name().to_string(),
				property: full,
			})
			.await;
		match result {
			Ok(ResponsePayload::Locked(locked)) => locked,
			Ok(_) => false,
			Err(e) => {
				debug!(channel = self.name(), property, error = %e, "lock query failed");
				false
			}
		}
	}

	/// Removes `property_base` (and its subtree when `recursive`) from the
	/// user configuration, revealing system defaults where present.
	pub async fn reset_property(&self, property_base: &str, recursive: bool) -> Result<(), Error> {
		let full = match property_base {
			"" | "/" => property_base.to_string(),
			other => self.resolve(other),
		};
		self.cache.reset(&full, recursive).await
	}

	/// Dumps every property under `property_base` (or the channel's base
	/// when `None`) straight from the daemon.
	pub async fn get_properties(
		&self,
		property_base: Option<&str>,
	) -> Result<BTreeMap<String, Value>, Error> {
		let base = match property_base {
			None | Some("") | Some("/") => self.property_base.clone().unwrap_or_else(|| "/".into()),
			Some(other) => self.resolve(other),
		};
		match self
			.client
			.call(RequestPayload::GetAllProperties {
				channel: self.name().to_string(),
				property_base: base,
			})
			.await?
		{
			ResponsePayload::Properties(props) => Ok(props),
			other => Err(Error::internal(format!(
				"unexpected response to GetAllProperties: {other:?}"
			))),
		}
	}

	/// The raw value of `property`.
	///
	/// Unlike the typed getters this surfaces errors, including
	/// [`Error::PropertyNotFound`] for absent properties.
	pub async fn get_property(&self, property: &str) -> Result<Value, Error> {
		let full = self.resolve(property);
		self.cache
			.lookup(&full)
			.await?
			.ok_or_else(|| Error::PropertyNotFound {
				channel: self.name().to_string(),
				property: full,
			})
	}

	/// Stores a raw value at `property`.
	pub async fn set_property(&self, property: &str, value: Value) -> Result<(), Error> {
		let full = self.resolve(property);
		self.cache.set(&full, value).await
	}

	async fn coerced(&self, property: &str, kind: ValueKind) -> Option<Value> {
		let full = self.resolve(property);
		let value = self.cache.lookup(&full).await.ok().flatten()?;
		value.coerce(kind)
	}

	/// String getter; returns `default` when absent or not coercible.
	pub async fn get_string(&self, property: &str, default: &str) -> String {
		match self.coerced(property, ValueKind::String).await {
			Some(Value::String(s)) => s,
			_ => default.to_string(),
		}
	}

	/// String setter.
	pub async fn set_string(&self, property: &str, value: &str) -> Result<(), Error> {
		self.set_property(property, Value::String(value.to_string()))
			.await
	}

	/// `i32` getter; returns `default` when absent or not coercible.
	pub async fn get_int(&self, property: &str, default: i32) -> i32 {
		match self.coerced(property, ValueKind::Int).await {
			Some(Value::Int(n)) => n,
			_ => default,
		}
	}

	/// `i32` setter.
	pub async fn set_int(&self, property: &str, value: i32) -> Result<(), Error> {
		self.set_property(property, Value::Int(value)).await
	}

	/// `u32` getter; returns `default` when absent or not coercible.
	pub async fn get_uint(&self, property: &str, default: u32) -> u32 {
		match self.coerced(property, ValueKind::Uint).await {
			Some(Value::Uint(n)) => n,
			_ => default,
		}
	}

	/// `u32` setter.
	pub async fn set_uint(&self, property: &str, value: u32) -> Result<(), Error> {
		self.set_property(property, Value::Uint(value)).await
	}

	/// `i64` getter; returns `default` when absent or not coercible.
	pub async fn get_int64(&self, property: &str, default: i64) -> i64 {
		match self.coerced(property, ValueKind::Int64).await {
			Some(Value::Int64(n)) => n,
			_ => default,
		}
	}

	/// `i64` setter.
	pub async fn set_int64(&self, property: &str, value: i64) -> Result<(), Error> {
		self.set_property(property, Value::Int64(value)).await
	}

	/// `u64` getter; returns `default` when absent or not coercible.
	pub async fn get_uint64(&self, property: &str, default: u64) -> u64 {
		match self.coerced(property, ValueKind::Uint64).await {
			Some(Value::Uint64(n)) => n,
			_ => default,
		}
	}

	/// `u64` setter.
	pub async fn set_uint64(&self, property: &str, value: u64) -> Result<(), Error> {
		self.set_property(property, Value::Uint64(value)).await
	}

	/// `f64` getter; returns `default` when absent or not coercible.
	pub async fn get_double(&self, property: &str, default: f64) -> f64 {
		match self.coerced(property, ValueKind::Double).await {
			Some(Value::Double(d)) => d,
			_ => default,
		}
	}

	/// `f64` setter.
	pub async fn set_double(&self, property: &str, value: f64) -> Result<(), Error> {
		self.set_property(property, Value::Double(value)).await
	}

	/// Boolean getter; returns `default` when absent or not coercible.
	pub async fn get_bool(&self, property: &str, default: bool) -> bool {
		match self.coerced(property, ValueKind::Bool).await {
			Some(Value::Bool(b)) => b,
			_ => default,
		}
	}

	/// Boolean setter.
	pub async fn set_bool(&self, property: &str, value: bool) -> Result<(), Error> {
		self.set_property(property, Value::Bool(value)).await
	}

	/// The heterogeneous array stored at `property`, element tags intact.
	pub async fn get_arrayv(&self, property: &str) -> Option<Vec<Value>> {
		let full = self.resolve(property);
		match self.cache.lookup(&full).await {
			Ok(Some(Value::Array(values))) => Some(values),
			_ => None,
		}
	}

	/// Stores a heterogeneous array at `property`.
	pub async fn set_arrayv(&self, property: &str, values: Vec<Value>) -> Result<(), Error> {
		self.set_property(property, Value::Array(values)).await
	}

	/// Convenience for arrays whose elements are all strings.
	pub async fn get_string_list(&self, property: &str) -> Option<Vec<String>> {
		let values = self.get_arrayv(property).await?;
		values
			.into_iter()
			.map(|v| match v.coerce(ValueKind::String) {
				Some(Value::String(s)) => Some(s),
				_ => None,
			})
			.collect()
	}

	/// Stores an array of strings at `property`.
	pub async fn set_string_list(
		&self,
		property: &str,
		values: impl IntoIterator<Item = impl Into<String>>,
	) -> Result<(), Error> {
		let values = values
			.into_iter()
			.map(|s| Value::String(s.into()))
			.collect();
		self.set_arrayv(property, values).await
	}

	/// Reads `property` as the registered struct `struct_name`.
	///
	/// Members come back in registration order, coerced to their registered
	/// types; `None` when the property is absent, the struct is unknown, or
	/// the stored array does not fit it.
	pub async fn get_named_struct(
		&self,
		property: &str,
		struct_name: &str,
	) -> Option<Vec<Value>> {
		let kinds = named_struct(struct_name)?;
		let values = self.get_arrayv(property).await?;
		if values.len() != kinds.len() {
			return None;
		}
		values
			.into_iter()
			.zip(kinds)
			.map(|(value, kind)| value.coerce(kind))
			.collect()
	}

	/// Stores `members` at `property` as the registered struct
	/// `struct_name`.
	pub async fn set_named_struct(
		&self,
		property: &str,
		struct_name: &str,
		members: Vec<Value>,
	) -> Result<(), Error> {
		let Some(kinds) = named_struct(struct_name) else {
			return Err(Error::Unknown(format!(
				"named struct \"{struct_name}\" is not registered"
			)));
		};
		if members.len() != kinds.len() {
			return Err(Error::Unknown(format!(
				"named struct \"{struct_name}\" has {} members, {} given",
				kinds.len(),
				members.len()
			)));
		}

		let mut values = Vec::with_capacity(members.len());
		for (index, (member, kind)) in members.into_iter().zip(kinds).enumerate() {
			let Some(value) = member.coerce(kind) else {
				return Err(Error::Unknown(format!(
					"member {index} of struct \"{struct_name}\" is not coercible to {}",
					kind.as_tag()
				)));
			};
			values.push(value);
		}
		self.set_arrayv(property, values).await
	}
}
