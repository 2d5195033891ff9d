//! The per-channel XML backend.
//!
//! Each channel is one XML file named `<channel>.xml`. Files are searched
//! across an ordered list of roots: the writable root first (the user's
//! configuration directory), then each system root. The writable root is the
//! only layer sets and resets touch; files found in system roots are
//! read-only overlays that win lookups and lock their properties against
//! user writes.
//!
//! Channel data loads lazily on first access and stays in memory; mutations
//! mark the channel dirty and are persisted by [`PerchannelXmlBackend::flush`]
//! with a write-to-temp-then-rename dance.

mod tree;
mod xml;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use settled_proto::errors::Error;
use settled_proto::value::Value;
use tracing::{debug, warn};

use crate::backend::{Backend, ChangeCallback};

pub use tree::{Node, PropertyTree};

/// Identifier this backend registers under.
pub const BACKEND_ID: &str = "perchannel-xml";

/// Directory name used under each configuration root.
const APP_DIR: &str = "settled";

/// One loaded channel: the writable layer plus any read-only overlays.
struct ChannelStore {
	writable: PropertyTree,
	overlays: Vec<PropertyTree>,
}

impl ChannelStore {
	/// The value a reader sees: the first overlay that carries the property
	/// wins, then the writable layer.
	fn effective_value(&self, property: &str) -> Option<Value> {
		for overlay in &self.overlays {
			if let Some(v) = overlay.value(property) {
				return Some(v.clone());
			}
		}
		self.writable.value(property).cloned()
	}

	fn locks(&self, property: &str) -> bool {
		self.overlays.iter().any(|o| o.locks(property))
	}
}

/// Per-channel XML file store.
pub struct PerchannelXmlBackend {
	writable_root: PathBuf,
	system_roots: Vec<PathBuf>,
	channels: HashMap<String, ChannelStore>,
	dirty: HashSet<String>,
	on_change: Option<ChangeCallback>,
}

impl PerchannelXmlBackend {
	/// Creates a backend rooted at the XDG configuration directories.
	///
	/// The writable root is `$XDG_CONFIG_HOME/settled` (falling back to
	/// `~/.config/settled`); each entry of `$XDG_CONFIG_DIRS` contributes a
	/// read-only root (`/etc/xdg/settled` when unset).
	#[must_use]
	pub fn new() -> Self {
		Self::with_roots(default_writable_root(), default_system_roots())
	}

	/// Creates a backend with explicit roots.
	#[must_use]
	pub fn with_roots(writable_root: PathBuf, system_roots: Vec<PathBuf>) -> Self {
		Self {
			writable_root,
			system_roots,
			channels: HashMap::new(),
			dirty: HashSet::new(),
			on_change: None,
		}
	}

	fn channel_file(root: &Path, channel: &str) -> PathBuf {
		root.join(format!("{channel}.xml"))
	}

	fn parse_file(path: &Path) -> Result<PropertyTree, Error> {
		let contents = std::fs::read_to_string(path).map_err(|e| Error::ReadFailure {
			message: format!("{}: {e}", path.display()),
		})?;
		let parsed = xml::parse_channel(&contents).map_err(|e| match e {
			Error::ReadFailure { message } => Error::ReadFailure {
				message: format!("{}: {message}", path.display()),
			},
			other => other,
		})?;
		Ok(PropertyTree::from_root(parsed.root))
	}

	/// Loads `channel` into memory on first access.
	///
	/// With `create`, a channel with no file anywhere starts out empty
	/// instead of failing with [`Error::ChannelNotFound`].
	fn load(&mut self, channel: &str, create: bool) -> Result<&mut ChannelStore, Error> {
		if !self.channels.contains_key(channel) {
			let user_file = Self::channel_file(&self.writable_root, channel);
			let mut found = user_file.is_file();
			let writable = if found {
				Self::parse_file(&user_file)?
			} else {
				PropertyTree::new()
			};

			let mut overlays = Vec::new();
			for root in &self.system_roots {
				let file = Self::channel_file(root, channel);
				if file.is_file() {
					overlays.push(Self::parse_file(&file)?);
					found = true;
				}
			}

			if !found && !create {
				return Err(Error::ChannelNotFound {
					channel: channel.to_string(),
				});
			}

			debug!(channel, overlays = overlays.len(), "channel loaded");
			self.channels
				.insert(channel.to_string(), ChannelStore { writable, overlays });
		}

		self.channels
			.get_mut(channel)
			.ok_or_else(|| Error::internal("channel store vanished during load"))
	}

	fn notify(&self, channel: &str, property: &str) {
		if let Some(callback) = &self.on_change {
			callback(channel, property);
		}
	}

	fn save_channel(&mut self, channel: &str) -> Result<(), Error> {
		let Some(store) = self.channels.get_mut(channel) else {
			return Ok(());
		};
		store.writable.prune();
		let bytes = xml::write_channel(channel, store.writable.root())?;

		let path = Self::channel_file(&self.writable_root, channel);
		let tmp = self
			.writable_root
			.join(format!("{channel}.xml.new.{}", std::process::id()));

		std::fs::write(&tmp, &bytes).map_err(|e| Error::WriteFailure {
			message: format!("{}: {e}", tmp.display()),
		})?;
		std::fs::rename(&tmp, &path).map_err(|e| {
			let _ = std::fs::remove_file(&tmp);
			Error::WriteFailure {
				message: format!("{}: {e}", path.display()),
			}
		})?;

		debug!(channel, path = %path.display(), "channel saved");
		Ok(())
	}
}

impl Default for PerchannelXmlBackend {
	fn default() -> Self {
		Self::new()
	}
}

impl Backend for PerchannelXmlBackend {
	fn id(&self) -> &'static str {
		BACKEND_ID
	}

	fn initialize(&mut self) -> Result<(), Error> {
		std::fs::create_dir_all(&self.writable_root).map_err(|e| Error::WriteFailure {
			message: format!("{}: {e}", self.writable_root.display()),
		})
	}

	fn set(&mut self, channel: &str, property: &str, value: Value) -> Result<(), Error> {
		let changed = {
			let store = self.load(channel, true)?;
			if store.locks(property) {
				return Err(Error::PermissionDenied {
					channel: channel.to_string(),
					property: property.to_string(),
				});
			}

			let before = store.effective_value(property);
			store.writable.set(property, value);
			before != store.effective_value(property)
		};

		self.dirty.insert(channel.to_string());
		if changed {
			self.notify(channel, property);
		}
		Ok(())
	}

	fn get(&mut self, channel: &str, property: &str) -> Result<Value, Error> {
		let store = self.load(channel, false)?;
		store
			.effective_value(property)
			.ok_or_else(|| Error::PropertyNotFound {
				channel: channel.to_string(),
				property: property.to_string(),
			})
	}

	fn get_all(
		&mut self,
		channel: &str,
		property_base: &str,
	) -> Result<BTreeMap<String, Value>, Error> {
		let store = self.load(channel, false)?;

		let mut props = BTreeMap::new();
		for (path, value) in store.writable.collect(property_base) {
			props.insert(path, value);
		}
		// Later inserts win, so apply overlays from lowest to highest
		// precedence on top of the writable layer.
		for overlay in store.overlays.iter().rev() {
			for (path, value) in overlay.collect(property_base) {
				props.insert(path, value);
			}
		}
		Ok(props)
	}

	fn exists(&mut self, channel: &str, property: &str) -> Result<bool, Error> {
		match self.load(channel, false) {
			Ok(store) => Ok(store.effective_value(property).is_some()),
			Err(Error::ChannelNotFound { .. }) => Ok(false),
			Err(e) => Err(e),
		}
	}

	fn reset(&mut self, channel: &str, property: &str, recursive: bool) -> Result<(), Error> {
		let changed: Vec<String> = {
			let store = self.load(channel, false)?;
			let removed = store.writable.reset(property, recursive);
			// A removal only changes the effective value when no overlay
			// keeps providing a default for that path.
			removed
				.into_iter()
				.filter(|p| !store.overlays.iter().any(|o| o.value(p).is_some()))
				.collect()
		};

		self.dirty.insert(channel.to_string());
		for path in &changed {
			self.notify(channel, path);
		}
		Ok(())
	}

	fn list_channels(&mut self) -> Result<Vec<String>, Error> {
		let mut channels: Vec<String> = self.channels.keys().cloned().collect();

		for root in std::iter::once(&self.writable_root).chain(self.system_roots.iter()) {
			let Ok(entries) = std::fs::read_dir(root) else {
				continue;
			};
			for entry in entries.flatten() {
				let path = entry.path();
				if path.extension().is_some_and(|ext| ext == "xml")
					&& let Some(stem) = path.file_stem().and_then(|s| s.to_str())
				{
					channels.push(stem.to_string());
				}
			}
		}

		Ok(channels)
	}

	fn is_property_locked(&mut self, channel: &str, property: &str) -> Result<bool, Error> {
		match self.load(channel, false) {
			Ok(store) => Ok(store.locks(property)),
			Err(Error::ChannelNotFound { .. }) => Ok(false),
			Err(e) => Err(e),
		}
	}

	fn flush(&mut self) -> Result<(), Error> {
		let dirty: Vec<String> = self.dirty.iter().cloned().collect();
		let mut last_error = None;

		for channel in dirty {
			match self.save_channel(&channel) {
				Ok(()) => {
					self.dirty.remove(&channel);
				}
				Err(e) => {
					warn!(channel = %channel, error = %e, "failed to save channel");
					last_error = Some(e);
				}
			}
		}

		match last_error {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}

	fn register_change_callback(&mut self, callback: ChangeCallback) {
		self.on_change = Some(callback);
	}
}

fn default_writable_root() -> PathBuf {
	dirs::config_dir()
		.unwrap_or_else(|| PathBuf::from("."))
		.join(APP_DIR)
}

fn default_system_roots() -> Vec<PathBuf> {
	let dirs = std::env::var("XDG_CONFIG_DIRS").unwrap_or_else(|_| "/etc/xdg".to_string());
	dirs.split(':')
		.filter(|d| !d.is_empty())
		.map(|d| PathBuf::from(d).join(APP_DIR))
		.collect()
}
