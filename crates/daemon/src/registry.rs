//! Construction of backends by identifier.

use std::collections::HashMap;

use settled_proto::errors::Error;
use tracing::debug;

use crate::backend::Backend;
use crate::perchannel_xml::{self, PerchannelXmlBackend};

type Constructor = fn() -> Box<dyn Backend>;

/// Maps backend identifier strings to constructors.
pub struct BackendRegistry {
	constructors: HashMap<&'static str, Constructor>,
}

impl BackendRegistry {
	/// Creates a registry holding every built-in backend.
	#[must_use]
	pub fn new() -> Self {
		let mut constructors: HashMap<&'static str, Constructor> = HashMap::new();
		constructors.insert(perchannel_xml::BACKEND_ID, || {
			Box::new(PerchannelXmlBackend::new())
		});
		Self { constructors }
	}

	/// Constructs and initializes the backend registered under `id`.
	pub fn create(&self, id: &str) -> Result<Box<dyn Backend>, Error> {
		let Some(constructor) = self.constructors.get(id) else {
			return Err(Error::Unknown(format!(
				"unable to find a settled backend of type \"{id}\""
			)));
		};

		let mut backend = constructor();
		backend.initialize()?;
		debug!(id, "backend initialized");
		Ok(backend)
	}
}

impl Default for BackendRegistry {
	fn default() -> Self {
		Self::new()
	}
}
