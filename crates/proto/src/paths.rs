//! Utilities for settled file paths and socket resolution.

use std::path::PathBuf;

/// Returns the default socket path for the settled daemon.
///
/// Prioritizes writable directories so the daemon can bind its IPC socket
/// even in restricted environments.
///
/// # Resolution Order
///
/// 1. `SETTLED_SOCKET` environment variable.
/// 2. System runtime directory (e.g., `$XDG_RUNTIME_DIR`).
/// 3. System temp directory (e.g., `/tmp`).
///
/// The default file name is `settled.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
	if let Ok(p) = std::env::var("SETTLED_SOCKET") {
		return PathBuf::from(p);
	}

	dirs::runtime_dir()
		.filter(|p| std::fs::create_dir_all(p).is_ok())
		.unwrap_or_else(std::env::temp_dir)
		.join("settled.sock")
}
