//! Shared wire types for the settled IPC protocol.
//!
//! This crate defines the protocol messages exchanged between clients and the
//! settled daemon over Unix domain sockets, the typed value model those
//! messages carry, and the validation rules for channel and property names.
//! The protocol uses binary framing with postcard encoding for efficiency.

#![warn(missing_docs)]

pub mod errors;
pub mod name;
pub mod paths;
pub mod protocol;
pub mod types;
pub mod value;

pub use errors::Error;
pub use types::*;
pub use value::{Value, ValueKind};
