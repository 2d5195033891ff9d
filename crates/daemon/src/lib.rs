#![warn(missing_docs)]

//! settled daemon library.
//!
//! The daemon owns an ordered list of configuration backends, routes client
//! requests across them, and broadcasts change events to subscribed sessions.
//! Storage is pluggable behind the [`backend::Backend`] trait; the default
//! store is the per-channel XML backend in [`perchannel_xml`].

pub mod backend;
pub mod core;
pub mod ipc;
pub mod perchannel_xml;
pub mod registry;

pub use settled_proto as proto;
