//! Capabilities consumed by process groups.
//!
//! A process group never talks to a device directly. It goes through a [StreamBackend] for
//! device contexts, streams and events, and through a [CommBackend] for communicators and the
//! collective primitives themselves. Algorithms (ring, tree, ...) are entirely delegated to the
//! implementation.

mod base;

pub use base::*;

/// In-process implementation of the capabilities, running devices and streams on host threads.
#[cfg(feature = "host")]
pub mod host;
