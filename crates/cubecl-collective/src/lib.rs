#![warn(missing_docs)]

//! CubeCL collective crate: process groups running collective and point-to-point operations
//! across devices and processes.
//!
//! Operations are issued asynchronously on a private stream per device, after the work already
//! queued on the default stream of that device, and return a [Task] tracking their completion.
//! The devices, streams and communication library are abstracted by the
//! [StreamBackend](backend::StreamBackend) and [CommBackend](backend::CommBackend) traits.

extern crate alloc;

#[macro_use]
extern crate derive_new;

mod backtrace;

/// Device, stream and communication library capabilities.
pub mod backend;
/// Buffer descriptors.
pub mod buffer;
/// Communicator cache module.
pub mod cache;
/// Config module.
pub mod config;
/// Device identifiers and context guard.
pub mod device;
/// Error types.
pub mod error;
/// Bootstrap id exchange.
pub mod rendezvous;
/// Rendezvous stores.
pub mod store;
/// Stream synchronization.
pub mod sync;

mod group;
mod task;

pub use backtrace::BackTrace;
pub use error::{CollectiveError, Result, StoreError};
pub use group::*;
pub use task::*;
