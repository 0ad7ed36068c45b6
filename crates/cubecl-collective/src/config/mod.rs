/// Collective config module.
pub mod collective;

mod base;
mod logger;

pub use base::*;
pub use collective::{CollectiveConfig, CollectiveLogLevel, WaitConfig};
pub use logger::*;
