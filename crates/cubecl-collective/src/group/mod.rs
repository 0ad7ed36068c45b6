mod base;
mod ops;
mod options;
mod validation;

pub use base::*;
pub use options::*;
