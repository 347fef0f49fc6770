//! Snapshot-file backend: a flat dump of guest physical memory accessed
//! through a shared mapping.

mod driver;
mod error;

pub use self::{driver::FileDriver, error::Error};
