//! Live-Xen backend.
//!
//! Memory comes from foreign-frame mappings through the control library,
//! registers from the HVM or PV CPU save records, and events from the
//! monitor ring. The control libraries are loaded at runtime, so this
//! crate builds without a Xen toolstack installed.

mod driver;
mod error;
mod events;
mod registers;
mod sys;

pub use self::{driver::XenDriver, error::Error};
